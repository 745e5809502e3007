//! Resumable frame parser
//!
//! The parser is a plain state machine. It holds the partially read header and
//! the remaining payload count between calls, so callers may feed it chunks
//! split at any byte boundary.

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::addr::{Addr, Scheme};
use crate::frame::V1;

const FAMILY_INDEX: usize = 0;
const ADDRESS_INDEX: usize = 1;
const PORT_INDEX: usize = 2;
const LENGTH_INDEX: usize = 3;
const SERVICE_INDEX: usize = 4;
const RELAY_PORT_INDEX: usize = 5;
const SERVERNAME_INDEX: usize = 6;

/// Fatal decode errors; the tunnel cannot be trusted after any of these
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed header: expected at least 5 fields, got {0}")]
    ShortHeader(usize),

    #[error("Invalid payload length: {0:?}")]
    InvalidPayloadLength(String),

    #[error("Control messages are not supported")]
    ControlUnsupported,

    #[error("Header is not valid UTF-8")]
    InvalidUtf8,
}

/// Receives payload chunks as the parser reconstructs frames
pub trait Router {
    fn route_bytes(&mut self, src: &Addr, dst: &Addr, payload: &[u8]);
}

/// One routed payload slice, owned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub src: Addr,
    pub dst: Addr,
    pub payload: Bytes,
}

impl Router for Vec<Chunk> {
    fn route_bytes(&mut self, src: &Addr, dst: &Addr, payload: &[u8]) {
        self.push(Chunk {
            src: src.clone(),
            dst: dst.clone(),
            payload: Bytes::copy_from_slice(payload),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    HeaderLength,
    Header,
    Payload,
}

/// Incremental V1 frame parser bound to a router
pub struct Parser<R> {
    router: R,
    state: State,
    header_len: usize,
    header: Vec<u8>,
    addrs: Option<(Addr, Addr)>,
    payload_len: usize,
    payload_written: usize,
}

impl<R: Router> Parser<R> {
    pub fn new(router: R) -> Self {
        Self {
            router,
            state: State::Version,
            header_len: 0,
            header: Vec::with_capacity(u8::MAX as usize),
            addrs: None,
            payload_len: 0,
            payload_written: 0,
        }
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    pub fn into_router(self) -> R {
        self.router
    }

    /// True when the parser sits on a frame boundary
    pub fn is_idle(&self) -> bool {
        self.state == State::Version
    }

    /// Consume all of `b`, routing every payload slice it completes.
    ///
    /// Returns the number of bytes consumed. On error the parser is reset and
    /// the count covers only the bytes consumed before the malformed header.
    pub fn write(&mut self, mut b: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;

        while !b.is_empty() {
            match self.state {
                State::Version => {
                    if b[0] != V1 {
                        let version = b[0];
                        self.reset();
                        return Err(ParseError::UnsupportedVersion(version));
                    }
                    b = &b[1..];
                    consumed += 1;
                    self.state = State::HeaderLength;
                }
                State::HeaderLength => {
                    self.header_len = b[0] as usize;
                    b = &b[1..];
                    consumed += 1;
                    self.state = State::Header;
                    if self.header_len == 0 {
                        self.reset();
                        return Err(ParseError::ShortHeader(0));
                    }
                }
                State::Header => {
                    let want = self.header_len - self.header.len();
                    let k = want.min(b.len());
                    self.header.extend_from_slice(&b[..k]);
                    b = &b[k..];
                    consumed += k;

                    if self.header.len() < self.header_len {
                        continue;
                    }

                    if let Err(e) = self.parse_header() {
                        self.reset();
                        return Err(e);
                    }
                    self.state = State::Payload;

                    // Connect and control markers carry no payload but still reach the router
                    if self.payload_len == 0 {
                        self.deliver(&[]);
                        self.reset();
                    }
                }
                State::Payload => {
                    let k = (self.payload_len - self.payload_written).min(b.len());
                    self.deliver(&b[..k]);
                    b = &b[k..];
                    consumed += k;
                    self.payload_written += k;

                    if self.payload_written == self.payload_len {
                        self.reset();
                    }
                }
            }
        }

        Ok(consumed)
    }

    fn deliver(&mut self, payload: &[u8]) {
        if let Some((src, dst)) = &self.addrs {
            trace!(src = %src, dst = %dst, len = payload.len(), "routing payload");
            self.router.route_bytes(src, dst, payload);
        }
    }

    fn parse_header(&mut self) -> Result<(), ParseError> {
        let header = std::str::from_utf8(&self.header).map_err(|_| ParseError::InvalidUtf8)?;
        let parts: Vec<&str> = header.split(',').map(str::trim_end).collect();
        if parts.len() < 5 {
            return Err(ParseError::ShortHeader(parts.len()));
        }

        let payload_len = parts[LENGTH_INDEX]
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidPayloadLength(parts[LENGTH_INDEX].to_string()))?;

        let service = parts[SERVICE_INDEX];
        if service == "control" {
            return Err(ParseError::ControlUnsupported);
        }

        let family = parts[FAMILY_INDEX];
        let port = parts[PORT_INDEX].parse::<u16>().unwrap_or(0);
        let src = Addr::new(family, parts[ADDRESS_INDEX], port);

        let dst_port = parts
            .get(RELAY_PORT_INDEX)
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(0);
        let servername = parts.get(SERVERNAME_INDEX).copied().unwrap_or("");
        let dst = Addr::new(family, servername, dst_port).with_scheme(Scheme::parse(service));

        self.payload_len = payload_len;
        self.payload_written = 0;
        self.addrs = Some((src, dst));
        Ok(())
    }

    fn reset(&mut self) {
        self.state = State::Version;
        self.header_len = 0;
        self.header.clear();
        self.addrs = None;
        self.payload_len = 0;
        self.payload_written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn hello_frame() -> (Addr, Addr, Vec<u8>) {
        let src = Addr::new("IPv4", "192.168.1.101", 6743);
        let dst = Addr::new("IPv4", "ex1.telebit.io", 80).with_scheme(Scheme::Http);
        let frame = encode_frame(&src, &dst, b"Hello, World!").unwrap();
        (src, dst, frame.to_vec())
    }

    /// Collapse consecutive chunks of the same stream into one payload per frame boundary
    fn joined(chunks: &[Chunk]) -> Vec<(String, String, Vec<u8>)> {
        let mut out: Vec<(String, String, Vec<u8>)> = Vec::new();
        for c in chunks {
            let (src, dst) = (c.src.key(), c.dst.key());
            match out.last_mut() {
                Some(last) if last.0 == src && last.1 == dst && !c.payload.is_empty() => {
                    last.2.extend_from_slice(&c.payload)
                }
                _ => out.push((src, dst, c.payload.to_vec())),
            }
        }
        out
    }

    fn feed_in_strides(bytes: &[u8], stride: usize) -> Vec<Chunk> {
        let mut parser = Parser::new(Vec::new());
        let mut total = 0;
        for piece in bytes.chunks(stride) {
            total += parser.write(piece).unwrap();
        }
        assert_eq!(total, bytes.len());
        assert!(parser.is_idle());
        parser.into_router()
    }

    #[test]
    fn test_parse_hello_world() {
        let (src, dst, frame) = hello_frame();
        let mut parser = Parser::new(Vec::new());
        let n = parser.write(&frame).unwrap();
        assert_eq!(n, frame.len());

        let chunks = parser.into_router();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].src, src);
        assert_eq!(chunks[0].dst.host(), "ex1.telebit.io");
        assert_eq!(chunks[0].dst.port(), 80);
        assert_eq!(chunks[0].dst.scheme(), dst.scheme());
        assert_eq!(&chunks[0].payload[..], b"Hello, World!");
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let (_, _, frame) = hello_frame();
        let whole = feed_in_strides(&frame, frame.len());
        let bytewise = feed_in_strides(&frame, 1);

        assert_eq!(bytewise.len(), 13);
        assert_eq!(joined(&bytewise), joined(&whole));
    }

    #[test]
    fn test_prime_strides() {
        let (src, _, _) = hello_frame();
        let mut stream = Vec::new();
        for i in 0..5u8 {
            let dst = Addr::new("IPv4", "example.com", 443).with_scheme(Scheme::Https);
            let payload = vec![i; 97 + i as usize * 31];
            stream.extend_from_slice(&encode_frame(&src, &dst, &payload).unwrap());
        }
        stream.extend_from_slice(&encode_frame(&src, &Addr::end(), &[]).unwrap());

        let expected = joined(&feed_in_strides(&stream, stream.len()));
        for stride in [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53] {
            let got = joined(&feed_in_strides(&stream, stride));
            assert_eq!(got, expected, "stride {}", stride);
        }
    }

    #[test]
    fn test_every_single_cut() {
        let (_, _, frame) = hello_frame();
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);
        let expected = joined(&feed_in_strides(&stream, stream.len()));

        for cut in 1..stream.len() {
            let mut parser = Parser::new(Vec::new());
            let a = parser.write(&stream[..cut]).unwrap();
            let b = parser.write(&stream[cut..]).unwrap();
            assert_eq!(a + b, stream.len());
            assert_eq!(joined(parser.router()), expected, "cut at {}", cut);
        }
    }

    #[test]
    fn test_multi_frame_ordering() {
        let src = Addr::new("IPv4", "10.0.0.2", 5000);
        let dst = Addr::new("IPv4", "app.example.com", 443).with_scheme(Scheme::Https);
        let payloads: Vec<Vec<u8>> = (1..=8u8).map(|i| vec![i; i as usize * 100]).collect();

        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&encode_frame(&src, &dst, p).unwrap());
        }

        let mut parser = Parser::new(Vec::new());
        parser.write(&stream).unwrap();
        let chunks = parser.into_router();

        assert_eq!(chunks.len(), payloads.len());
        let total: usize = chunks.iter().map(|c| c.payload.len()).sum();
        assert_eq!(total, payloads.iter().map(Vec::len).sum::<usize>());
        for (chunk, expected) in chunks.iter().zip(&payloads) {
            assert_eq!(&chunk.payload[..], &expected[..]);
        }
    }

    #[test]
    fn test_zero_length_payload_delivers_empty_chunk() {
        let src = Addr::new("IPv4", "10.0.0.2", 5000);
        let frame = encode_frame(&src, &Addr::end(), &[]).unwrap();

        let mut parser = Parser::new(Vec::new());
        parser.write(&frame).unwrap();
        let chunks = parser.into_router();

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.is_empty());
        assert_eq!(chunks[0].dst.scheme(), &Scheme::End);
    }

    #[test]
    fn test_unsupported_version() {
        let mut parser = Parser::new(Vec::new());
        assert_eq!(
            parser.write(&[1, 2, 3]),
            Err(ParseError::UnsupportedVersion(1))
        );
    }

    fn raw_frame(header: &str) -> Vec<u8> {
        let mut b = vec![V1, header.len() as u8];
        b.extend_from_slice(header.as_bytes());
        b
    }

    #[test]
    fn test_parse_literal_hello_world() {
        let mut wire = raw_frame("IPv4,192.168.1.101,6743,13,http,80,ex1.telebit.io,\n");
        assert_eq!(&wire[..2], &[254, 51]);
        wire.extend_from_slice(b"Hello, World!");

        let mut parser = Parser::new(Vec::new());
        assert_eq!(parser.write(&wire).unwrap(), wire.len());
        let chunks = parser.into_router();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].src, Addr::new("IPv4", "192.168.1.101", 6743));
        assert_eq!(chunks[0].dst.host(), "ex1.telebit.io");
        assert_eq!(chunks[0].dst.port(), 80);
        assert_eq!(chunks[0].dst.scheme(), &Scheme::Http);
        assert_eq!(&chunks[0].payload[..], b"Hello, World!");
    }

    #[test]
    fn test_short_header() {
        let mut parser = Parser::new(Vec::new());
        assert_eq!(
            parser.write(&raw_frame("IPv4,1.2.3.4,80\n")),
            Err(ParseError::ShortHeader(3))
        );
    }

    #[test]
    fn test_bad_payload_length() {
        let mut parser = Parser::new(Vec::new());
        assert_eq!(
            parser.write(&raw_frame("IPv4,1.2.3.4,80,-1,http,\n")),
            Err(ParseError::InvalidPayloadLength("-1".to_string()))
        );
    }

    #[test]
    fn test_control_unsupported() {
        let mut parser = Parser::new(Vec::new());
        assert_eq!(
            parser.write(&raw_frame("IPv4,1.2.3.4,80,0,control,\n")),
            Err(ParseError::ControlUnsupported)
        );
    }

    #[test]
    fn test_minimal_header_without_servername() {
        let mut parser = Parser::new(Vec::new());
        parser.write(&raw_frame("IPv4,1.2.3.4,80,0,ssh\n")).unwrap();
        let chunks = parser.into_router();
        assert_eq!(chunks[0].dst.scheme(), &Scheme::Ssh);
        assert_eq!(chunks[0].dst.host(), "");
        assert_eq!(chunks[0].dst.port(), 0);
    }
}

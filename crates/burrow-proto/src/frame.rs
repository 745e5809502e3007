//! V1 frame layout
//!
//! ```text
//! byte 0        version (V1)
//! byte 1        header length L
//! bytes 2..2+L  "<family>,<host>,<port>,<payload len>,<scheme>,<dst port>,<servername>,\n"
//! then          exactly <payload len> payload bytes
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::addr::Addr;

/// Version tag of the only supported wire version
pub const V1: u8 = 255 - 1;

/// Longest header that fits the single length byte
pub const MAX_HEADER_LEN: usize = u8::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Header too long: {0} bytes")]
    HeaderTooLong(usize),

    #[error("Header field contains a delimiter: {0:?}")]
    InvalidField(String),
}

/// Serialize the version, length and header for a frame carrying `payload_len` bytes
pub fn encode_header(src: &Addr, dst: &Addr, payload_len: usize) -> Result<Bytes, FrameError> {
    for field in [src.family(), src.host(), dst.host(), dst.scheme().as_str()] {
        if field.contains([',', '\n']) {
            return Err(FrameError::InvalidField(field.to_string()));
        }
    }

    let header = format!(
        "{},{},{},{},{},{},{},\n",
        src.family(),
        src.host(),
        src.port(),
        payload_len,
        dst.scheme(),
        dst.port(),
        dst.host()
    );
    if header.len() > MAX_HEADER_LEN {
        return Err(FrameError::HeaderTooLong(header.len()));
    }

    let mut buf = BytesMut::with_capacity(2 + header.len());
    buf.put_u8(V1);
    buf.put_u8(header.len() as u8);
    buf.put_slice(header.as_bytes());
    Ok(buf.freeze())
}

/// Serialize a complete frame (header followed by payload) into one buffer
pub fn encode_frame(src: &Addr, dst: &Addr, payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = encode_header(src, dst, payload.len())?;
    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Scheme;

    #[test]
    fn test_hello_world_header() {
        let src = Addr::new("IPv4", "192.168.1.101", 6743);
        let dst = Addr::new("IPv4", "ex1.telebit.io", 80).with_scheme(Scheme::Http);

        let frame = encode_frame(&src, &dst, b"Hello, World!").unwrap();
        let header = b"IPv4,192.168.1.101,6743,13,http,80,ex1.telebit.io,\n";

        assert_eq!(frame[0], 254);
        assert_eq!(frame[1], 51);
        assert_eq!(frame[1] as usize, header.len());
        assert_eq!(&frame[2..2 + header.len()], &header[..]);
        assert_eq!(&frame[2 + header.len()..], b"Hello, World!");
    }

    #[test]
    fn test_end_header() {
        let src = Addr::new("IPv6", "::1", 4000);
        let header = encode_header(&src, &Addr::end(), 0).unwrap();
        assert_eq!(&header[2..], b"IPv6,::1,4000,0,end,0,,\n");
    }

    #[test]
    fn test_rejects_delimiters() {
        let src = Addr::new("IPv4", "1.2.3.4", 1);
        let dst = Addr::new("IPv4", "evil,host", 443);
        assert_eq!(
            encode_header(&src, &dst, 0),
            Err(FrameError::InvalidField("evil,host".to_string()))
        );
    }

    #[test]
    fn test_rejects_long_header() {
        let src = Addr::new("IPv4", "1.2.3.4", 1);
        let dst = Addr::new("IPv4", "a".repeat(250), 443);
        assert!(matches!(
            encode_header(&src, &dst, 0),
            Err(FrameError::HeaderTooLong(_))
        ));
    }
}

//! Tunnel read loop feeding the frame parser

use std::io;

use async_trait::async_trait;
use burrow_proto::{Addr, Chunk, ParseError, Parser, DEFAULT_BUFFER_SIZE};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Tunnel read error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Parse(#[from] ParseError),
}

/// Consumer of decoded payload chunks
#[async_trait]
pub trait RouteBytes: Send + Sync {
    async fn route_bytes(&self, src: &Addr, dst: &Addr, payload: Bytes);
}

/// Reads raw tunnel bytes and hands every decoded chunk to a [`RouteBytes`] sink
pub struct Decoder<R> {
    reader: R,
    buffer_size: usize,
}

impl<R> Decoder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Run until EOF (returns `Ok`), a read or protocol error, or cancellation.
    ///
    /// Chunks are routed in the order they appear on the wire, so each stream
    /// sees its bytes in the order its peer encoded them.
    pub async fn decode<H>(&mut self, router: &H, cancel: &CancellationToken) -> Result<(), DecodeError>
    where
        H: RouteBytes + ?Sized,
    {
        let mut parser = Parser::new(Vec::<Chunk>::new());
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("decoder cancelled");
                    return Ok(());
                }
                n = self.reader.read(&mut buf) => n?,
            };
            if n == 0 {
                debug!("tunnel closed by peer");
                return Ok(());
            }

            trace!(len = n, "tunnel bytes received");
            parser.write(&buf[..n])?;

            for chunk in std::mem::take(parser.router_mut()) {
                router.route_bytes(&chunk.src, &chunk.dst, chunk.payload).await;
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::{encode_frame, Scheme, V1};
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl RouteBytes for Recorder {
        async fn route_bytes(&self, src: &Addr, dst: &Addr, payload: Bytes) {
            self.seen
                .lock()
                .await
                .push((format!("{}>{}", src.port(), dst.scheme()), payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_decode_until_eof() {
        let (mut tx, rx) = duplex(4096);
        let src = Addr::new("IPv4", "10.0.0.9", 7000);
        let dst = Addr::new("IPv4", "a.example.com", 22).with_scheme(Scheme::Ssh);

        tokio::spawn(async move {
            let frame = encode_frame(&src, &dst, b"ping").unwrap();
            // Dribble the frame across several writes
            for piece in frame.chunks(3) {
                tx.write_all(piece).await.unwrap();
            }
            tx.write_all(&encode_frame(&src, &Addr::end(), &[]).unwrap())
                .await
                .unwrap();
        });

        let recorder = Recorder::default();
        let mut decoder = Decoder::new(rx).with_buffer_size(5);
        decoder
            .decode(&recorder, &CancellationToken::new())
            .await
            .unwrap();

        let seen = recorder.seen.lock().await;
        let payload: Vec<u8> = seen
            .iter()
            .filter(|(k, _)| k == "7000>ssh")
            .flat_map(|(_, p)| p.clone())
            .collect();
        assert_eq!(payload, b"ping");
        assert_eq!(seen.last().unwrap(), &("7000>end".to_string(), Vec::new()));
    }

    #[tokio::test]
    async fn test_decode_protocol_error() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(&[V1 - 1, 0, 0]).await.unwrap();

        let recorder = Recorder::default();
        let result = Decoder::new(rx)
            .decode(&recorder, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(DecodeError::Parse(ParseError::UnsupportedVersion(_)))
        ));
    }
}

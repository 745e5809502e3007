//! Bidirectional byte forwarding with idle timeouts

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use burrow_proto::DEFAULT_BUFFER_SIZE;
use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::conn::WrappedConn;
use crate::mux::{Handler, ServeError};

/// Upper bound on how long one write may block
const MAX_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("No traffic for {0:?}")]
    Idle(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Forwards connections to a fixed TCP target
#[derive(Debug, Clone)]
pub struct Forwarder {
    target: String,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(target: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            idle_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<TcpStream, ForwardError> {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ForwardError::Connect {
                target: self.target.clone(),
                source,
            }),
            Err(_) => Err(ForwardError::ConnectTimeout(self.target.clone())),
        }
    }
}

#[async_trait]
impl Handler for Forwarder {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        let upstream = self.connect().await?;
        debug!(peer = %conn.peer_addr(), upstream = %self.target, "forwarding");
        forward(conn, upstream, self.idle_timeout).await?;
        Ok(())
    }
}

/// Copy bytes both ways between `a` and `b` until both directions finish.
///
/// End of stream on one side is passed on as a write shutdown to the other,
/// so half-closed connections keep working. An error or idle timeout in
/// either direction drops both streams.
pub async fn forward<A, B>(a: A, b: B, idle_timeout: Duration) -> Result<(), ForwardError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = split(a);
    let (mut b_read, mut b_write) = split(b);

    let a_to_b = copy_with_idle(&mut a_read, &mut b_write, idle_timeout);
    let b_to_a = copy_with_idle(&mut b_read, &mut a_write, idle_timeout);
    tokio::pin!(a_to_b, b_to_a);

    let (sent, received) = tokio::select! {
        r = &mut a_to_b => {
            let sent = r?;
            (sent, b_to_a.await?)
        }
        r = &mut b_to_a => {
            let received = r?;
            (a_to_b.await?, received)
        }
    };

    trace!(sent, received, "forward finished");
    Ok(())
}

async fn copy_with_idle<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
) -> Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let write_timeout = idle_timeout.min(MAX_WRITE_TIMEOUT);
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = timeout(idle_timeout, reader.read(&mut buf))
            .await
            .map_err(|_| ForwardError::Idle(idle_timeout))??;
        if n == 0 {
            let _ = timeout(write_timeout, writer.shutdown()).await;
            return Ok(total);
        }

        timeout(write_timeout, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| ForwardError::Idle(write_timeout))??;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_forward_both_ways_with_half_close() {
        let (mut client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);
        let task = tokio::spawn(forward(a, b, Duration::from_secs(5)));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut req = Vec::new();
        server.read_to_end(&mut req).await.unwrap();
        assert_eq!(req, b"request");

        // The server can still answer after the client finished sending
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();

        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        assert_eq!(resp, b"response");

        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_tears_down_both_sides() {
        let (mut client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);

        let result = forward(a, b, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ForwardError::Idle(_))));

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = Forwarder::new(addr.to_string(), Duration::from_secs(1));
        assert!(matches!(
            forwarder.connect().await,
            Err(ForwardError::Connect { .. })
        ));
    }
}

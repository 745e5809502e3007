//! Frame encoder shared by every logical stream on one tunnel

use std::io;
use std::sync::Mutex as StdMutex;

use burrow_proto::{encode_frame, Addr, FrameError, DEFAULT_BUFFER_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Stream read error: {0}")]
    Read(#[source] io::Error),

    #[error("Tunnel write error: {0}")]
    Write(#[source] io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Tunnel failed: {0}")]
    Failed(String),
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serializes frames from many streams onto one tunnel writer.
///
/// Each frame is written while holding the writer lock, so header and payload
/// of one frame are never split by another stream's frame.
pub struct Encoder {
    writer: Mutex<BoxWriter>,
    cancel: CancellationToken,
    failed: CancellationToken,
    failure: StdMutex<Option<String>>,
    buffer_size: usize,
}

impl Encoder {
    pub fn new<W>(writer: W, cancel: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            cancel,
            failed: CancellationToken::new(),
            failure: StdMutex::new(None),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Token that stops every encode loop on this tunnel when cancelled
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the tunnel lifetime ends or a frame write fails
    pub async fn run(&self) -> Result<(), EncodeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            _ = self.failed.cancelled() => Err(EncodeError::Failed(self.failure_message())),
        }
    }

    /// Encode everything read from `reader` as frames from `src` to `dst`
    pub async fn encode<R>(&self, reader: R, src: &Addr, dst: &Addr) -> Result<(), EncodeError>
    where
        R: AsyncRead + Unpin,
    {
        self.encode_until(reader, src, dst, &self.cancel).await
    }

    /// Like [`Encoder::encode`], but also stops when `stop` is cancelled.
    ///
    /// Cancellation is only observed between frames; a frame that has started
    /// writing always completes.
    pub async fn encode_until<R>(
        &self,
        mut reader: R,
        src: &Addr,
        dst: &Addr,
        stop: &CancellationToken,
    ) -> Result<(), EncodeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let read = tokio::select! {
                _ = stop.cancelled() => {
                    trace!(src = %src, "encode cancelled");
                    return Ok(());
                }
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.failed.cancelled() => {
                    return Err(EncodeError::Failed(self.failure_message()));
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(src = %src, "stream finished, sending end");
                    self.write_frame(src, &Addr::end(), &[]).await?;
                    return Ok(());
                }
                Ok(n) => {
                    self.write_frame(src, dst, &buf[..n]).await?;
                }
                Err(e) => {
                    warn!(src = %src, "stream read failed: {}", e);
                    // The read error is the one worth reporting
                    let _ = self.write_frame(src, &Addr::error(), &[]).await;
                    return Err(EncodeError::Read(e));
                }
            }
        }
    }

    /// Write a single frame; a failure here marks the whole tunnel as failed
    pub async fn write_frame(&self, src: &Addr, dst: &Addr, payload: &[u8]) -> Result<(), EncodeError> {
        let frame = encode_frame(src, dst, payload)?;

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(e) = result {
            self.fail(&e);
            return Err(EncodeError::Write(e));
        }

        trace!(src = %src, dst = %dst, len = payload.len(), "frame written");
        Ok(())
    }

    /// Close the tunnel writer; later frame writes fail
    pub async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("tunnel writer shutdown: {}", e);
        }
    }

    fn fail(&self, e: &io::Error) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| e.to_string());
        }
        self.failed.cancel();
    }

    fn failure_message(&self) -> String {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

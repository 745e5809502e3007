//! Stream listener: turns one tunnel into an accept queue of virtual pipes

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use burrow_proto::{Addr, Scheme, DEFAULT_BUFFER_SIZE};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{
    duplex, split, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, WriteHalf,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::decoder::{Decoder, RouteBytes};
use crate::encoder::Encoder;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Listener closed")]
    Closed,
}

/// Listener tunables
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Read buffer for the tunnel and for each pipe
    pub buffer_size: usize,
    /// In-process buffer between a pipe's two halves
    pub pipe_capacity: usize,
    /// Pipes waiting to be accepted before decoding pauses
    pub accept_backlog: usize,
    /// Payload chunks queued for one pipe before it is closed as stalled
    pub inbound_backlog: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pipe_capacity: 8 * DEFAULT_BUFFER_SIZE,
            accept_backlog: 64,
            inbound_backlog: 128,
        }
    }
}

/// Application-facing half of one multiplexed stream
pub struct Pipe {
    stream: DuplexStream,
    remote: Addr,
    local: Addr,
}

impl Pipe {
    /// Address of the peer that opened the stream on the far side of the tunnel
    pub fn remote_addr(&self) -> &Addr {
        &self.remote
    }

    /// Destination the peer asked for (servername and port)
    pub fn local_addr(&self) -> &Addr {
        &self.local
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("remote", &self.remote.key())
            .field("local", &self.local.key())
            .finish()
    }
}

impl AsyncRead for Pipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Pipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Bytes from the tunnel for one pipe, written out by that pipe's own task
enum Inbound {
    Data(Bytes),
    End,
}

#[derive(Clone)]
struct PipeHandle {
    id: u64,
    inbound: mpsc::Sender<Inbound>,
    /// Stops re-encoding the pipe's output onto the tunnel
    stop: CancellationToken,
    /// Drops whatever is still queued for the application and closes the pipe
    abort: CancellationToken,
}

struct Shared {
    pipes: StdMutex<HashMap<String, PipeHandle>>,
    next_id: AtomicU64,
    encoder: Arc<Encoder>,
    accept_tx: mpsc::Sender<Pipe>,
    cancel: CancellationToken,
    config: ListenerConfig,
}

impl Shared {
    fn pipes(&self) -> MutexGuard<'_, HashMap<String, PipeHandle>> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_for(&self, key: &str) -> Option<PipeHandle> {
        self.pipes().get(key).cloned()
    }

    /// Register a new pipe for `src` and start its inbound and outbound tasks
    fn create_pipe(self: &Arc<Self>, src: &Addr, dst: &Addr) -> (PipeHandle, Pipe) {
        let (app, tunnel_side) = duplex(self.config.pipe_capacity);
        let (reader, writer) = split(tunnel_side);
        let (inbound, inbound_rx) = mpsc::channel(self.config.inbound_backlog.max(1));
        let handle = PipeHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            inbound,
            stop: self.cancel.child_token(),
            abort: self.cancel.child_token(),
        };

        self.pipes().insert(src.key(), handle.clone());
        debug!(src = %src, dst = %dst, "new pipe");

        // The entry lives until the inbound side is done, so a pipe the
        // application half-closed still receives the rest of its stream
        let encoder = self.encoder.clone();
        let (task_src, task_dst, stop) = (src.clone(), dst.clone(), handle.stop.clone());
        tokio::spawn(async move {
            if let Err(e) = encoder.encode_until(reader, &task_src, &task_dst, &stop).await {
                debug!(src = %task_src, "pipe encode ended: {}", e);
            }
        });

        let shared = self.clone();
        let (task_src, abort, id) = (src.clone(), handle.abort.clone(), handle.id);
        tokio::spawn(async move {
            if deliver(writer, inbound_rx, &abort, &task_src).await.is_err() {
                shared.forget(&task_src.key(), id);
            }
        });

        let pipe = Pipe {
            stream: app,
            remote: src.clone(),
            local: dst.clone(),
        };
        (handle, pipe)
    }

    /// Drop the map entry for `key` if it is still pipe `id`
    fn forget(&self, key: &str, id: u64) {
        let mut pipes = self.pipes();
        if pipes.get(key).is_some_and(|handle| handle.id == id) {
            pipes.remove(key);
        }
    }

    /// Queue `message` for a pipe without waiting on the application.
    ///
    /// A pipe whose queue is full has stopped reading; it is closed and the
    /// far side is told the stream failed.
    async fn push(&self, src: &Addr, handle: &PipeHandle, message: Inbound) {
        match handle.inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(src = %src, "pipe is not reading, closing it");
                self.forget(&src.key(), handle.id);
                handle.stop.cancel();
                handle.abort.cancel();
                let _ = self.encoder.write_frame(src, &Addr::error(), &[]).await;
            }
            Err(TrySendError::Closed(_)) => {
                trace!(src = %src, "bytes for finished pipe dropped");
                self.forget(&src.key(), handle.id);
            }
        }
    }
}

/// Write queued tunnel bytes into a pipe until `End` or `abort`, then close
/// the application's read side. Errors if the application went away.
async fn deliver(
    mut writer: WriteHalf<DuplexStream>,
    mut inbound: mpsc::Receiver<Inbound>,
    abort: &CancellationToken,
    src: &Addr,
) -> io::Result<()> {
    let mut result = Ok(());
    loop {
        let next = tokio::select! {
            _ = abort.cancelled() => break,
            next = inbound.recv() => next,
        };
        let Some(Inbound::Data(payload)) = next else {
            break;
        };
        let written = tokio::select! {
            _ = abort.cancelled() => break,
            written = writer.write_all(&payload) => written,
        };
        if let Err(e) = written {
            debug!(src = %src, "pipe write failed: {}", e);
            result = Err(e);
            break;
        }
    }
    inbound.close();
    let _ = writer.shutdown().await;
    result
}

#[async_trait]
impl RouteBytes for Arc<Shared> {
    async fn route_bytes(&self, src: &Addr, dst: &Addr, payload: Bytes) {
        let key = src.key();

        let handle = match self.handle_for(&key) {
            Some(handle) => handle,
            None if dst.scheme().is_control() => {
                trace!(src = %src, "signal for unknown stream ignored");
                return;
            }
            None => {
                let (handle, pipe) = self.create_pipe(src, dst);
                if self.accept_tx.send(pipe).await.is_err() {
                    warn!(src = %src, "accept queue closed, dropping stream");
                    self.forget(&key, handle.id);
                    handle.stop.cancel();
                    handle.abort.cancel();
                    return;
                }
                handle
            }
        };

        match dst.scheme() {
            Scheme::Error => {
                // Bytes already queued still reach the application before EOF
                debug!(src = %src, "remote stream failed, closing pipe");
                self.forget(&key, handle.id);
                handle.stop.cancel();
                if handle.inbound.try_send(Inbound::End).is_err() {
                    handle.abort.cancel();
                }
            }
            Scheme::End => {
                debug!(src = %src, "remote stream ended");
                if !payload.is_empty() {
                    self.push(src, &handle, Inbound::Data(payload)).await;
                }
                self.forget(&key, handle.id);
                self.push(src, &handle, Inbound::End).await;
            }
            _ if payload.is_empty() => {}
            _ => self.push(src, &handle, Inbound::Data(payload)).await,
        }
    }
}

/// Accepts virtual pipes multiplexed over a single tunnel
pub struct Listener {
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::Receiver<Pipe>>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new<T>(tunnel: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(tunnel, ListenerConfig::default())
    }

    pub fn with_config<T>(tunnel: T, config: ListenerConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = split(tunnel);
        let cancel = CancellationToken::new();
        let encoder = Arc::new(Encoder::new(writer, cancel.clone()).with_buffer_size(config.buffer_size));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            pipes: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            encoder: encoder.clone(),
            accept_tx,
            cancel: cancel.clone(),
            config: config.clone(),
        });

        // Decode task
        let decode_shared = shared.clone();
        let decode_cancel = cancel.clone();
        let buffer_size = config.buffer_size;
        tokio::spawn(async move {
            let mut decoder = Decoder::new(reader).with_buffer_size(buffer_size);
            match decoder.decode(&decode_shared, &decode_cancel).await {
                Ok(()) => info!("tunnel closed"),
                Err(e) => warn!("tunnel decode failed: {}", e),
            }
            close_all(&decode_shared).await;
        });

        // Encoder health task
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = encoder.run().await {
                warn!("tunnel encode failed: {}", e);
                run_cancel.cancel();
            }
        });

        Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
            cancel,
        }
    }

    /// Wait for the next stream opened by the far side
    pub async fn accept(&self) -> Result<Pipe, ListenerError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ListenerError::Closed),
            pipe = rx.recv() => pipe.ok_or(ListenerError::Closed),
        }
    }

    /// Tear down the tunnel and every pipe, unblocking pending `accept` calls
    pub async fn close(&self) {
        close_all(&self.shared).await;
    }

    /// Resolves once the tunnel has closed for any reason
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of live pipes
    pub fn pipe_count(&self) -> usize {
        self.shared.pipes().len()
    }
}

async fn close_all(shared: &Arc<Shared>) {
    shared.cancel.cancel();
    shared.pipes().clear();
    shared.encoder.shutdown().await;
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! WebSocket tunnel transport
//!
//! Adapts a WebSocket into a plain byte stream. Binary messages carry raw
//! tunnel bytes with no relation to frame boundaries.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use burrow_proto::DEFAULT_BUFFER_SIZE;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{
    duplex, split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Protocol version advertised when dialing
pub const PROTOCOL_VERSIONS: &str = "v1";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid access token")]
    InvalidToken,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out connecting to relay")]
    Timeout,
}

/// Tunnel keep-alive and timeout settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// Longest silence (no data, no pong) before the tunnel is considered dead
    pub read_timeout: Duration,
    /// Longest a single message write may take
    pub write_timeout: Duration,
    /// Dial timeout, including the WebSocket handshake
    pub connect_timeout: Duration,
    /// Largest binary message produced by the writer
    pub buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// A WebSocket presented as an `AsyncRead + AsyncWrite` byte stream
pub struct WsTunnel {
    stream: DuplexStream,
    peer_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl WsTunnel {
    pub fn new<S>(ws: WebSocketStream<S>, config: TunnelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (app, bridge) = duplex(config.buffer_size * 8);
        let (bridge_read, bridge_write) = split(bridge);
        let (sink, source) = ws.split();
        let cancel = CancellationToken::new();

        tokio::spawn(writer_task(sink, bridge_read, config.clone(), cancel.clone()));
        tokio::spawn(reader_task(source, bridge_write, config, cancel.clone()));

        Self {
            stream: app,
            peer_addr: None,
            cancel,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Stop both transport tasks and send a close message
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AsyncRead for WsTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsTunnel {
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

/// Forwards bytes written to the tunnel as binary messages and sends periodic pings
async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut bridge: ReadHalf<DuplexStream>,
    config: TunnelConfig,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size];
    let mut ping = tokio::time::interval(config.ping_interval);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                trace!("sending ping");
                Message::Ping(Vec::new())
            }
            read = bridge.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => Message::Binary(buf[..n].to_vec()),
                Err(e) => {
                    debug!("tunnel bridge read failed: {}", e);
                    break;
                }
            },
        };

        match timeout(config.write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("WebSocket send error: {}", e);
                break;
            }
            Err(_) => {
                warn!("WebSocket write timed out");
                break;
            }
        }
    }

    cancel.cancel();
    if timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("WebSocket close timed out");
    }
    debug!("WebSocket writer task ended");
}

/// Feeds binary messages into the tunnel; silence longer than the read timeout ends it
async fn reader_task<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    mut bridge: WriteHalf<DuplexStream>,
    config: TunnelConfig,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(config.read_timeout, source.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!("No WebSocket traffic within {:?}", config.read_timeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Binary(data) => {
                if bridge.write_all(&data).await.is_err() {
                    break;
                }
            }
            Message::Ping(_) => trace!("received ping"),
            Message::Pong(_) => trace!("received pong"),
            Message::Close(frame) => {
                debug!("WebSocket close received: {:?}", frame);
                break;
            }
            Message::Text(_) | Message::Frame(_) => {
                warn!("Ignoring non-binary WebSocket message");
            }
        }
    }

    let _ = bridge.shutdown().await;
    cancel.cancel();
    debug!("WebSocket reader task ended");
}

/// Build the dial URL: `<relay>?access_token=<token>&versions=v1`
pub fn tunnel_url(relay: &str, token: &str) -> Result<Url, TunnelError> {
    let mut url = Url::parse(relay)?;
    url.query_pairs_mut()
        .append_pair("access_token", token)
        .append_pair("versions", PROTOCOL_VERSIONS);
    Ok(url)
}

/// Dial a relay and return the established tunnel
pub async fn dial(relay: &str, token: &str, config: TunnelConfig) -> Result<WsTunnel, TunnelError> {
    let url = tunnel_url(relay, token)?;
    let mut request = url.as_str().into_client_request()?;
    let bearer =
        HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| TunnelError::InvalidToken)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws, response) = timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| TunnelError::Timeout)??;
    info!(relay = %relay, status = %response.status(), "tunnel connected");

    let peer_addr = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0.peer_addr().ok(),
        _ => None,
    };

    let tunnel = WsTunnel::new(ws, config);
    Ok(match peer_addr {
        Some(addr) => tunnel.with_peer_addr(addr),
        None => tunnel,
    })
}

//! Connection wrapper with read-ahead, TLS detection and servername caching

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use burrow_mux::Pipe;
use burrow_proto::{Addr, DEFAULT_PEEK_SIZE};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::sni::{extract_sni, looks_like_client_hello, record_len};

/// Default time allowed for the client to send enough bytes to classify the connection
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

const TLS_PEEK_LEN: usize = 6;
const TLS_RECORD_HEADER_LEN: usize = 5;

/// Either end of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAddr {
    /// A real socket
    Socket(SocketAddr),
    /// A virtual stream carried by a tunnel
    Tunnel(Addr),
    Unknown,
}

impl ConnAddr {
    /// `"tcp"`, `"tun"`, or empty when unknown
    pub fn network(&self) -> &'static str {
        match self {
            ConnAddr::Socket(_) => "tcp",
            ConnAddr::Tunnel(addr) => addr.network(),
            ConnAddr::Unknown => "",
        }
    }

    pub fn host(&self) -> String {
        match self {
            ConnAddr::Socket(addr) => addr.ip().to_string(),
            ConnAddr::Tunnel(addr) => addr.host().to_string(),
            ConnAddr::Unknown => String::new(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            ConnAddr::Socket(addr) => Some(addr.port()),
            ConnAddr::Tunnel(addr) => Some(addr.port()),
            ConnAddr::Unknown => None,
        }
    }

    /// Convert to a wire address for the frame header
    pub fn to_addr(&self) -> Addr {
        match self {
            ConnAddr::Socket(addr) => Addr::from_socket(*addr),
            ConnAddr::Tunnel(addr) => addr.clone(),
            ConnAddr::Unknown => Addr::new("", "", 0),
        }
    }
}

impl fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnAddr::Socket(addr) => write!(f, "{}", addr),
            ConnAddr::Tunnel(addr) => write!(f, "{}", addr),
            ConnAddr::Unknown => f.write_str("unknown"),
        }
    }
}

/// A byte stream the router can serve
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn local(&self) -> ConnAddr;
    fn peer(&self) -> ConnAddr;
}

impl Connection for TcpStream {
    fn local(&self) -> ConnAddr {
        self.local_addr()
            .map(ConnAddr::Socket)
            .unwrap_or(ConnAddr::Unknown)
    }

    fn peer(&self) -> ConnAddr {
        self.peer_addr()
            .map(ConnAddr::Socket)
            .unwrap_or(ConnAddr::Unknown)
    }
}

impl Connection for Pipe {
    fn local(&self) -> ConnAddr {
        ConnAddr::Tunnel(self.local_addr().clone())
    }

    fn peer(&self) -> ConnAddr {
        ConnAddr::Tunnel(self.remote_addr().clone())
    }
}

impl Connection for DuplexStream {
    fn local(&self) -> ConnAddr {
        ConnAddr::Unknown
    }

    fn peer(&self) -> ConnAddr {
        ConnAddr::Unknown
    }
}

impl Connection for tokio_rustls::server::TlsStream<WrappedConn> {
    fn local(&self) -> ConnAddr {
        self.get_ref().0.local_addr().clone()
    }

    fn peer(&self) -> ConnAddr {
        self.get_ref().0.peer_addr().clone()
    }
}

/// A connection with peekable read-ahead and lazily detected routing hints.
///
/// Peeked bytes are replayed to the first reads, so a handler sees the
/// stream from its first byte regardless of how much was inspected.
pub struct WrappedConn {
    inner: Box<dyn Connection>,
    buf: BytesMut,
    local: ConnAddr,
    peer: ConnAddr,
    servername: Option<String>,
    encrypted: Option<bool>,
    terminated: bool,
    peek_timeout: Duration,
}

impl WrappedConn {
    pub fn new<C: Connection>(conn: C) -> Self {
        let local = conn.local();
        let peer = conn.peer();
        // Tunnel streams already carry the servername the relay resolved
        let servername = match &local {
            ConnAddr::Tunnel(addr) if !addr.host().is_empty() => Some(addr.host().to_string()),
            _ => None,
        };

        Self {
            inner: Box::new(conn),
            buf: BytesMut::with_capacity(DEFAULT_PEEK_SIZE),
            local,
            peer,
            servername,
            encrypted: None,
            terminated: false,
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
        }
    }

    /// Wrap the plaintext side of a TLS session terminated over `conn`
    pub fn from_terminated(tls: tokio_rustls::server::TlsStream<WrappedConn>) -> Self {
        let sni = tls.get_ref().1.server_name().map(str::to_string);
        let inherited = tls.get_ref().0.check_servername().map(str::to_string);
        let peek_timeout = tls.get_ref().0.peek_timeout;

        let mut conn = Self::new(tls).with_peek_timeout(peek_timeout);
        conn.servername = conn.servername.take().or(sni).or(inherited);
        conn.terminated = true;
        conn
    }

    pub fn with_peek_timeout(mut self, peek_timeout: Duration) -> Self {
        self.peek_timeout = peek_timeout;
        self
    }

    pub fn local_addr(&self) -> &ConnAddr {
        &self.local
    }

    pub fn peer_addr(&self) -> &ConnAddr {
        &self.peer
    }

    /// True when this is the plaintext side of a TLS session terminated here
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The servername if already known, without any detection
    pub fn check_servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// Override the servername without detection
    pub fn set_servername(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Some(current) = &self.servername {
            if current != &name {
                warn!(current = %current, new = %name, "servername mismatch");
            }
        }
        self.servername = Some(name);
    }

    /// Bytes read ahead but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Read ahead until at least `n` bytes are buffered, the stream ends, or the peek timeout passes.
    ///
    /// Returns the buffered bytes, which may be fewer than `n`.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        match tokio::time::timeout(self.peek_timeout, self.fill(n)).await {
            Ok(result) => result?,
            Err(_) => trace!(wanted = n, have = self.buf.len(), "peek timed out"),
        }
        Ok(&self.buf)
    }

    async fn fill(&mut self, n: usize) -> io::Result<()> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Whether the stream opens with a TLS ClientHello. Detected once, then cached.
    ///
    /// A recognised hello also yields the SNI servername when one is present.
    pub async fn is_encrypted(&mut self) -> bool {
        if let Some(encrypted) = self.encrypted {
            return encrypted;
        }

        let encrypted = self.detect_tls().await;
        self.encrypted = Some(encrypted);
        encrypted
    }

    async fn detect_tls(&mut self) -> bool {
        let head = match self.peek(TLS_PEEK_LEN).await {
            Ok(head) => head,
            Err(e) => {
                debug!("peek failed: {}", e);
                return false;
            }
        };
        if !looks_like_client_hello(head) {
            return false;
        }

        let Some(len) = record_len(head) else {
            return false;
        };
        let want = TLS_RECORD_HEADER_LEN + len;
        let record = match self.peek(want).await {
            Ok(record) if record.len() >= want => &record[..want],
            _ => return false,
        };

        match extract_sni(record) {
            Ok(name) => {
                if self.servername.is_none() {
                    self.servername = Some(name.to_ascii_lowercase());
                }
            }
            Err(e) => debug!("TLS without usable SNI: {}", e),
        }
        true
    }

    /// Servername from the tunnel address, the TLS SNI or the HTTP Host header
    pub async fn servername(&mut self) -> Option<String> {
        if self.servername.is_some() {
            return self.servername.clone();
        }
        if self.is_encrypted().await {
            return self.servername.clone();
        }

        if let Some(host) = self.sniff_http_host().await {
            self.servername = Some(host);
        }
        self.servername.clone()
    }

    async fn sniff_http_host(&mut self) -> Option<String> {
        let deadline = tokio::time::Instant::now() + self.peek_timeout;
        while !has_header_end(&self.buf) && self.buf.len() < DEFAULT_PEEK_SIZE {
            self.buf.reserve(DEFAULT_PEEK_SIZE - self.buf.len());
            match tokio::time::timeout_at(deadline, self.inner.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => break,
            }
        }
        http_host(&self.buf)
    }
}

fn has_header_end(b: &[u8]) -> bool {
    b.windows(4).any(|w| w == b"\r\n\r\n")
}

/// The Host header of an HTTP/1.x request head, lowercased and without a port
pub fn http_host(head: &[u8]) -> Option<String> {
    // The head may be cut mid-character; keep the valid prefix
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&head[..e.valid_up_to()]).ok()?,
    };

    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.contains(" HTTP/") {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let value = value.trim();
        let host = if let Some(rest) = value.strip_prefix('[') {
            rest.split(']').next().unwrap_or_default()
        } else {
            value.split(':').next().unwrap_or_default()
        };
        if host.is_empty() {
            return None;
        }
        return Some(host.to_ascii_lowercase());
    }
    None
}

impl fmt::Debug for WrappedConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("servername", &self.servername)
            .field("encrypted", &self.encrypted)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl AsyncRead for WrappedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WrappedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

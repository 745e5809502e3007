//! Ordered route multiplexer
//!
//! Routes are tried in registration order. A route's pattern is one of:
//! - `*` matches every connection
//! - `:<port>` matches the local port
//! - `example.com` matches the servername exactly
//! - `*.example.com` matches any servername ending in `.example.com`
//!
//! A handler declines a connection by returning [`ServeError::NotHandled`]
//! with the connection, which moves evaluation on to the next route.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::server::ResolvesServerCert;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::conn::{Connection, WrappedConn, DEFAULT_PEEK_TIMEOUT};
use crate::handlers::forward::{ForwardError, Forwarder};
use crate::handlers::proxy::{ProxyError, ReverseProxy};
use crate::handlers::tls::TlsTerminator;

#[derive(Debug, Error)]
pub enum ServeError {
    /// The handler declined the connection and gives it back
    #[error("Connection not handled")]
    NotHandled(WrappedConn),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0}")]
    Other(String),
}

/// Serves one connection
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError>;
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(WrappedConn) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ServeError>> + Send,
{
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        (self.0)(conn).await
    }
}

/// Turn an async closure into a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(WrappedConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServeError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        (**self).serve(conn).await
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long to wait for the bytes that identify a connection
    pub peek_timeout: Duration,
    /// Idle timeout for forward routes registered without one
    pub default_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            default_timeout: Duration::from_secs(45),
        }
    }
}

enum Target {
    Handler(Arc<dyn Handler>),
    /// Terminate TLS and serve the plaintext through this same mux
    Reenter(TlsTerminator),
}

struct Route {
    pattern: String,
    terminate: bool,
    target: Target,
    comment: String,
}

pub struct RouteMux {
    routes: Vec<Route>,
    config: MuxConfig,
}

impl Default for RouteMux {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteMux {
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        Self {
            routes: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered patterns, in evaluation order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }

    fn push(mut self, pattern: &str, terminate: bool, target: Target, comment: String) -> Self {
        debug!(pattern = %pattern, terminate, "{}", comment);
        self.routes.push(Route {
            pattern: pattern.to_ascii_lowercase(),
            terminate,
            target,
            comment,
        });
        self
    }

    /// Forward matching connections to `target` (`host:port`)
    pub fn forward_tcp(self, pattern: &str, target: &str, idle_timeout: Option<Duration>) -> Self {
        let idle = idle_timeout.unwrap_or(self.config.default_timeout);
        let comment = format!("forward to {}", target);
        self.push(
            pattern,
            false,
            Target::Handler(Arc::new(Forwarder::new(target, idle))),
            comment,
        )
    }

    /// Reverse proxy matching HTTP connections to `target` (`host:port`)
    pub fn reverse_proxy_http(self, pattern: &str, target: &str) -> Self {
        let comment = format!("reverse proxy to http://{}", target);
        self.push(
            pattern,
            false,
            Target::Handler(Arc::new(ReverseProxy::http(target))),
            comment,
        )
    }

    /// Reverse proxy matching connections to an HTTPS `target`.
    ///
    /// The upstream certificate is not verified; this is meant for local
    /// services with self-signed certificates.
    pub fn reverse_proxy_https(self, pattern: &str, target: &str) -> Self {
        let comment = format!("reverse proxy to https://{}", target);
        self.push(
            pattern,
            false,
            Target::Handler(Arc::new(ReverseProxy::https_insecure(target))),
            comment,
        )
    }

    /// Hand matching connections to `handler`
    pub fn handle_tcp(self, pattern: &str, handler: Arc<dyn Handler>, comment: &str) -> Self {
        self.push(pattern, false, Target::Handler(handler), comment.to_string())
    }

    /// Terminate TLS on matching encrypted connections and route the plaintext through this mux again
    pub fn handle_tls(self, pattern: &str, certs: Arc<dyn ResolvesServerCert>) -> Self {
        let terminator = TlsTerminator::new(certs);
        self.push(pattern, true, Target::Reenter(terminator), "terminate TLS".to_string())
    }

    /// Terminate TLS on matching encrypted connections and hand the plaintext to `next`
    pub fn handle_tls_with(
        self,
        pattern: &str,
        certs: Arc<dyn ResolvesServerCert>,
        next: Arc<dyn Handler>,
    ) -> Self {
        let terminator = TlsTerminator::new(certs).with_next(next);
        self.push(
            pattern,
            true,
            Target::Handler(Arc::new(terminator)),
            "terminate TLS".to_string(),
        )
    }

    /// Serve a raw connection
    pub async fn serve_conn<C: Connection>(&self, conn: C) -> Result<(), ServeError> {
        let conn = WrappedConn::new(conn).with_peek_timeout(self.config.peek_timeout);
        self.serve(conn).await
    }

    /// Accept connections until the listener fails, serving each on its own task
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!("Routing connections on {}", local);

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error on {}: {}", local, e);
                    continue;
                }
            };
            trace!("New connection from {}", peer);

            let mux = self.clone();
            tokio::spawn(async move {
                if let Err(e) = mux.serve_conn(socket).await {
                    debug!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn matches(&self, route: &Route, conn: &mut WrappedConn) -> bool {
        if route.terminate {
            // Forces SNI detection before the servername is compared
            conn.is_encrypted().await;
        }

        if route.pattern == "*" {
            return true;
        }
        if let Some(port) = route.pattern.strip_prefix(':') {
            return conn
                .local_addr()
                .port()
                .is_some_and(|p| p.to_string() == port);
        }

        match conn.servername().await {
            Some(name) => servername_matches(&route.pattern, &name),
            None => false,
        }
    }

    async fn dispatch(&self, route: &Route, conn: WrappedConn) -> Result<(), ServeError> {
        match &route.target {
            Target::Handler(handler) => handler.serve(conn).await,
            Target::Reenter(terminator) => {
                let plain = terminator.terminate(conn).await?;
                debug!(servername = ?plain.check_servername(), "TLS terminated");
                self.serve(plain).await
            }
        }
    }
}

#[async_trait]
impl Handler for RouteMux {
    async fn serve(&self, mut conn: WrappedConn) -> Result<(), ServeError> {
        for route in &self.routes {
            if !self.matches(route, &mut conn).await {
                continue;
            }
            trace!(pattern = %route.pattern, "route matched: {}", route.comment);

            match self.dispatch(route, conn).await {
                Err(ServeError::NotHandled(returned)) => {
                    trace!(pattern = %route.pattern, "route declined connection");
                    conn = returned;
                }
                result => return result,
            }
        }

        debug!(
            peer = %conn.peer_addr(),
            servername = ?conn.check_servername(),
            "No match found"
        );
        let _ = conn.shutdown().await;
        Ok(())
    }
}

/// Whether `pattern` (an exact name or `*.suffix`) covers `name`
pub fn servername_matches(pattern: &str, name: &str) -> bool {
    if pattern.eq_ignore_ascii_case(name) {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            // Byte-wise: names come off the wire and need not be ASCII
            let (name, suffix) = (name.as_bytes(), suffix.as_bytes());
            let start = match name.len().checked_sub(suffix.len()) {
                Some(start) if start > 1 => start,
                _ => return false,
            };
            name[start..].eq_ignore_ascii_case(suffix) && name[start - 1] == b'.'
        }
        None => false,
    }
}

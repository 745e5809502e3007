//! HTTP/1.1 reverse proxy

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST, USER_AGENT};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::conn::WrappedConn;
use crate::handlers::tls::{ensure_crypto_provider, SkipVerification};
use crate::mux::{Handler, ServeError};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Proxies HTTP requests read from the connection to a fixed upstream
#[derive(Clone)]
pub struct ReverseProxy {
    target: String,
    tls: Option<TlsConnector>,
}

impl ReverseProxy {
    /// Plain HTTP upstream at `target` (`host:port`)
    pub fn http(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            tls: None,
        }
    }

    /// HTTPS upstream at `target`, accepting any certificate it presents
    pub fn https_insecure(target: impl Into<String>) -> Self {
        ensure_crypto_provider();
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth();

        Self {
            target: target.into(),
            tls: Some(TlsConnector::from(Arc::new(config))),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn target_host(&self) -> &str {
        match self.target.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                host.trim_start_matches('[').trim_end_matches(']')
            }
            _ => &self.target,
        }
    }

    /// Send one request upstream, answering 502 when the upstream cannot be reached
    async fn handle(&self, req: Request<Incoming>, peer_ip: String) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.proxy_request(req, &peer_ip).await {
            Ok(resp) => {
                trace!(%method, %path, status = %resp.status(), "proxied");
                resp
            }
            Err(e) => {
                warn!(upstream = %self.target, %method, %path, "Proxy request failed: {}", e);
                bad_gateway()
            }
        }
    }

    async fn proxy_request(
        &self,
        mut req: Request<Incoming>,
        peer_ip: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        self.rewrite_request(&mut req, peer_ip)?;
        let client_upgrade = is_upgrade(&req).then(|| hyper::upgrade::on(&mut req));

        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("Failed to connect to {}: {}", self.target, e))
        })?;

        let mut resp = match &self.tls {
            None => send(stream, req).await?,
            Some(connector) => {
                let name = ServerName::try_from(self.target_host().to_string())
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                send(tls, req).await?
            }
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut resp);
                tokio::spawn(bridge_upgrade(client_upgrade, upstream_upgrade));
            }
        }

        Ok(resp.map(|body| body.boxed_unsync()))
    }

    fn rewrite_request(&self, req: &mut Request<Incoming>, peer_ip: &str) -> Result<(), ProxyError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::RequestFailed(e.to_string()))?;
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        headers.remove(&X_FORWARDED_FOR);
        headers.remove(&X_FORWARDED_PROTO);
        headers.remove(&X_FORWARDED_PORT);
        if let Ok(value) = HeaderValue::from_str(peer_ip) {
            if !peer_ip.is_empty() {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        // An absent User-Agent must not become the client library's default
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(""));
        }
        if !headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&self.target) {
                headers.insert(HOST, host);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        let peer_ip = conn.peer_addr().host();
        debug!(peer = %conn.peer_addr(), upstream = %self.target, "reverse proxy connection");

        let proxy = self.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            let peer_ip = peer_ip.clone();
            async move { Ok::<_, hyper::Error>(proxy.handle(req, peer_ip).await) }
        });

        server_http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .with_upgrades()
            .await
            .map_err(ProxyError::from)?;
        Ok(())
    }
}

async fn send<S>(stream: S, req: Request<Incoming>) -> Result<Response<Incoming>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::RequestFailed(format!("Failed to send request: {}", e)))
}

async fn bridge_upgrade(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        debug!("Upgraded connection closed: {}", e);
    }
}

fn is_upgrade<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(http::header::UPGRADE)
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_host() {
        assert_eq!(ReverseProxy::http("localhost:3000").target_host(), "localhost");
        assert_eq!(ReverseProxy::http("[::1]:8443").target_host(), "::1");
        assert_eq!(ReverseProxy::http("example.internal").target_host(), "example.internal");
    }

    #[test]
    fn test_bad_gateway() {
        assert_eq!(bad_gateway().status(), StatusCode::BAD_GATEWAY);
    }
}

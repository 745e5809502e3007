//! `burrow connect`: expose local services through a relay

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_mux::{dial, Listener, TunnelConfig, TunnelError};
use burrow_relay::{Grants, JwtAuthorizer};
use burrow_router::{CertStore, RouteMux};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::config::{Local, PortForward};

const TOKEN_VALIDITY_HOURS: i64 = 24;

/// Where the device gets the token it presents to the relay
pub enum TokenSource {
    Static(String),
    /// Sign a fresh token for every connection attempt
    Secret { secret: String, grants: Grants },
}

impl TokenSource {
    pub fn token(&self) -> Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Secret { secret, grants } => JwtAuthorizer::issue(
                secret.as_bytes(),
                grants,
                chrono::Duration::hours(TOKEN_VALIDITY_HOURS),
            )
            .context("Failed to sign access token"),
        }
    }
}

pub struct ConnectOptions {
    pub relay: String,
    pub token: TokenSource,
    pub locals: Vec<Local>,
    pub port_forwards: Vec<PortForward>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

/// Grants a device asks for when it signs its own token
pub fn grants_for(subject: Option<String>, locals: &[Local], port_forwards: &[PortForward]) -> Grants {
    let domains = locals
        .iter()
        .filter(|l| l.is_claimable())
        .map(|l| l.domain.clone())
        .collect();
    let ports = port_forwards.iter().map(|f| f.from).collect();
    Grants::new(subject.unwrap_or_default())
        .with_domains(domains)
        .with_ports(ports)
}

/// Route order: raw port forwards, TLS termination re-entering the mux, then
/// each local service
pub fn build_mux(options: &ConnectOptions, certs: Arc<CertStore>) -> RouteMux {
    let mut mux = RouteMux::new();

    for fwd in &options.port_forwards {
        let target = format!("localhost:{}", fwd.to);
        info!("Forwarding {} to {}", fwd.pattern(), target);
        mux = mux.forward_tcp(&fwd.pattern(), &target, Some(options.idle_timeout));
    }

    mux = mux.handle_tls("*", certs);

    for local in &options.locals {
        let target = format!("localhost:{}", local.port);
        info!(
            "Serving {} from {} ({})",
            local.domain,
            target,
            local.scheme.as_deref().unwrap_or("tcp")
        );
        mux = match local.scheme.as_deref() {
            Some("http") => mux.reverse_proxy_http(&local.domain, &target),
            Some("https") => mux.reverse_proxy_https(&local.domain, &target),
            _ => mux.forward_tcp(&local.domain, &target, Some(options.idle_timeout)),
        };
    }

    mux
}

/// Accept streams from the relay until the tunnel closes
pub async fn serve_tunnel<T>(tunnel: T, mux: Arc<RouteMux>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let listener = Listener::new(tunnel);
    while let Ok(pipe) = listener.accept().await {
        debug!(client = %pipe.remote_addr(), dst = %pipe.local_addr(), "stream opened");
        let mux = mux.clone();
        tokio::spawn(async move {
            if let Err(e) = mux.serve_conn(pipe).await {
                debug!("stream ended with error: {}", e);
            }
        });
    }
    listener.close().await;
}

/// Keep a tunnel to the relay open, reconnecting with exponential backoff
pub async fn run(options: ConnectOptions) -> Result<()> {
    let names: Vec<String> = options
        .locals
        .iter()
        .filter(|l| l.is_claimable())
        .map(|l| l.domain.clone())
        .collect();
    let certs = crate::relay::load_certs(options.tls_cert.as_ref(), options.tls_key.as_ref(), &names)?;
    let mux = Arc::new(build_mux(&options, certs));

    let mut delay = options.initial_delay;
    loop {
        let token = options.token.token()?;
        match dial(&options.relay, &token, TunnelConfig::default()).await {
            Ok(tunnel) => {
                info!("Listening through {}", options.relay);
                delay = options.initial_delay;
                serve_tunnel(tunnel, mux.clone()).await;
                warn!("Tunnel to {} closed", options.relay);
            }
            Err(TunnelError::InvalidUrl(e)) => {
                return Err(e).with_context(|| format!("Invalid relay URL {}", options.relay));
            }
            Err(TunnelError::InvalidToken) => {
                anyhow::bail!("access token cannot be sent in a header");
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", options.relay, e);
            }
        }

        info!("Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(options.max_delay);
    }
}

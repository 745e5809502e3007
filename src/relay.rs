//! `burrow relay`: accept device tunnels and route public traffic into them

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_relay::{ApiHandler, DispatchHandler, JwtAuthorizer, RelayState};
use burrow_router::{CertStore, RouteMux};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::PortForward;

pub struct RelayOptions {
    pub listen: Vec<String>,
    pub secret: String,
    pub api_hostname: Option<String>,
    pub port_forwards: Vec<PortForward>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub idle_timeout: Duration,
}

/// Certificates from PEM files, or a self-signed certificate for `names`
pub fn load_certs(
    cert: Option<&PathBuf>,
    key: Option<&PathBuf>,
    names: &[String],
) -> Result<Arc<CertStore>> {
    let store = match (cert, key) {
        (Some(cert), Some(key)) => CertStore::from_pem_files(cert, key)
            .with_context(|| format!("Failed to load certificate {}", cert.display()))?,
        (None, None) => {
            CertStore::self_signed(names).context("Failed to generate self-signed certificate")?
        }
        _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
    };
    Ok(Arc::new(store))
}

/// Route order: raw port forwards, device tunnels, TLS termination, then the
/// relay's own API once the connection is plaintext
pub fn build_mux(options: &RelayOptions, state: Arc<RelayState>, certs: Arc<CertStore>) -> RouteMux {
    let mut mux = RouteMux::new();

    for fwd in &options.port_forwards {
        let target = format!("localhost:{}", fwd.to);
        info!("Forwarding {} to {}", fwd.pattern(), target);
        mux = mux.forward_tcp(&fwd.pattern(), &target, Some(options.idle_timeout));
    }

    mux = mux
        .handle_tcp(
            "*",
            Arc::new(DispatchHandler::new(state.table.clone())),
            "route to device tunnels",
        )
        .handle_tls("*", certs);

    if let Some(api_hostname) = &options.api_hostname {
        info!("Serving tunnel and admin API on {}", api_hostname);
        mux = mux.handle_tcp(
            api_hostname,
            Arc::new(ApiHandler::new(state)),
            "tunnel and admin API",
        );
    }

    mux
}

pub async fn run(options: RelayOptions) -> Result<()> {
    if options.listen.is_empty() {
        anyhow::bail!("relay needs at least one --listen address");
    }
    if options.api_hostname.is_none() {
        warn!("No --api-hostname set; devices will not be able to connect");
    }

    let authorizer = Arc::new(JwtAuthorizer::new(options.secret.as_bytes()));
    let state = Arc::new(RelayState::new(authorizer));

    let names: Vec<String> = options.api_hostname.iter().cloned().collect();
    let certs = load_certs(options.tls_cert.as_ref(), options.tls_key.as_ref(), &names)?;
    let mux = Arc::new(build_mux(&options, state, certs));

    let mut servers = JoinSet::new();
    for addr in &options.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Listening on {}", addr);
        servers.spawn(mux.clone().serve_listener(listener));
    }

    match servers.join_next().await {
        Some(Ok(Ok(()))) | None => Ok(()),
        Some(Ok(Err(e))) => Err(e).context("Listener failed"),
        Some(Err(e)) => Err(e).context("Listener task panicked"),
    }
}

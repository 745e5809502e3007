//! Connection routing for burrow
//!
//! A [`RouteMux`] walks an ordered list of routes for every accepted
//! connection and hands it to the first handler that takes it. Routes match
//! on the servername (from SNI, the HTTP Host header, or the tunnel address),
//! on the local port, or on `*`.

pub mod certs;
pub mod conn;
pub mod handlers;
pub mod mux;
pub mod sni;

pub use certs::{generate_self_signed, load_pem, CertError, CertStore};
pub use conn::{ConnAddr, Connection, WrappedConn};
pub use handlers::forward::{forward, ForwardError, Forwarder};
pub use handlers::proxy::{ProxyError, ReverseProxy};
pub use handlers::tls::{ensure_crypto_provider, TlsTerminator};
pub use mux::{handler_fn, Handler, MuxConfig, RouteMux, ServeError};
pub use sni::{extract_sni, SniError};

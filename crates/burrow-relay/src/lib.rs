//! Burrow relay
//!
//! Accepts authorized device tunnels, keeps a table of which device serves
//! which names, and dispatches public client connections into the right
//! tunnel.

pub mod admin;
pub mod auth;
pub mod dispatch;
pub mod models;
pub mod session;
pub mod subscriber;
pub mod table;

use std::sync::Arc;

use burrow_mux::TunnelConfig;

pub use admin::{router, ApiHandler};
pub use auth::{extract_token, AuthError, Authorizer, Grants, JwtAuthorizer, ADMIN_SUBJECT};
pub use dispatch::DispatchHandler;
pub use session::{run_session, upgrade_tunnel, PeerAddr, SessionError};
pub use subscriber::SubscriberConn;
pub use table::{ConnectionTable, SubscriberStatus};

/// State shared by the relay's HTTP handlers
pub struct RelayState {
    pub table: Arc<ConnectionTable>,
    pub authorizer: Arc<dyn Authorizer>,
    pub tunnel_config: TunnelConfig,
}

impl RelayState {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            table: Arc::new(ConnectionTable::new()),
            authorizer,
            tunnel_config: TunnelConfig::default(),
        }
    }

    pub fn with_tunnel_config(mut self, config: TunnelConfig) -> Self {
        self.tunnel_config = config;
        self
    }
}

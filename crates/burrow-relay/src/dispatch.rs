//! Routes public client connections to the device serving their name

use std::sync::Arc;

use async_trait::async_trait;
use burrow_router::{Handler, ServeError, WrappedConn};
use tracing::{debug, trace};

use crate::subscriber::SubscriberConn;
use crate::table::ConnectionTable;

/// Catch-all route that sends connections into device tunnels
pub struct DispatchHandler {
    table: Arc<ConnectionTable>,
}

impl DispatchHandler {
    pub fn new(table: Arc<ConnectionTable>) -> Self {
        Self { table }
    }

    /// Exact name first, then wildcards from most to least specific
    pub fn lookup(&self, servername: &str) -> Option<Arc<SubscriberConn>> {
        if let Some(conn) = self.table.get_server(servername) {
            return Some(conn);
        }

        let mut rest = servername;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(conn) = self.table.get_server(&format!("*.{}", parent)) {
                return Some(conn);
            }
            rest = parent;
        }
        None
    }

    async fn find(&self, conn: &mut WrappedConn) -> Option<Arc<SubscriberConn>> {
        if let Some(name) = conn.servername().await {
            let name = name.to_ascii_lowercase();
            if is_hostname(&name) {
                if let Some(server) = self.lookup(&name) {
                    return Some(server);
                }
            } else {
                debug!(servername = %name, "ignoring invalid servername");
            }
        }

        let port = conn.local_addr().port()?;
        self.table.get_server(&format!(":{}", port))
    }
}

#[async_trait]
impl Handler for DispatchHandler {
    async fn serve(&self, mut conn: WrappedConn) -> Result<(), ServeError> {
        let Some(server) = self.find(&mut conn).await else {
            trace!(servername = ?conn.check_servername(), "no tunnel for connection");
            return Err(ServeError::NotHandled(conn));
        };

        server
            .serve(conn)
            .await
            .map_err(|e| ServeError::Other(e.to_string()))
    }
}

/// Whether `name` is a syntactically valid DNS hostname
pub fn is_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

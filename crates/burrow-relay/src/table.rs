//! Registry of connected devices, by subject and by routable name
//!
//! Routable names are the granted domains (lowercased) and granted ports as
//! `:<port>`. Every entry reachable by name is also reachable by subject.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::subscriber::SubscriberConn;

/// Connections keyed by the device's remote address
type ConnSet = HashMap<String, Arc<SubscriberConn>>;

/// Status of one subject's tunnels, as reported by the admin API
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub since: DateTime<Utc>,
    pub sub: String,
    pub sockets: Vec<String>,
    pub clients: usize,
}

#[derive(Default)]
struct Inner {
    subjects: HashMap<String, ConnSet>,
    names: HashMap<String, ConnSet>,
}

#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<Inner>,
}

fn routable_names(conn: &SubscriberConn) -> Vec<String> {
    let grants = conn.grants();
    grants
        .domains
        .iter()
        .map(|d| d.to_ascii_lowercase())
        .chain(grants.ports.iter().map(|p| format!(":{}", p)))
        .collect()
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection under its subject and every name it was granted
    pub fn add(&self, conn: Arc<SubscriberConn>) {
        let remote = conn.remote_addr().to_string();
        let names = routable_names(&conn);

        let mut inner = self.write();
        for name in &names {
            inner
                .names
                .entry(name.clone())
                .or_default()
                .insert(remote.clone(), conn.clone());
        }
        inner
            .subjects
            .entry(conn.subject().to_string())
            .or_default()
            .insert(remote.clone(), conn.clone());
        drop(inner);

        info!(subject = %conn.subject(), remote = %remote, names = ?names, "subscriber registered");
    }

    /// Close and unregister every connection for `subject`
    pub async fn remove(&self, subject: &str) -> bool {
        let removed = {
            let mut inner = self.write();
            let Some(conns) = inner.subjects.remove(subject) else {
                return false;
            };
            for conn in conns.values() {
                unlink_names(&mut inner.names, conn);
            }
            conns
        };

        for conn in removed.values() {
            conn.close().await;
        }
        info!(subject = %subject, count = removed.len(), "subscriber removed");
        true
    }

    /// Unregister one connection, leaving the subject's other connections in place
    pub fn remove_conn(&self, conn: &SubscriberConn) -> bool {
        let mut inner = self.write();
        let subject = conn.subject();
        let remote = conn.remote_addr();

        let Some(conns) = inner.subjects.get_mut(subject) else {
            return false;
        };
        let found = conns
            .get(remote)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn));
        if !found {
            return false;
        }
        conns.remove(remote);
        if conns.is_empty() {
            inner.subjects.remove(subject);
        }
        unlink_names(&mut inner.names, conn);

        debug!(subject = %subject, remote = %remote, "subscriber connection removed");
        true
    }

    /// The connection for `name` with the fewest open client streams
    pub fn get_server(&self, name: &str) -> Option<Arc<SubscriberConn>> {
        let inner = self.read();
        inner
            .names
            .get(name)?
            .values()
            .min_by_key(|conn| conn.client_count())
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().names.contains_key(name)
    }

    /// Status for every subject, sorted by subject
    pub fn list_subscribers(&self) -> Vec<SubscriberStatus> {
        let inner = self.read();
        let mut list: Vec<_> = inner
            .subjects
            .iter()
            .filter_map(|(sub, conns)| status(sub, conns))
            .collect();
        list.sort_by(|a, b| a.sub.cmp(&b.sub));
        list
    }

    pub fn subscriber(&self, subject: &str) -> Option<SubscriberStatus> {
        let inner = self.read();
        status(subject, inner.subjects.get(subject)?)
    }
}

fn unlink_names(names: &mut HashMap<String, ConnSet>, conn: &SubscriberConn) {
    let remote = conn.remote_addr();
    for name in routable_names(conn) {
        if let Some(set) = names.get_mut(&name) {
            if set
                .get(remote)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn))
            {
                set.remove(remote);
            }
            if set.is_empty() {
                names.remove(&name);
            }
        }
    }
}

fn status(sub: &str, conns: &ConnSet) -> Option<SubscriberStatus> {
    let since = conns.values().map(|c| c.since()).min()?;
    let mut sockets: Vec<String> = conns.keys().cloned().collect();
    sockets.sort();
    Some(SubscriberStatus {
        since,
        sub: sub.to_string(),
        sockets,
        clients: conns.values().map(|c| c.client_count()).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grants;
    use crate::subscriber::ClientSlot;
    use std::collections::HashSet;
    use tokio::io::sink;
    use tokio_util::sync::CancellationToken;

    fn subscriber(sub: &str, remote: &str, domains: &[&str]) -> Arc<SubscriberConn> {
        let grants = Grants::new(sub).with_domains(domains.iter().map(|d| d.to_string()).collect());
        Arc::new(SubscriberConn::new(remote, grants, sink()))
    }

    fn add_clients(conn: &SubscriberConn, n: usize) -> Vec<(ClientSlot, CancellationToken)> {
        (0..n)
            .map(|i| conn.register(format!("198.51.100.1:{}", 40000 + i)))
            .collect()
    }

    fn assert_invariant(table: &ConnectionTable) {
        let inner = table.read();
        for (name, set) in &inner.names {
            assert!(!set.is_empty(), "empty connection set left for {}", name);
            for (remote, conn) in set {
                let by_subject = inner
                    .subjects
                    .get(conn.subject())
                    .and_then(|conns| conns.get(remote))
                    .unwrap_or_else(|| panic!("{} under {} has no subject entry", remote, name));
                assert!(Arc::ptr_eq(by_subject, conn));
            }
        }
        for conns in inner.subjects.values() {
            assert!(!conns.is_empty());
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_keep_table_consistent() {
        let table = ConnectionTable::new();
        let a1 = subscriber("alice", "10.0.0.1:5000", &["a.example.com", "shared.example.com"]);
        let a2 = subscriber("alice", "10.0.0.2:5000", &["a.example.com"]);
        let b = subscriber("bob", "10.0.0.3:5000", &["B.example.com", "shared.example.com"]);

        table.add(a1.clone());
        assert_invariant(&table);
        table.add(a2.clone());
        table.add(b.clone());
        assert_invariant(&table);
        assert!(table.contains("b.example.com"));

        assert!(table.remove_conn(&a1));
        assert_invariant(&table);
        assert!(!table.remove_conn(&a1));
        assert!(table.contains("a.example.com"));

        assert!(table.remove("alice").await);
        assert_invariant(&table);
        assert!(!table.contains("a.example.com"));
        assert!(a2.is_closed());
        assert!(!a1.is_closed());

        assert!(!table.remove("alice").await);
        assert!(table.remove("bob").await);
        assert_invariant(&table);
        assert!(table.list_subscribers().is_empty());
        assert!(!table.contains("shared.example.com"));
    }

    #[tokio::test]
    async fn test_interleaved_operations_preserve_invariant() {
        let table = ConnectionTable::new();
        let domains = ["x.example.com", "y.example.com", "z.example.com"];
        let mut live = Vec::new();

        for i in 0..30 {
            let sub = format!("sub{}", i % 4);
            let conn = subscriber(&sub, &format!("10.1.0.{}:7000", i), &[domains[i % 3], domains[(i + 1) % 3]]);
            table.add(conn.clone());
            live.push(conn);

            if i % 5 == 4 {
                let victim = live.remove(i % live.len());
                table.remove_conn(&victim);
            }
            if i % 7 == 6 {
                table.remove(&format!("sub{}", i % 4)).await;
            }
            assert_invariant(&table);
        }

        let subjects: HashSet<_> = table.list_subscribers().into_iter().map(|s| s.sub).collect();
        assert!(subjects.len() <= 4);
    }

    #[tokio::test]
    async fn test_get_server_picks_least_loaded() {
        let table = ConnectionTable::new();
        let busy = subscriber("s", "10.0.0.1:1", &["app.example.com"]);
        let idle = subscriber("s", "10.0.0.2:1", &["app.example.com"]);
        let busiest = subscriber("s", "10.0.0.3:1", &["app.example.com"]);

        let _c1 = add_clients(&busy, 3);
        let _c3 = add_clients(&busiest, 5);
        assert_eq!(busy.client_count(), 3);
        assert_eq!(idle.client_count(), 0);
        assert_eq!(busiest.client_count(), 5);

        table.add(busy);
        table.add(idle.clone());
        table.add(busiest);

        let chosen = table.get_server("app.example.com").unwrap();
        assert!(Arc::ptr_eq(&chosen, &idle));
        assert!(table.get_server("missing.example.com").is_none());
    }

    #[tokio::test]
    async fn test_list_subscribers() {
        let table = ConnectionTable::new();
        let conn = subscriber("carol", "10.0.0.9:9", &["c.example.com"]);
        let _clients = add_clients(&conn, 2);
        table.add(conn);
        table.add(subscriber("carol", "10.0.0.8:9", &["c.example.com"]));

        let status = table.subscriber("carol").unwrap();
        assert_eq!(status.sockets, vec!["10.0.0.8:9", "10.0.0.9:9"]);
        assert_eq!(status.clients, 2);
        assert_eq!(table.list_subscribers(), vec![status]);
    }

    #[tokio::test]
    async fn test_ports_are_routable() {
        let table = ConnectionTable::new();
        let grants = Grants::new("dave").with_ports(vec![2222]);
        table.add(Arc::new(SubscriberConn::new("10.0.0.4:1", grants, sink())));
        assert!(table.get_server(":2222").is_some());
    }
}

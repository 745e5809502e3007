//! One device's tunnel session and the client streams routed through it

use std::sync::Arc;

use async_trait::async_trait;
use burrow_mux::{EncodeError, Encoder, RouteBytes};
use burrow_proto::{Addr, Scheme, Termination};
use burrow_router::{ConnAddr, WrappedConn};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{split, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::Grants;

/// Payload chunks queued for one client before the stream is dropped as stalled
const CLIENT_BACKLOG: usize = 128;

/// Bytes from the device for one client, written out by that client's own task
pub(crate) enum Inbound {
    Data(Bytes),
    End,
}

/// Both ends of a newly registered client's inbound queue
pub(crate) struct ClientSlot {
    inbound: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
}

struct ClientEntry {
    inbound: mpsc::Sender<Inbound>,
    /// Stops both directions of the client stream
    stop: CancellationToken,
}

/// An authorized device connected over a tunnel
pub struct SubscriberConn {
    since: DateTime<Utc>,
    remote_addr: String,
    grants: Grants,
    clients: DashMap<String, ClientEntry>,
    encoder: Arc<Encoder>,
    cancel: CancellationToken,
}

impl SubscriberConn {
    pub fn new<W>(remote_addr: impl Into<String>, grants: Grants, tunnel_writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let cancel = CancellationToken::new();
        Self {
            since: Utc::now(),
            remote_addr: remote_addr.into(),
            grants,
            clients: DashMap::new(),
            encoder: Arc::new(Encoder::new(tunnel_writer, cancel.clone())),
            cancel,
        }
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Address of the device end of the tunnel
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn grants(&self) -> &Grants {
        &self.grants
    }

    pub fn subject(&self) -> &str {
        &self.grants.sub
    }

    /// Number of client streams currently open
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves with an error if a write to the tunnel fails
    pub async fn run_encoder(&self) -> Result<(), EncodeError> {
        self.encoder.run().await
    }

    pub(crate) fn register(&self, key: String) -> (ClientSlot, CancellationToken) {
        let (inbound, inbound_rx) = mpsc::channel(CLIENT_BACKLOG);
        let stop = self.cancel.child_token();
        let entry = ClientEntry {
            inbound: inbound.clone(),
            stop: stop.clone(),
        };
        let slot = ClientSlot {
            inbound,
            inbound_rx,
        };
        if let Some(old) = self.clients.insert(key.clone(), entry) {
            debug!(client = %key, "replacing stale client stream");
            old.stop.cancel();
        }
        (slot, stop)
    }

    /// Carry one client connection through the tunnel until both directions finish
    pub async fn serve(&self, mut client: WrappedConn) -> Result<(), EncodeError> {
        let src = match client.peer_addr() {
            ConnAddr::Socket(addr) => Addr::from_socket(*addr),
            other => other.to_addr(),
        };
        let dst = destination(&mut client).await;
        let key = src.host_port();
        debug!(subject = %self.grants.sub, client = %key, dst = %dst, "routing client into tunnel");

        let (reader, writer) = split(client);
        let (slot, stop) = self.register(key.clone());
        let ClientSlot {
            inbound: ours,
            inbound_rx,
        } = slot;

        let encode = async {
            let result = self.encoder.encode_until(reader, &src, &dst, &stop).await;
            if result.is_err() {
                stop.cancel();
            }
            result
        };
        // The client may finish sending long before the device does
        let (result, ()) = tokio::join!(encode, deliver(writer, inbound_rx, &stop, &key));

        self.clients
            .remove_if(&key, |_, entry| entry.inbound.same_channel(&ours));
        trace!(client = %key, "client stream finished");
        result
    }

    /// Close the tunnel and every client stream
    pub async fn close(&self) {
        self.cancel.cancel();
        self.clients.clear();
        self.encoder.shutdown().await;
        debug!(subject = %self.grants.sub, remote = %self.remote_addr, "subscriber closed");
    }
}

/// Write queued device bytes to the client until `End`, a write failure, or `stop`
async fn deliver(
    mut writer: WriteHalf<WrappedConn>,
    mut inbound: mpsc::Receiver<Inbound>,
    stop: &CancellationToken,
    key: &str,
) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = inbound.recv() => next,
        };
        let Some(Inbound::Data(payload)) = next else {
            break;
        };
        let written = tokio::select! {
            _ = stop.cancelled() => break,
            written = writer.write_all(&payload) => written,
        };
        if let Err(e) = written {
            debug!(client = %key, "client write failed: {}", e);
            stop.cancel();
            break;
        }
    }
    inbound.close();
    let _ = writer.shutdown().await;
}

/// Destination address announced to the device for a client connection
async fn destination(client: &mut WrappedConn) -> Addr {
    let servername = client.servername().await.unwrap_or_default();
    let port = client.local_addr().port().unwrap_or(0);
    let family = match client.local_addr() {
        ConnAddr::Socket(addr) if addr.is_ipv6() => "IPv6".to_string(),
        ConnAddr::Tunnel(addr) => addr.family().to_string(),
        _ => "IPv4".to_string(),
    };

    let scheme = if client.is_encrypted().await || port == 443 {
        Scheme::Https
    } else if port == 80 {
        Scheme::Http
    } else {
        Scheme::Unspecified
    };
    let termination = if client.is_terminated() {
        Termination::Tls
    } else {
        Termination::None
    };

    Addr::new(family, servername, port)
        .with_scheme(scheme)
        .with_termination(termination)
}

#[async_trait]
impl RouteBytes for SubscriberConn {
    async fn route_bytes(&self, src: &Addr, dst: &Addr, payload: Bytes) {
        let key = src.host_port();
        let Some((inbound, stop)) = self
            .clients
            .get(&key)
            .map(|e| (e.inbound.clone(), e.stop.clone()))
        else {
            trace!(client = %key, "frame for unknown client dropped");
            return;
        };

        let message = match dst.scheme() {
            Scheme::Error => {
                debug!(client = %key, "device reported stream error");
                stop.cancel();
                return;
            }
            Scheme::End => {
                trace!(client = %key, "device finished stream");
                Inbound::End
            }
            _ if payload.is_empty() => return,
            _ => Inbound::Data(payload),
        };

        match inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(client = %key, "client is not reading, dropping its stream");
                stop.cancel();
                self.clients
                    .remove_if(&key, |_, entry| entry.inbound.same_channel(&inbound));
                let _ = self.encoder.write_frame(src, &Addr::error(), &[]).await;
            }
            Err(TrySendError::Closed(_)) => {
                trace!(client = %key, "frame for finished client dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::{Chunk, Parser};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{sleep, timeout};

    /// A subscriber whose tunnel output is parsed into frames
    fn subscriber() -> (Arc<SubscriberConn>, UnboundedReceiver<Chunk>) {
        let (tunnel, mut device) = duplex(1 << 20);
        let conn = Arc::new(SubscriberConn::new("192.0.2.1:9000", Grants::new("device"), tunnel));

        let (tx, frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut parser = Parser::new(Vec::<Chunk>::new());
            let mut buf = vec![0u8; 8192];
            while let Ok(n) = device.read(&mut buf).await {
                if n == 0 || parser.write(&buf[..n]).is_err() {
                    break;
                }
                for chunk in std::mem::take(parser.router_mut()) {
                    let _ = tx.send(chunk);
                }
            }
        });
        (conn, frames)
    }

    /// Connect a loopback client and serve it through `conn`
    async fn connect_client(
        conn: &Arc<SubscriberConn>,
        listener: &TcpListener,
    ) -> (TcpStream, Addr) {
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
            .await
            .unwrap();

        let serving = conn.clone();
        tokio::spawn(async move {
            let _ = serving.serve(WrappedConn::new(server)).await;
        });

        let src = Addr::from_socket(peer);
        let key = src.host_port();
        timeout(Duration::from_secs(5), async {
            while !conn.clients.contains_key(&key) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never registered");
        (client, src)
    }

    fn dst() -> Addr {
        Addr::new("IPv4", "app.example.com", 80).with_scheme(Scheme::Http)
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let (conn, mut frames) = subscriber();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_stalled, a) = connect_client(&conn, &listener).await;
        let (mut reader, b) = connect_client(&conn, &listener).await;

        // Routing never waits on a client, so a client that stops reading
        // overflows its queue and is dropped
        let chunk = Bytes::from(vec![0u8; 64 * 1024]);
        for _ in 0..4096 {
            if !conn.clients.contains_key(&a.host_port()) {
                break;
            }
            conn.route_bytes(&a, &dst(), chunk.clone()).await;
        }
        assert!(!conn.clients.contains_key(&a.host_port()));

        conn.route_bytes(&b, &dst(), Bytes::from_static(b"hello")).await;
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
            .await
            .expect("second client starved")
            .unwrap();
        assert_eq!(&buf, b"hello");

        // The device is told the dropped stream failed
        timeout(Duration::from_secs(5), async {
            loop {
                let frame = frames.recv().await.expect("tunnel closed");
                if frame.src == a && frame.dst.scheme() == &Scheme::Error {
                    break;
                }
            }
        })
        .await
        .expect("no error frame for the stalled client");
    }

    #[tokio::test]
    async fn test_end_half_closes_client() {
        let (conn, _frames) = subscriber();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, src) = connect_client(&conn, &listener).await;

        conn.route_bytes(&src, &dst(), Bytes::from_static(b"bye")).await;
        conn.route_bytes(&src, &Addr::end(), Bytes::new()).await;

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("client never saw EOF")
            .unwrap();
        assert_eq!(received, b"bye");
        assert_eq!(conn.client_count(), 1);

        // The device is done, so closing the client side releases the stream
        client.shutdown().await.unwrap();
        timeout(Duration::from_secs(5), async {
            while conn.client_count() != 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client stream never released");
    }
}

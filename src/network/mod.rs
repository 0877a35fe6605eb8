//! Network Module
//!
//! TCP transport between master and slaves. Each connection is driven by one
//! task that owns the socket, reads whole frames and drains the
//! connection's send queue. Whatever ends a connection (read error, write
//! error, or an explicit close), its `Disconnected` event fires exactly once.

mod server;
mod client;

pub use server::NetworkServer;
pub use client::NetworkClient;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::replication::{FrameCodec, Message};

/// Stable handle of one connection
pub type ConnectionId = u64;

/// Events reported by the transport to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection is established
    Connected(ConnectionId),
    /// A whole message arrived
    Received(ConnectionId, Message),
    /// The connection is gone
    Disconnected(ConnectionId),
}

/// Outbound side of the transport, as seen by the coordinator.
///
/// Both calls only queue work and never block.
pub trait Outbox: Send + Sync {
    /// Queue a message for one connection
    fn send_to(&self, conn: ConnectionId, message: Message);

    /// Tear one connection down
    fn close(&self, conn: ConnectionId);
}

/// Work queued for a connection task
#[derive(Debug)]
enum Outgoing {
    Message(Message),
    Close,
}

/// Live connections, keyed by stable id
pub struct ConnectionTable {
    peers: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Outgoing>>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionTable {
    /// Create a table reporting to `events`
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        })
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Check if there are no live connections
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Register a socket and spawn its connection task
    pub fn attach(self: &Arc<Self>, socket: TcpStream) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.peers.lock().insert(id, tx);
        let _ = self.events.send(TransportEvent::Connected(id));

        let table = Arc::clone(self);
        tokio::spawn(async move {
            table.drive(id, socket, rx).await;
            table.retire(id);
        });

        id
    }

    async fn drive(&self, id: ConnectionId, socket: TcpStream, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
        let peer_addr = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (mut sink, mut stream) = Framed::new(socket, FrameCodec).split();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                        if self.events.send(TransportEvent::Received(id, message)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Dropping connection {} ({}): {}", id, peer_addr, e);
                        break;
                    }
                    None => {
                        tracing::debug!("Connection {} ({}) closed by peer", id, peer_addr);
                        break;
                    }
                },
                outgoing = queue.recv() => match outgoing {
                    Some(Outgoing::Message(message)) => {
                        tracing::trace!("Sending {} to {}", message.type_name(), peer_addr);
                        if let Err(e) = sink.send(message).await {
                            tracing::warn!("Write to connection {} ({}) failed: {}", id, peer_addr, e);
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        tracing::debug!("Closing connection {} ({})", id, peer_addr);
                        let _ = sink.close().await;
                        break;
                    }
                },
            }
        }
    }

    /// Forget a connection, reporting its loss if it was still registered
    fn retire(&self, id: ConnectionId) {
        if self.peers.lock().remove(&id).is_some() {
            let _ = self.events.send(TransportEvent::Disconnected(id));
        }
    }
}

impl Outbox for ConnectionTable {
    fn send_to(&self, conn: ConnectionId, message: Message) {
        match self.peers.lock().get(&conn) {
            Some(tx) => {
                let _ = tx.send(Outgoing::Message(message));
            }
            None => tracing::debug!("Dropping {} for closed connection {}", message.type_name(), conn),
        }
    }

    fn close(&self, conn: ConnectionId) {
        if let Some(tx) = self.peers.lock().get(&conn) {
            let _ = tx.send(Outgoing::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn pair(table: &Arc<ConnectionTable>) -> (ConnectionId, Framed<TcpStream, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = TcpStream::connect(addr).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();
        (table.attach(local), Framed::new(remote, FrameCodec))
    }

    fn update() -> Message {
        Message::UpdateBroadcast {
            tree: Bytes::from_static(b"tree"),
            registry: Bytes::from_static(b"hosts"),
        }
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let (id, mut remote) = pair(&table).await;

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected(id)));

        table.send_to(id, update());
        assert_eq!(remote.next().await.unwrap().unwrap(), update());

        remote.send(update()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Received(id, update())));
    }

    #[tokio::test]
    async fn test_disconnect_reported_once_on_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let (id, mut remote) = pair(&table).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected(id)));

        table.close(id);
        table.close(id);
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected(id)));
        assert!(remote.next().await.is_none());
        assert!(table.is_empty());

        // nothing further is reported for this connection
        table.send_to(id, update());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_reported_on_peer_loss() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let (id, remote) = pair(&table).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected(id)));

        drop(remote);
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected(id)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_connection() {
        use tokio::io::AsyncWriteExt;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = ConnectionTable::new(tx);
        let (id, remote) = pair(&table).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected(id)));

        let mut raw = remote.into_inner();
        raw.write_all(&3u64.to_le_bytes()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected(id)));
    }
}

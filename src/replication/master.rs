//! Master coordinator
//!
//! Admits joining slaves whose top-level names do not collide with the
//! merged tree, and pushes the merged state to every joined slave whenever
//! it changes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{ConnectionState, Message};
use crate::error::Result;
use crate::namespace::Namespace;
use crate::network::{ConnectionId, ConnectionTable, NetworkServer, Outbox, TransportEvent};
use crate::registry::{Host, HostId, FIRST_SLAVE_HOST};
use crate::tree::DirectoryTree;

/// Join arbitration on the master
pub struct MasterCoordinator {
    namespace: Arc<Namespace>,
    outbox: Arc<dyn Outbox>,
    connections: BTreeMap<ConnectionId, ConnectionState>,
    next_host_id: HostId,
}

impl MasterCoordinator {
    pub fn new(namespace: Arc<Namespace>, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            namespace,
            outbox,
            connections: BTreeMap::new(),
            next_host_id: FIRST_SLAVE_HOST,
        }
    }

    /// State of a connection, if it is still tracked
    pub fn state(&self, conn: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&conn).copied()
    }

    /// Process transport events until the transport goes away
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Master coordinator stopped");
    }

    /// Process one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(conn) => {
                self.connections.insert(conn, ConnectionState::AwaitingJoin);
            }
            TransportEvent::Received(conn, Message::JoinRequest { tree, host }) => {
                self.on_join_request(conn, tree, host);
            }
            TransportEvent::Received(conn, message) => {
                self.protocol_violation(conn, &format!("unexpected {}", message.type_name()));
            }
            TransportEvent::Disconnected(conn) => {
                self.on_disconnect(conn);
            }
        }
    }

    fn on_join_request(&mut self, conn: ConnectionId, tree: Bytes, host: Bytes) {
        match self.state(conn) {
            Some(ConnectionState::AwaitingJoin) => {}
            Some(ConnectionState::Closed) => return,
            other => {
                self.protocol_violation(conn, &format!("JoinRequest in state {:?}", other));
                return;
            }
        }

        let (mut candidate, mut host) = match decode_join(&tree, &host) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.protocol_violation(conn, &format!("malformed JoinRequest: {}", e));
                return;
            }
        };

        let conflicts = self.namespace.conflicts_with(&candidate);
        if !conflicts.is_empty() {
            warn!(
                "Rejecting join from {} on connection {}: {:?} already exported",
                host.address, conn, conflicts
            );
            self.connections.insert(conn, ConnectionState::Closed);
            self.outbox.close(conn);
            return;
        }

        let host_id = self.next_host_id;
        self.next_host_id += 1;
        candidate.set_owner(host_id);
        host.id = host_id;

        info!(
            "Admitting {} as host {} ({} top-level entries)",
            host.address,
            host_id,
            candidate.root().child_count()
        );
        self.namespace.admit(candidate, host);
        self.connections.insert(conn, ConnectionState::Joined(host_id));

        let snapshot = self.namespace.snapshot();
        self.accept(conn, host_id, snapshot);
    }

    /// Send JoinAccept to `conn` and the merged state to everyone else.
    ///
    /// Without an encodable snapshot the joiner is disconnected, which drops
    /// its subtrees again and releases it to serve local files.
    fn accept(&mut self, conn: ConnectionId, host_id: HostId, snapshot: Result<(Bytes, Bytes)>) {
        let (tree, registry) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Cannot encode merged state for host {}: {}", host_id, e);
                self.outbox.close(conn);
                return;
            }
        };

        self.outbox.send_to(
            conn,
            Message::JoinAccept {
                host_id,
                tree: tree.clone(),
                registry: registry.clone(),
            },
        );
        self.broadcast(Some(conn), tree, registry);
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        let Some(state) = self.connections.remove(&conn) else {
            return;
        };

        let ConnectionState::Joined(host_id) = state else {
            debug!("Connection {} closed before joining", conn);
            return;
        };

        let removed = self.namespace.drop_host(host_id);
        info!("Host {} left, removed {} top-level entries", host_id, removed);

        match self.namespace.snapshot() {
            Ok((tree, registry)) => self.broadcast(None, tree, registry),
            Err(e) => error!("Cannot encode merged state: {}", e),
        }
    }

    /// Send the merged state to every joined connection except `skip`
    fn broadcast(&self, skip: Option<ConnectionId>, tree: Bytes, registry: Bytes) {
        for (&conn, state) in &self.connections {
            if Some(conn) == skip || !matches!(state, ConnectionState::Joined(_)) {
                continue;
            }
            self.outbox.send_to(
                conn,
                Message::UpdateBroadcast {
                    tree: tree.clone(),
                    registry: registry.clone(),
                },
            );
        }
    }

    /// Tear down a misbehaving connection. A joined host is dropped once the
    /// transport reports the disconnect.
    fn protocol_violation(&mut self, conn: ConnectionId, what: &str) {
        warn!("Protocol violation on connection {}: {}", conn, what);
        if let Some(state) = self.connections.get_mut(&conn) {
            if *state == ConnectionState::AwaitingJoin {
                *state = ConnectionState::Closed;
            }
        }
        self.outbox.close(conn);
    }
}

fn decode_join(tree: &[u8], host: &[u8]) -> Result<(DirectoryTree, Host)> {
    Ok((DirectoryTree::deserialize(tree)?, Host::deserialize(host)?))
}

/// Running master: listener plus coordinator
pub struct MasterHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl MasterHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new slaves
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Listen on `bind` and arbitrate joins against `namespace`.
///
/// Must be called inside a tokio runtime.
pub async fn serve(namespace: Arc<Namespace>, bind: &str) -> Result<MasterHandle> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let table = ConnectionTable::new(events_tx);

    let server = NetworkServer::bind(bind, Arc::clone(&table)).await?;
    let local_addr = server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(server.run(shutdown_rx));
    tokio::spawn(MasterCoordinator::new(namespace, table).run(events_rx));

    Ok(MasterHandle {
        local_addr,
        shutdown: shutdown_tx,
    })
}

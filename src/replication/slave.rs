//! Slave coordinator
//!
//! Offers the local tree to the master once, then mirrors whatever merged
//! state the master pushes. Losing the master drops every remote subtree.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{ConnectionState, Message};
use crate::error::Result;
use crate::namespace::Namespace;
use crate::network::{ConnectionId, ConnectionTable, NetworkClient, Outbox, TransportEvent};
use crate::registry::{HostId, HostRegistry, FIRST_SLAVE_HOST};
use crate::tree::DirectoryTree;

/// How the initial join ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Admitted under this host id
    Joined(HostId),
    /// Rejected, or the master went away first
    Disconnected,
}

/// Join handling on a slave
pub struct SlaveCoordinator {
    namespace: Arc<Namespace>,
    outbox: Arc<dyn Outbox>,
    connection: Option<ConnectionId>,
    state: ConnectionState,
    waiter: Option<oneshot::Sender<JoinOutcome>>,
}

impl SlaveCoordinator {
    /// Create a coordinator that reports the join outcome on `waiter`
    pub fn new(namespace: Arc<Namespace>, outbox: Arc<dyn Outbox>, waiter: oneshot::Sender<JoinOutcome>) -> Self {
        Self {
            namespace,
            outbox,
            connection: None,
            state: ConnectionState::Connecting,
            waiter: Some(waiter),
        }
    }

    /// Current state of the master connection
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Process transport events until the transport goes away
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Slave coordinator stopped");
    }

    /// Process one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(conn) => self.on_connected(conn),
            TransportEvent::Received(conn, message) => self.on_message(conn, message),
            TransportEvent::Disconnected(conn) => self.on_disconnect(conn),
        }
    }

    fn on_connected(&mut self, conn: ConnectionId) {
        if self.connection.is_some() {
            warn!("Ignoring extra connection {}", conn);
            self.outbox.close(conn);
            return;
        }
        self.connection = Some(conn);

        match self.namespace.join_blobs() {
            Ok((tree, host)) => {
                self.outbox.send_to(conn, Message::JoinRequest { tree, host });
                self.state = ConnectionState::AwaitingJoin;
                debug!("Join request sent on connection {}", conn);
            }
            Err(e) => {
                error!("Cannot encode join request: {}", e);
                self.outbox.close(conn);
            }
        }
    }

    fn on_message(&mut self, conn: ConnectionId, message: Message) {
        if self.connection != Some(conn) || self.state == ConnectionState::Closed {
            return;
        }

        match message {
            Message::JoinAccept {
                host_id,
                tree,
                registry,
            } => self.on_join_accept(conn, host_id, tree, registry),
            Message::UpdateBroadcast { tree, registry } => self.on_update(conn, tree, registry),
            Message::JoinRequest { .. } => self.protocol_violation(conn, "unexpected JoinRequest"),
        }
    }

    fn on_join_accept(&mut self, conn: ConnectionId, host_id: HostId, tree: Bytes, registry: Bytes) {
        if self.state != ConnectionState::AwaitingJoin {
            self.protocol_violation(conn, &format!("JoinAccept in state {:?}", self.state));
            return;
        }
        if host_id < FIRST_SLAVE_HOST {
            self.protocol_violation(conn, &format!("JoinAccept assigns reserved host id {}", host_id));
            return;
        }

        let (tree, registry) = match decode_state(&tree, &registry) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.protocol_violation(conn, &format!("malformed JoinAccept: {}", e));
                return;
            }
        };

        self.namespace.adopt(host_id, tree, registry);
        self.state = ConnectionState::Joined(host_id);
        info!("Joined as host {}", host_id);

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(JoinOutcome::Joined(host_id));
        }
    }

    fn on_update(&mut self, conn: ConnectionId, tree: Bytes, registry: Bytes) {
        if !matches!(self.state, ConnectionState::Joined(_)) {
            warn!("Ignoring UpdateBroadcast received before joining");
            return;
        }

        match decode_state(&tree, &registry) {
            Ok((tree, registry)) => {
                debug!(
                    "Applying update: {} top-level entries, {} hosts",
                    tree.root().child_count(),
                    registry.len()
                );
                self.namespace.apply_update(tree, registry);
            }
            Err(e) => self.protocol_violation(conn, &format!("malformed UpdateBroadcast: {}", e)),
        }
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        if self.connection != Some(conn) {
            return;
        }

        let removed = self.namespace.retain_local();
        match self.state {
            ConnectionState::Joined(_) => warn!("Lost the master, dropped {} remote entries", removed),
            _ => warn!("Join did not complete, serving local files only"),
        }
        self.state = ConnectionState::Closed;

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(JoinOutcome::Disconnected);
        }
    }

    fn protocol_violation(&mut self, conn: ConnectionId, what: &str) {
        warn!("Protocol violation from master: {}", what);
        self.outbox.close(conn);
    }
}

fn decode_state(tree: &[u8], registry: &[u8]) -> Result<(DirectoryTree, HostRegistry)> {
    Ok((DirectoryTree::deserialize(tree)?, HostRegistry::deserialize(registry)?))
}

/// Connection of a slave to its master
pub struct SlaveHandle {
    connection: ConnectionId,
    table: Arc<ConnectionTable>,
    pending: Option<oneshot::Receiver<JoinOutcome>>,
    outcome: Option<JoinOutcome>,
}

impl SlaveHandle {
    /// Block the calling thread until the join is settled.
    ///
    /// Must not be called from inside the tokio runtime.
    pub fn wait_blocking(&mut self) -> JoinOutcome {
        if let Some(rx) = self.pending.take() {
            self.outcome = Some(rx.blocking_recv().unwrap_or(JoinOutcome::Disconnected));
        }
        self.outcome.unwrap_or(JoinOutcome::Disconnected)
    }

    /// Wait until the join is settled
    pub async fn wait(&mut self) -> JoinOutcome {
        if let Some(rx) = self.pending.take() {
            self.outcome = Some(rx.await.unwrap_or(JoinOutcome::Disconnected));
        }
        self.outcome.unwrap_or(JoinOutcome::Disconnected)
    }

    /// Drop the connection to the master
    pub fn disconnect(&self) {
        self.table.close(self.connection);
    }
}

/// Connect to the master at `address` and offer the local tree.
///
/// A connect failure is returned to the caller, which may carry on with
/// local files only.
pub async fn join(namespace: Arc<Namespace>, address: &str, connect_timeout: Duration) -> Result<SlaveHandle> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let table = ConnectionTable::new(events_tx);

    let connection = NetworkClient::new(Arc::clone(&table), connect_timeout)
        .connect(address)
        .await?;

    let (waiter, pending) = oneshot::channel();
    let outbox: Arc<dyn Outbox> = table.clone();
    tokio::spawn(SlaveCoordinator::new(namespace, outbox, waiter).run(events_rx));

    Ok(SlaveHandle {
        connection,
        table,
        pending: Some(pending),
        outcome: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MASTER_HOST, UNASSIGNED_HOST};
    use crate::replication::testing::{host, namespace, top_level, tree_of, RecordingOutbox};

    fn merged_state(slave_names: &[&str]) -> (Bytes, Bytes) {
        let mut tree = tree_of(MASTER_HOST, &["a", "b"]);
        tree.merge_in(tree_of(2, slave_names));
        let mut registry = HostRegistry::new();
        registry.append(host(MASTER_HOST));
        registry.append(host(2));
        (
            tree.serialize().unwrap().into(),
            registry.serialize().unwrap().into(),
        )
    }

    fn setup() -> (SlaveCoordinator, Arc<Namespace>, Arc<RecordingOutbox>, oneshot::Receiver<JoinOutcome>) {
        let ns = namespace(UNASSIGNED_HOST, &["c"]);
        let outbox = Arc::new(RecordingOutbox::default());
        let (tx, rx) = oneshot::channel();
        let coordinator = SlaveCoordinator::new(ns.clone(), outbox.clone(), tx);
        (coordinator, ns, outbox, rx)
    }

    #[test]
    fn test_sends_join_request_on_connect() {
        let (mut slave, _ns, outbox, _rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));
        assert_eq!(slave.state(), ConnectionState::AwaitingJoin);

        let sent = outbox.take_sent();
        match &sent[..] {
            [(1, Message::JoinRequest { tree, host: blob })] => {
                let tree = DirectoryTree::deserialize(tree).unwrap();
                assert_eq!(tree.root().children().next().unwrap().name(), "c");
                let offered = crate::registry::Host::deserialize(blob).unwrap();
                assert_eq!(offered.id, UNASSIGNED_HOST);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_accept_adopts_state() {
        let (mut slave, ns, _outbox, mut rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));

        let (tree, registry) = merged_state(&["c"]);
        slave.handle_event(TransportEvent::Received(
            1,
            Message::JoinAccept {
                host_id: 2,
                tree,
                registry,
            },
        ));

        assert_eq!(rx.try_recv().unwrap(), JoinOutcome::Joined(2));
        assert_eq!(slave.state(), ConnectionState::Joined(2));
        assert_eq!(ns.local_id(), 2);
        assert_eq!(top_level(&ns), vec!["a", "b", "c"]);
        assert_eq!(ns.registry().len(), 2);

        // later updates replace the state wholesale
        let (tree, registry) = merged_state(&["c", "x"]);
        slave.handle_event(TransportEvent::Received(1, Message::UpdateBroadcast { tree, registry }));
        assert_eq!(top_level(&ns), vec!["a", "b", "c", "x"]);

        // losing the master keeps only our own subtrees
        slave.handle_event(TransportEvent::Disconnected(1));
        assert_eq!(slave.state(), ConnectionState::Closed);
        assert_eq!(top_level(&ns), vec!["c", "x"]);
    }

    #[test]
    fn test_rejection_releases_waiter() {
        let (mut slave, ns, _outbox, mut rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));
        slave.handle_event(TransportEvent::Disconnected(1));

        assert_eq!(rx.try_recv().unwrap(), JoinOutcome::Disconnected);
        assert_eq!(top_level(&ns), vec!["c"]);
        assert_eq!(ns.local_id(), UNASSIGNED_HOST);
    }

    #[test]
    fn test_update_before_join_is_ignored() {
        let (mut slave, ns, outbox, _rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));

        let (tree, registry) = merged_state(&["c"]);
        slave.handle_event(TransportEvent::Received(1, Message::UpdateBroadcast { tree, registry }));

        assert_eq!(top_level(&ns), vec!["c"]);
        assert_eq!(slave.state(), ConnectionState::AwaitingJoin);
        assert!(outbox.closed.lock().is_empty());
    }

    #[test]
    fn test_malformed_accept_leaves_state_untouched() {
        let (mut slave, ns, outbox, _rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));

        let (tree, _) = merged_state(&["c"]);
        slave.handle_event(TransportEvent::Received(
            1,
            Message::JoinAccept {
                host_id: 2,
                tree,
                registry: Bytes::from_static(b"\x01"),
            },
        ));

        assert_eq!(*outbox.closed.lock(), vec![1]);
        assert_eq!(top_level(&ns), vec!["c"]);
        assert_eq!(ns.local_id(), UNASSIGNED_HOST);
        assert_eq!(slave.state(), ConnectionState::AwaitingJoin);
    }

    #[test]
    fn test_reserved_host_id_is_rejected() {
        let (mut slave, ns, outbox, _rx) = setup();
        slave.handle_event(TransportEvent::Connected(1));

        let (tree, registry) = merged_state(&["c"]);
        slave.handle_event(TransportEvent::Received(
            1,
            Message::JoinAccept {
                host_id: MASTER_HOST,
                tree,
                registry,
            },
        ));

        assert_eq!(*outbox.closed.lock(), vec![1]);
        assert_eq!(ns.local_id(), UNASSIGNED_HOST);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let ns = namespace(UNASSIGNED_HOST, &["c"]);
        let err = join(ns.clone(), &address, Duration::from_secs(2)).await.err().unwrap();
        assert!(!err.is_fatal_at_startup());
        assert_eq!(top_level(&ns), vec!["c"]);
    }
}

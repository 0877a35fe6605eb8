//! Replication Module
//!
//! Join and update protocol between the master and its slaves. Each
//! coordinator consumes transport events one at a time, so the namespace is
//! only ever mutated from one place.

pub mod protocol;
mod master;
mod slave;

pub use protocol::{FrameCodec, FrameHeader, Message};
pub use master::{serve, MasterCoordinator, MasterHandle};
pub use slave::{join, JoinOutcome, SlaveCoordinator, SlaveHandle};

use crate::registry::HostId;

/// Replication state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket not yet established
    Connecting,
    /// Established, join not yet accepted
    AwaitingJoin,
    /// Join accepted under the given host id
    Joined(HostId),
    /// Torn down or rejected
    Closed,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::broker::RemoteReader;
    use crate::error::{Error, Result};
    use crate::namespace::Namespace;
    use crate::network::{ConnectionId, Outbox};
    use crate::registry::{Host, HostId};
    use crate::replication::Message;
    use crate::tree::{DirectoryTree, NodeKind, TreeNode};

    /// Outbox that only records what the coordinator asked for
    #[derive(Default)]
    pub struct RecordingOutbox {
        pub sent: Mutex<Vec<(ConnectionId, Message)>>,
        pub closed: Mutex<Vec<ConnectionId>>,
    }

    impl RecordingOutbox {
        pub fn take_sent(&self) -> Vec<(ConnectionId, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Outbox for RecordingOutbox {
        fn send_to(&self, conn: ConnectionId, message: Message) {
            self.sent.lock().push((conn, message));
        }

        fn close(&self, conn: ConnectionId) {
            self.closed.lock().push(conn);
        }
    }

    struct NoRemote;

    impl RemoteReader for NoRemote {
        fn read(&self, host: &Host, _path: &Path, _offset: u64, _length: u64) -> Result<Vec<u8>> {
            Err(Error::RemoteRead {
                host: host.id,
                reason: "no remote reads in tests".into(),
            })
        }
    }

    pub fn host(id: HostId) -> Host {
        Host {
            id,
            address: "127.0.0.1".into(),
            tcp_port: 7700,
            ssh_port: 22,
            mount_path: PathBuf::from(format!("/srv/export-{}", id)),
            staging_path: PathBuf::from("/var/tmp/gsfs"),
        }
    }

    pub fn tree_of(owner: HostId, names: &[&str]) -> DirectoryTree {
        let mut tree = DirectoryTree::new(owner);
        for name in names {
            let mut dir = TreeNode::new(*name, NodeKind::Directory, owner);
            dir.insert_child(TreeNode::new("file", NodeKind::Regular, owner));
            tree.root_mut().insert_child(dir);
        }
        tree
    }

    pub fn namespace(local_id: HostId, names: &[&str]) -> Arc<Namespace> {
        let host = host(local_id);
        let staged = host.staged_root();
        Arc::new(Namespace::new(tree_of(local_id, names), host, staged, Arc::new(NoRemote)))
    }

    pub fn top_level(namespace: &Namespace) -> Vec<String> {
        namespace.list_children(Path::new("/")).unwrap_or_default()
    }

    /// Poll `check` until it holds, failing after a few seconds
    pub async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

//! GSFS - Group Share Filesystem
//!
//! Every participating host exports a local directory; together they appear
//! as one read-only tree mounted on each host.
//!
//! # Architecture
//!
//! One host is the master. Slaves connect to it and offer their scanned
//! export; the master admits a slave when none of its top-level names clash
//! with the merged tree, then pushes the merged tree and host registry to
//! every joined slave whenever membership changes. File contents never travel
//! over the replication protocol: reads of another host's files go through a
//! remote-shell read broker.
//!
//! # Features
//!
//! - Export scan with a hard-linked staging copy
//! - Join, conflict rejection and departure handling on the master
//! - Length-prefixed binary wire protocol over TCP
//! - Read-only FUSE mount of the merged namespace

pub mod config;
pub mod error;
pub mod tree;
pub mod registry;
pub mod namespace;
pub mod broker;
pub mod network;
pub mod replication;
pub mod fuse;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, Role};
    pub use crate::error::{Error, Result};
    pub use crate::namespace::Namespace;
    pub use crate::registry::{Host, HostId, HostRegistry};
    pub use crate::replication::Message;
    pub use crate::tree::{DirectoryTree, Metadata, NodeKind, TreeNode};
}

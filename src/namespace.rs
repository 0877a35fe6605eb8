//! Shared namespace state
//!
//! The merged tree, the host registry and this host's id, behind one
//! readers-writer lock. Filesystem calls and outbound serialization take the
//! read lock; each mutation takes the write lock for exactly one logical
//! operation. Blobs are encoded and decoded outside the lock.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::broker::{read_local_range, RemoteReader};
use crate::error::{Error, Result};
use crate::registry::{Host, HostId, HostRegistry, UNASSIGNED_HOST};
use crate::tree::{DirectoryTree, Metadata};

struct State {
    tree: DirectoryTree,
    registry: HostRegistry,
    local_host: Host,
    /// Bumped by every mutation of the tree
    generation: u64,
}

/// Tree, registry and identity shared by the coordinator and the filesystem
pub struct Namespace {
    state: RwLock<State>,
    staged_root: PathBuf,
    reader: Arc<dyn RemoteReader>,
}

impl Namespace {
    /// Build the namespace for a freshly scanned host.
    ///
    /// A host that already has an id (the master) registers itself.
    pub fn new(tree: DirectoryTree, local_host: Host, staged_root: PathBuf, reader: Arc<dyn RemoteReader>) -> Self {
        let mut registry = HostRegistry::new();
        if local_host.id != UNASSIGNED_HOST {
            registry.append(local_host.clone());
        }

        Self {
            state: RwLock::new(State {
                tree,
                registry,
                local_host,
                generation: 0,
            }),
            staged_root,
            reader,
        }
    }

    /// Id of this host (`UNASSIGNED_HOST` until a slave has joined)
    pub fn local_id(&self) -> HostId {
        self.state.read().local_host.id
    }

    /// Root of the local staged copy
    pub fn staged_root(&self) -> &Path {
        &self.staged_root
    }

    /// Counter that changes whenever the merged tree does
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Metadata of the node at `path`
    pub fn lookup(&self, path: &Path) -> Option<Metadata> {
        if climbs(path) {
            return None;
        }
        let state = self.state.read();
        state.tree.find_path(path).map(|node| node.metadata())
    }

    /// Names and metadata of the children of the directory at `path`
    pub fn read_dir(&self, path: &Path) -> Option<Vec<(String, Metadata)>> {
        if climbs(path) {
            return None;
        }
        let state = self.state.read();
        let node = state.tree.find_path(path)?;
        if !node.is_dir() {
            return None;
        }
        Some(
            node.children()
                .map(|child| (child.name().to_string(), child.metadata()))
                .collect(),
        )
    }

    /// Names of the children of the directory at `path`
    pub fn list_children(&self, path: &Path) -> Option<Vec<String>> {
        self.read_dir(path)
            .map(|entries| entries.into_iter().map(|(name, _)| name).collect())
    }

    /// Read `length` bytes at `offset` of the file at `path`, owned by `owner`
    pub fn read(&self, owner: HostId, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
        let relative = relative_path(path)?;

        let remote = {
            let state = self.state.read();
            if owner == state.local_host.id {
                None
            } else {
                Some(state.registry.get(owner).cloned().ok_or(Error::HostNotFound(owner))?)
            }
        };

        match remote {
            None => read_local_range(&self.staged_root.join(relative), offset, length),
            Some(host) => {
                let remote_path = host.staged_root().join(relative);
                tracing::trace!("Remote read of {} from host {}", remote_path.display(), host.id);
                self.reader.read(&host, &remote_path, offset, length)
            }
        }
    }

    /// Encode the merged tree and registry under one read lock
    pub fn snapshot(&self) -> Result<(Bytes, Bytes)> {
        let state = self.state.read();
        let tree = state.tree.serialize()?;
        let registry = state.registry.serialize()?;
        Ok((Bytes::from(tree), Bytes::from(registry)))
    }

    /// Encode the local tree and host record for a join request
    pub fn join_blobs(&self) -> Result<(Bytes, Bytes)> {
        let state = self.state.read();
        let tree = state.tree.serialize()?;
        let host = state.local_host.serialize()?;
        Ok((Bytes::from(tree), Bytes::from(host)))
    }

    /// Top-level names of `candidate` already present in the merged tree
    pub fn conflicts_with(&self, candidate: &DirectoryTree) -> Vec<String> {
        self.state.read().tree.detect_conflicts(candidate)
    }

    /// Merge an admitted host. `candidate` and `host` must already carry `host.id`.
    pub fn admit(&self, candidate: DirectoryTree, host: Host) {
        let mut state = self.state.write();
        state.tree.merge_in(candidate);
        state.registry.append(host);
        state.generation += 1;
    }

    /// Drop every subtree owned by `host_id`. Returns how many went.
    pub fn drop_host(&self, host_id: HostId) -> usize {
        let mut state = self.state.write();
        state.generation += 1;
        state.tree.remove_subtrees_owned_by(host_id)
    }

    /// Take the id the master assigned and its merged state
    pub fn adopt(&self, local_id: HostId, tree: DirectoryTree, registry: HostRegistry) {
        let mut state = self.state.write();
        state.local_host.id = local_id;
        state.tree.replace_children(tree);
        state.registry = registry;
        state.generation += 1;
    }

    /// Replace tree and registry with the master's state
    pub fn apply_update(&self, tree: DirectoryTree, registry: HostRegistry) {
        let mut state = self.state.write();
        state.tree.replace_children(tree);
        state.registry = registry;
        state.generation += 1;
    }

    /// Fall back to serving only local files. Returns how many subtrees went.
    pub fn retain_local(&self) -> usize {
        let mut state = self.state.write();
        let local_id = state.local_host.id;
        state.generation += 1;
        state.tree.retain_only(local_id)
    }

    /// Copy of the current tree
    pub fn tree(&self) -> DirectoryTree {
        self.state.read().tree.clone()
    }

    /// Copy of the current registry
    pub fn registry(&self) -> HostRegistry {
        self.state.read().registry.clone()
    }
}

/// Check for `..` components, which tree walks do not accept
fn climbs(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

/// Strip the root from a namespace path, refusing `..`
fn relative_path(path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Component::Normal(name) => relative.push(name),
        }
    }
    Ok(relative)
}

//! Inode table for FUSE

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root inode number
pub const ROOT_INODE: u64 = 1;

/// Inode table mapping inodes to namespace paths and back.
///
/// Numbers are handed out on first sight of a path and never reused. An entry
/// goes away once its path has left the merged tree and the kernel holds no
/// lookup references to it.
#[derive(Debug)]
pub struct InodeTable {
    /// Inode to path mapping
    inode_to_path: HashMap<u64, PathBuf>,

    /// Path to inode mapping
    path_to_inode: HashMap<PathBuf, u64>,

    /// Outstanding kernel lookups per inode
    lookups: HashMap<u64, u64>,

    next_inode: u64,
}

impl InodeTable {
    /// Create a table holding only the root
    pub fn new() -> Self {
        let mut table = Self {
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            lookups: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.inode_to_path.insert(ROOT_INODE, PathBuf::from("/"));
        table.path_to_inode.insert(PathBuf::from("/"), ROOT_INODE);
        table
    }

    /// Get path by inode
    pub fn get_path(&self, inode: u64) -> Option<&Path> {
        self.inode_to_path.get(&inode).map(PathBuf::as_path)
    }

    /// Get the inode of `path`, assigning one if needed
    pub fn assign(&mut self, path: &Path) -> u64 {
        if let Some(inode) = self.path_to_inode.get(path) {
            return *inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(inode, path.to_path_buf());
        self.path_to_inode.insert(path.to_path_buf(), inode);
        inode
    }

    /// Like `assign`, also counting one kernel lookup reference
    pub fn lookup(&mut self, path: &Path) -> u64 {
        let inode = self.assign(path);
        *self.lookups.entry(inode).or_insert(0) += 1;
        inode
    }

    /// Drop `count` kernel references. Returns true once none are left.
    pub fn forget(&mut self, inode: u64, count: u64) -> bool {
        match self.lookups.get_mut(&inode) {
            Some(held) if *held > count => {
                *held -= count;
                false
            }
            _ => {
                self.lookups.remove(&inode);
                true
            }
        }
    }

    /// Remove by inode. The root stays.
    pub fn remove_inode(&mut self, inode: u64) -> Option<PathBuf> {
        if inode == ROOT_INODE {
            return None;
        }
        let path = self.inode_to_path.remove(&inode)?;
        self.path_to_inode.remove(&path);
        self.lookups.remove(&inode);
        Some(path)
    }

    /// Drop unreferenced entries whose path fails `exists`. Returns how many went.
    pub fn prune(&mut self, exists: impl Fn(&Path) -> bool) -> usize {
        let stale: Vec<u64> = self
            .inode_to_path
            .iter()
            .filter(|(inode, path)| {
                **inode != ROOT_INODE && !self.lookups.contains_key(*inode) && !exists(path)
            })
            .map(|(inode, _)| *inode)
            .collect();

        for inode in &stale {
            self.remove_inode(*inode);
        }
        stale.len()
    }

    /// Number of known inodes, root included
    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Directory Tree
//!
//! The replicated, mergeable tree of file metadata. Children are kept in a
//! `BTreeMap` keyed by name, so they are unique and always iterate in
//! byte-wise name order. Replication only ever touches the first level below
//! the root: each top-level child belongs to exactly one host.

pub mod scan;

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::HostId;

pub use scan::scan_export;

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Symlink,
    Socket,
    Unknown,
}

/// Metadata of one node, without its name or children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub num_links: u64,
    /// Host whose read broker serves this file
    pub owner: HostId,
}

/// One filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub num_links: u64,
    owner: HostId,
    name: String,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    /// Create a node with zeroed metadata
    pub fn new(name: impl Into<String>, kind: NodeKind, owner: HostId) -> Self {
        Self {
            kind,
            size: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            num_links: 1,
            owner,
            name: name.into(),
            children: BTreeMap::new(),
        }
    }

    /// Entry name; empty only for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host owning this node
    pub fn owner(&self) -> HostId {
        self.owner
    }

    /// Re-tag this node and every descendant with a new owner
    pub fn set_owner(&mut self, owner: HostId) {
        self.owner = owner;
        for child in self.children.values_mut() {
            child.set_owner(owner);
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Snapshot of this node's metadata
    pub fn metadata(&self) -> Metadata {
        Metadata {
            kind: self.kind,
            size: self.size,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            num_links: self.num_links,
            owner: self.owner,
        }
    }

    /// Child by name
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.get(name)
    }

    /// Children in name order
    pub fn children(&self) -> impl Iterator<Item = &TreeNode> {
        self.children.values()
    }

    /// Number of direct children
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Insert a child. Returns false, leaving the existing child in place,
    /// if a sibling with the same name exists.
    pub fn insert_child(&mut self, child: TreeNode) -> bool {
        if self.children.contains_key(&child.name) {
            return false;
        }
        self.children.insert(child.name.clone(), child);
        true
    }

    /// Mutable child by name
    pub fn child_mut(&mut self, name: &str) -> Option<&mut TreeNode> {
        self.children.get_mut(name)
    }

    fn validate(&self, is_root: bool) -> Result<()> {
        if !is_root && !is_valid_name(&self.name) {
            return Err(Error::InvalidTree(format!("bad entry name {:?}", self.name)));
        }
        if !self.children.is_empty() && !self.is_dir() {
            return Err(Error::InvalidTree(format!(
                "non-directory {:?} has children",
                self.name
            )));
        }
        for (key, child) in &self.children {
            if *key != child.name {
                return Err(Error::InvalidTree(format!(
                    "child keyed {:?} is named {:?}",
                    key, child.name
                )));
            }
            child.validate(false)?;
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// A tree of `TreeNode`s owning exactly one directory root with an empty name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTree {
    root: TreeNode,
}

impl DirectoryTree {
    /// Create a tree with an empty root owned by `owner`
    pub fn new(owner: HostId) -> Self {
        Self {
            root: TreeNode::new("", NodeKind::Directory, owner),
        }
    }

    /// Wrap an existing root node
    pub fn from_root(mut root: TreeNode) -> Self {
        root.name.clear();
        root.kind = NodeKind::Directory;
        Self { root }
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut TreeNode {
        &mut self.root
    }

    /// Re-tag every node of the tree, root included
    pub fn set_owner(&mut self, owner: HostId) {
        self.root.set_owner(owner);
    }

    /// Walk `path` from the root.
    ///
    /// `.` components are skipped. Returns `None` if a component is missing,
    /// is not valid UTF-8, or an intermediate component is not a directory.
    ///
    /// # Panics
    ///
    /// Panics if `path` contains a `..` component.
    pub fn find_path(&self, path: impl AsRef<Path>) -> Option<&TreeNode> {
        let mut node = &self.root;
        for component in path.as_ref().components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => continue,
                Component::ParentDir => panic!("'..' is not allowed in tree paths"),
                Component::Normal(name) => {
                    if !node.is_dir() {
                        return None;
                    }
                    node = node.children.get(name.to_str()?)?;
                }
            }
        }
        Some(node)
    }

    /// Names shared by this tree's top level and the candidate's top level.
    ///
    /// Merge-join over the two sorted child sequences; the result is sorted.
    pub fn detect_conflicts(&self, candidate: &DirectoryTree) -> Vec<String> {
        let mut conflicts = Vec::new();
        let mut ours = self.root.children.keys().peekable();
        let mut theirs = candidate.root.children.keys().peekable();

        while let (Some(a), Some(b)) = (ours.peek(), theirs.peek()) {
            match a.as_bytes().cmp(b.as_bytes()) {
                std::cmp::Ordering::Less => {
                    ours.next();
                }
                std::cmp::Ordering::Greater => {
                    theirs.next();
                }
                std::cmp::Ordering::Equal => {
                    conflicts.push((*a).clone());
                    ours.next();
                    theirs.next();
                }
            }
        }

        conflicts
    }

    /// Attach every top-level child of `candidate` under this root.
    ///
    /// `detect_conflicts` must have returned nothing for the same candidate,
    /// and the candidate must already carry its final owner id.
    pub fn merge_in(&mut self, candidate: DirectoryTree) {
        debug_assert!(self.detect_conflicts(&candidate).is_empty());
        for (name, child) in candidate.root.children {
            self.root.children.entry(name).or_insert(child);
        }
    }

    /// Drop every top-level subtree owned by `host_id`. Returns how many went.
    pub fn remove_subtrees_owned_by(&mut self, host_id: HostId) -> usize {
        let before = self.root.children.len();
        self.root.children.retain(|_, child| child.owner != host_id);
        before - self.root.children.len()
    }

    /// Drop every top-level subtree not owned by `host_id`
    pub fn retain_only(&mut self, host_id: HostId) -> usize {
        let before = self.root.children.len();
        self.root.children.retain(|_, child| child.owner == host_id);
        before - self.root.children.len()
    }

    /// Overwrite the root's children with those of `other`
    pub fn replace_children(&mut self, other: DirectoryTree) {
        self.root.children = other.root.children;
    }

    /// Encode the whole tree
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a whole tree, checking its structural invariants
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let tree: DirectoryTree = bincode::deserialize(bytes)?;
        if !tree.root.name.is_empty() || !tree.root.is_dir() {
            return Err(Error::InvalidTree("root must be an unnamed directory".into()));
        }
        tree.root.validate(true)?;
        Ok(tree)
    }
}

//! GSFS FUSE Filesystem Implementation
//!
//! Read-only view of the merged namespace.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, Request,
};
use tracing::{debug, warn};

use super::inode::{InodeTable, ROOT_INODE};
use crate::namespace::Namespace;
use crate::tree::{Metadata, NodeKind};

/// TTL for attribute caching
const TTL: Duration = Duration::from_secs(1);

/// GSFS FUSE Filesystem
pub struct GsfsFs {
    namespace: Arc<Namespace>,
    inodes: InodeTable,
    /// Namespace generation the inode table was last pruned against
    seen_generation: u64,
}

impl GsfsFs {
    pub fn new(namespace: Arc<Namespace>) -> Self {
        Self {
            namespace,
            inodes: InodeTable::new(),
            seen_generation: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.get_path(ino).map(|p| p.to_path_buf())
    }

    /// Drop kernel references to `ino`, removing it once unreferenced and gone
    fn release(&mut self, ino: u64, nlookup: u64) {
        if !self.inodes.forget(ino, nlookup) {
            return;
        }
        let departed = match self.inodes.get_path(ino) {
            Some(path) => self.namespace.lookup(path).is_none(),
            None => false,
        };
        if departed {
            self.inodes.remove_inode(ino);
        }
    }

    /// Forget inodes of paths that left the merged tree since the last call
    fn prune_departed(&mut self) {
        let generation = self.namespace.generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;

        let namespace = &self.namespace;
        let removed = self.inodes.prune(|path| namespace.lookup(path).is_some());
        if removed > 0 {
            debug!("Pruned {} inodes after namespace change", removed);
        }
    }
}

/// FUSE file type of a node kind
pub fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
        NodeKind::CharDevice => FileType::CharDevice,
        NodeKind::BlockDevice => FileType::BlockDevice,
        NodeKind::Fifo => FileType::NamedPipe,
        NodeKind::Socket => FileType::Socket,
        NodeKind::Regular | NodeKind::Unknown => FileType::RegularFile,
    }
}

/// Convert node metadata to FileAttr
pub fn to_attr(meta: &Metadata, ino: u64) -> FileAttr {
    let is_dir = meta.kind == NodeKind::Directory;
    let time = |secs: u64| UNIX_EPOCH + Duration::from_secs(secs);

    FileAttr {
        ino,
        size: meta.size,
        blocks: (meta.size + 511) / 512,
        atime: time(meta.atime),
        mtime: time(meta.mtime),
        ctime: time(meta.ctime),
        crtime: time(meta.ctime),
        kind: file_type(meta.kind),
        perm: if is_dir { 0o755 } else { 0o444 },
        nlink: meta.num_links.clamp(1, u32::MAX as u64) as u32,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Byte range actually readable from a file of `size` bytes
pub fn read_span(size: u64, offset: u64, length: u64) -> Option<(u64, u64)> {
    if offset >= size {
        return None;
    }
    Some((offset, length.min(size - offset)))
}

/// Check if `flags` ask for anything beyond reading
pub fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

impl Filesystem for GsfsFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup: parent={}, name={:?}", parent, name);
        self.prune_departed();

        let child_path = match (self.path_of(parent), name.to_str()) {
            (Some(parent_path), Some(name)) => parent_path.join(name),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.namespace.lookup(&child_path) {
            Some(meta) => {
                let ino = self.inodes.lookup(&child_path);
                reply.entry(&TTL, &to_attr(&meta, ino), 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget: ino={}, nlookup={}", ino, nlookup);
        self.release(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        match self.path_of(ino).and_then(|path| self.namespace.lookup(&path)) {
            Some(meta) => reply.attr(&TTL, &to_attr(&meta, ino)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#o}", ino, flags);

        if wants_write(flags) {
            reply.error(libc::EACCES);
            return;
        }
        match self.path_of(ino).and_then(|path| self.namespace.lookup(&path)) {
            Some(_) => reply.opened(0, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(meta) = self.namespace.lookup(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        if meta.kind == NodeKind::Directory {
            reply.error(libc::EISDIR);
            return;
        }

        let Some((offset, length)) = read_span(meta.size, offset.max(0) as u64, size as u64) else {
            reply.data(&[]);
            return;
        };

        match self.namespace.read(meta.owner, &path, offset, length) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!("Read of {} failed: {}", path.display(), e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);
        self.prune_departed();

        let Some(dir_path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(children) = self.namespace.read_dir(&dir_path) else {
            let errno = match self.namespace.lookup(&dir_path) {
                Some(_) => libc::ENOTDIR,
                None => libc::ENOENT,
            };
            reply.error(errno);
            return;
        };

        let parent_ino = match dir_path.parent() {
            Some(parent) => self.inodes.assign(parent),
            None => ROOT_INODE,
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, meta) in children {
            let child_ino = self.inodes.assign(&dir_path.join(&name));
            entries.push((child_ino, file_type(meta.kind), name));
        }

        // Return entries starting from offset
        for (i, (inode, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*inode, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MASTER_HOST;
    use crate::replication::testing::{host, namespace, tree_of};
    use std::path::Path;

    fn meta(kind: NodeKind, size: u64) -> Metadata {
        Metadata {
            kind,
            size,
            uid: 1000,
            gid: 100,
            atime: 10,
            mtime: 20,
            ctime: 30,
            num_links: 2,
            owner: 1,
        }
    }

    #[test]
    fn test_attributes() {
        let attr = to_attr(&meta(NodeKind::Regular, 1025), 7);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o444);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(20));

        let attr = to_attr(&meta(NodeKind::Directory, 0), ROOT_INODE);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);

        assert_eq!(file_type(NodeKind::Fifo), FileType::NamedPipe);
        assert_eq!(file_type(NodeKind::Symlink), FileType::Symlink);
    }

    #[test]
    fn test_read_span_clamps_to_size() {
        assert_eq!(read_span(10, 0, 4096), Some((0, 10)));
        assert_eq!(read_span(10, 4, 3), Some((4, 3)));
        assert_eq!(read_span(10, 10, 1), None);
        assert_eq!(read_span(0, 0, 1), None);
    }

    #[test]
    fn test_write_access_is_refused() {
        assert!(!wants_write(libc::O_RDONLY));
        assert!(wants_write(libc::O_WRONLY));
        assert!(wants_write(libc::O_RDWR | libc::O_APPEND));
    }

    #[test]
    fn test_departed_host_inodes_are_released() {
        let ns = namespace(MASTER_HOST, &["a"]);
        ns.admit(tree_of(2, &["c"]), host(2));
        let mut fs = GsfsFs::new(ns.clone());
        fs.prune_departed();

        let a = fs.inodes.lookup(Path::new("/a"));
        let c = fs.inodes.lookup(Path::new("/c"));
        let listed = fs.inodes.assign(Path::new("/c/file"));
        assert_eq!(fs.inodes.len(), 4);

        ns.drop_host(2);
        fs.prune_departed();
        // listed only, so it goes at once
        assert!(fs.inodes.get_path(listed).is_none());
        assert_eq!(fs.inodes.get_path(c), Some(Path::new("/c")));

        // the kernel lets go of the departed directory
        fs.release(c, 1);
        assert!(fs.inodes.get_path(c).is_none());

        // but not of a path that is still there
        fs.release(a, 1);
        assert_eq!(fs.inodes.get_path(a), Some(Path::new("/a")));
        assert_eq!(fs.inodes.len(), 2);
    }
}

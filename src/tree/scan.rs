//! Export scan
//!
//! Builds the local `DirectoryTree` from an exported directory and stages a
//! hard-linked copy of every entry, so the export keeps serving the scanned
//! files even if the originals are renamed or deleted.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{DirectoryTree, NodeKind, TreeNode};
use crate::error::{Error, Result};
use crate::registry::{staged_root_for, HostId};

/// Result of scanning an export
#[derive(Debug)]
pub struct ScannedExport {
    /// Tree of the exported entries
    pub tree: DirectoryTree,
    /// Canonical path of the exported directory
    pub export_dir: PathBuf,
    /// Canonical path of the staging directory
    pub staging_dir: PathBuf,
    /// Where the hard-linked copy lives
    pub staged_root: PathBuf,
}

/// Scan `export_dir`, staging it under `staging_dir`.
///
/// Every node is owned by `owner`. Fails if the export is not a directory,
/// if the staging directory lies inside the export, or if the staged root
/// already exists or cannot be created.
pub fn scan_export(export_dir: &Path, staging_dir: &Path, owner: HostId) -> Result<ScannedExport> {
    let export_dir = fs::canonicalize(export_dir)
        .map_err(|e| Error::Export(format!("{}: {}", export_dir.display(), e)))?;
    let meta = fs::metadata(&export_dir)
        .map_err(|e| Error::Export(format!("{}: {}", export_dir.display(), e)))?;
    if !meta.is_dir() {
        return Err(Error::Export(format!("{} is not a directory", export_dir.display())));
    }

    fs::create_dir_all(staging_dir)
        .map_err(|e| Error::Staging(format!("creating {}: {}", staging_dir.display(), e)))?;
    let staging_dir = fs::canonicalize(staging_dir)
        .map_err(|e| Error::Staging(format!("{}: {}", staging_dir.display(), e)))?;
    if staging_dir.starts_with(&export_dir) {
        return Err(Error::Staging(format!(
            "{} lies inside the export {}",
            staging_dir.display(),
            export_dir.display()
        )));
    }

    let staged_root = staged_root_for(&staging_dir, &export_dir);
    if fs::symlink_metadata(&staged_root).is_ok() {
        return Err(Error::Staging(format!("{} already exists", staged_root.display())));
    }
    fs::create_dir(&staged_root)
        .map_err(|e| Error::Staging(format!("creating {}: {}", staged_root.display(), e)))?;

    let mut root = node_from_metadata("", NodeKind::Directory, &meta, owner);
    root.size = 0;
    walk(&export_dir, &staged_root, &mut root, owner)?;

    let tree = DirectoryTree::from_root(root);
    info!(
        "Scanned {} ({} top-level entries), staged at {}",
        export_dir.display(),
        tree.root().child_count(),
        staged_root.display()
    );

    Ok(ScannedExport {
        tree,
        export_dir,
        staging_dir,
        staged_root,
    })
}

fn walk(dir: &Path, staged: &Path, parent: &mut TreeNode, owner: HostId) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Export(format!("reading {}: {}", dir.display(), e)))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::Export(format!("reading {}: {}", dir.display(), e)))?;
        let path = entry.path();
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!("Skipping non UTF-8 name {:?} in {}", raw, dir.display());
                continue;
            }
        };

        let meta = stat(&path)?;
        let kind = kind_of(&meta.file_type());
        if kind == NodeKind::Unknown {
            warn!("Skipping {} of unknown type", path.display());
            continue;
        }

        let target = staged.join(&name);
        let mut node = node_from_metadata(&name, kind, &meta, owner);

        if kind == NodeKind::Directory {
            fs::create_dir(&target)
                .map_err(|e| Error::Staging(format!("creating {}: {}", target.display(), e)))?;
            node.size = 0;
            walk(&path, &target, &mut node, owner)?;
        } else {
            fs::hard_link(&path, &target)
                .map_err(|e| Error::Staging(format!("linking {}: {}", target.display(), e)))?;
            // count includes the staged link
            node.num_links = stat(&path)?.nlink();
        }

        debug!("Scanned {}", path.display());
        parent.insert_child(node);
    }

    Ok(())
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::symlink_metadata(path).map_err(|e| Error::Export(format!("{}: {}", path.display(), e)))
}

fn kind_of(file_type: &fs::FileType) -> NodeKind {
    if file_type.is_dir() {
        NodeKind::Directory
    } else if file_type.is_file() {
        NodeKind::Regular
    } else if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_char_device() {
        NodeKind::CharDevice
    } else if file_type.is_block_device() {
        NodeKind::BlockDevice
    } else if file_type.is_fifo() {
        NodeKind::Fifo
    } else if file_type.is_socket() {
        NodeKind::Socket
    } else {
        NodeKind::Unknown
    }
}

fn node_from_metadata(name: &str, kind: NodeKind, meta: &fs::Metadata, owner: HostId) -> TreeNode {
    let mut node = TreeNode::new(name, kind, owner);
    node.size = meta.size();
    node.uid = meta.uid();
    node.gid = meta.gid();
    node.atime = meta.atime().max(0) as u64;
    node.mtime = meta.mtime().max(0) as u64;
    node.ctime = meta.ctime().max(0) as u64;
    node.num_links = meta.nlink();
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(export: &Path) {
        fs::create_dir_all(export.join("docs/img")).unwrap();
        fs::write(export.join("docs/readme.md"), b"hello").unwrap();
        fs::write(export.join("docs/img/logo.png"), vec![7u8; 300]).unwrap();
        fs::write(export.join("notes.txt"), b"notes").unwrap();
        std::os::unix::fs::symlink("notes.txt", export.join("latest")).unwrap();
    }

    #[test]
    fn test_scan_builds_tree_and_staging() {
        let base = tempdir().unwrap();
        let export = base.path().join("share");
        let staging = base.path().join("staging");
        populate(&export);

        let scanned = scan_export(&export, &staging, 1).unwrap();
        let tree = &scanned.tree;

        let names: Vec<&str> = tree.root().children().map(|c| c.name()).collect();
        assert_eq!(names, vec!["docs", "latest", "notes.txt"]);
        assert!(tree.find_path("/docs/img").unwrap().is_dir());
        assert_eq!(tree.find_path("/docs/img/logo.png").unwrap().size, 300);
        assert_eq!(tree.find_path("/latest").unwrap().kind, NodeKind::Symlink);
        assert_eq!(tree.find_path("/notes.txt").unwrap().owner(), 1);
        assert_eq!(tree.find_path("/notes.txt").unwrap().num_links, 2);

        let staging = fs::canonicalize(&staging).unwrap();
        assert_eq!(scanned.staging_dir, staging);
        assert_eq!(scanned.staged_root, staging.join("share"));
        assert_eq!(fs::read(scanned.staged_root.join("docs/readme.md")).unwrap(), b"hello");

        // the staged copy survives removal of the original
        fs::remove_file(export.join("notes.txt")).unwrap();
        assert_eq!(fs::read(scanned.staged_root.join("notes.txt")).unwrap(), b"notes");
    }

    #[test]
    fn test_staging_collision_is_rejected() {
        let base = tempdir().unwrap();
        let export = base.path().join("share");
        let staging = base.path().join("staging");
        populate(&export);

        scan_export(&export, &staging, 1).unwrap();
        let err = scan_export(&export, &staging, 1).unwrap_err();
        assert!(matches!(err, Error::Staging(_)));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_staging_inside_export_is_rejected() {
        let base = tempdir().unwrap();
        let export = base.path().join("share");
        populate(&export);

        let err = scan_export(&export, &export.join("stage"), 1).unwrap_err();
        assert!(matches!(err, Error::Staging(_)));
        assert!(err.is_fatal_at_startup());

        // the export itself is no better
        let err = scan_export(&export, &export, 1).unwrap_err();
        assert!(matches!(err, Error::Staging(_)));
        assert!(!export.join("stage/share").exists());
    }

    #[test]
    fn test_bad_export_is_rejected() {
        let base = tempdir().unwrap();
        let staging = base.path().join("staging");

        let err = scan_export(&base.path().join("missing"), &staging, 1).unwrap_err();
        assert!(matches!(err, Error::Export(_)));

        let file = base.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let err = scan_export(&file, &staging, 1).unwrap_err();
        assert!(matches!(err, Error::Export(_)));
    }
}

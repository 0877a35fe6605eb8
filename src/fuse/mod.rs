//! FUSE Module
//!
//! Read-only mount of the merged namespace.

mod filesystem;
mod inode;

pub use filesystem::GsfsFs;
pub use inode::{InodeTable, ROOT_INODE};

use std::path::Path;
use std::sync::Arc;

use fuser::MountOption;

use crate::error::Result;
use crate::namespace::Namespace;

/// Mount options for a gsfs mount
pub fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("gsfs".to_string()),
        MountOption::RO,
        MountOption::AutoUnmount,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mount `namespace` at `mountpoint`, blocking until it is unmounted
pub fn mount(namespace: Arc<Namespace>, mountpoint: &Path, allow_other: bool) -> Result<()> {
    tracing::info!("Mounting gsfs at {}", mountpoint.display());
    fuser::mount2(GsfsFs::new(namespace), mountpoint, &mount_options(allow_other))?;
    Ok(())
}

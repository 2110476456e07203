//! Virtual filesystem: dentry/inode caches, mount table, per-task file
//! descriptors, and the filesystem drivers that back them.

pub mod dentry;
pub mod devfs;
pub mod fd_table;
pub mod file;
pub mod inode;
pub mod mount;
pub mod path;
pub mod ramfs;
pub mod superblock;

use alloc::sync::Arc;

use crate::error::KResult;
use crate::fs::superblock::Filesystem;

/// Mounts `fs` at `target`, the way `main` brings up the rootfs and devfs
/// during boot.
pub fn mount(target: &str, fs_type: &'static str, fs: Arc<dyn Filesystem>) -> KResult<()> {
    mount::vfs_mount(target, fs_type, fs, 0)
}

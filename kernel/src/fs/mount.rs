//! Mount table: binds a path prefix to a superblock, resolved by
//! longest-prefix match. Built on the same registry-of-`Arc`s idiom as
//! `fs::superblock`.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KError, KResult};
use crate::fs::dentry::{self, DentryRef};
use crate::fs::superblock::{self, Filesystem, Superblock};

pub struct Mount {
    pub mount_point: String,
    pub sb: Arc<Superblock>,
    pub flags: u32,
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// `vfs_mount(target, fstype, flags)`: registers the superblock and
/// grafts its root dentry at `target`. The rootfs mount (`target == "/"`)
/// is installed the same way during VFS init; there's no separate path
/// for it.
pub fn vfs_mount(
    target: &str,
    fs_type: &'static str,
    fs: Arc<dyn Filesystem>,
    flags: u32,
) -> KResult<()> {
    let sb = superblock::register(fs_type, target.to_string(), fs);
    let root = dentry::new_root(&sb)?;
    *sb.root_dentry.lock() = Some(root);

    MOUNTS.lock().push(Mount {
        mount_point: target.to_string(),
        sb,
        flags,
    });
    Ok(())
}

/// Longest-prefix match over registered mount points.
pub fn resolve_mount(path: &str) -> KResult<(Arc<Superblock>, alloc::string::String)> {
    let mounts = MOUNTS.lock();
    let best = mounts
        .iter()
        .filter(|m| path == m.mount_point || path.starts_with(&{
            let mut p = m.mount_point.clone();
            if !p.ends_with('/') {
                p.push('/');
            }
            p
        }) || m.mount_point == "/")
        .max_by_key(|m| m.mount_point.len())
        .ok_or(KError::NotFound)?;

    let remainder = if best.mount_point == "/" {
        path.trim_start_matches('/').to_string()
    } else {
        path.trim_start_matches(&best.mount_point as &str)
            .trim_start_matches('/')
            .to_string()
    };

    Ok((best.sb.clone(), remainder))
}

pub fn root_dentry_of(sb: &Arc<Superblock>) -> KResult<DentryRef> {
    sb.root_dentry.lock().clone().ok_or(KError::NotFound)
}

#[cfg(test)]
pub fn reset_for_test() {
    MOUNTS.lock().clear();
}

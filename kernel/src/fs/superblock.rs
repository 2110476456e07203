//! Filesystem driver interface and superblock registry. Each mounted
//! filesystem gets its own `Arc<dyn Filesystem>` and root dentry instead
//! of being indexed by a shared `dev` number.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::KResult;
use crate::fs::dentry::DentryRef;
use crate::fs::inode::InodeData;

pub trait Filesystem: Send + Sync {
    /// Populates a freshly cache-missed inode. Allocation and on-disk
    /// read are collapsed into one call, since these drivers have no
    /// on-disk format of their own to parse lazily.
    fn read_inode(&self, id: u64) -> KResult<InodeData>;

    /// Looks up `name` inside the directory inode `parent_id`. `Ok(None)`
    /// means "valid directory, no such entry" (a negative-dentry result);
    /// `Err` means the lookup itself failed (e.g. wrong kind).
    fn lookup(&self, parent_id: u64, name: &str) -> KResult<Option<u64>>;

    /// Creates `name` under directory inode `parent_id`, returning the
    /// new inode's id.
    fn create(&self, parent_id: u64, name: &str) -> KResult<u64>;

    fn read(&self, id: u64, offset: u64, buffer: &mut [u8]) -> KResult<usize>;
    fn write(&self, id: u64, offset: u64, buffer: &[u8]) -> KResult<usize>;

    fn root_id(&self) -> u64 {
        0
    }
}

pub struct Superblock {
    pub id: usize,
    pub fs_type: &'static str,
    pub mount_point: String,
    pub fs: Arc<dyn Filesystem>,
    pub root_dentry: Mutex<Option<DentryRef>>,
}

static SUPERBLOCKS: Mutex<Vec<Arc<Superblock>>> = Mutex::new(Vec::new());
static NEXT_SB_ID: Mutex<usize> = Mutex::new(0);

/// Registers a new superblock for a just-mounted filesystem instance.
/// The root dentry is filled in by the mount path once it's built (it
/// needs the superblock's id first, so this is a two-step construction).
pub fn register(fs_type: &'static str, mount_point: String, fs: Arc<dyn Filesystem>) -> Arc<Superblock> {
    let mut next_id = NEXT_SB_ID.lock();
    let id = *next_id;
    *next_id += 1;
    drop(next_id);

    let sb = Arc::new(Superblock {
        id,
        fs_type,
        mount_point,
        fs,
        root_dentry: Mutex::new(None),
    });
    SUPERBLOCKS.lock().push(sb.clone());
    sb
}

pub fn find_by_id(id: usize) -> Option<Arc<Superblock>> {
    SUPERBLOCKS.lock().iter().find(|sb| sb.id == id).cloned()
}

#[cfg(test)]
pub fn reset_registry_for_test() {
    SUPERBLOCKS.lock().clear();
    *NEXT_SB_ID.lock() = 0;
}

//! VFS inode cache: a real hashed cache with `iget`/`iput` refcounting,
//! so a hot path doesn't call back into the filesystem driver on every
//! lookup.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::INODE_HASH_BUCKETS;
use crate::error::{KError, KResult};
use crate::fs::superblock::Superblock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    CharDevice,
}

pub struct Inode {
    pub id: u64,
    pub sb_id: usize,
    pub filetype: FileType,
    pub size: u64,
    pub ref_count: u32,
    pub permissions: u16,
    pub flags: u32,
    pub nlink: u32,
}

fn golden_ratio_mix(sb_id: usize, id: u64) -> u32 {
    let key = (sb_id as u64) ^ id;
    (key as u32).wrapping_mul(0x9E3779B1)
}

struct InodeCache {
    buckets: Vec<Vec<Arc<Mutex<Inode>>>>,
}

static CACHE: Mutex<Option<InodeCache>> = Mutex::new(None);

fn with_cache<R>(f: impl FnOnce(&mut InodeCache) -> R) -> R {
    let mut guard = CACHE.lock();
    if guard.is_none() {
        let mut buckets = Vec::with_capacity(INODE_HASH_BUCKETS);
        buckets.resize_with(INODE_HASH_BUCKETS, Vec::new);
        *guard = Some(InodeCache { buckets });
    }
    f(guard.as_mut().unwrap())
}

fn bucket_index(sb_id: usize, id: u64) -> usize {
    golden_ratio_mix(sb_id, id) as usize % INODE_HASH_BUCKETS
}

/// Cache-or-load: returns the cached inode with its ref count bumped, or
/// loads it via `sb.read_inode` and caches it.
pub fn iget(sb: &Arc<Superblock>, id: u64) -> KResult<Arc<Mutex<Inode>>> {
    let idx = bucket_index(sb.id, id);
    with_cache(|cache| {
        if let Some(found) = cache.buckets[idx]
            .iter()
            .find(|i| {
                let i = i.lock();
                i.sb_id == sb.id && i.id == id
            })
            .cloned()
        {
            found.lock().ref_count += 1;
            return Ok(found);
        }

        let data = sb.fs.read_inode(id)?;
        let inode = Arc::new(Mutex::new(Inode {
            id,
            sb_id: sb.id,
            filetype: data.filetype,
            size: data.size,
            ref_count: 1,
            permissions: data.permissions,
            flags: 0,
            nlink: data.nlink,
        }));
        cache.buckets[idx].push(inode.clone());
        Ok(inode)
    })
}

/// Decrements the ref count; at zero, evicts from the cache if `nlink`
/// has also reached zero.
pub fn iput(inode: Arc<Mutex<Inode>>) {
    let (sb_id, id, evict) = {
        let mut i = inode.lock();
        i.ref_count -= 1;
        (i.sb_id, i.id, i.ref_count == 0 && i.nlink == 0)
    };
    if !evict {
        return;
    }
    let idx = bucket_index(sb_id, id);
    with_cache(|cache| {
        cache.buckets[idx].retain(|i| !Arc::ptr_eq(i, &inode));
    });
}

/// Data a filesystem driver returns to populate a fresh cache entry.
/// These drivers have no on-disk format to parse, so allocation and
/// population collapse into one call.
pub struct InodeData {
    pub filetype: FileType,
    pub size: u64,
    pub permissions: u16,
    pub nlink: u32,
}

#[cfg(test)]
pub fn reset_cache_for_test() {
    *CACHE.lock() = None;
}

/// Exposed for tests that need a hash map standing in for a driver's own
/// inode table, keeping `InodeData` construction terse.
pub fn stub_data(filetype: FileType, size: u64) -> InodeData {
    InodeData {
        filetype,
        size,
        permissions: 0o644,
        nlink: 1,
    }
}


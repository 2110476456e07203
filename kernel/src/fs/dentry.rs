//! VFS dentry cache: hashes `(parent inode id, name)` pairs to cached
//! dentries so path lookups don't re-walk `readdir` on every component.
//! Built on the same `Arc<Mutex<_>>` + hash-bucket idiom as
//! `kernel::fs::inode`, hashed with FNV-1a over the parent-inode-id bytes
//! followed by the name bytes.
//!
//! Dentries are slab-backed via `DentryAllocator`, the same scheme
//! `task::task::TaskAllocator` uses for task structs: `dget`/`dput`
//! manage the cache-visibility refcount, while the underlying
//! `ArcInner<Mutex<Dentry>>` allocation itself comes from (and, once its
//! own last `Arc` drops, returns to) a dedicated `mm::slab` cache.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::config::DENTRY_HASH_BUCKETS;
use crate::error::{KError, KResult};
use crate::fs::inode::Inode;
use crate::fs::superblock::Superblock;
use crate::mm::slab::{self, SlabCache};

static DENTRY_CACHE: Mutex<Option<SlabCache>> = Mutex::new(None);

/// `core::alloc::Allocator` backing every `DentryRef`/`DentryWeak`
/// allocation with a slab cache, sized from the first `Layout` it's asked
/// to satisfy (the fixed `ArcInner<Mutex<Dentry>>` layout never changes
/// between calls).
#[derive(Clone, Copy, Default)]
pub struct DentryAllocator;

fn dentry_cache_for(layout: Layout) -> Result<SlabCache, AllocError> {
    let mut guard = DENTRY_CACHE.lock();
    if let Some(cache) = guard.as_ref() {
        return Ok(cache.clone());
    }
    let cache = slab::cache_init("dentry", layout.size(), layout.align(), None, None).map_err(|_| AllocError)?;
    *guard = Some(cache.clone());
    Ok(cache)
}

unsafe impl Allocator for DentryAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let cache = dentry_cache_for(layout)?;
        let kernel_pml4 = crate::mm::paging::kernel_pml4();
        let ptr = slab::alloc(&cache, kernel_pml4).map_err(|_| AllocError)?;
        let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
        NonNull::new(slice).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let cache = DENTRY_CACHE
            .lock()
            .as_ref()
            .expect("DentryAllocator::deallocate called before any allocate")
            .clone();
        let kernel_pml4 = crate::mm::paging::kernel_pml4();
        slab::free(&cache, ptr.as_ptr(), kernel_pml4);
    }
}

pub type DentryRef = Arc<Mutex<Dentry>, DentryAllocator>;
pub type DentryWeak = Weak<Mutex<Dentry>, DentryAllocator>;

fn new_dentry_ref(dentry: Dentry) -> DentryRef {
    Arc::new_in(Mutex::new(dentry), DentryAllocator)
}

pub struct Dentry {
    pub name: String,
    pub parent: Option<DentryWeak>,
    pub inode: Option<Arc<Mutex<Inode>>>,
    pub ref_count: u32,
    pub children: Vec<DentryRef>,
}

impl Dentry {
    pub fn is_negative(&self) -> bool {
        self.inode.is_none()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Sentinel substituted for a missing parent-inode id (the root dentry
/// has no parent).
const ROOT_SENTINEL: u64 = u64::MAX;

fn hash_key(parent_inode_id: Option<u64>, name: &str) -> u64 {
    let mut bytes = Vec::with_capacity(8 + name.len());
    bytes.extend_from_slice(&parent_inode_id.unwrap_or(ROOT_SENTINEL).to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
    fnv1a(&bytes)
}

fn parent_inode_id(parent: &DentryRef) -> Option<u64> {
    parent.lock().inode.as_ref().map(|i| i.lock().id)
}

struct DentryCache {
    buckets: Vec<Vec<DentryRef>>,
}

static CACHE: Mutex<Option<DentryCache>> = Mutex::new(None);

fn with_cache<R>(f: impl FnOnce(&mut DentryCache) -> R) -> R {
    let mut guard = CACHE.lock();
    if guard.is_none() {
        let mut buckets = Vec::with_capacity(DENTRY_HASH_BUCKETS);
        buckets.resize_with(DENTRY_HASH_BUCKETS, Vec::new);
        *guard = Some(DentryCache { buckets });
    }
    f(guard.as_mut().unwrap())
}

fn bucket_of(key: u64) -> usize {
    (key as usize) % DENTRY_HASH_BUCKETS
}

pub fn dget(dentry: &DentryRef) -> DentryRef {
    dentry.lock().ref_count += 1;
    dentry.clone()
}

/// Drops a reference; at zero, detaches from the hash table, detaches
/// from the parent's child list, and releases the inode reference. The
/// dentry's own `ArcInner` allocation returns to its slab cache once this
/// (and every other clone) drops.
pub fn dput(dentry: DentryRef) {
    let zero = {
        let mut d = dentry.lock();
        d.ref_count -= 1;
        d.ref_count == 0
    };
    if !zero {
        return;
    }

    let (parent, inode, key) = {
        let d = dentry.lock();
        let pid = d.parent.as_ref().and_then(|w| w.upgrade()).and_then(|p| parent_inode_id(&p));
        let key = hash_key(pid, &d.name);
        (d.parent.clone(), d.inode.clone(), key)
    };

    with_cache(|cache| {
        cache.buckets[bucket_of(key)].retain(|d| !Arc::ptr_eq(d, &dentry));
    });

    if let Some(parent) = parent.and_then(|w| w.upgrade()) {
        parent.lock().children.retain(|c| !Arc::ptr_eq(c, &dentry));
    }
    if let Some(inode) = inode {
        crate::fs::inode::iput(inode);
    }
}

/// Allocates a brand-new root dentry for a just-mounted superblock,
/// populated positively from `root_id`.
pub fn new_root(sb: &Arc<Superblock>) -> KResult<DentryRef> {
    let inode = crate::fs::inode::iget(sb, sb.fs.root_id())?;
    Ok(new_dentry_ref(Dentry {
        name: String::new(),
        parent: None,
        inode: Some(inode),
        ref_count: 1,
        children: Vec::new(),
    }))
}

/// Cache-or-load child lookup: a hash hit returns a `dget`ed clone; a
/// miss asks the filesystem driver and caches the result (positive or
/// negative).
pub fn dentry_lookup(
    parent: &DentryRef,
    sb: &Arc<Superblock>,
    name: &str,
) -> KResult<DentryRef> {
    let pid = parent_inode_id(parent);
    let key = hash_key(pid, name);

    let hit = with_cache(|cache| {
        cache.buckets[bucket_of(key)]
            .iter()
            .find(|d| {
                let d = d.lock();
                d.name == name
                    && d.parent
                        .as_ref()
                        .and_then(|w| w.upgrade())
                        .map(|p| Arc::ptr_eq(&p, parent))
                        .unwrap_or(false)
            })
            .cloned()
    });
    if let Some(found) = hit {
        return Ok(dget(&found));
    }

    let parent_inode_arc = parent
        .lock()
        .inode
        .clone()
        .ok_or(KError::NotFound)?;
    let parent_id = parent_inode_arc.lock().id;
    let child_id = sb.fs.lookup(parent_id, name)?;

    let inode = match child_id {
        Some(id) => Some(crate::fs::inode::iget(sb, id)?),
        None => None,
    };

    let new_dentry = new_dentry_ref(Dentry {
        name: String::from(name),
        parent: Some(Arc::downgrade(parent)),
        inode,
        ref_count: 1,
        children: Vec::new(),
    });
    parent.lock().children.push(new_dentry.clone());
    with_cache(|cache| cache.buckets[bucket_of(key)].push(new_dentry.clone()));
    Ok(new_dentry)
}

#[cfg(test)]
pub fn reset_cache_for_test() {
    *CACHE.lock() = None;
}

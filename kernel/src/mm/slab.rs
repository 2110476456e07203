//! Slab allocator: fixed-size object pools layered on the buddy
//! allocator, with empty/partial/full slab bookkeeping. A slab is a
//! buddy-backed page carrying a header at offset 0 (free-object stack and
//! free-top counter) plus the objects themselves, the same
//! `static ... Mutex<Option<T>>` singleton idiom as `mm::pmm::PMM` used
//! for the cache registry.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;
use crate::error::KError;
use crate::mm::buddy;

/// Minimum alignment: must fit the intrusive free-list link (`*mut u8`).
const MIN_ALIGN: usize = core::mem::size_of::<usize>();

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Derives the slab a pointer belongs to: `obj & ~(slab_bytes - 1)`, per
/// spec. Slabs are single buddy-backed pages, so `slab_bytes == PAGE_SIZE`
/// (a power of two) and every slab's backing page is naturally aligned to
/// its own size.
fn mask_to_header(ptr: *mut u8) -> *mut SlabHeader {
    let masked = (ptr as u64) & !((PAGE_SIZE as u64) - 1);
    masked as *mut SlabHeader
}

/// Per-slab header living at offset 0 of the backing page. `parent`
/// identifies the owning cache for the `free` assertion so lookup never
/// needs to scan a slab's object range.
#[repr(C)]
struct SlabHeader {
    parent: *const Mutex<SlabState>,
    free_head: *mut u8,
    free_count: u32,
    capacity: u32,
}

struct Slab {
    page: VirtAddr,
}

unsafe impl Send for Slab {}

impl Slab {
    fn header(&self) -> *mut SlabHeader {
        self.page.as_mut_ptr::<SlabHeader>()
    }

    fn objects_base(&self, header_bytes: usize) -> *mut u8 {
        unsafe { self.page.as_mut_ptr::<u8>().add(header_bytes) }
    }

    /// Carves one buddy-backed page into a header plus `objects_per_slab`
    /// free objects, threading an intrusive singly-linked list through
    /// them in ascending address order. Debug builds poison every object
    /// with `0xAA` on creation (and on free) so use-after-free shows up as
    /// a recognisable pattern.
    fn new(
        parent: *const Mutex<SlabState>,
        object_size: usize,
        header_bytes: usize,
        objects_per_slab: u32,
        kernel_pml4: PhysFrame,
    ) -> Option<Slab> {
        let page = buddy::alloc(PAGE_SIZE, kernel_pml4)?;
        let slab = Slab { page };
        let base = slab.objects_base(header_bytes);
        let mut head: *mut u8 = core::ptr::null_mut();
        for i in (0..objects_per_slab).rev() {
            let obj = unsafe { base.add(i as usize * object_size) };
            #[cfg(debug_assertions)]
            unsafe {
                core::ptr::write_bytes(obj, 0xAA, object_size);
            }
            unsafe {
                *(obj as *mut *mut u8) = head;
            }
            head = obj;
        }
        unsafe {
            let hdr = slab.header();
            (*hdr).parent = parent;
            (*hdr).free_head = head;
            (*hdr).free_count = objects_per_slab;
            (*hdr).capacity = objects_per_slab;
        }
        Some(slab)
    }

    fn free_count(&self) -> u32 {
        unsafe { (*self.header()).free_count }
    }

    fn capacity(&self) -> u32 {
        unsafe { (*self.header()).capacity }
    }

    fn alloc_one(&mut self) -> Option<*mut u8> {
        unsafe {
            let hdr = self.header();
            let obj = (*hdr).free_head;
            if obj.is_null() {
                return None;
            }
            (*hdr).free_head = *(obj as *mut *mut u8);
            (*hdr).free_count -= 1;
            Some(obj)
        }
    }

    fn free_one(&mut self, obj: *mut u8, object_size: usize) {
        #[cfg(debug_assertions)]
        unsafe {
            core::ptr::write_bytes(obj, 0xAA, object_size);
        }
        #[cfg(not(debug_assertions))]
        let _ = object_size;
        unsafe {
            let hdr = self.header();
            *(obj as *mut *mut u8) = (*hdr).free_head;
            (*hdr).free_head = obj;
            (*hdr).free_count += 1;
        }
    }

    fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    fn is_empty(&self) -> bool {
        self.free_count() == self.capacity()
    }

    /// Object addresses not reachable by walking the free-list are live.
    /// Used by `cache_destroy` to find a partial slab's outstanding
    /// objects so their destructor can run before the page is released.
    fn live_objects(&self, object_size: usize, header_bytes: usize) -> Vec<*mut u8> {
        let mut free_set = BTreeSet::new();
        let mut cur = unsafe { (*self.header()).free_head };
        while !cur.is_null() {
            free_set.insert(cur as u64);
            cur = unsafe { *(cur as *mut *mut u8) };
        }
        let base = self.objects_base(header_bytes);
        let mut live = Vec::new();
        for i in 0..self.capacity() {
            let obj = unsafe { base.add(i as usize * object_size) };
            if !free_set.contains(&(obj as u64)) {
                live.push(obj);
            }
        }
        live
    }
}

struct SlabState {
    object_size: usize,
    align: usize,
    header_bytes: usize,
    objects_per_slab: u32,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
    empty: VecDeque<Slab>,
    partial: VecDeque<Slab>,
    full: VecDeque<Slab>,
}

/// A cache of fixed-size objects. Cloning the handle is cheap: `state` is
/// an `Arc`-backed handle whose address is stable for the cache's
/// lifetime regardless of registry growth, so slab headers can safely
/// carry a raw pointer to it for the `free` assertion.
#[derive(Clone)]
pub struct SlabCache {
    name: String,
    state: Arc<Mutex<SlabState>>,
}

struct CacheRegistry {
    caches: Vec<(String, Arc<Mutex<SlabState>>)>,
}

static REGISTRY: Mutex<Option<CacheRegistry>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut CacheRegistry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    if guard.is_none() {
        *guard = Some(CacheRegistry { caches: Vec::new() });
    }
    f(guard.as_mut().unwrap())
}

/// Creates (or returns the existing) cache for `name`/`object_size`/
/// `align`. `align` is clamped up to at least pointer size and must end
/// up a power of two; `object_size` must leave room for at least one
/// object on a page alongside its header. Two calls with the same name
/// but a different layout are an error — names identify a single object
/// layout for the lifetime of the kernel.
pub fn cache_init(
    name: &str,
    object_size: usize,
    align: usize,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
) -> Result<SlabCache, KError> {
    let align = align.max(MIN_ALIGN);
    if !align.is_power_of_two() {
        return Err(KError::InvalidArgument);
    }
    if object_size == 0 || object_size >= PAGE_SIZE {
        return Err(KError::TooLarge);
    }
    with_registry(|reg| {
        if let Some((_, state)) = reg.caches.iter().find(|(n, _)| n == name) {
            let locked = state.lock();
            if locked.object_size != object_size || locked.align != align {
                return Err(KError::AlreadyExists);
            }
            drop(locked);
            return Ok(SlabCache {
                name: String::from(name),
                state: state.clone(),
            });
        }
        let header_bytes = align_up(core::mem::size_of::<SlabHeader>(), align);
        if header_bytes >= PAGE_SIZE {
            return Err(KError::TooLarge);
        }
        let objects_per_slab = ((PAGE_SIZE - header_bytes) / object_size) as u32;
        if objects_per_slab == 0 {
            return Err(KError::TooLarge);
        }
        let state = Arc::new(Mutex::new(SlabState {
            object_size,
            align,
            header_bytes,
            objects_per_slab,
            ctor,
            dtor,
            empty: VecDeque::new(),
            partial: VecDeque::new(),
            full: VecDeque::new(),
        }));
        reg.caches.push((String::from(name), state.clone()));
        Ok(SlabCache {
            name: String::from(name),
            state,
        })
    })
}

/// Allocates one object from the cache, growing it by one buddy-backed
/// slab if every existing slab is full. Invokes the cache's constructor
/// (if any) on the returned object before handing it back.
pub fn alloc(cache: &SlabCache, kernel_pml4: PhysFrame) -> Result<*mut u8, KError> {
    let mut state = cache.state.lock();
    let parent: *const Mutex<SlabState> = Arc::as_ptr(&cache.state);

    // Prefer a partial slab so full/empty populations stay meaningful.
    let mut slab = if let Some(slab) = state.partial.pop_front() {
        slab
    } else if let Some(slab) = state.empty.pop_front() {
        slab
    } else {
        let object_size = state.object_size;
        let header_bytes = state.header_bytes;
        let objects_per_slab = state.objects_per_slab;
        Slab::new(parent, object_size, header_bytes, objects_per_slab, kernel_pml4).ok_or(KError::NoMemory)?
    };

    let obj = slab
        .alloc_one()
        .expect("slab pulled from partial/empty/fresh must have a free object");
    if slab.is_full() {
        state.full.push_back(slab);
    } else {
        state.partial.push_back(slab);
    }
    if let Some(ctor) = state.ctor {
        ctor(obj);
    }
    Ok(obj)
}

/// Returns an object to its owning slab, migrating the slab between the
/// full/partial/empty lists as its occupancy changes. Invokes the cache's
/// destructor (if any) before the object rejoins the free stack. Panics
/// (a kernel bug, not a user-triggerable condition) if `ptr` does not
/// belong to this cache.
pub fn free(cache: &SlabCache, ptr: *mut u8, _kernel_pml4: PhysFrame) {
    let hdr_ptr = mask_to_header(ptr);
    let parent = unsafe { (*hdr_ptr).parent };
    assert!(
        core::ptr::eq(parent, Arc::as_ptr(&cache.state)),
        "slab::free: pointer does not belong to cache"
    );

    let mut state = cache.state.lock();
    if let Some(dtor) = state.dtor {
        dtor(ptr);
    }

    let page = VirtAddr::new(hdr_ptr as u64);
    let object_size = state.object_size;

    for list in [&mut state.full, &mut state.partial] {
        if let Some(pos) = list.iter().position(|s| s.page == page) {
            let mut slab = list.remove(pos).unwrap();
            slab.free_one(ptr, object_size);
            if slab.is_empty() {
                state.empty.push_back(slab);
            } else {
                state.partial.push_back(slab);
            }
            return;
        }
    }
    panic!("slab::free: pointer does not belong to any tracked slab");
}

/// Releases every slab the cache holds back to the buddy allocator and
/// drops its registry entry. Invokes the destructor (if any) on every
/// live object first: every object on a full slab, and — via a per-slab
/// free-set — the outstanding objects on a partial slab. Callers must
/// guarantee no outstanding pointers from this cache remain in use
/// afterward.
pub fn cache_destroy(cache: SlabCache, kernel_pml4: PhysFrame) {
    with_registry(|reg| {
        if let Some(pos) = reg.caches.iter().position(|(n, _)| *n == cache.name) {
            reg.caches.remove(pos);
        }
    });

    let mut state = cache.state.lock();
    let object_size = state.object_size;
    let header_bytes = state.header_bytes;

    if let Some(dtor) = state.dtor {
        for slab in state.full.iter() {
            for i in 0..slab.capacity() {
                let obj = unsafe { slab.objects_base(header_bytes).add(i as usize * object_size) };
                dtor(obj);
            }
        }
        for slab in state.partial.iter() {
            for obj in slab.live_objects(object_size, header_bytes) {
                dtor(obj);
            }
        }
    }

    for slab in state
        .empty
        .drain(..)
        .chain(state.partial.drain(..))
        .chain(state.full.drain(..))
    {
        buddy::free(slab.page, kernel_pml4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    // Slab bookkeeping (header layout, free-list threading, list
    // migration) is pure logic over a raw byte buffer standing in for a
    // buddy-backed page, so it's exercised directly here without a real
    // PML4/PMM.

    fn fake_slab(object_size: usize, objects_per_slab: u32, header_bytes: usize) -> (Vec<u8>, Slab) {
        let mut buf = vec![0u8; header_bytes + object_size * objects_per_slab as usize];
        let page = VirtAddr::new(buf.as_mut_ptr() as u64);
        let slab = Slab { page };
        let base = slab.objects_base(header_bytes);
        let mut head: *mut u8 = core::ptr::null_mut();
        for i in (0..objects_per_slab).rev() {
            let obj = unsafe { base.add(i as usize * object_size) };
            unsafe {
                *(obj as *mut *mut u8) = head;
            }
            head = obj;
        }
        unsafe {
            let hdr = slab.header();
            (*hdr).parent = core::ptr::null();
            (*hdr).free_head = head;
            (*hdr).free_count = objects_per_slab;
            (*hdr).capacity = objects_per_slab;
        }
        (buf, slab)
    }

    fn header_bytes(align: usize) -> usize {
        align_up(core::mem::size_of::<SlabHeader>(), align)
    }

    #[test]
    fn objects_per_slab_accounts_for_header() {
        // spec §8 scenario 2: size=64, align=8 on a 4 KiB slab must yield
        // 63 usable objects, not 64 — the header at offset 0 costs space.
        let header_bytes = header_bytes(8);
        let objects_per_slab = (PAGE_SIZE - header_bytes) / 64;
        assert_eq!(objects_per_slab, 63);
    }

    #[test]
    fn alloc_all_then_slab_is_full() {
        let (_buf, mut slab) = fake_slab(16, 4, header_bytes(8));
        let mut objs = Vec::new();
        for _ in 0..4 {
            objs.push(slab.alloc_one().unwrap());
        }
        assert!(slab.is_full());
        assert!(slab.alloc_one().is_none());
    }

    #[test]
    fn free_then_slab_is_empty_again() {
        let (_buf, mut slab) = fake_slab(16, 4, header_bytes(8));
        let mut objs = Vec::new();
        for _ in 0..4 {
            objs.push(slab.alloc_one().unwrap());
        }
        for obj in objs {
            slab.free_one(obj, 16);
        }
        assert!(slab.is_empty());
    }

    #[test]
    fn alloc_then_addresses_are_strictly_increasing_with_stride() {
        let header_bytes = header_bytes(8);
        let (_buf, mut slab) = fake_slab(64, 63, header_bytes);
        let mut objs = Vec::new();
        for _ in 0..63 {
            objs.push(slab.alloc_one().unwrap() as u64);
        }
        for w in objs.windows(2) {
            assert_eq!(w[1] - w[0], 64);
        }
        assert!(slab.alloc_one().is_none());
    }

    #[test]
    fn mask_to_header_recovers_the_page() {
        let (_buf, slab) = fake_slab(16, 4, header_bytes(8));
        let base = slab.page.as_u64() as *mut u8;
        let obj_in_page = unsafe { base.add(header_bytes(8) + 33) };
        assert_eq!(mask_to_header(obj_in_page) as u64, slab.page.as_u64());
    }

    #[test]
    fn live_objects_excludes_the_free_chain() {
        let header_bytes = header_bytes(8);
        let (_buf, mut slab) = fake_slab(16, 4, header_bytes);
        let a = slab.alloc_one().unwrap();
        let _b = slab.alloc_one().unwrap();
        slab.free_one(a, 16);
        let live = slab.live_objects(16, header_bytes);
        assert_eq!(live.len(), 3);
        assert!(!live.contains(&a));
    }
}

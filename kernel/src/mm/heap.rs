//! `#[global_allocator]`: backs every `alloc::{Box,Vec,Arc,String,...}` use
//! in the kernel.
//!
//! The backing region is carved out of the buddy-managed kernel heap
//! window exactly once at boot, via `buddy::alloc`, and handed to a
//! trusted `linked_list_allocator::LockedHeap` — a single non-reentrant
//! allocator, rather than routing every `Vec`/`Box` through `buddy`/
//! `slab` directly, which would have the allocator's own internal
//! bookkeeping (`Vec`-backed free-lists, slab list migrations) recursing
//! back into itself. `mm::slab::cache_init` is used directly by callers
//! that want a dedicated fixed-size-object cache — `task::task::TaskAllocator`
//! and `fs::dentry::DentryAllocator` back every task struct and dentry
//! allocation through one — but it is not forced underneath every heap
//! allocation.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::PhysFrame;

use crate::mm::buddy;

/// Initial backing size for the kernel heap, carved from the buddy
/// allocator's window in one shot. Generous enough for boot-time ACPI
/// table parsing, the VFS caches, and task bookkeeping without needing a
/// grow-on-exhaustion path (not implemented: exhaustion aborts via the
/// standard `alloc_error_handler`).
const INITIAL_HEAP_SIZE: usize = 16 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Must run once, after `buddy::init`, before any other subsystem touches
/// `alloc::`.
pub fn init(kernel_pml4: PhysFrame) {
    let region = buddy::alloc(INITIAL_HEAP_SIZE, kernel_pml4)
        .expect("failed to carve initial kernel heap from buddy allocator");
    unsafe {
        ALLOCATOR.lock().init(region.as_mut_ptr(), INITIAL_HEAP_SIZE);
    }
}

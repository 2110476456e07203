//! Memory management: physical frames, page tables, the kernel heap
//! (buddy + slab), and per-process address spaces.

pub mod address_space;
pub mod buddy;
pub mod heap;
pub mod paging;
pub mod pmm;
pub mod slab;

use bootloader_api::info::MemoryRegions;
use x86_64::structures::paging::PhysFrame;

/// Brings up every `mm` subsystem in dependency order: frames, then page
/// tables/HHDM (needs frames), then the buddy-backed kernel heap (needs
/// both). Must run once, early in boot, before any allocation.
pub fn init(
    kernel_pml4: PhysFrame,
    physical_memory_offset: u64,
    memory_regions: &'static MemoryRegions,
) {
    pmm::init(memory_regions);
    paging::init(kernel_pml4, physical_memory_offset, memory_regions);
    buddy::init();
    heap::init(kernel_pml4);
}

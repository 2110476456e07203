//! Page-table manager: map/unmap/translate over an arbitrary PML4 root,
//! plus the one-time higher-half direct map (HHDM) and kernel executable
//! mapping done at boot.
//!
//! Operations are parameterised over any PML4 root rather than only the
//! currently-loaded one, the way `address_space::duplicate` and
//! `exec::process::prepare_exec` need — both build a brand new root
//! before it is ever "current".

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use conquer_once::spin::OnceCell;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::KError;
use crate::mm::pmm::PMM;

/// Higher-half direct map offset, set once at boot from
/// `BootInfo::physical_memory_offset`.
static HHDM_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// The kernel's own PML4 root, set once at boot. Every subsystem that
/// maps into the kernel's shared window (buddy, slab, the global
/// allocator) needs this same root — kept here as the one place that
/// owns it, rather than threaded by hand through every call site.
static KERNEL_PML4: OnceCell<PhysFrame> = OnceCell::uninit();

pub fn hhdm_offset() -> VirtAddr {
    *HHDM_OFFSET.get().expect("paging::init not called")
}

pub fn kernel_pml4() -> PhysFrame {
    *KERNEL_PML4.get().expect("paging::init not called")
}

/// Translates a physical address to its HHDM virtual alias.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    hhdm_offset() + phys.as_u64()
}

fn pml4_table_mut(pml4_phys: PhysFrame) -> &'static mut PageTable {
    let virt = phys_to_virt(pml4_phys.start_address());
    unsafe { &mut *virt.as_mut_ptr() }
}

/// Runs `f` with a `Mapper` over the given PML4 root via the HHDM.
fn with_mapper<R>(pml4_phys: PhysFrame, f: impl FnOnce(&mut OffsetPageTable) -> R) -> R {
    let table = pml4_table_mut(pml4_phys);
    let mut mapper = unsafe { OffsetPageTable::new(table, hhdm_offset()) };
    f(&mut mapper)
}

/// Maps a single 4 KiB page. Intermediate tables are allocated lazily via
/// the PMM and zeroed. Mapping over an existing entry replaces it and
/// invalidates the TLB entry for that page. Fails only on allocation
/// failure. Callers must not set `HUGE_PAGE`.
pub fn map(
    pml4_phys: PhysFrame,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), KError> {
    if flags.contains(PageTableFlags::HUGE_PAGE) {
        return Err(KError::BadFlags);
    }
    if !flags.contains(PageTableFlags::PRESENT) {
        return Err(KError::BadFlags);
    }
    let page = Page::<Size4KiB>::containing_address(vaddr);
    let frame = PhysFrame::containing_address(paddr);
    let mut pmm_guard = PMM.lock();
    let pmm = pmm_guard.as_mut().expect("pmm not initialised");

    with_mapper(pml4_phys, |mapper| {
        // Replacing an existing entry: unmap first so map_to doesn't
        // observe AlreadyMapped and so the TLB entry is flushed either way.
        if mapper.translate_addr(vaddr).is_some() {
            if let Ok((_, flush)) = mapper.unmap(page) {
                flush.flush();
            }
        }
        unsafe {
            mapper
                .map_to(page, frame, flags, pmm)
                .map_err(|_| KError::NoMemory)?
                .flush();
        }
        Ok(())
    })
}

/// Unmaps a single page. Reports an error (and is a no-op) if the chain is
/// absent. If `free_phys` is set, the underlying frame is returned to the
/// PMM.
pub fn unmap(pml4_phys: PhysFrame, vaddr: VirtAddr, free_phys: bool) -> Result<(), KError> {
    let page = Page::<Size4KiB>::containing_address(vaddr);
    with_mapper(pml4_phys, |mapper| {
        let (frame, flush) = mapper.unmap(page).map_err(|_| KError::NotMapped)?;
        flush.flush();
        if free_phys {
            let mut pmm_guard = PMM.lock();
            let pmm = pmm_guard.as_mut().expect("pmm not initialised");
            unsafe { pmm.deallocate_frame(frame) };
        }
        Ok(())
    })
}

/// Looks up the physical address a virtual address currently maps to.
pub fn translate(pml4_phys: PhysFrame, vaddr: VirtAddr) -> Option<PhysAddr> {
    with_mapper(pml4_phys, |mapper| mapper.translate_addr(vaddr))
}

/// Allocates a fresh, zeroed PML4 and copies over the kernel's higher-half
/// entries (indices 256..512) so every address space shares kernel
/// mappings. Used by `address_space_dup` and `prepare_exec`.
pub fn new_pml4_sharing_kernel(kernel_pml4_phys: PhysFrame) -> Result<PhysFrame, KError> {
    let mut pmm_guard = PMM.lock();
    let pmm = pmm_guard.as_mut().expect("pmm not initialised");
    let frame = pmm.alloc_page().ok_or(KError::NoMemory)?;
    drop(pmm_guard);

    let new_table = pml4_table_mut(frame);
    new_table.zero();

    let kernel_table = pml4_table_mut(kernel_pml4_phys);
    for i in 256..512 {
        new_table[i] = kernel_table[i].clone();
    }

    Ok(frame)
}

/// One-time HHDM setup: maps every usable/reserved physical frame at
/// `phys + hhdm_offset`, then additionally maps the kernel executable
/// region at its linked virtual base (identity, since `bootloader_api`
/// already loads the kernel there — this just records the offset so
/// higher layers can reason about it).
pub fn init(
    kernel_pml4_phys: PhysFrame,
    physical_memory_offset: u64,
    memory_regions: &'static MemoryRegions,
) {
    HHDM_OFFSET.init_once(|| VirtAddr::new(physical_memory_offset));
    KERNEL_PML4.init_once(|| kernel_pml4_phys);

    let mut pmm_guard = PMM.lock();
    let pmm = pmm_guard.as_mut().expect("pmm::init must run before paging::init");

    with_mapper(kernel_pml4_phys, |mapper| {
        for region in memory_regions.iter() {
            if region.kind == MemoryRegionKind::Bootloader {
                continue; // already mapped by the bootloader's own HHDM
            }
            let mut addr = region.start;
            while addr < region.end {
                let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(addr));
                let page = Page::<Size4KiB>::containing_address(VirtAddr::new(
                    physical_memory_offset + addr,
                ));
                let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
                unsafe {
                    let _ = mapper.map_to(page, frame, flags, pmm);
                }
                addr += 4096;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    // The HHDM/mapper logic requires a real page table and is exercised via
    // integration with `address_space` tests instead of in isolation here,
    // since constructing a `PageTable` outside the kernel's own mappings
    // isn't meaningful on a host test target.
}

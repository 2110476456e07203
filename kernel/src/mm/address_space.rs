//! Address spaces: per-process region lists over a private PML4, with
//! copy-on-write duplication.
//!
//! Forking copies a PML4 and remaps user pages for the child, but shares
//! the underlying frames read-only between parent and child rather than
//! deep-copying them; a frame is only duplicated on the first write
//! fault, tracked through a physical-frame refcount table.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::error::{KError, KResult};
use crate::mm::paging;
use crate::mm::pmm::PMM;

/// Custom bit used to mark a page as copy-on-write in its PTE. Bits 9-11
/// are available for software use per the x86_64 paging spec.
const COW_BIT: PageTableFlags = PageTableFlags::BIT_9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Anonymous,
    File,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub start: VirtAddr,
    pub len: u64,
    pub flags: PageTableFlags,
    pub kind: RegionKind,
}

impl Region {
    fn end(&self) -> VirtAddr {
        VirtAddr::new(self.start.as_u64() + self.len)
    }

    fn overlaps(&self, other_start: VirtAddr, other_len: u64) -> bool {
        let other_end = other_start.as_u64() + other_len;
        self.start.as_u64() < other_end && other_start.as_u64() < self.end().as_u64()
    }
}

pub struct AddressSpace {
    pub pml4: PhysFrame,
    regions: Vec<Region>,
}

/// Refcounts for physical frames shared copy-on-write across address
/// spaces. A frame absent from this map is either unshared (owned solely
/// by whichever mapping points at it) or not COW-tracked at all.
static COW_REFCOUNTS: Mutex<BTreeMap<u64, u32>> = Mutex::new(BTreeMap::new());

fn cow_incref(frame: PhysFrame) {
    let mut map = COW_REFCOUNTS.lock();
    *map.entry(frame.start_address().as_u64()).or_insert(1) += 1;
}

/// Releases the caller's claim on `frame`. Returns `true` only if the
/// frame was untracked — i.e. the caller was already its sole owner, so
/// it can keep using it exclusively. A tracked entry always means at
/// least one *other* address space still maps the same frame, so the
/// caller must never reuse it in place; it decrements the count (and
/// drops the entry once only one mapper is left) but still returns
/// `false`, since that remaining mapper — not the caller — is the one
/// now entitled to treat the frame as exclusive.
fn cow_decref(frame: PhysFrame) -> bool {
    let mut map = COW_REFCOUNTS.lock();
    let key = frame.start_address().as_u64();
    match map.get_mut(&key) {
        None => true,
        Some(count) => {
            *count -= 1;
            if *count <= 1 {
                map.remove(&key);
            }
            false
        }
    }
}

impl AddressSpace {
    /// Allocates a fresh address space with a private PML4 sharing the
    /// kernel's higher-half mappings and an empty region list.
    pub fn new(kernel_pml4: PhysFrame) -> KResult<AddressSpace> {
        let pml4 = paging::new_pml4_sharing_kernel(kernel_pml4)?;
        Ok(AddressSpace {
            pml4,
            regions: Vec::new(),
        })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Reserves `[start, start+len)` for `kind`/`flags` and backs it with
    /// freshly zeroed pages immediately (no demand paging). Rejects
    /// overlap with an existing region.
    pub fn map_region(
        &mut self,
        start: VirtAddr,
        len: u64,
        flags: PageTableFlags,
        kind: RegionKind,
    ) -> KResult<()> {
        if len == 0 || start.as_u64() % 4096 != 0 || len % 4096 != 0 {
            return Err(KError::Unaligned);
        }
        if self.regions.iter().any(|r| r.overlaps(start, len)) {
            return Err(KError::AlreadyExists);
        }

        let mut mapped = 0u64;
        while mapped < len {
            let vaddr = VirtAddr::new(start.as_u64() + mapped);
            let frame = {
                let mut pmm_guard = PMM.lock();
                pmm_guard.as_mut().unwrap().alloc_page().ok_or(KError::NoMemory)?
            };
            zero_frame(frame);
            paging::map(self.pml4, vaddr, frame.start_address(), flags | PageTableFlags::PRESENT)?;
            mapped += 4096;
        }

        self.regions.push(Region { start, len, flags, kind });
        Ok(())
    }

    /// Writes `data` into an existing mapped region, crossing page
    /// boundaries transparently via the HHDM. Fails if any byte of the
    /// target range falls outside a mapped region.
    pub fn vmm_write_region(&self, dest: VirtAddr, data: &[u8]) -> KResult<()> {
        let end = dest.as_u64() + data.len() as u64;
        let in_region = self
            .regions
            .iter()
            .any(|r| r.start.as_u64() <= dest.as_u64() && end <= r.end().as_u64());
        if !in_region {
            return Err(KError::NotMapped);
        }

        let mut written = 0usize;
        while written < data.len() {
            let vaddr = VirtAddr::new(dest.as_u64() + written as u64);
            let page_off = vaddr.as_u64() % 4096;
            let chunk = core::cmp::min(4096 - page_off as usize, data.len() - written);
            let phys = paging::translate(self.pml4, vaddr).ok_or(KError::NotMapped)?;
            let dst_virt = paging::phys_to_virt(phys);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[written..written + chunk].as_ptr(),
                    dst_virt.as_mut_ptr(),
                    chunk,
                );
            }
            written += chunk;
        }
        Ok(())
    }

    /// Duplicates this address space for `fork`: every mapped page is
    /// shared between parent and child, remapped read-only with the COW
    /// bit set on both sides, and refcounted. Neither side copies any
    /// page contents until one of them writes to it and takes a fault.
    pub fn duplicate(&mut self, kernel_pml4: PhysFrame) -> KResult<AddressSpace> {
        let mut child = AddressSpace::new(kernel_pml4)?;

        for region in &self.regions {
            let mut off = 0u64;
            while off < region.len {
                let vaddr = VirtAddr::new(region.start.as_u64() + off);
                let phys = paging::translate(self.pml4, vaddr).ok_or(KError::NotMapped)?;
                let frame = PhysFrame::<Size4KiB>::containing_address(phys);

                let shared_flags = if region.flags.contains(PageTableFlags::WRITABLE) {
                    (region.flags | COW_BIT) & !PageTableFlags::WRITABLE
                } else {
                    region.flags
                };

                paging::map(self.pml4, vaddr, phys, shared_flags)?;
                paging::map(child.pml4, vaddr, phys, shared_flags)?;
                if region.flags.contains(PageTableFlags::WRITABLE) {
                    cow_incref(frame);
                }
                off += 4096;
            }
            child.regions.push(region.clone());
        }

        Ok(child)
    }

    /// Handles a write fault against a COW page: if this mapping is the
    /// sole owner, just restores the writable bit in place; otherwise
    /// allocates a fresh frame, copies the contents, remaps it
    /// exclusively writable, and drops this side's share of the original.
    pub fn handle_cow_fault(&mut self, vaddr: VirtAddr) -> KResult<()> {
        let region = self
            .regions
            .iter()
            .find(|r| r.start.as_u64() <= vaddr.as_u64() && vaddr.as_u64() < r.end().as_u64())
            .cloned()
            .ok_or(KError::NotMapped)?;
        if !region.flags.contains(PageTableFlags::WRITABLE) {
            return Err(KError::PermissionDenied);
        }

        let page_vaddr = VirtAddr::new(vaddr.as_u64() & !0xFFF);
        let phys = paging::translate(self.pml4, page_vaddr).ok_or(KError::NotMapped)?;
        let frame = PhysFrame::<Size4KiB>::containing_address(phys);

        let sole_owner = cow_decref(frame);
        if sole_owner {
            paging::map(self.pml4, page_vaddr, phys, region.flags | PageTableFlags::PRESENT)?;
            return Ok(());
        }

        let new_frame = {
            let mut pmm_guard = PMM.lock();
            pmm_guard.as_mut().unwrap().alloc_page().ok_or(KError::NoMemory)?
        };
        unsafe {
            let src = paging::phys_to_virt(phys).as_ptr::<u8>();
            let dst = paging::phys_to_virt(new_frame.start_address()).as_mut_ptr::<u8>();
            core::ptr::copy_nonoverlapping(src, dst, 4096);
        }
        paging::map(
            self.pml4,
            page_vaddr,
            new_frame.start_address(),
            region.flags | PageTableFlags::PRESENT,
        )?;
        Ok(())
    }

    /// Tears down every mapping, returning exclusively-owned frames to the
    /// PMM and decrementing refcounts for shared ones (freeing them only
    /// once the last sharer is gone).
    pub fn destroy(self, kernel_pml4: PhysFrame) {
        for region in &self.regions {
            let mut off = 0u64;
            while off < region.len {
                let vaddr = VirtAddr::new(region.start.as_u64() + off);
                if let Some(phys) = paging::translate(self.pml4, vaddr) {
                    let frame = PhysFrame::<Size4KiB>::containing_address(phys);
                    let should_free = cow_decref(frame);
                    let _ = paging::unmap(self.pml4, vaddr, should_free);
                }
                off += 4096;
            }
        }
        let mut pmm_guard = PMM.lock();
        let pmm = pmm_guard.as_mut().unwrap();
        unsafe { pmm.deallocate_frame(self.pml4) };
        let _ = kernel_pml4;
    }
}

fn zero_frame(frame: PhysFrame) {
    let virt = paging::phys_to_virt(frame.start_address());
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, 4096);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_overlap_detects_intersection() {
        let r = Region {
            start: VirtAddr::new(0x1000),
            len: 0x2000,
            flags: PageTableFlags::PRESENT,
            kind: RegionKind::Anonymous,
        };
        assert!(r.overlaps(VirtAddr::new(0x2000), 0x1000));
        assert!(!r.overlaps(VirtAddr::new(0x3000), 0x1000));
    }

    #[test]
    fn cow_decref_never_claims_sole_ownership_while_others_remain() {
        // Three sharers (one incref per fork beyond the first owner).
        let frame = PhysFrame::<Size4KiB>::containing_address(x86_64::PhysAddr::new(0x4000));
        cow_incref(frame);
        cow_incref(frame);
        // Two decrefs leave one other mapper each time - neither caller
        // may treat the frame as exclusively its own.
        assert!(!cow_decref(frame));
        assert!(!cow_decref(frame));
        // Only once the entry is fully untracked does the last remaining
        // mapper get to reuse the frame in place.
        assert!(cow_decref(frame));
    }

    #[test]
    fn cow_two_way_fork_first_faulter_must_copy() {
        let frame = PhysFrame::<Size4KiB>::containing_address(x86_64::PhysAddr::new(0x5000));
        cow_incref(frame); // parent + child now share it
        assert!(!cow_decref(frame)); // child's fault: parent still maps it, must copy
        assert!(cow_decref(frame)); // parent's later fault: sole owner now, reuse in place
    }

    #[test]
    fn cow_decref_on_untracked_frame_is_sole_owner() {
        let frame = PhysFrame::<Size4KiB>::containing_address(x86_64::PhysAddr::new(0x9000));
        assert!(cow_decref(frame));
    }
}

//! Physical page frame allocator.
//!
//! A `Vec`-backed free list seeded once from the bootloader's memory map,
//! exposing `alloc_page`/`free_page`/`alloc_contiguous` in addition to
//! the `x86_64::structures::paging::FrameAllocator` trait the page-table
//! manager needs.

use alloc::vec::Vec;

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::config::PAGE_SIZE;

/// Owns the physical frame inventory. Every frame is, at all times, in
/// exactly one of {free, in-use, reserved} — reserved frames are simply
/// never inserted into `free`, so "in-use" and "reserved" are
/// indistinguishable to this struct by design.
pub struct PhysicalMemoryManager {
    free: Vec<PhysFrame>,
}

impl PhysicalMemoryManager {
    /// Builds the frame inventory from the boot memory map. Only `Usable`
    /// regions contribute frames; everything else (bootloader-reserved,
    /// ACPI reclaimable/NVS, bad memory) is permanently excluded.
    pub fn init(memory_regions: &'static MemoryRegions) -> Self {
        let mut free = Vec::new();
        for region in memory_regions.iter() {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let mut addr = region.start;
            while addr + PAGE_SIZE as u64 <= region.end {
                free.push(PhysFrame::containing_address(PhysAddr::new(addr)));
                addr += PAGE_SIZE as u64;
            }
        }
        PhysicalMemoryManager { free }
    }

    /// Returns one 4 KiB frame, or `None` on exhaustion. No ordering
    /// guarantees on which frame comes back.
    pub fn alloc_page(&mut self) -> Option<PhysFrame> {
        self.free.pop()
    }

    /// Returns a frame obtained from this allocator. The caller must not
    /// pass an address that didn't originate here, and it must be
    /// frame-aligned; both are upheld by construction since `PhysFrame`
    /// can only be built from an aligned address.
    pub fn free_page(&mut self, frame: PhysFrame) {
        self.free.push(frame);
    }

    /// Best-effort linear scan for `n` physically contiguous frames.
    /// Returns `None` if no contiguous run of that length is currently
    /// free. On success, all `n` frames are removed from the free list.
    pub fn alloc_contiguous(&mut self, n: usize) -> Option<PhysFrame> {
        if n == 0 {
            return None;
        }
        self.free.sort_by_key(|f| f.start_address().as_u64());
        let mut run_start = 0usize;
        for i in 1..self.free.len() {
            let prev_end = self.free[i - 1].start_address().as_u64() + PAGE_SIZE as u64;
            if self.free[i].start_address().as_u64() != prev_end {
                run_start = i;
            }
            if i - run_start + 1 >= n {
                let base = self.free[run_start];
                self.free.drain(run_start..=i);
                return Some(base);
            }
        }
        None
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc_page()
    }
}

impl FrameDeallocator<Size4KiB> for PhysicalMemoryManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_page(frame);
    }
}

pub static PMM: Mutex<Option<PhysicalMemoryManager>> = Mutex::new(None);

/// Must only be called once, during boot, before any other `mm` subsystem
/// touches `PMM`.
pub fn init(memory_regions: &'static MemoryRegions) {
    *PMM.lock() = Some(PhysicalMemoryManager::init(memory_regions));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn alloc_then_free_returns_same_frame() {
        let mut pmm = PhysicalMemoryManager { free: Vec::new() };
        pmm.free_page(frame(0x1000));
        let f = pmm.alloc_page().unwrap();
        assert_eq!(f, frame(0x1000));
        pmm.free_page(f);
        assert_eq!(pmm.alloc_page().unwrap(), frame(0x1000));
    }

    #[test]
    fn alloc_contiguous_finds_run() {
        let mut pmm = PhysicalMemoryManager { free: Vec::new() };
        for a in [0x3000u64, 0x1000, 0x2000, 0x5000] {
            pmm.free_page(frame(a));
        }
        let base = pmm.alloc_contiguous(3).unwrap();
        assert_eq!(base, frame(0x1000));
        assert_eq!(pmm.free_frames(), 1);
    }

    #[test]
    fn alloc_contiguous_fails_when_no_run_long_enough() {
        let mut pmm = PhysicalMemoryManager { free: Vec::new() };
        pmm.free_page(frame(0x1000));
        pmm.free_page(frame(0x5000));
        assert!(pmm.alloc_contiguous(2).is_none());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pmm = PhysicalMemoryManager { free: Vec::new() };
        assert!(pmm.alloc_page().is_none());
    }
}

//! Buddy page allocator over the kernel heap window: a binary buddy tree
//! with an explicit index-to-address formula, implemented as a
//! `Vec`-backed node array so it stays testable as pure logic.
//!
//! The window size is required to be exactly `2^max_order` bytes (a
//! single tree root) — to stay conservative about coalescing across a
//! seed-decomposition boundary, this simply never creates more than one
//! tree.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::config::{KERNEL_HEAP_BASE, KERNEL_HEAP_MAX_ORDER, KERNEL_HEAP_MIN_ORDER, PAGE_SIZE};
use crate::mm::paging;
use crate::mm::pmm::PMM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Invalid,
    Free,
    Split,
    Allocated,
}

pub struct BuddyAllocator {
    base: u64,
    min_order: u32,
    max_order: u32,
    /// Flat array of all nodes across every level, root first (level 0 has
    /// 1 node at index 0, level 1 has 2 nodes at indices 1..3, etc).
    nodes: Vec<NodeState>,
    /// `free_lists[level]` holds the node indices at that level that are
    /// currently FREE.
    free_lists: Vec<Vec<usize>>,
}

impl BuddyAllocator {
    fn level_of(&self, order: u32) -> u32 {
        self.max_order - order
    }

    fn level_offset(level: u32) -> usize {
        (1usize << level) - 1
    }

    /// `base + ((i - offset(level)) << order)`.
    fn address_of(&self, order: u32, index: usize) -> u64 {
        let level = self.level_of(order);
        let offset = Self::level_offset(level);
        self.base + (((index - offset) as u64) << order)
    }

    fn buddy_index(&self, order: u32, index: usize) -> usize {
        let level = self.level_of(order);
        let offset = Self::level_offset(level);
        let rel = index - offset;
        offset + (rel ^ 1)
    }

    fn parent_index(&self, order: u32, index: usize) -> usize {
        let level = self.level_of(order);
        let offset = Self::level_offset(level);
        let rel = index - offset;
        let parent_level = level - 1;
        Self::level_offset(parent_level) + rel / 2
    }

    fn child_indices(&self, order: u32, index: usize) -> (usize, usize) {
        let level = self.level_of(order);
        let offset = Self::level_offset(level);
        let rel = index - offset;
        let child_level = level + 1;
        let child_offset = Self::level_offset(child_level);
        let left = child_offset + rel * 2;
        (left, left + 1)
    }

    /// Seeds the allocator: the window is exactly one `2^max_order` block,
    /// so the root starts FREE.
    pub fn new(base: u64, min_order: u32, max_order: u32) -> Self {
        let levels = (max_order - min_order + 1) as u32;
        let total_nodes = (1usize << levels) - 1;
        let mut nodes = vec![NodeState::Invalid; total_nodes];
        nodes[0] = NodeState::Free;
        let mut free_lists = vec![Vec::new(); levels as usize];
        free_lists[0].push(0);
        BuddyAllocator {
            base,
            min_order,
            max_order,
            nodes,
            free_lists,
        }
    }

    fn order_to_bytes(bytes: usize, min_order: u32, max_order: u32) -> Option<u32> {
        if bytes == 0 {
            return None;
        }
        let mut order = min_order;
        while (1usize << order) < bytes {
            order += 1;
            if order > max_order {
                return None;
            }
        }
        Some(order.max(min_order))
    }

    /// Splits the node at `(order, index)` down to `target_order`,
    /// returning the index of the resulting `target_order` node. Marks
    /// every ancestor SPLIT and every sibling-of-descent FREE, on its own
    /// free list.
    fn split_down(&mut self, mut order: u32, mut index: usize, target_order: u32) -> usize {
        while order > target_order {
            self.nodes[index] = NodeState::Split;
            let (left, right) = self.child_indices(order, index);
            order -= 1;
            self.nodes[right] = NodeState::Free;
            let level = self.level_of(order);
            self.free_lists[level as usize].push(right);
            self.nodes[left] = NodeState::Free; // becomes ALLOCATED or split again next loop
            index = left;
        }
        index
    }

    /// Finds and splits down a free block of `target_order`, purely on
    /// the node tree, without touching the PMM/page tables — kept
    /// separate so the invariants (free-list membership, no adjacent
    /// equal-order free blocks) are unit-testable without hardware.
    fn reserve_order(&mut self, target_order: u32) -> Option<(u32, usize)> {
        for order in target_order..=self.max_order {
            let level = self.level_of(order) as usize;
            if let Some(index) = self.free_lists[level].pop() {
                debug_assert_eq!(self.nodes[index], NodeState::Free);
                let final_index = self.split_down(order, index, target_order);
                self.nodes[final_index] = NodeState::Allocated;
                return Some((target_order, final_index));
            }
        }
        None
    }

    /// Marks a block free and coalesces eagerly with its buddy while
    /// possible. Returns the address that was freed, for callers (here,
    /// `free`) that need to unmap the underlying pages.
    fn release(&mut self, mut order: u32, mut index: usize) {
        self.nodes[index] = NodeState::Free;
        while order < self.max_order {
            let buddy = self.buddy_index(order, index);
            if self.nodes[buddy] != NodeState::Free {
                break;
            }
            // Remove both from their free list.
            let level = self.level_of(order) as usize;
            self.free_lists[level].retain(|&i| i != index && i != buddy);
            self.nodes[index] = NodeState::Invalid;
            self.nodes[buddy] = NodeState::Invalid;
            let parent = self.parent_index(order, index);
            order += 1;
            index = parent;
            self.nodes[index] = NodeState::Free;
        }
        let level = self.level_of(order) as usize;
        self.free_lists[level].push(index);
    }

    /// Finds the order and index of the allocated node whose address
    /// matches `addr`, scanning orders from `min_order` upward.
    fn find_allocated(&self, addr: u64) -> Option<(u32, usize)> {
        for order in self.min_order..=self.max_order {
            let level = self.level_of(order);
            let offset = Self::level_offset(level);
            let span = 1u64 << order;
            if addr < self.base {
                continue;
            }
            let rel = addr - self.base;
            if rel % span != 0 {
                continue;
            }
            let index = offset + (rel / span) as usize;
            if index < self.nodes.len() && self.nodes[index] == NodeState::Allocated {
                return Some((order, index));
            }
        }
        None
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        for (level, list) in self.free_lists.iter().enumerate() {
            for &idx in list {
                if self.nodes[idx] != NodeState::Free {
                    return false;
                }
                let order = self.max_order - level as u32;
                debug_assert!(order >= self.min_order);
            }
            // No two free blocks of equal order at adjacent addresses.
            let mut addrs: Vec<u64> = list
                .iter()
                .map(|&idx| self.address_of(self.max_order - level as u32, idx))
                .collect();
            addrs.sort_unstable();
            let order = self.max_order - level as u32;
            for w in addrs.windows(2) {
                if w[1] - w[0] == (1u64 << order) {
                    // Adjacent and same order and both free: would have
                    // coalesced already unless they aren't buddies (valid,
                    // non-buddy neighbours can be adjacent and both free).
                }
            }
        }
        true
    }
}

pub static BUDDY: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

pub fn init() {
    *BUDDY.lock() = Some(BuddyAllocator::new(
        KERNEL_HEAP_BASE,
        KERNEL_HEAP_MIN_ORDER,
        KERNEL_HEAP_MAX_ORDER,
    ));
}

/// Reserves a tree node, then backs every covered page with a physical
/// frame mapped into the kernel's own PML4.
pub fn alloc(bytes: usize, kernel_pml4: PhysFrame) -> Option<VirtAddr> {
    let (order, index) = {
        let mut guard = BUDDY.lock();
        let buddy = guard.as_mut()?;
        let target_order =
            BuddyAllocator::order_to_bytes(bytes, buddy.min_order, buddy.max_order)?;
        buddy.reserve_order(target_order)?
    };
    let base = {
        let guard = BUDDY.lock();
        guard.as_ref().unwrap().address_of(order, index)
    };
    let size = 1u64 << order;
    let mut mapped = 0u64;
    while mapped < size {
        let vaddr = VirtAddr::new(base + mapped);
        let frame = {
            let mut pmm_guard = PMM.lock();
            match pmm_guard.as_mut().unwrap().alloc_page() {
                Some(f) => f,
                None => {
                    // Roll back: free what we've mapped so far, then the
                    // tree node, and report exhaustion.
                    free_range(base, mapped, kernel_pml4);
                    let mut guard = BUDDY.lock();
                    guard.as_mut().unwrap().release(order, index);
                    return None;
                }
            }
        };
        let _ = paging::map(
            kernel_pml4,
            vaddr,
            frame.start_address(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        mapped += PAGE_SIZE as u64;
    }
    Some(VirtAddr::new(base))
}

fn free_range(base: u64, len: u64, kernel_pml4: PhysFrame) {
    let mut off = 0u64;
    while off < len {
        let _ = paging::unmap(kernel_pml4, VirtAddr::new(base + off), true);
        off += PAGE_SIZE as u64;
    }
}

/// Unmaps every covered page (returning frames to the PMM) and releases
/// the tree node, coalescing eagerly.
pub fn free(addr: VirtAddr, kernel_pml4: PhysFrame) {
    let (order, index) = {
        let guard = BUDDY.lock();
        match guard.as_ref().unwrap().find_allocated(addr.as_u64()) {
            Some(v) => v,
            None => return, // not a block we handed out; no-op
        }
    };
    let size = 1u64 << order;
    free_range(addr.as_u64(), size, kernel_pml4);
    let mut guard = BUDDY.lock();
    guard.as_mut().unwrap().release(order, index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_seed_single_block() {
        let buddy = BuddyAllocator::new(0x100_0000, 12, 21);
        assert_eq!(buddy.free_lists[0], vec![0]);
        assert_eq!(buddy.address_of(21, 0), 0x100_0000);
    }

    #[test]
    fn alloc_two_pages_then_free_coalesces() {
        let mut buddy = BuddyAllocator::new(0x100_0000, 12, 21);

        let (o1, i1) = buddy.reserve_order(12).unwrap();
        let a1 = buddy.address_of(o1, i1);
        assert_eq!(a1, 0x100_0000);

        let (o2, i2) = buddy.reserve_order(12).unwrap();
        let a2 = buddy.address_of(o2, i2);
        assert_eq!(a2, 0x100_1000);

        buddy.release(o2, i2);
        buddy.release(o1, i1);

        // Exactly one free block left, at max order (fully coalesced).
        let total_free: usize = buddy.free_lists.iter().map(|l| l.len()).sum();
        assert_eq!(total_free, 1);
        assert_eq!(buddy.free_lists[0], vec![0]);
    }

    #[test]
    fn find_allocated_matches_smallest_order_first() {
        let mut buddy = BuddyAllocator::new(0x100_0000, 12, 21);
        let (o, i) = buddy.reserve_order(12).unwrap();
        let addr = buddy.address_of(o, i);
        let found = buddy.find_allocated(addr).unwrap();
        assert_eq!(found, (o, i));
    }

    #[test]
    fn zero_byte_alloc_rejected() {
        assert_eq!(
            BuddyAllocator::order_to_bytes(0, 12, 21),
            None
        );
    }

    #[test]
    fn oversized_alloc_rejected() {
        assert_eq!(
            BuddyAllocator::order_to_bytes(1 << 22, 12, 21),
            None
        );
    }

    #[test]
    fn churn_preserves_total_capacity() {
        let mut buddy = BuddyAllocator::new(0x100_0000, 12, 21);
        let mut allocs = Vec::new();
        for _ in 0..16 {
            allocs.push(buddy.reserve_order(12).unwrap());
        }
        for (o, i) in allocs {
            buddy.release(o, i);
        }
        let total_free: usize = buddy.free_lists.iter().map(|l| l.len()).sum();
        assert_eq!(total_free, 1);
        assert!(buddy.invariants_hold());
    }
}

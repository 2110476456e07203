//! Compile-time tunables for every subsystem, gathered in one place
//! instead of scattered as magic numbers across modules.

/// Size of one physical/virtual page on x86_64.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Kernel heap window managed by the buddy allocator.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_8800_0000_0000;
/// `max_order` such that the window is `2^KERNEL_HEAP_MAX_ORDER` bytes.
pub const KERNEL_HEAP_MAX_ORDER: u32 = 30; // 1 GiB window
pub const KERNEL_HEAP_MIN_ORDER: u32 = PAGE_SHIFT; // 4 KiB smallest block
pub const KERNEL_HEAP_LIMIT: u64 = KERNEL_HEAP_BASE + (1u64 << KERNEL_HEAP_MAX_ORDER);

/// Bootstrap allocator used only until the buddy+slab stack is online.
pub const BOOTSTRAP_HEAP_SIZE: usize = 256 * 1024;

/// Kernel stack size handed to every task (pages).
pub const KERNEL_STACK_PAGES: usize = 8;

/// Fixed-size per-task open-file table.
pub const MAX_FDS_PER_TASK: usize = 64;

/// User stack: fixed high virtual address and size.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
pub const USER_STACK_PAGES: usize = 16;

/// Dentry/inode hash table sizing, expressed as a bit count.
pub const DENTRY_HASH_BITS: u32 = 10;
pub const INODE_HASH_BITS: u32 = 10;
pub const DENTRY_HASH_BUCKETS: usize = 1 << DENTRY_HASH_BITS;
pub const INODE_HASH_BUCKETS: usize = 1 << INODE_HASH_BITS;

/// Scheduler timer-tick period, in milliseconds (round-robin quantum).
pub const SCHED_TICK_MS: u64 = 1;

/// Software interrupt vector reserved for voluntary yield.
pub const YIELD_VECTOR: u8 = 0x50;

/// Local APIC timer vector and divisor used by `kernel::arch::apic`.
pub const TIMER_VECTOR: u8 = 0x31;
pub const SPURIOUS_VECTOR: u8 = 0xff;

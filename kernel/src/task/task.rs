//! Task struct and lifecycle states: a callee-saved register context, a
//! `Vec`-backed kernel stack, an explicit state machine, preemption
//! counting, parent/child links, and a per-task open-file table.
//!
//! Task structs themselves (the `ArcInner<Mutex<Task>>` allocation
//! `TaskRef` wraps) come from a dedicated `mm::slab` cache via
//! `TaskAllocator`, not the global heap: spec-mandated so a reaped task
//! returns its slot to the slab rather than trickling through the
//! general-purpose allocator.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::fs::fd_table::FdTable;
use crate::mm::address_space::AddressSpace;
use crate::mm::slab::{self, SlabCache};
use crate::task::wait_queue::WaitQueue;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

static TASK_CACHE: Mutex<Option<SlabCache>> = Mutex::new(None);

/// `core::alloc::Allocator` backing every `TaskRef`/`TaskWeak` allocation
/// with a slab cache instead of the global heap. The cache is sized from
/// the first `Layout` it's asked to satisfy (the fixed `ArcInner<Mutex<Task>>`
/// layout never changes between calls) so it doesn't need to reach into
/// `Arc`'s private internals to precompute a size.
#[derive(Clone, Copy, Default)]
pub struct TaskAllocator;

fn task_cache_for(layout: Layout) -> Result<SlabCache, AllocError> {
    let mut guard = TASK_CACHE.lock();
    if let Some(cache) = guard.as_ref() {
        return Ok(cache.clone());
    }
    let cache = slab::cache_init("task", layout.size(), layout.align(), None, None).map_err(|_| AllocError)?;
    *guard = Some(cache.clone());
    Ok(cache)
}

unsafe impl Allocator for TaskAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let cache = task_cache_for(layout)?;
        let kernel_pml4 = crate::mm::paging::kernel_pml4();
        let ptr = slab::alloc(&cache, kernel_pml4).map_err(|_| AllocError)?;
        let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
        NonNull::new(slice).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let cache = TASK_CACHE
            .lock()
            .as_ref()
            .expect("TaskAllocator::deallocate called before any allocate")
            .clone();
        let kernel_pml4 = crate::mm::paging::kernel_pml4();
        slab::free(&cache, ptr.as_ptr(), kernel_pml4);
    }
}

/// Strong/weak task handles, slab-backed per `TaskAllocator`.
pub type TaskRef = Arc<Mutex<Task>, TaskAllocator>;
pub type TaskWeak = Weak<Mutex<Task>, TaskAllocator>;

pub fn new_task_ref(task: Task) -> TaskRef {
    Arc::new_in(Mutex::new(task), TaskAllocator)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initialised,
    Ready,
    Running,
    Blocked,
    Idle,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    None,
    Preparing,
    Sleeping,
    Woken,
}

/// Callee-saved register set, saved/restored by `scheduler::switch_to`
/// (System V AMD64 ABI: everything else is caller-saved and already on
/// the stack by the time we get here).
#[derive(Default, Clone, Debug)]
#[repr(C)]
pub struct Context {
    pub rflags: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }
}

pub struct Task {
    pub pid: u32,
    pub name: Option<String>,
    pub state: TaskState,
    pub ttype: TaskType,
    pub context: Context,
    pub kstack: Vec<u64>,
    pub address_space: Option<AddressSpace>,
    pub preempt_count: i32,
    pub sleep_ticks: u64,
    pub fd_table: FdTable,
    pub parent: Option<TaskWeak>,
    pub children: Vec<TaskRef>,
    pub exit_code: i32,
    /// `Arc`-wrapped so a waker can clone it out from behind a brief lock
    /// on the owning task and then call `wake_one`/`wake_all` without
    /// holding that task's own lock (which the waiter may itself need).
    pub parent_wq: Arc<WaitQueue>,
    pub wait_state: WaitState,
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name.as_deref().unwrap_or("<unnamed>"))
            .field("state", &self.state)
            .finish()
    }
}

impl Task {
    /// Builds a kernel task whose entry point runs the moment it is first
    /// switched to. The return address is placed at the top of a freshly
    /// allocated kernel stack.
    pub fn kernel_task(entry: unsafe extern "sysv64" fn(), name: Option<String>) -> Task {
        let mut kstack = vec![0u64; crate::config::KERNEL_STACK_PAGES * 512];
        *kstack.last_mut().unwrap() = entry as u64;
        let rsp = kstack.last_mut().unwrap() as *const u64 as u64;

        let mut context = Context::new();
        context.rsp = rsp;

        Task {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name,
            state: TaskState::Initialised,
            ttype: TaskType::Kernel,
            context,
            kstack,
            address_space: None,
            preempt_count: 0,
            sleep_ticks: 0,
            fd_table: FdTable::new(),
            parent: None,
            children: Vec::new(),
            exit_code: 0,
            parent_wq: Arc::new(WaitQueue::new()),
            wait_state: WaitState::None,
        }
    }

    /// Builds a user task with its own address space; its register frame
    /// is populated later by `exec::process::commit_exec`, not here.
    pub fn user_task(address_space: AddressSpace, name: Option<String>) -> Task {
        let kstack = vec![0u64; crate::config::KERNEL_STACK_PAGES * 512];
        Task {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name,
            state: TaskState::Initialised,
            ttype: TaskType::User,
            context: Context::new(),
            kstack,
            address_space: Some(address_space),
            preempt_count: 0,
            sleep_ticks: 0,
            fd_table: FdTable::new(),
            parent: None,
            children: Vec::new(),
            exit_code: 0,
            parent_wq: Arc::new(WaitQueue::new()),
            wait_state: WaitState::None,
        }
    }

    pub fn kstack_top(&self) -> u64 {
        self.kstack.last().map(|r| r as *const u64 as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "sysv64" fn dummy_entry() {}

    #[test]
    fn kernel_task_gets_increasing_pids() {
        let a = Task::kernel_task(dummy_entry, None);
        let b = Task::kernel_task(dummy_entry, None);
        assert!(b.pid > a.pid);
    }

    #[test]
    fn kernel_task_return_address_is_entry() {
        let t = Task::kernel_task(dummy_entry, None);
        assert_eq!(*t.kstack.last().unwrap(), dummy_entry as u64);
        assert_eq!(t.state, TaskState::Initialised);
    }
}

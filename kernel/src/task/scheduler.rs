//! Preemptive round-robin scheduler: ready/blocked/terminated lists,
//! sleep-tick countdown, preemption counting honoured by the timer tick,
//! and `task_end`/`waitpid` reaping. Single CPU only — no SMP.

use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::task::task::{self, Context, Task, TaskRef, TaskState};

static READY: OnceCell<Mutex<VecDeque<TaskRef>>> = OnceCell::uninit();
static BLOCKED: OnceCell<Mutex<Vec<TaskRef>>> = OnceCell::uninit();
static TERMINATED: OnceCell<Mutex<Vec<TaskRef>>> = OnceCell::uninit();

/// Set by the timer tick when the running task has used its quantum;
/// honoured by the interrupt-return path only when `preempt_count == 0`.
static NEED_RESCHEDULE: AtomicBool = AtomicBool::new(false);

struct SchedState {
    current: Option<TaskRef>,
    next: Option<TaskRef>,
    idle: Option<TaskRef>,
}

/// Single-CPU scheduler state, wrapped in an
/// `UnsafeCell` behind a lock-free `Send+Sync` shim since only the owning
/// CPU ever touches it and access is always from a context where
/// interrupts are either disabled or re-entrant-safe by construction.
struct SchedCell(UnsafeCell<SchedState>);
unsafe impl Send for SchedCell {}
unsafe impl Sync for SchedCell {}

static STATE: SchedCell = SchedCell(UnsafeCell::new(SchedState {
    current: None,
    next: None,
    idle: None,
}));

fn state() -> &'static mut SchedState {
    unsafe { &mut *STATE.0.get() }
}

unsafe extern "sysv64" fn idle_loop() {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

pub fn init() {
    READY
        .try_init_once(|| Mutex::new(VecDeque::new()))
        .expect("scheduler::init called twice");
    BLOCKED
        .try_init_once(|| Mutex::new(Vec::new()))
        .expect("scheduler::init called twice");
    TERMINATED
        .try_init_once(|| Mutex::new(Vec::new()))
        .expect("scheduler::init called twice");
    state().idle = Some(task::new_task_ref(Task::kernel_task(idle_loop, Some(alloc::string::String::from("idle")))));
}

fn ready_list() -> &'static Mutex<VecDeque<TaskRef>> {
    READY.get().expect("scheduler::init not called")
}

fn blocked_list() -> &'static Mutex<Vec<TaskRef>> {
    BLOCKED.get().expect("scheduler::init not called")
}

fn terminated_list() -> &'static Mutex<Vec<TaskRef>> {
    TERMINATED.get().expect("scheduler::init not called")
}

/// `initialised -> ready`: adds a new task to the ready list.
pub fn kthread_run(task: TaskRef) {
    task.lock().state = TaskState::Ready;
    ready_list().lock().push_back(task);
}

pub fn enqueue_ready(task: TaskRef) {
    task.lock().state = TaskState::Ready;
    ready_list().lock().push_back(task);
}

pub fn current() -> Option<TaskRef> {
    state().current.clone()
}

/// `disable_preemption`/`enable_preemption` bracket sections that must run
/// atomically w.r.t. the scheduler. Panics on underflow, since that can
/// only mean mismatched enable/disable calls.
pub fn disable_preemption() {
    if let Some(task) = state().current.as_ref() {
        task.lock().preempt_count += 1;
    }
}

pub fn enable_preemption() {
    if let Some(task) = state().current.as_ref() {
        let mut t = task.lock();
        t.preempt_count -= 1;
        if t.preempt_count < 0 {
            panic!("preempt_count underflow on task {}", t.pid);
        }
    }
}

fn preempt_count() -> i32 {
    state()
        .current
        .as_ref()
        .map(|t| t.lock().preempt_count)
        .unwrap_or(0)
}

/// Called from the timer tick: decrements `sleep_ticks` for every blocked
/// task with a pending timeout, waking those that reach zero, and flags a
/// reschedule request.
pub fn on_timer_tick() {
    {
        let mut blocked = blocked_list().lock();
        let mut i = 0;
        while i < blocked.len() {
            let wake = {
                let mut t = blocked[i].lock();
                if t.sleep_ticks > 0 {
                    t.sleep_ticks -= 1;
                }
                t.sleep_ticks == 0 && t.state == TaskState::Blocked
            };
            if wake {
                let task = blocked.swap_remove(i);
                task.lock().state = TaskState::Ready;
                ready_list().lock().push_back(task);
            } else {
                i += 1;
            }
        }
    }
    NEED_RESCHEDULE.store(true, Ordering::SeqCst);
}

/// Called from the common interrupt-return path. Only actually
/// reschedules if preemption is currently enabled.
pub fn maybe_reschedule() {
    if preempt_count() != 0 {
        return;
    }
    if NEED_RESCHEDULE.swap(false, Ordering::SeqCst) {
        yield_and_continue();
    }
}

/// Pick-next: single-queue round robin. Falls back to idle when the
/// ready list is empty.
fn pick_next() -> TaskRef {
    ready_list()
        .lock()
        .pop_front()
        .unwrap_or_else(|| state().idle.clone().expect("scheduler::init not called"))
}

/// Voluntary yield that keeps the current task runnable (re-enqueues it
/// before switching).
pub fn yield_and_continue() {
    if let Some(task) = state().current.clone() {
        if task.lock().state == TaskState::Running {
            enqueue_ready(task);
        }
    }
    yield_execution();
}

/// Used by `WaitQueue::commit_sleep`: the task has already been marked
/// `Blocked` and moved onto the blocked list by the caller; this just
/// switches away from it without re-enqueuing.
pub fn block_current_and_yield() {
    if let Some(task) = state().current.clone() {
        blocked_list().lock().push(task);
    }
    yield_execution();
}

/// Runs the scheduler: picks the next task and switches the CPU to it.
/// Does nothing if the next task is the same as the current one (a
/// self-switch would deadlock on the context's own lock).
pub fn yield_execution() {
    x86_64::instructions::interrupts::disable();

    let next_task = pick_next();
    let current_task = state().current.clone();

    let prev: *mut Context = match &current_task {
        None => {
            let mut dummy = Context::new();
            &mut dummy as *mut Context
        }
        Some(task) => {
            if Arc::ptr_eq(task, &next_task) {
                return;
            }
            &mut task.lock().context as *mut Context
        }
    };

    let next_context = next_task.lock().context.clone();
    next_task.lock().state = TaskState::Running;
    state().next = Some(next_task);

    unsafe {
        switch_to(&mut *prev, &next_context);
    }
}

/// Releases the lock on the outgoing task (held across the asm switch via
/// a raw context pointer) and installs the new current task.
unsafe extern "sysv64" fn switch_finish_hook() {
    let s = state();
    if let Some(task) = s.current.as_ref() {
        unsafe { task.force_unlock() };
    }
    s.current = s.next.take();
    if let Some(task) = s.current.as_ref() {
        crate::cpu::set_kernel_stack(VirtAddr::new(task.lock().kstack_top()));
    }
}

/// Saves the outgoing callee-saved registers and RFLAGS, loads the
/// incoming ones, then hands off to `switch_finish_hook` to release locks
/// (the asm itself never returns to its caller on the old task).
#[unsafe(naked)]
unsafe extern "sysv64" fn switch_to(_prev: &mut Context, _next: &Context) {
    core::arch::naked_asm!(
        concat!("
            mov [rdi + {off_rbx}], rbx
            mov rbx, [rsi + {off_rbx}]

            mov [rdi + {off_r12}], r12
            mov r12, [rsi + {off_r12}]

            mov [rdi + {off_r13}], r13
            mov r13, [rsi + {off_r13}]

            mov [rdi + {off_r14}], r14
            mov r14, [rsi + {off_r14}]

            mov [rdi + {off_r15}], r15
            mov r15, [rsi + {off_r15}]

            mov [rdi + {off_rbp}], rbp
            mov rbp, [rsi + {off_rbp}]

            mov [rdi + {off_rsp}], rsp
            mov rsp, [rsi + {off_rsp}]

            pushfq
            pop QWORD PTR [rdi + {off_rflags}]

            push QWORD PTR [rsi + {off_rflags}]
            popfq

            jmp {switch_hook}
            "),
        off_rflags = const(offset_of!(Context, rflags)),
        off_rbx = const(offset_of!(Context, rbx)),
        off_r12 = const(offset_of!(Context, r12)),
        off_r13 = const(offset_of!(Context, r13)),
        off_r14 = const(offset_of!(Context, r14)),
        off_r15 = const(offset_of!(Context, r15)),
        off_rbp = const(offset_of!(Context, rbp)),
        off_rsp = const(offset_of!(Context, rsp)),
        switch_hook = sym switch_finish_hook,
    );
}

/// `task_end(status)`: destroys the address space, closes all FDs, moves
/// the task to the terminated list, wakes the parent's wait-queue, and
/// never returns (the caller is expected to be the task itself, about to
/// yield away forever).
pub fn task_end(task: &TaskRef, status: i32, kernel_pml4: x86_64::structures::paging::PhysFrame) -> ! {
    {
        let mut t = task.lock();
        t.exit_code = status;
        t.state = TaskState::Terminated;
        if let Some(vas) = t.address_space.take() {
            vas.destroy(kernel_pml4);
        }
        t.fd_table.close_all();
    }
    terminated_list().lock().push(task.clone());
    if let Some(parent) = task.lock().parent.as_ref().and_then(|w| w.upgrade()) {
        let wq = parent.lock().parent_wq.clone();
        wq.wake_one();
    }
    loop {
        yield_execution();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    NoChildren,
}

/// `waitpid(pid, opts)`: reaps a terminated child matching `pid` (`-1` =
/// any), freeing its kernel stack and task structure. Blocks (retrying)
/// until a match appears if none is ready yet.
pub fn waitpid(parent: &TaskRef, pid: i64) -> Result<(u32, i32), WaitError> {
    loop {
        if parent.lock().children.is_empty() {
            return Err(WaitError::NoChildren);
        }

        disable_preemption();
        let found = {
            let mut p = parent.lock();
            let pos = p.children.iter().position(|c| {
                let c = c.lock();
                c.state == TaskState::Terminated && (pid == -1 || c.pid as i64 == pid)
            });
            pos.map(|i| p.children.remove(i))
        };
        enable_preemption();

        if let Some(child) = found {
            let (cpid, code) = {
                let c = child.lock();
                (c.pid, c.exit_code)
            };
            terminated_list().lock().retain(|t| !Arc::ptr_eq(t, &child));
            return Ok((cpid, code));
        }

        let wq = parent.lock().parent_wq.clone();
        wq.prepare_wait(parent);
        wq.commit_sleep(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_count_tracking_without_current_task_is_a_no_op() {
        // No current task installed: disable/enable must not panic.
        disable_preemption();
        enable_preemption();
    }
}

//! Race-free wait-queue protocol: a FIFO of waiters with a
//! prepare/commit/cancel/wake protocol so a wakeup between the condition
//! check and the sleep is never lost.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::task::scheduler;
use crate::task::task::{self, TaskRef, WaitState};

pub struct WaitQueue {
    waiters: Mutex<VecDeque<TaskRef>>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Step 1: publish intent to wait. Must be called before the caller
    /// re-checks the condition it's waiting on, so a concurrent waker
    /// cannot slip a wakeup in unseen.
    pub fn prepare_wait(&self, task: &TaskRef) {
        let mut waiters = self.waiters.lock();
        task.lock().wait_state = WaitState::Preparing;
        waiters.push_back(task.clone());
    }

    /// Step 3: having rechecked the condition and found it still
    /// unsatisfied, commit to sleeping. If a waker already fired while we
    /// were `Preparing`, we observe `Woken` here and return immediately
    /// without blocking — this is the race the protocol exists to close.
    pub fn commit_sleep(&self, task: &TaskRef) {
        {
            let _waiters = self.waiters.lock();
            let mut t = task.lock();
            if t.wait_state == WaitState::Woken {
                t.wait_state = WaitState::None;
                return;
            }
            t.wait_state = WaitState::Sleeping;
            t.state = crate::task::task::TaskState::Blocked;
        }
        scheduler::block_current_and_yield();
    }

    /// Unlinks `task` from the waiters list without blocking (used when a
    /// caller decides not to wait after all, e.g. the condition was
    /// already true at `prepare_wait` time).
    pub fn cancel_wait(&self, task: &TaskRef) {
        let mut waiters = self.waiters.lock();
        waiters.retain(|t| !Arc::ptr_eq(t, task));
        task.lock().wait_state = WaitState::None;
    }

    /// Wakes the head of the queue. A `Preparing` waiter is marked
    /// `Woken` so its own `commit_sleep` short-circuits; a `Sleeping`
    /// waiter is moved back onto the ready list immediately.
    pub fn wake_one(&self) {
        let mut waiters = self.waiters.lock();
        if let Some(task) = waiters.pop_front() {
            Self::wake_task(&task);
        }
    }

    pub fn wake_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(task) = waiters.pop_front() {
            Self::wake_task(&task);
        }
    }

    fn wake_task(task: &TaskRef) {
        let mut t = task.lock();
        match t.wait_state {
            WaitState::Preparing => {
                t.wait_state = WaitState::Woken;
            }
            WaitState::Sleeping => {
                t.wait_state = WaitState::None;
                t.state = crate::task::task::TaskState::Ready;
                drop(t);
                scheduler::enqueue_ready(task.clone());
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn make_task() -> TaskRef {
        unsafe extern "sysv64" fn entry() {}
        task::new_task_ref(crate::task::task::Task::kernel_task(entry, Some("t".to_string())))
    }

    #[test]
    fn prepare_then_wake_marks_woken_without_scheduler() {
        let wq = WaitQueue::new();
        let task = make_task();
        wq.prepare_wait(&task);
        wq.wake_one();
        assert_eq!(task.lock().wait_state, WaitState::Woken);
    }

    #[test]
    fn cancel_wait_clears_state_and_removes_from_queue() {
        let wq = WaitQueue::new();
        let task = make_task();
        wq.prepare_wait(&task);
        wq.cancel_wait(&task);
        assert_eq!(task.lock().wait_state, WaitState::None);
        assert!(wq.waiters.lock().is_empty());
    }

    #[test]
    fn wake_one_on_empty_queue_is_a_no_op() {
        let wq = WaitQueue::new();
        wq.wake_one();
        wq.wake_all();
    }
}

//! Deferred-work queue: one kernel worker parked on a wait-queue, drained
//! by a persistent loop, draining a FIFO of `(fn, data)` items.

use alloc::collections::VecDeque;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::task::task::TaskRef;
use crate::task::wait_queue::WaitQueue;

type WorkFn = fn(usize);

struct WorkItem {
    func: WorkFn,
    data: usize,
}

struct WorkQueueState {
    items: VecDeque<WorkItem>,
}

static QUEUE: OnceCell<Mutex<WorkQueueState>> = OnceCell::uninit();
static WAIT: WaitQueue = WaitQueue::new();

fn queue() -> &'static Mutex<WorkQueueState> {
    QUEUE.get().expect("workqueue::init not called")
}

pub fn init() {
    QUEUE
        .try_init_once(|| Mutex::new(WorkQueueState { items: VecDeque::new() }))
        .expect("workqueue::init called twice");
}

/// Appends a deferred work item and wakes the worker if it's parked.
pub fn add_work_item(func: WorkFn, data: usize) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        queue().lock().items.push_back(WorkItem { func, data });
    });
    WAIT.wake_one();
}

/// The worker loop: take head; block if empty; else run it. Runs forever
/// as the body of the dedicated worker kernel task.
pub unsafe extern "sysv64" fn worker_loop() {
    loop {
        let item = x86_64::instructions::interrupts::without_interrupts(|| queue().lock().items.pop_front());
        match item {
            Some(item) => (item.func)(item.data),
            None => {
                let current = crate::task::scheduler::current();
                if let Some(task) = current {
                    park_until_work(&task);
                }
            }
        }
    }
}

fn park_until_work(task: &TaskRef) {
    WAIT.prepare_wait(task);
    let has_work = !queue().lock().items.is_empty();
    if has_work {
        WAIT.cancel_wait(task);
        return;
    }
    WAIT.commit_sleep(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn record(data: usize) {
        CALLS.fetch_add(data, Ordering::SeqCst);
    }

    #[test]
    fn add_work_item_enqueues_fifo() {
        let _ = QUEUE.try_init_once(|| Mutex::new(WorkQueueState { items: VecDeque::new() }));
        queue().lock().items.clear();
        add_work_item(record, 1);
        add_work_item(record, 2);
        let first = queue().lock().items.pop_front().unwrap();
        let second = queue().lock().items.pop_front().unwrap();
        assert_eq!(first.data, 1);
        assert_eq!(second.data, 2);
    }
}

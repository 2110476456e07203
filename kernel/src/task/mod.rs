//! Task lifecycle, scheduling, and synchronisation.

pub mod scheduler;
pub mod task;
pub mod wait_queue;
pub mod workqueue;

/// Brings up the scheduler and work queue, then spawns the dedicated
/// worker kernel task that drains it. Must run after `mm::init` (the idle
/// task needs a kernel stack) and before any task is created.
pub fn init() {
    scheduler::init();
    workqueue::init();

    let worker = task::new_task_ref(task::Task::kernel_task(
        workqueue::worker_loop,
        Some(alloc::string::String::from("kworker")),
    ));
    scheduler::kthread_run(worker);
}

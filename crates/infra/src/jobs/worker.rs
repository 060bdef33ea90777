//! Queue worker loops.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::engine::{Execution, JobEngine};
use super::queue::{FinishSignal, JobBlockingQueue, QueueEntry};

/// A running slot that is given back when dropped unless kept.
struct Slot<'a> {
    queue: &'a JobBlockingQueue,
    armed: bool,
}

impl<'a> Slot<'a> {
    fn acquire(queue: &'a JobBlockingQueue) -> Option<Self> {
        queue.acquire_slot().then_some(Self { queue, armed: true })
    }

    /// Hand the slot over to the in-flight job; completion frees it.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.free_slot();
        }
    }
}

/// Body of a queue worker thread. A panicking iteration is logged and the
/// loop restarts until the queue is stopped.
pub(crate) fn run_queue(engine: Arc<JobEngine>, queue: Arc<JobBlockingQueue>) {
    info!(queue = %queue.name(), ordered = queue.is_ordered(), "job queue worker started");
    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if queue.is_ordered() {
                ordered_loop(&engine, &queue);
            } else {
                unordered_loop(&engine, &queue);
            }
        }));
        match outcome {
            Ok(()) => break,
            Err(_) if queue.is_stopped() => break,
            Err(_) => error!(queue = %queue.name(), "job queue worker panicked; restarting"),
        }
    }
    info!(queue = %queue.name(), "job queue worker stopped");
}

/// One job at a time, in arrival order. The worker holds the job until it
/// is finished or its retries are exhausted.
fn ordered_loop(engine: &JobEngine, queue: &Arc<JobBlockingQueue>) {
    loop {
        let mut job = match queue.take() {
            QueueEntry::Job(job) => job,
            QueueEntry::Stop => return,
        };
        let Some(_slot) = Slot::acquire(queue) else {
            return;
        };

        loop {
            queue.prepare_for_finish();
            match engine.execute(&job, queue) {
                Execution::Dispatched => match queue.wait_for_finish() {
                    FinishSignal::Done => break,
                    FinishSignal::Reprocess { job: next, delay } => {
                        debug!(queue = %queue.name(), job_path = %next.path, retry_count = next.retry_count, "reprocessing job in ordered queue");
                        job = next;
                        if !queue.sleep(delay) {
                            return;
                        }
                    }
                    FinishSignal::Stopped => return,
                },
                Execution::Reschedule => {
                    queue.cancel_finish();
                    if !queue.sleep(engine.config.sleep_time) {
                        return;
                    }
                }
                Execution::Dropped => {
                    queue.cancel_finish();
                    break;
                }
            }
        }
    }
}

/// Parallel processing bounded by the queue's slot count. Used for the main
/// queue as well.
fn unordered_loop(engine: &JobEngine, queue: &Arc<JobBlockingQueue>) {
    loop {
        let job = match queue.take() {
            QueueEntry::Job(job) => job,
            QueueEntry::Stop => return,
        };
        let Some(slot) = Slot::acquire(queue) else {
            return;
        };

        match engine.execute(&job, queue) {
            Execution::Dispatched => slot.keep(),
            Execution::Reschedule => {
                drop(slot);
                queue.put_delayed(job, engine.config.sleep_time);
            }
            Execution::Dropped => {}
        }
    }
}

//! Blocking job queue shared by the main queue and every named queue.
//!
//! One mutex guards the whole queue state and one condition variable wakes
//! every waiter (taker, slot acquirer, ordered completion wait, back-off
//! sleep). The queue also tracks running jobs so that idle detection and the
//! parallel slot cap live in one place.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::types::JobRecord;

/// What a worker takes out of a queue.
#[derive(Debug)]
pub enum QueueEntry {
    Job(JobRecord),
    /// Shutdown sentinel: the worker exits.
    Stop,
}

/// Completion signal handed to an ordered queue worker.
#[derive(Debug)]
pub enum FinishSignal {
    /// The in-flight job is done; take the next one.
    Done,
    /// Run the job again after `delay`.
    Reprocess { job: JobRecord, delay: Duration },
    /// The queue is shutting down.
    Stopped,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    delayed: Vec<(Instant, JobRecord)>,
    running: usize,
    awaiting_finish: bool,
    finish: Option<FinishSignal>,
    wake_requested: bool,
    marked_for_cleanup: bool,
    stopped: bool,
}

impl QueueState {
    /// Move due delayed jobs to the tail of the pending queue; returns the
    /// earliest remaining due time.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        let mut due: Vec<(Instant, JobRecord)> = Vec::new();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                due.push(self.delayed.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(at, _)| *at);
        self.pending
            .extend(due.into_iter().map(|(_, job)| QueueEntry::Job(job)));
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn queued_jobs(&self) -> usize {
        self.pending
            .iter()
            .filter(|e| matches!(e, QueueEntry::Job(_)))
            .count()
            + self.delayed.len()
    }
}

/// Snapshot of a queue for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub name: String,
    pub ordered: bool,
    pub pending: usize,
    pub running: usize,
    pub max_running: usize,
    pub marked_for_cleanup: bool,
}

#[derive(Debug)]
pub struct JobBlockingQueue {
    name: String,
    ordered: bool,
    max_running: usize,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl JobBlockingQueue {
    pub fn new(name: impl Into<String>, ordered: bool, max_running: usize) -> Self {
        Self {
            name: name.into(),
            ordered,
            max_running: if ordered { 1 } else { max_running.max(1) },
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, QueueState>, timeout: Option<Duration>) -> MutexGuard<'a, QueueState> {
        match timeout {
            Some(t) => {
                self.changed
                    .wait_timeout(guard, t)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Append a job; clears a pending cleanup mark.
    pub fn put(&self, job: JobRecord) {
        let mut state = self.state();
        state.pending.push_back(QueueEntry::Job(job));
        state.marked_for_cleanup = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Append a job that becomes eligible after `delay`.
    pub fn put_delayed(&self, job: JobRecord, delay: Duration) {
        if delay.is_zero() {
            return self.put(job);
        }
        let mut state = self.state();
        state.delayed.push((Instant::now() + delay, job));
        state.marked_for_cleanup = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Block until an entry is available. A stopped queue only yields
    /// [`QueueEntry::Stop`]; jobs still queued stay in durable storage.
    pub fn take(&self) -> QueueEntry {
        let mut state = self.state();
        loop {
            if state.stopped {
                return QueueEntry::Stop;
            }
            let next_due = state.promote_due(Instant::now());
            if let Some(entry) = state.pending.pop_front() {
                return entry;
            }
            let timeout = next_due.map(|at| at.saturating_duration_since(Instant::now()));
            state = self.wait(state, timeout);
        }
    }

    /// Push the shutdown sentinel and wake every waiter.
    pub fn stop(&self) {
        let mut state = self.state();
        state.stopped = true;
        state.pending.push_back(QueueEntry::Stop);
        if state.awaiting_finish && state.finish.is_none() {
            state.finish = Some(FinishSignal::Stopped);
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// Block until a running slot is free and take it. `false` when the
    /// queue stopped while waiting.
    pub fn acquire_slot(&self) -> bool {
        let mut state = self.state();
        while state.running >= self.max_running && !state.stopped {
            state = self.wait(state, None);
        }
        if state.stopped {
            return false;
        }
        state.running += 1;
        true
    }

    pub fn free_slot(&self) {
        let mut state = self.state();
        state.running = state.running.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    /// Arm the completion wait of an ordered worker before dispatching.
    pub fn prepare_for_finish(&self) {
        let mut state = self.state();
        state.awaiting_finish = true;
        state.finish = None;
    }

    /// Disarm the completion wait when the job was never dispatched.
    pub fn cancel_finish(&self) {
        let mut state = self.state();
        state.awaiting_finish = false;
        state.finish = None;
    }

    /// Block an ordered worker until its in-flight job completed.
    pub fn wait_for_finish(&self) -> FinishSignal {
        let mut state = self.state();
        loop {
            if let Some(signal) = state.finish.take() {
                state.awaiting_finish = false;
                return signal;
            }
            if state.stopped {
                state.awaiting_finish = false;
                return FinishSignal::Stopped;
            }
            state = self.wait(state, None);
        }
    }

    /// A job dispatched from this queue completed.
    ///
    /// Ordered queues hand the outcome to the waiting worker; other queues
    /// free the slot and re-enqueue a job to reprocess after its delay.
    pub fn job_finished(&self, reprocess: Option<(JobRecord, Duration)>) {
        if self.ordered {
            let mut state = self.state();
            state.finish = Some(match reprocess {
                Some((job, delay)) => FinishSignal::Reprocess { job, delay },
                None => FinishSignal::Done,
            });
            drop(state);
            self.changed.notify_all();
        } else {
            self.free_slot();
            if let Some((job, delay)) = reprocess {
                self.put_delayed(job, delay);
            }
        }
    }

    /// Sleep up to `delay`. Returns `false` when the queue was stopped;
    /// [`wake`](Self::wake) cuts the sleep short.
    pub fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state();
        state.wake_requested = false;
        loop {
            if state.stopped {
                return false;
            }
            if state.wake_requested {
                state.wake_requested = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = self.wait(state, Some(deadline - now));
        }
    }

    /// Interrupt a back-off sleep and make delayed jobs eligible now.
    pub fn wake(&self) {
        let mut state = self.state();
        state.wake_requested = true;
        let delayed = std::mem::take(&mut state.delayed);
        state
            .pending
            .extend(delayed.into_iter().map(|(_, job)| QueueEntry::Job(job)));
        drop(state);
        self.changed.notify_all();
    }

    /// Queued jobs, delayed ones included.
    pub fn depth(&self) -> usize {
        self.state().queued_jobs()
    }

    pub fn running(&self) -> usize {
        self.state().running
    }

    /// Nothing queued, delayed, running or awaiting completion.
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.queued_jobs() == 0 && state.running == 0 && !state.awaiting_finish
    }

    /// First phase of idle cleanup: mark an idle queue. Returns whether the
    /// queue was already marked and is still idle, i.e. may be torn down.
    pub fn check_idle(&self) -> bool {
        let mut state = self.state();
        let idle = state.queued_jobs() == 0 && state.running == 0 && !state.awaiting_finish;
        if !idle {
            state.marked_for_cleanup = false;
            return false;
        }
        if state.marked_for_cleanup {
            return true;
        }
        state.marked_for_cleanup = true;
        false
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            name: self.name.clone(),
            ordered: self.ordered,
            pending: state.queued_jobs(),
            running: state.running,
            max_running: self.max_running,
            marked_for_cleanup: state.marked_for_cleanup,
        }
    }
}

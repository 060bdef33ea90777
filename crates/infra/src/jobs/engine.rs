//! Shared state of a running job handler and the dispatch protocol.
//!
//! A job moves through the engine as follows:
//!
//! ```text
//! submit ─→ store.put ─→ route ─→ queue ─→ execute ─→ dispatch
//!                                   ↑                   │
//!                                   │     acknowledge ←─┤
//!                                   └──── complete ←────┘
//! ```
//!
//! `execute` refreshes the record, passes the topic gate, claims the record
//! and hands it to the dispatcher. The executor then calls `acknowledge` and
//! finally `complete`. An entry stays in the in-flight map from dispatch to
//! completion, which makes a second completion of the same job a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use eventing_core::{ApplicationId, EventingError, EventingResult, JobPath};
use eventing_events::NotificationTopic;

use super::dispatch::JobDispatcher;
use super::gate::TopicGate;
use super::lock;
use super::notify::{NotificationSink, notification};
use super::queue::JobBlockingQueue;
use super::registry::QueueRegistry;
use super::request::JobRequest;
use super::store::JobStore;
use super::types::{JobHandle, JobRecord, JobState, Parallelism, PutOutcome, QueueOptions};
use super::worker;
use crate::config::JobHandlerConfig;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Execution {
    /// Claimed and handed to the executor.
    Dispatched,
    /// Not possible right now; try again later.
    Reschedule,
    /// Nothing to do: the job is gone, finished or owned elsewhere.
    Dropped,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) job: JobRecord,
    pub(crate) queue: Arc<JobBlockingQueue>,
    pub(crate) dispatched: Instant,
    /// Identifies the dispatch; callbacks carrying an older handle are ignored.
    pub(crate) dispatched_at: DateTime<Utc>,
    pub(crate) acknowledged: bool,
}

pub(crate) struct JobEngine {
    pub(crate) config: JobHandlerConfig,
    pub(crate) store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    notifier: Option<Arc<dyn NotificationSink>>,
    pub(crate) gate: TopicGate,
    pub(crate) registry: QueueRegistry,
    pub(crate) main_queue: Arc<JobBlockingQueue>,
    in_flight: Mutex<HashMap<JobPath, InFlight>>,
    pub(crate) started_at: DateTime<Utc>,
    running: AtomicBool,
}

impl JobEngine {
    pub(crate) fn new(
        config: JobHandlerConfig,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        notifier: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        let main_queue = Arc::new(JobBlockingQueue::new("main", false, config.max_parallel_jobs));
        Self {
            registry: QueueRegistry::new(config.max_job_queues),
            config,
            store,
            dispatcher,
            notifier,
            gate: TopicGate::new(),
            main_queue,
            in_flight: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn application_id(&self) -> ApplicationId {
        self.config.application_id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Persist and route a new job.
    ///
    /// A duplicate of an unfinished job is a no-op returning the existing
    /// path. When routing fails the freshly written record is removed again.
    pub(crate) fn submit(self: &Arc<Self>, request: JobRequest) -> EventingResult<JobPath> {
        if !self.is_running() {
            return Err(EventingError::Stopped);
        }
        let record = request.into_record(self.config.max_job_retries, self.application_id());
        let topic = record.topic.clone();

        match self.store.put(record.clone())? {
            PutOutcome::Existing(path) => {
                debug!(job_path = %path, topic = %topic, "job already pending; submission ignored");
                Ok(path)
            }
            PutOutcome::Inserted(path) => {
                if let Err(err) = self.route(record) {
                    warn!(job_path = %path, topic = %topic, error = %err, "failed to route job; removing record");
                    if let Err(del) = self.store.delete(&path) {
                        warn!(job_path = %path, error = %del, "failed to remove unroutable job");
                    }
                    return Err(err);
                }
                debug!(job_path = %path, topic = %topic, "job submitted");
                Ok(path)
            }
        }
    }

    /// Put a job on its queue: a named queue when it asks for one, the main
    /// queue otherwise. Run-local jobs of other applications are discarded.
    pub(crate) fn route(self: &Arc<Self>, job: JobRecord) -> EventingResult<()> {
        if !self.is_running() {
            return Err(EventingError::Stopped);
        }
        if !job.runnable_by(self.application_id()) {
            debug!(job_path = %job.path, topic = %job.topic, "discarding run-local job of another application");
            return Ok(());
        }

        match job.queue.clone() {
            None => {
                self.main_queue.put(job);
                Ok(())
            }
            Some(options) => {
                let slots = self.slots_for(&options, job.parallelism);
                let engine = Arc::clone(self);
                self.registry
                    .enqueue(&options, slots, job, move |queue| engine.spawn_queue_worker(queue))
            }
        }
    }

    /// Route a job read back from the store. When its named queue cannot be
    /// created the job runs on the main queue instead, so a persisted job is
    /// never left behind.
    pub(crate) fn route_recovered(self: &Arc<Self>, job: JobRecord) -> EventingResult<()> {
        let fallback = job.clone();
        match self.route(job) {
            Err(EventingError::QueueLimitExceeded { queue, limit }) => {
                warn!(
                    job_path = %fallback.path,
                    topic = %fallback.topic,
                    queue = %queue,
                    limit,
                    "job queue limit reached; running recovered job on the main queue"
                );
                self.main_queue.put(fallback);
                Ok(())
            }
            other => other,
        }
    }

    /// Parallel slots of a new unordered named queue.
    fn slots_for(&self, options: &QueueOptions, parallelism: Parallelism) -> usize {
        let slots = match (options.max_parallel, parallelism) {
            (Some(max), _) => max as usize,
            (None, Parallelism::Bounded(n)) => n as usize,
            (None, Parallelism::Exclusive) => 1,
            (None, Parallelism::Unbounded) => self.config.max_parallel_jobs,
        };
        slots.max(1)
    }

    pub(crate) fn spawn_queue_worker(
        self: Arc<Self>,
        queue: Arc<JobBlockingQueue>,
    ) -> EventingResult<JoinHandle<()>> {
        let name = format!("eventing-queue-{}", queue.name());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker::run_queue(self, queue))
            .map_err(|e| EventingError::spawn(name, &e))
    }

    /// One attempt to hand `job` to the executor.
    pub(crate) fn execute(&self, job: &JobRecord, queue: &Arc<JobBlockingQueue>) -> Execution {
        let job = match self.store.get(&job.path) {
            Ok(Some(current)) if !current.is_finished() => current,
            Ok(_) => {
                debug!(job_path = %job.path, topic = %job.topic, "job no longer pending; skipping");
                return Execution::Dropped;
            }
            Err(err) => {
                warn!(job_path = %job.path, topic = %job.topic, error = %err, "failed to refresh job; will retry");
                return Execution::Reschedule;
            }
        };

        if job.is_claimed() {
            debug!(job_path = %job.path, topic = %job.topic, "job claimed elsewhere; skipping");
            return Execution::Dropped;
        }

        if !self.gate.try_acquire(&job.topic, job.parallelism) {
            debug!(job_path = %job.path, topic = %job.topic, "topic at its parallel limit; rescheduling");
            return Execution::Reschedule;
        }

        match self.store.claim(&job.path, self.application_id()) {
            Ok(true) => {}
            Ok(false) => {
                self.gate.release(&job.topic, job.parallelism);
                debug!(job_path = %job.path, topic = %job.topic, "job claimed concurrently; skipping");
                return Execution::Dropped;
            }
            Err(err) => {
                self.gate.release(&job.topic, job.parallelism);
                warn!(job_path = %job.path, topic = %job.topic, error = %err, "failed to claim job; treating as owned elsewhere");
                return Execution::Dropped;
            }
        }

        let mut job = job;
        job.state = JobState::Claimed;
        job.claimed_by = Some(self.application_id());

        let handle = JobHandle::new(job.clone());
        lock(&self.in_flight).insert(
            job.path.clone(),
            InFlight {
                job,
                queue: queue.clone(),
                dispatched: Instant::now(),
                dispatched_at: handle.dispatched_at,
                acknowledged: false,
            },
        );

        let path = handle.job.path.clone();
        let topic = handle.job.topic.clone();
        let parallelism = handle.job.parallelism;
        let retry_count = handle.job.retry_count;
        match self.dispatcher.dispatch(handle) {
            Ok(()) => {
                debug!(job_path = %path, topic = %topic, retry_count, queue = %queue.name(), "job dispatched");
                Execution::Dispatched
            }
            Err(err) => {
                lock(&self.in_flight).remove(&path);
                self.gate.release(&topic, parallelism);
                if let Err(rel) = self.store.release(&path) {
                    warn!(job_path = %path, error = %rel, "failed to release claim after dispatch failure");
                }
                warn!(job_path = %path, topic = %topic, retry_count, error = %err, "failed to dispatch job; will retry");
                Execution::Reschedule
            }
        }
    }

    /// Executor confirmed receipt. `false` when the job is not in flight
    /// under this handle or was already acknowledged.
    pub(crate) fn acknowledge(&self, handle: &JobHandle) -> bool {
        let path = handle.path();
        let job = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(path) {
                Some(flight) if !flight.acknowledged && flight.dispatched_at == handle.dispatched_at => {
                    flight.acknowledged = true;
                    flight.job.state = JobState::AwaitingAck;
                    flight.job.updated_at = Utc::now();
                    flight.job.clone()
                }
                _ => return false,
            }
        };

        if let Err(err) = self.store.update(&job) {
            warn!(job_path = %path, error = %err, "failed to record acknowledgement");
        }
        self.notify(NotificationTopic::Started, &job);
        true
    }

    /// Executor finished the job.
    pub(crate) fn complete(&self, handle: &JobHandle, reschedule: bool) -> bool {
        let path = handle.path();
        match self.take_in_flight(path, |f| f.dispatched_at == handle.dispatched_at) {
            Some(flight) => self.finish_in_flight(flight, reschedule),
            None => {
                debug!(job_path = %path, "completion for a job that is not in flight; ignoring");
                false
            }
        }
    }

    /// Remove an in-flight entry if `accept` agrees.
    pub(crate) fn take_in_flight<F>(&self, path: &JobPath, accept: F) -> Option<InFlight>
    where
        F: FnOnce(&InFlight) -> bool,
    {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.get(path).is_some_and(accept) {
            return None;
        }
        in_flight.remove(path)
    }

    /// Unacknowledged entries dispatched longer than `wait_for_ack` ago.
    pub(crate) fn unacknowledged(&self) -> Vec<(JobPath, Instant)> {
        let wait_for_ack = self.config.wait_for_ack;
        lock(&self.in_flight)
            .iter()
            .filter(|(_, f)| !f.acknowledged && f.dispatched.elapsed() >= wait_for_ack)
            .map(|(path, f)| (path.clone(), f.dispatched))
            .collect()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Apply the completion rules to a job taken out of the in-flight map.
    ///
    /// Returns `true` when no reschedule was requested, otherwise whether the
    /// job was actually rescheduled.
    pub(crate) fn finish_in_flight(&self, flight: InFlight, reschedule: bool) -> bool {
        let InFlight { job: snapshot, queue, .. } = flight;
        self.gate.release(&snapshot.topic, snapshot.parallelism);

        let mut job = match self.store.get(&snapshot.path) {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(job_path = %snapshot.path, topic = %snapshot.topic, "job removed while running");
                queue.job_finished(None);
                return !reschedule;
            }
            Err(err) => {
                warn!(job_path = %snapshot.path, error = %err, "failed to refresh completed job; using dispatched copy");
                snapshot
            }
        };

        if reschedule {
            job.retry_count += 1;
            if job.retries.allows(job.retry_count) {
                job.state = JobState::Pending;
                job.claimed_by = None;
                job.updated_at = Utc::now();
                if let Err(err) = self.store.update(&job) {
                    warn!(job_path = %job.path, retry_count = job.retry_count, error = %err, "failed to persist retry");
                }
                info!(job_path = %job.path, topic = %job.topic, retry_count = job.retry_count, "job failed; rescheduling");
                self.notify(NotificationTopic::Failed, &job);
                let delay = job.retry_delay();
                queue.job_finished(Some((job, delay)));
                return true;
            }

            warn!(job_path = %job.path, topic = %job.topic, retry_count = job.retry_count, "job retries exhausted; cancelling");
            self.store_terminal(&job, JobState::Cancelled);
            self.notify(NotificationTopic::Cancelled, &job);
            queue.job_finished(None);
            return false;
        }

        debug!(job_path = %job.path, topic = %job.topic, retry_count = job.retry_count, "job finished");
        self.store_terminal(&job, JobState::Finished);
        self.notify(NotificationTopic::Finished, &job);
        queue.job_finished(None);
        true
    }

    /// Identified jobs are kept in a terminal state; anonymous jobs are
    /// deleted.
    fn store_terminal(&self, job: &JobRecord, state: JobState) {
        let result = if job.id.is_some() {
            self.store.mark_finished(&job.path, state)
        } else {
            self.store.delete(&job.path).map(|_| ())
        };
        if let Err(err) = result {
            warn!(job_path = %job.path, state = state.as_str(), error = %err, "failed to store job outcome");
        }
    }

    fn notify(&self, topic: NotificationTopic, job: &JobRecord) {
        if let Some(sink) = &self.notifier {
            sink.notify(notification(topic, job));
        }
    }

    /// Queued jobs across the main queue and every named queue.
    pub(crate) fn depth(&self) -> usize {
        self.main_queue.depth() + self.registry.depth()
    }

    /// Stop accepting work and stop every queue worker.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.main_queue.stop();
        self.registry.shutdown();
        info!(application = %self.application_id(), in_flight = self.in_flight_count(), "job engine stopped");
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("application_id", &self.config.application_id)
            .field("running", &self.is_running())
            .field("queues", &self.registry.len())
            .finish_non_exhaustive()
    }
}

//! Executor side of the dispatch protocol.
//!
//! A [`JobConsumer`] drains a dispatch subscription, acknowledges every job
//! it has a handler for, runs the handler on its own [`ThreadPool`] and
//! reports the outcome with `complete`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{debug, error, warn};

use eventing_core::EventingResult;
use eventing_events::Subscription;

use super::handler::JobEventHandler;
use super::types::{JobHandle, JobRecord, JobResult};
use crate::workers::{ShutdownSignal, ThreadPool, WorkerHandle};

/// Job handler function type.
pub type JobFn = Arc<dyn Fn(&JobRecord) -> JobResult + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callbacks an executor uses to report back to the engine.
pub trait JobCallbacks: Send + Sync {
    fn acknowledge(&self, job: &JobHandle) -> bool;
    fn complete(&self, job: &JobHandle, reschedule: bool) -> bool;
}

impl JobCallbacks for JobEventHandler {
    fn acknowledge(&self, job: &JobHandle) -> bool {
        JobEventHandler::acknowledge(self, job)
    }

    fn complete(&self, job: &JobHandle, reschedule: bool) -> bool {
        JobEventHandler::complete(self, job, reschedule)
    }
}

impl<T> JobCallbacks for Arc<T>
where
    T: JobCallbacks + ?Sized,
{
    fn acknowledge(&self, job: &JobHandle) -> bool {
        (**self).acknowledge(job)
    }

    fn complete(&self, job: &JobHandle, reschedule: bool) -> bool {
        (**self).complete(job, reschedule)
    }
}

/// Runs registered handlers for dispatched jobs.
#[derive(Default)]
pub struct JobConsumer {
    handlers: Vec<(String, JobFn)>,
}

impl JobConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic pattern: an exact topic, `prefix/*`
    /// or `*`. A later registration for the same pattern replaces the
    /// earlier one.
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobRecord) -> JobResult + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        self.handlers.retain(|(p, _)| *p != pattern);
        self.handlers.push((pattern, Arc::new(handler)));
    }

    /// The most specific handler for `job`: exact topic, then the longest
    /// matching prefix pattern, then `*`.
    pub fn handler_for(&self, job: &JobRecord) -> Option<JobFn> {
        let topic = &job.topic;
        if let Some((_, h)) = self.handlers.iter().find(|(p, _)| p == topic.as_str()) {
            return Some(h.clone());
        }
        self.handlers
            .iter()
            .filter(|(p, _)| p != "*" && topic.matches(p))
            .max_by_key(|(p, _)| p.len())
            .or_else(|| self.handlers.iter().find(|(p, _)| p == "*"))
            .map(|(_, h)| h.clone())
    }

    /// Drain `subscription` on a background thread, running handlers on a
    /// pool of `pool_size` threads.
    pub fn spawn(
        self,
        subscription: Subscription<JobHandle>,
        callbacks: Arc<dyn JobCallbacks>,
        pool_size: usize,
    ) -> EventingResult<WorkerHandle> {
        let pool = ThreadPool::new("eventing-consumer-pool", pool_size)?;
        WorkerHandle::spawn("eventing-consumer", move |shutdown| {
            self.run(subscription, callbacks, pool, shutdown)
        })
    }

    fn run(
        self,
        subscription: Subscription<JobHandle>,
        callbacks: Arc<dyn JobCallbacks>,
        pool: ThreadPool,
        shutdown: ShutdownSignal,
    ) {
        while !shutdown.is_requested() {
            match subscription.recv_timeout(POLL_INTERVAL) {
                Ok(handle) => self.accept(handle, &callbacks, &pool),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(pool = %pool.name(), "job consumer stopped");
    }

    fn accept(&self, handle: JobHandle, callbacks: &Arc<dyn JobCallbacks>, pool: &ThreadPool) {
        let Some(handler) = self.handler_for(&handle.job) else {
            debug!(job_path = %handle.path(), topic = %handle.topic(), "no handler for job topic");
            return;
        };
        if !callbacks.acknowledge(&handle) {
            debug!(job_path = %handle.path(), "job no longer in flight; skipping");
            return;
        }

        let callbacks = callbacks.clone();
        let submitted = pool.execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&handle.job)));
            let failed = match outcome {
                Ok(JobResult::Success) => false,
                Ok(JobResult::Failure(reason)) => {
                    warn!(
                        job_path = %handle.path(),
                        topic = %handle.topic(),
                        retry_count = handle.job.retry_count,
                        reason = %reason,
                        "job failed"
                    );
                    true
                }
                Err(_) => {
                    error!(job_path = %handle.path(), topic = %handle.topic(), "job handler panicked");
                    true
                }
            };
            callbacks.complete(&handle, failed);
        });
        if let Err(err) = submitted {
            error!(error = %err, "failed to hand job to the consumer pool");
        }
    }
}

impl std::fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<&str> = self.handlers.iter().map(|(p, _)| p.as_str()).collect();
        f.debug_struct("JobConsumer").field("patterns", &patterns).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::JobRequest;
    use eventing_core::{ApplicationId, Topic};

    fn record(topic: &str) -> JobRecord {
        JobRequest::new(Topic::new(topic).unwrap()).into_record(0, ApplicationId::new())
    }

    fn tagged(tag: &'static str) -> impl Fn(&JobRecord) -> JobResult + Send + Sync + 'static {
        move |_| JobResult::Failure(tag.to_string())
    }

    fn tag_of(consumer: &JobConsumer, topic: &str) -> Option<String> {
        consumer.handler_for(&record(topic)).map(|h| match h(&record(topic)) {
            JobResult::Failure(tag) => tag,
            JobResult::Success => String::new(),
        })
    }

    #[test]
    fn most_specific_handler_wins() {
        let mut consumer = JobConsumer::new();
        consumer.register_handler("*", tagged("any"));
        consumer.register_handler("mail/*", tagged("mail"));
        consumer.register_handler("mail/bulk/*", tagged("bulk"));
        consumer.register_handler("mail/send", tagged("send"));

        assert_eq!(tag_of(&consumer, "mail/send").as_deref(), Some("send"));
        assert_eq!(tag_of(&consumer, "mail/bulk/weekly").as_deref(), Some("bulk"));
        assert_eq!(tag_of(&consumer, "mail/receive").as_deref(), Some("mail"));
        assert_eq!(tag_of(&consumer, "reports/daily").as_deref(), Some("any"));
    }

    #[test]
    fn unmatched_topic_has_no_handler() {
        let mut consumer = JobConsumer::new();
        consumer.register_handler("mail/*", tagged("mail"));
        assert!(tag_of(&consumer, "reports/daily").is_none());
        // prefix patterns need a segment boundary
        assert!(tag_of(&consumer, "mailbox/x").is_none());
    }

    #[test]
    fn registering_again_replaces() {
        let mut consumer = JobConsumer::new();
        consumer.register_handler("t", tagged("first"));
        consumer.register_handler("t", tagged("second"));
        assert_eq!(tag_of(&consumer, "t").as_deref(), Some("second"));
    }
}

//! The job event handler: public entry point of the job engine.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use eventing_core::{ApplicationId, EventingError, EventingResult, JobPath, Topic};

use super::dispatch::JobDispatcher;
use super::engine::JobEngine;
use super::loader::run_loader;
use super::lock;
use super::notify::NotificationSink;
use super::queue::QueueStats;
use super::request::{JobEvent, JobRequest};
use super::store::JobStore;
use super::supervisor::{MaintenanceReport, run_maintenance};
use super::types::{JobHandle, JobQuery, JobRecord, PropertyFilter};
use crate::config::JobHandlerConfig;
use crate::workers::WorkerHandle;

/// Builder for a [`JobEventHandler`].
pub struct JobEventHandlerBuilder {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    notifier: Option<Arc<dyn NotificationSink>>,
    config: JobHandlerConfig,
    supervisor: bool,
    loader: bool,
}

impl JobEventHandlerBuilder {
    pub fn with_config(mut self, config: JobHandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    /// Do not start the periodic maintenance thread; the host calls
    /// [`JobEventHandler::run_maintenance`] itself.
    pub fn without_supervisor_thread(mut self) -> Self {
        self.supervisor = false;
        self
    }

    /// Do not reload unfinished jobs from the store on startup.
    pub fn without_loader(mut self) -> Self {
        self.loader = false;
        self
    }

    /// Start the writer, the main queue worker and the enabled background
    /// threads.
    pub fn start(self) -> EventingResult<JobEventHandler> {
        let engine = Arc::new(JobEngine::new(self.config, self.store, self.dispatcher, self.notifier));

        let main = engine.clone().spawn_queue_worker(engine.main_queue.clone())?;

        let (writer_tx, writer_rx) = mpsc::channel::<JobRequest>();
        let writer_engine = engine.clone();
        let writer = thread::Builder::new()
            .name("eventing-writer".to_string())
            .spawn(move || {
                while let Ok(request) = writer_rx.recv() {
                    let topic = request.topic.clone();
                    if let Err(err) = writer_engine.submit(request) {
                        warn!(topic = %topic, error = %err, "failed to persist job event");
                    }
                }
                debug!("job writer stopped");
            })
            .map_err(|e| EventingError::spawn("eventing-writer", &e))?;

        let mut threads = Threads {
            main: Some(main),
            writer: Some(writer),
            loader: None,
            supervisor: None,
        };

        if self.loader {
            let loader_engine = engine.clone();
            threads.loader = Some(WorkerHandle::spawn("eventing-loader", move |shutdown| {
                run_loader(loader_engine, shutdown)
            })?);
        }

        if self.supervisor {
            let supervisor_engine = engine.clone();
            let period = engine.config.scheduler_period;
            threads.supervisor = Some(WorkerHandle::periodic("eventing-supervisor", period, move || {
                run_maintenance(&supervisor_engine);
            })?);
        }

        info!(
            application = %engine.application_id(),
            max_parallel_jobs = engine.config.max_parallel_jobs,
            max_job_queues = engine.config.max_job_queues,
            "job event handler started"
        );

        Ok(JobEventHandler {
            engine,
            writer: Mutex::new(Some(writer_tx)),
            threads: Mutex::new(Some(threads)),
        })
    }
}

struct Threads {
    main: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    loader: Option<WorkerHandle>,
    supervisor: Option<WorkerHandle>,
}

/// Persistent, retrying job queue keyed by topic.
///
/// Jobs are written to the [`JobStore`] first and then routed to the main
/// queue or to the named queue they ask for. Claimed jobs go to the
/// [`JobDispatcher`]; the executor answers with [`acknowledge`](Self::acknowledge)
/// and [`complete`](Self::complete).
pub struct JobEventHandler {
    engine: Arc<JobEngine>,
    writer: Mutex<Option<Sender<JobRequest>>>,
    threads: Mutex<Option<Threads>>,
}

impl JobEventHandler {
    pub fn builder(store: Arc<dyn JobStore>, dispatcher: Arc<dyn JobDispatcher>) -> JobEventHandlerBuilder {
        JobEventHandlerBuilder {
            store,
            dispatcher,
            notifier: None,
            config: JobHandlerConfig::default(),
            supervisor: true,
            loader: true,
        }
    }

    pub fn application_id(&self) -> ApplicationId {
        self.engine.application_id()
    }

    pub fn config(&self) -> &JobHandlerConfig {
        &self.engine.config
    }

    /// Persist and queue a job. Returns the path of the stored record, or of
    /// the unfinished record that already exists for the same topic and id.
    pub fn submit(&self, request: JobRequest) -> EventingResult<JobPath> {
        self.engine.submit(request)
    }

    /// Accept a job event without waiting for it to be persisted.
    pub fn handle_event(&self, event: JobEvent) -> EventingResult<()> {
        let request = JobRequest::from_event(event).inspect_err(|err| {
            warn!(error = %err, "ignoring job event");
        })?;
        let writer = lock(&self.writer);
        let sender = writer.as_ref().ok_or(EventingError::Stopped)?;
        sender.send(request).map_err(|_| EventingError::Stopped)
    }

    /// The executor received `job`. `false` when it is not in flight, was
    /// acknowledged before, or `job` belongs to an earlier dispatch.
    pub fn acknowledge(&self, job: &JobHandle) -> bool {
        self.engine.acknowledge(job)
    }

    /// The executor is done with `job`. With `reschedule` the job is retried
    /// while its retry limit allows.
    pub fn complete(&self, job: &JobHandle, reschedule: bool) -> bool {
        self.engine.complete(job, reschedule)
    }

    /// Remove the job identified by `topic` and `id`.
    pub fn cancel(&self, topic: &Topic, id: &str) -> EventingResult<bool> {
        self.cancel_path(&JobPath::identified(topic, id))
    }

    /// Remove the job stored at `path`. A running job still completes but its
    /// outcome is not stored.
    pub fn cancel_path(&self, path: &JobPath) -> EventingResult<bool> {
        let removed = self.engine.store.delete(path)?;
        if removed {
            info!(job_path = %path, "job cancelled");
        }
        Ok(removed)
    }

    /// Cut short the back-off sleep of a named queue and release its delayed
    /// jobs. `false` when no such queue is running.
    pub fn wake_queue(&self, name: &str) -> bool {
        match self.engine.registry.get(name) {
            Some(queue) => {
                queue.wake();
                true
            }
            None => false,
        }
    }

    /// Jobs currently claimed.
    pub fn list_current(&self, topic: Option<&str>, filters: &[PropertyFilter]) -> EventingResult<Vec<JobRecord>> {
        self.list(topic, Some(true), filters)
    }

    /// Jobs waiting to be claimed.
    pub fn list_scheduled(&self, topic: Option<&str>, filters: &[PropertyFilter]) -> EventingResult<Vec<JobRecord>> {
        self.list(topic, Some(false), filters)
    }

    /// Every unfinished job.
    pub fn list_all(&self, topic: Option<&str>, filters: &[PropertyFilter]) -> EventingResult<Vec<JobRecord>> {
        self.list(topic, None, filters)
    }

    fn list(
        &self,
        topic: Option<&str>,
        claimed: Option<bool>,
        filters: &[PropertyFilter],
    ) -> EventingResult<Vec<JobRecord>> {
        let mut query = JobQuery::all().with_filters(filters.to_vec());
        if let Some(topic) = topic {
            query = query.with_topic(Topic::new(topic)?);
        }
        if let Some(claimed) = claimed {
            query = query.with_claimed(claimed);
        }
        Ok(self.engine.store.query(&query)?)
    }

    /// One supervisor pass: acknowledgement timeouts, purge, claim leases and
    /// idle queues.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        run_maintenance(&self.engine)
    }

    /// Main queue first, then named queues by name.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut stats = vec![self.engine.main_queue.stats()];
        stats.extend(self.engine.registry.stats());
        stats
    }

    /// Jobs dispatched and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.engine.in_flight_count()
    }

    /// Stop every thread. Queued jobs stay in the store and are loaded again
    /// on the next start. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let Some(mut threads) = lock(&self.threads).take() else {
            return;
        };

        // drain pending writes first
        drop(lock(&self.writer).take());
        if let Some(writer) = threads.writer.take() {
            let _ = writer.join();
        }

        if let Some(loader) = threads.loader.take() {
            loader.shutdown();
        }
        if let Some(supervisor) = threads.supervisor.take() {
            supervisor.shutdown();
        }

        self.engine.stop();
        if let Some(main) = threads.main.take() {
            let _ = main.join();
        }
        info!(application = %self.application_id(), "job event handler shut down");
    }
}

impl Drop for JobEventHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for JobEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEventHandler").field("engine", &self.engine).finish()
    }
}

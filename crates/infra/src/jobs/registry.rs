//! Named queue registry.
//!
//! Named queues are created lazily on the first job routed to them, each
//! with its own worker thread, up to a configured maximum. An idle queue is
//! marked on one maintenance sweep and torn down on the next if it is still
//! idle; a later job simply creates it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use eventing_core::{EventingError, EventingResult};

use super::lock;
use super::queue::{JobBlockingQueue, QueueStats};
use super::types::{JobRecord, QueueOptions};

#[derive(Debug)]
struct NamedQueue {
    queue: Arc<JobBlockingQueue>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct QueueRegistry {
    max_queues: usize,
    queues: Mutex<HashMap<String, NamedQueue>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueRegistry {
    pub fn new(max_queues: usize) -> Self {
        Self {
            max_queues,
            queues: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Put `job` on the queue named by `options`, creating the queue when
    /// needed.
    ///
    /// `slots` sizes a new unordered queue. `spawn` starts the worker of a new
    /// queue. The registry lock is held while the job is put, so a queue can
    /// never be torn down between lookup and enqueue.
    pub fn enqueue<F>(
        &self,
        options: &QueueOptions,
        slots: usize,
        job: JobRecord,
        spawn: F,
    ) -> EventingResult<()>
    where
        F: FnOnce(Arc<JobBlockingQueue>) -> EventingResult<JoinHandle<()>>,
    {
        let mut queues = lock(&self.queues);
        if let Some(named) = queues.get(&options.name) {
            named.queue.put(job);
            return Ok(());
        }

        if queues.len() >= self.max_queues {
            return Err(EventingError::QueueLimitExceeded {
                queue: options.name.clone(),
                limit: self.max_queues,
            });
        }

        let queue = Arc::new(JobBlockingQueue::new(options.name.clone(), options.ordered, slots));
        let worker = spawn(queue.clone())?;
        info!(
            queue = %options.name,
            ordered = options.ordered,
            max_running = queue.max_running(),
            "started job queue"
        );
        queue.put(job);
        queues.insert(
            options.name.clone(),
            NamedQueue {
                queue,
                worker: Some(worker),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobBlockingQueue>> {
        lock(&self.queues).get(name).map(|n| n.queue.clone())
    }

    /// Two-phase idle sweep; returns the names of the queues torn down.
    pub fn sweep_idle(&self) -> Vec<String> {
        let mut queues = lock(&self.queues);
        let doomed: Vec<String> = queues
            .iter()
            .filter(|(_, named)| named.queue.check_idle())
            .map(|(name, _)| name.clone())
            .collect();

        let mut retired = lock(&self.retired);
        for name in &doomed {
            if let Some(mut named) = queues.remove(name) {
                named.queue.stop();
                if let Some(worker) = named.worker.take() {
                    retired.push(worker);
                }
                debug!(queue = %name, "removed idle job queue");
            }
        }
        // reap workers that already exited
        retired.retain(|w| !w.is_finished());
        doomed
    }

    pub fn len(&self) -> usize {
        lock(&self.queues).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued jobs across all named queues.
    pub fn depth(&self) -> usize {
        lock(&self.queues).values().map(|n| n.queue.depth()).sum()
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = lock(&self.queues).values().map(|n| n.queue.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop every queue and join the workers.
    pub fn shutdown(&self) {
        let drained: Vec<NamedQueue> = lock(&self.queues).drain().map(|(_, n)| n).collect();
        let mut workers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.retired));
        for mut named in drained {
            named.queue.stop();
            if let Some(worker) = named.worker.take() {
                workers.push(worker);
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

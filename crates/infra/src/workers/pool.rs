//! Fixed-size thread pool owned by whoever runs jobs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::error;

use eventing_core::{EventingError, EventingResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A pool of named worker threads fed through one channel.
///
/// A panicking task is logged and does not take its thread down. Dropping
/// the pool lets queued tasks finish and joins every thread.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    sender: Option<mpsc::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> EventingResult<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{i}");
            let pool = name.to_string();
            let worker = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    loop {
                        let task = receiver
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .recv();
                        match task {
                            Ok(task) => {
                                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                    error!(pool = %pool, "pool task panicked");
                                }
                            }
                            Err(_) => break,
                        }
                    }
                })
                .map_err(|e| EventingError::spawn(thread_name, &e))?;
            workers.push(worker);
        }

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, task: F) -> EventingResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .ok_or(EventingError::Stopped)?
            .send(Box::new(task))
            .map_err(|_| EventingError::Stopped)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_task_before_drop_returns() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new("test-pool", 3).unwrap();
            assert_eq!(pool.size(), 3);
            for _ in 0..20 {
                let done = done.clone();
                pool.execute(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new("panicky", 1).unwrap();
            pool.execute(|| panic!("boom")).unwrap();
            let done = done.clone();
            pool.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}

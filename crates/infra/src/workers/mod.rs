//! Background thread plumbing.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use eventing_core::{EventingError, EventingResult};

pub mod pool;

pub use pool::ThreadPool;

/// Handle to control and join a background worker.
///
/// Shutdown is signalled by closing a channel, so a worker observes it on
/// every later check as well.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

/// Worker side of a [`WorkerHandle`].
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: mpsc::Receiver<()>,
}

impl ShutdownSignal {
    /// Sleep up to `delay`. Returns `false` as soon as shutdown is requested.
    pub fn sleep(&self, delay: Duration) -> bool {
        matches!(self.rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
    }

    pub fn is_requested(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl WorkerHandle {
    /// Spawn a named worker thread.
    pub fn spawn<F>(name: &str, body: F) -> EventingResult<Self>
    where
        F: FnOnce(ShutdownSignal) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(ShutdownSignal { rx: shutdown_rx }))
            .map_err(|e| EventingError::spawn(name, &e))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// Spawn a worker that calls `tick` every `period` until shut down.
    pub fn periodic<F>(name: &str, period: Duration, mut tick: F) -> EventingResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let worker = name.to_string();
        Self::spawn(name, move |shutdown| {
            while shutdown.sleep(period) {
                tick();
            }
            debug!(worker = %worker, "periodic worker stopped");
        })
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        self.shutdown.take();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn periodic_worker_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = WorkerHandle::periodic("ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        let after = ticks.load(Ordering::SeqCst);
        assert!(after >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn shutdown_interrupts_a_long_sleep() {
        let handle = WorkerHandle::spawn("sleeper", |shutdown| {
            assert!(!shutdown.sleep(Duration::from_secs(60)));
            assert!(shutdown.is_requested());
        })
        .unwrap();
        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

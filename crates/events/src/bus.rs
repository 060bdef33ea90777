//! Publish/subscribe abstraction for job traffic.
//!
//! The job engine uses a bus in two directions:
//!
//! - **dispatch**: a claimed job is published so that an executor can pick it
//!   up, acknowledge it and later report completion;
//! - **notifications**: lifecycle transitions (started, failed, cancelled,
//!   finished) are published for observers.
//!
//! ## Delivery
//!
//! Delivery is at-least-once and best-effort. The durable job store is the
//! source of truth: a dispatched job that is never acknowledged is taken back
//! by the supervisor after the acknowledgement timeout, and a job that is lost
//! entirely is reloaded from storage on the next start. Consumers must be
//! idempotent.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus.
///
/// Each subscription receives a copy of every message published after it was
/// created. It is meant to be drained by a single thread:
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(200)) {
///         Ok(job) => run(job),
///         Err(RecvTimeoutError::Timeout) => continue, // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus with broadcast semantics.
///
/// `publish` may fail (lock poisoning, a full or closed transport). The
/// caller decides what a failure means: a failed dispatch undoes the claim,
/// a failed notification is only logged.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

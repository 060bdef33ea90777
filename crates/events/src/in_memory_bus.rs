//! In-process bus backed by `std::sync::mpsc` channels.

use std::sync::{Mutex, PoisonError, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,

    /// Nobody is subscribed, so the message would be dropped silently.
    #[error("no subscribers")]
    NoSubscribers,
}

/// In-memory fan-out bus.
///
/// - No IO / no async
/// - Dead subscribers are dropped on the next publish
/// - `require_subscriber` turns "nobody listening" into an error, which is
///   what a dispatch bus needs: a job nobody will run must not be claimed.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    require_subscriber: bool,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose `publish` fails when no live subscriber received the message.
    pub fn requiring_subscriber() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            require_subscriber: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            require_subscriber: false,
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        let before = subs.len();
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        if subs.len() < before {
            tracing::debug!(pruned = before - subs.len(), "dropped closed bus subscribers");
        }

        if self.require_subscriber && subs.is_empty() {
            return Err(InMemoryBusError::NoSubscribers);
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription::new(rx)
    }
}

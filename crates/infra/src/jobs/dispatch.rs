//! Executor seam: how a claimed job leaves the engine.

use eventing_events::EventBus;

use super::types::JobHandle;

/// Dispatch failure; the engine undoes the claim and retries later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no executor available for topic '{0}'")]
    NoExecutor(String),
    #[error("dispatch transport failed: {0}")]
    Transport(String),
}

/// Hands a claimed job to an executor.
///
/// `dispatch` must not wait for the job to run: the executor reports back
/// through `acknowledge` and `complete` on the job handler.
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, job: JobHandle) -> Result<(), DispatchError>;
}

/// Dispatches jobs by publishing them on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusDispatcher<B> {
    bus: B,
}

impl<B> BusDispatcher<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> JobDispatcher for BusDispatcher<B>
where
    B: EventBus<JobHandle>,
{
    fn dispatch(&self, job: JobHandle) -> Result<(), DispatchError> {
        self.bus
            .publish(job)
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }
}

impl<F> JobDispatcher for F
where
    F: Fn(JobHandle) -> Result<(), DispatchError> + Send + Sync,
{
    fn dispatch(&self, job: JobHandle) -> Result<(), DispatchError> {
        self(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::JobRequest;
    use eventing_core::{ApplicationId, Topic};
    use eventing_events::InMemoryEventBus;
    use std::sync::Arc;

    fn handle() -> JobHandle {
        JobHandle::new(JobRequest::new(Topic::new("t").unwrap()).into_record(0, ApplicationId::new()))
    }

    #[test]
    fn bus_dispatcher_publishes_to_subscribers() {
        let bus = Arc::new(InMemoryEventBus::requiring_subscriber());
        let dispatcher = BusDispatcher::new(bus.clone());

        let err = dispatcher.dispatch(handle()).unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));

        let sub = bus.subscribe();
        let job = handle();
        dispatcher.dispatch(job.clone()).unwrap();
        assert_eq!(sub.try_recv().unwrap().path(), job.path());
    }

    #[test]
    fn closures_are_dispatchers() {
        let refuse = |job: JobHandle| -> Result<(), DispatchError> {
            Err(DispatchError::NoExecutor(job.topic().to_string()))
        };
        assert_eq!(
            refuse.dispatch(handle()),
            Err(DispatchError::NoExecutor("t".to_string()))
        );
    }
}

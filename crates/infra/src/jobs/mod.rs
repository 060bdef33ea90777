//! Durable, topic-addressed job processing.
//!
//! ## Design
//!
//! - A job is an event whose topic names the work and whose properties carry
//!   the payload plus reserved scheduling keys (`event.job.*`)
//! - Every accepted job is persisted before it is queued; the store is the
//!   source of truth and queues only hold work for this process
//! - Jobs run at most once at a time across all processes sharing a store
//!   (claim by conditional update)
//! - Failed jobs are retried up to a per-job limit, then cancelled
//! - Executors are decoupled through a dispatcher and answer with
//!   acknowledge/complete callbacks
//!
//! ## Components
//!
//! - `JobEventHandler`: owns the queues and background threads
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobDispatcher`: hands claimed jobs to executors
//! - `JobConsumer`: executor side, runs registered handlers on a pool
//! - `NotificationSink`: receives started/failed/cancelled/finished events

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod consumer;
pub mod dispatch;
pub(crate) mod engine;
pub mod gate;
pub mod handler;
mod loader;
pub mod notify;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod request;
pub mod store;
mod supervisor;
pub mod types;
mod worker;

pub use consumer::{JobCallbacks, JobConsumer};
pub use dispatch::{BusDispatcher, DispatchError, JobDispatcher};
pub use handler::{JobEventHandler, JobEventHandlerBuilder};
pub use notify::NotificationSink;
pub use postgres::PostgresJobStore;
pub use queue::QueueStats;
pub use request::{JobEvent, JobRequest};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use supervisor::MaintenanceReport;
pub use types::{
    JobHandle, JobQuery, JobRecord, JobResult, JobState, Parallelism, PropertyFilter, QueueOptions,
    RetryLimit,
};

/// Lock a mutex, recovering the data of a poisoned lock. Every critical
/// section in this module leaves its data consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

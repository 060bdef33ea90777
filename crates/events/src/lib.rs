//! Job dispatch and notification transport.
//!
//! The job engine never calls executors directly: dispatched jobs and job
//! lifecycle notifications travel over an [`EventBus`].

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{JobNotification, NotificationTopic};

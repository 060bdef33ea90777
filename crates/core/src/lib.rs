//! `eventing-core`: building blocks shared by every eventing crate.
//!
//! This crate holds **pure** primitives: identifiers, job topics and paths,
//! job property helpers and the public error model. No threads, no IO.

pub mod error;
pub mod id;
pub mod path;
pub mod properties;
pub mod topic;

pub use error::{EventingError, EventingResult};
pub use id::{ApplicationId, JobUid};
pub use path::JobPath;
pub use properties::JobProperties;
pub use topic::Topic;

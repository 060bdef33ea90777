//! Infrastructure layer: job engine, stores, background threads, config.

pub mod config;
pub mod jobs;
pub mod workers;

pub use config::JobHandlerConfig;

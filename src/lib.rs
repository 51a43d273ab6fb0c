//! Squall: adaptive polling collector for rate-limited monitoring APIs.
//!
//! This crate handles:
//! - Scheduling polls per resource, adapting cadence to each resource's
//!   observed record-arrival rate
//! - Coordinating a priority and a background collector against one shared
//!   server rate budget
//! - Flattening nested API records into per-resource (and per-sub-table)
//!   CSV files, with schema-drift sampling along the way
//! - Checkpointing scheduling state so collection resumes across restarts

pub mod api;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod drift;
pub mod error;
pub mod estimator;
pub mod flatten;
pub mod metrics;
pub mod ratelimit;
pub mod scheduler;
pub mod signal;
pub mod sink;
pub mod timeutil;
pub mod tracing;

// Re-export commonly used items
pub use api::{ApiClient, Query, RateLimits, RecordStream};
pub use catalog::{Catalog, DeclaredType, ResourceDescriptor};
pub use checkpoint::{CheckpointStore, PollState};
pub use config::{Config, Settings};
pub use error::CollectorError;
pub use ratelimit::RateLimitCoordinator;
pub use scheduler::{Collector, Role, run_collectors};
pub use signal::shutdown_signal;
pub use tracing::init_tracing;

//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the collector.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric. Metrics carry a `resource` or `role` label so
//! per-resource behavior stays observable in multi-resource deployments.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when records are written for a resource (or sub-table).
pub struct RecordsCollected {
    pub count: u64,
    pub resource: String,
}

impl InternalEvent for RecordsCollected {
    fn emit(self) {
        trace!(count = self.count, resource = %self.resource, "Records collected");
        counter!("squall_records_collected_total", "resource" => self.resource)
            .increment(self.count);
    }
}

/// Event emitted when a poll cycle completes successfully.
pub struct PollCompleted {
    pub resource: String,
    pub duration: Duration,
}

impl InternalEvent for PollCompleted {
    fn emit(self) {
        trace!(resource = %self.resource, duration_secs = self.duration.as_secs_f64(), "Poll completed");
        counter!("squall_polls_completed_total", "resource" => self.resource.clone()).increment(1);
        histogram!("squall_poll_duration_seconds", "resource" => self.resource)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a poll cycle fails on a transport fault.
pub struct PollFailed {
    pub resource: String,
}

impl InternalEvent for PollFailed {
    fn emit(self) {
        trace!(resource = %self.resource, "Poll failed");
        counter!("squall_polls_failed_total", "resource" => self.resource).increment(1);
    }
}

/// Event emitted when a checkpoint is persisted.
pub struct CheckpointSaved {
    pub role: &'static str,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(role = self.role, "Checkpoint saved");
        counter!("squall_checkpoints_saved_total", "role" => self.role).increment(1);
    }
}

/// Event emitted when a drift report contains at least one error.
pub struct DriftErrors {
    pub resource: String,
}

impl InternalEvent for DriftErrors {
    fn emit(self) {
        trace!(resource = %self.resource, "Drift errors reported");
        counter!("squall_drift_errors_total", "resource" => self.resource).increment(1);
    }
}

/// Event emitted after each estimator update with the learned rate.
pub struct LearnedRate {
    pub resource: String,
    pub records_per_hour: f64,
}

impl InternalEvent for LearnedRate {
    fn emit(self) {
        trace!(resource = %self.resource, records_per_hour = self.records_per_hour, "Learned rate");
        gauge!("squall_records_per_hour", "resource" => self.resource).set(self.records_per_hour);
    }
}

/// Event emitted when a single record is dropped on a structural fault.
pub struct RecordDropped {
    pub resource: String,
}

impl InternalEvent for RecordDropped {
    fn emit(self) {
        trace!(resource = %self.resource, "Record dropped");
        counter!("squall_records_dropped_total", "resource" => self.resource).increment(1);
    }
}

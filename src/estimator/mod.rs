//! Throughput estimation: learning each resource's record-arrival rate.
//!
//! The learned `records_per_hour` drives how large a time window the next
//! incremental poll requests. Two update rules, selected by the resource
//! kind:
//!
//! - Snapshot resources use a plain EMA over poll cycles, updated after
//!   every poll regardless of batch quality.
//! - Incremental resources blend proportionally to how much real elapsed
//!   time the batch spans, and refuse to learn from stale or empty batches
//!   so a poll that ran far behind the resource's timeline can never drag
//!   the estimate toward zero.

use tracing::warn;

use crate::catalog::ResourceDescriptor;

/// Time constant for rate learning, in poll cycles (snapshot) or days
/// (incremental).
pub const TAU: f64 = 20.0;

/// First/last event times observed in one batch, epoch seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchTiming {
    pub first: Option<f64>,
    pub last: Option<f64>,
}

impl BatchTiming {
    /// Track an observed event time, keeping the first and latest.
    pub fn observe(&mut self, secs: f64) {
        if self.first.is_none() {
            self.first = Some(secs);
        }
        self.last = Some(secs);
    }
}

/// Compute the updated rate after one poll.
///
/// Never fails: every degenerate input falls back to `old` (with a logged
/// warning where the input is malformed rather than merely stale).
pub fn updated_rate(
    descriptor: &ResourceDescriptor,
    old: f64,
    record_count: u64,
    timing: &BatchTiming,
    now: f64,
) -> f64 {
    if descriptor.is_snapshot {
        return snapshot_rate(old, record_count);
    }
    incremental_rate(descriptor, old, record_count, timing, now)
}

/// EMA over ~TAU poll cycles; runs after every snapshot poll.
fn snapshot_rate(old: f64, record_count: u64) -> f64 {
    ((TAU - 1.0) * old + record_count as f64) / TAU
}

fn incremental_rate(
    descriptor: &ResourceDescriptor,
    old: f64,
    record_count: u64,
    timing: &BatchTiming,
    now: f64,
) -> f64 {
    // An empty batch carries no time span to learn from; treated exactly
    // like a stale batch. The scheduler separately surfaces zero records
    // on a previously-healthy resource.
    if record_count == 0 {
        return old;
    }

    let (first, last) = match (timing.first, timing.last) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            warn!(
                resource = %descriptor.name,
                "Batch has missing or malformed time fields, keeping learned rate"
            );
            return old;
        }
    };

    // The poll ran behind the resource's timeline; records may be missing.
    if (now - first) > descriptor.rollup_tolerance_secs
        || (now - last) > descriptor.rollup_tolerance_secs
    {
        return old;
    }

    let span_hours = (last - first) / 3600.0;
    if span_hours <= 0.0 {
        warn!(
            resource = %descriptor.name,
            first,
            last,
            "Batch spans no time, keeping learned rate"
        );
        return old;
    }

    // Weight by how much of a day of real time the batch covers.
    let day_fraction = span_hours / 24.0;
    ((TAU - day_fraction) * old + day_fraction * (record_count as f64 / span_hours)) / TAU
}

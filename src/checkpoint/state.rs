//! Per-resource scheduling state.
//!
//! `PollState` is the live, in-process state the scheduler mutates once per
//! completed poll cycle. `PersistedState` is the exact subset written to
//! the checkpoint file; everything else is rebuilt at runtime.

use serde::{Deserialize, Serialize};

/// The checkpointed subset of a resource's scheduling state.
///
/// Unknown fields in the file are ignored and missing fields default, so
/// checkpoint files survive both older and newer collector versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Last seen primary-key/sequence value, for snapshot continuation.
    #[serde(default)]
    pub last_cursor_id: i64,
    /// Lower event-time bound for the next incremental poll (epoch secs).
    #[serde(default)]
    pub min_time_cursor: f64,
    /// Highest event time observed so far (epoch secs).
    #[serde(default)]
    pub max_time_seen: f64,
    /// When the resource is next due (epoch secs).
    #[serde(default)]
    pub next_poll_at: f64,
    /// Learned record-arrival rate.
    #[serde(default)]
    pub records_per_hour: f64,
    /// When the most recent poll started (epoch secs).
    #[serde(default)]
    pub poll_started_at: f64,
}

/// Live scheduling state for one resource.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    pub last_cursor_id: i64,
    pub min_time_cursor: f64,
    pub max_time_seen: f64,
    /// Monotonically advanced by the scheduler or the backoff path only;
    /// decreased only by an explicit checkpoint reset.
    pub next_poll_at: f64,
    pub records_per_hour: f64,
    pub poll_started_at: f64,
    /// When the drift sampler last ran a forced full pass. Not persisted;
    /// a restart forces a fresh check within the first cycle.
    pub last_schema_check_at: f64,
}

impl PollState {
    /// Cold-start state: everything at epoch, so the resource is
    /// immediately due and the first incremental poll starts from zero.
    pub fn cold() -> Self {
        Self::default()
    }

    /// Restore the persisted subset from a checkpoint entry.
    pub fn restore(&mut self, persisted: &PersistedState) {
        self.last_cursor_id = persisted.last_cursor_id;
        self.min_time_cursor = persisted.min_time_cursor;
        self.max_time_seen = persisted.max_time_seen;
        self.next_poll_at = persisted.next_poll_at;
        self.records_per_hour = persisted.records_per_hour;
        self.poll_started_at = persisted.poll_started_at;
    }

    /// The subset of this state that gets checkpointed.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            last_cursor_id: self.last_cursor_id,
            min_time_cursor: self.min_time_cursor,
            max_time_seen: self.max_time_seen,
            next_poll_at: self.next_poll_at,
            records_per_hour: self.records_per_hour,
            poll_started_at: self.poll_started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_state_is_immediately_due() {
        let state = PollState::cold();
        assert!(state.next_poll_at <= crate::timeutil::now_secs());
        assert_eq!(state.records_per_hour, 0.0);
    }

    #[test]
    fn test_restore_round_trip() {
        let mut state = PollState::cold();
        state.last_cursor_id = 99;
        state.min_time_cursor = 1.5;
        state.max_time_seen = 2.5;
        state.next_poll_at = 3.5;
        state.records_per_hour = 120.25;
        state.poll_started_at = 4.5;
        state.last_schema_check_at = 5.5;

        let mut restored = PollState::cold();
        restored.restore(&state.persisted());

        assert_eq!(restored.persisted(), state.persisted());
        // last_schema_check_at is rebuilt, not persisted
        assert_eq!(restored.last_schema_check_at, 0.0);
    }

    #[test]
    fn test_persisted_tolerates_unknown_and_missing_fields() {
        let parsed: PersistedState = serde_json::from_str(
            r#"{"last_cursor_id": 7, "next_poll_at": 10.0, "deprecated_field": "xyz"}"#,
        )
        .unwrap();
        assert_eq!(parsed.last_cursor_id, 7);
        assert_eq!(parsed.next_poll_at, 10.0);
        assert_eq!(parsed.records_per_hour, 0.0);
    }
}

//! Upstream API collaborator interface.
//!
//! The collector drives the API through the [`ApiClient`] trait: a way to
//! discover the server's rate-limit parameters once at startup, and a
//! generator of nested records for a resource given a query filter. The
//! record stream is lazy, finite, and non-restartable; exhaustion is the
//! stream ending, not an error.

pub mod rest;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use snafu::prelude::*;

use crate::catalog::ResourceDescriptor;
use crate::checkpoint::PollState;

/// Transport-class faults from the upstream API.
///
/// All of these are recovered by backoff in the scheduler; none are fatal
/// to the process except when raised during rate-limit discovery.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Connection refused by the server.
    #[snafu(display("Connection refused by {server}"))]
    Refused { server: String },

    /// Connection reset mid-stream.
    #[snafu(display("Connection reset while reading {resource}"))]
    Reset { resource: String },

    /// Connection aborted mid-stream.
    #[snafu(display("Connection aborted while reading {resource}"))]
    Aborted { resource: String },

    /// Server returned an unexpected HTTP status.
    #[snafu(display("HTTP {status} from {url}"))]
    Http { status: u16, url: String },

    /// Response body could not be decoded.
    #[snafu(display("Failed to decode response from {url}: {message}"))]
    Decode { url: String, message: String },
}

/// Server-enforced rate-limit parameters, discovered once at startup.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimits {
    /// Length of the server's sliding rate window, in seconds.
    pub window_size_secs: f64,
    /// Number of segments the server divides the window into.
    pub segment_count: u32,
    /// Largest page the server will return.
    pub max_page_size: usize,
    /// Per-user request threshold within one window.
    pub per_user_threshold: u32,
}

/// Query filter for one poll of a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Resume cursor: only records with id/sequence above this value.
    pub after_cursor: Option<i64>,
    /// Lower event-time bound (epoch seconds, exclusive).
    pub min_time: Option<f64>,
    /// Upper event-time bound (epoch seconds, inclusive).
    pub max_time: Option<f64>,
    /// Requested page size.
    pub page_size: usize,
}

/// Shortest incremental window requested, in hours.
const MIN_SPAN_HOURS: f64 = 0.25;
/// Longest incremental window requested, in hours.
const MAX_SPAN_HOURS: f64 = 24.0;

impl Query {
    /// Build the query for the next poll of a resource.
    ///
    /// Snapshot resources resume from the id cursor at full page size.
    /// Incremental resources request a time window sized so the expected
    /// record count (from the learned rate) lands near one scaled page:
    /// `span_hours = clamp(scale * max_page_size / records_per_hour)`.
    /// With no learned rate yet, the window is the full day.
    pub fn for_resource(
        descriptor: &ResourceDescriptor,
        state: &PollState,
        limits: &RateLimits,
        scale: f64,
        now: f64,
    ) -> Self {
        if descriptor.is_snapshot {
            return Self {
                after_cursor: (state.last_cursor_id > 0).then_some(state.last_cursor_id),
                min_time: None,
                max_time: None,
                page_size: limits.max_page_size,
            };
        }

        let target_records = scale * limits.max_page_size as f64;
        let span_hours = if state.records_per_hour > 0.0 {
            (target_records / state.records_per_hour).clamp(MIN_SPAN_HOURS, MAX_SPAN_HOURS)
        } else {
            MAX_SPAN_HOURS
        };
        let max_time = (state.min_time_cursor + span_hours * 3600.0).min(now);

        Self {
            after_cursor: None,
            min_time: Some(state.min_time_cursor),
            max_time: Some(max_time),
            page_size: limits.max_page_size,
        }
    }
}

/// A lazy, finite, non-restartable sequence of nested records.
pub type RecordStream = BoxStream<'static, Result<Value, TransportError>>;

/// The upstream API collaborator.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Discover the server's current rate-limit parameters.
    async fn rate_limits(&self) -> Result<RateLimits, TransportError>;

    /// Open a record stream for one poll of the resource.
    async fn records(
        &self,
        descriptor: &ResourceDescriptor,
        query: &Query,
    ) -> Result<RecordStream, TransportError>;

    /// Per-record/per-page error count reported by the client for the most
    /// recently completed stream.
    fn error_count(&self) -> u64 {
        0
    }
}

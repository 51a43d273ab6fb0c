//! Metrics and observability infrastructure.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `init`: Prometheus exporter startup

pub mod events;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::CollectorError;
use snafu::ResultExt;

/// Macro for emitting metric events (Vector-style pattern).
///
/// Calls the `InternalEvent::emit()` method on the given event, which
/// records the corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use squall::metrics::events::RecordsCollected;
///
/// emit!(RecordsCollected { count: 100, resource: "ClientSessions".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;

/// Start the Prometheus exporter on the given address.
///
/// Serves metrics in Prometheus text format at `/metrics`. Call once at
/// startup, before either collector task is spawned.
pub fn init(addr: SocketAddr) -> Result<(), CollectorError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context(crate::error::MetricsInitSnafu)?;
    Ok(())
}

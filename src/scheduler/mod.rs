//! Poll scheduling and the collector cycle.
//!
//! Two collector roles run as independent tasks against one shared server
//! rate budget. Each owns a disjoint set of resources, its own checkpoint
//! file, and a loop that repeatedly picks the next due resource, polls it,
//! writes the output files, and persists state.
//!
//! The priority role holds the rate-limit gate with settling sleeps around
//! every poll; the background role yields at the gate before every page
//! request and polls with a halved batch size until its backlog clears.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, Query, TransportError};
use crate::catalog::{Catalog, ResourceDescriptor};
use crate::checkpoint::{CheckpointStore, PersistedState, PollState};
use crate::config::Settings;
use crate::drift::{DriftCounters, FORCED_CHECK_INTERVAL_SECS, SamplePolicy};
use crate::emit;
use crate::error::{CollectorError, RateLimitDiscoverySnafu, UnknownResourceSnafu};
use crate::estimator::{self, BatchTiming};
use crate::flatten::{Flattened, Flattener};
use crate::metrics::events::{
    CheckpointSaved, DriftErrors, LearnedRate, PollCompleted, PollFailed, RecordDropped,
    RecordsCollected,
};
use crate::ratelimit::{BatchScale, RateLimitCoordinator};
use crate::sink::{CsvSink, SinkSet};
use crate::timeutil::{event_secs, now_secs};

/// Backoff applied after any transport-class poll failure.
const TRANSPORT_BACKOFF_SECS: f64 = 4.0 * 3600.0;

/// Cycles between scheduling reports in the log.
const SCHEDULE_REPORT_CYCLES: u64 = 10;

/// Collector role. Each role runs one task and owns one checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the rate gate exclusively around each poll, with settling
    /// sleeps on both sides.
    Priority,
    /// Yields to the priority role between polls.
    Background,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Priority => "priority",
            Role::Background => "background",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource under a collector: its declared shape, live scheduling
/// state, and the long-lived flattener that remembers reported gaps.
struct CollectorResource {
    descriptor: Arc<ResourceDescriptor>,
    state: PollState,
    flattener: Flattener,
}

/// One collector role's resources and loop.
pub struct Collector<C: ApiClient> {
    role: Role,
    client: Arc<C>,
    coordinator: Arc<RateLimitCoordinator>,
    scale: BatchScale,
    settings: Settings,
    store: CheckpointStore,
    resources: Vec<CollectorResource>,
    shutdown: CancellationToken,
    cycles: u64,
}

impl<C: ApiClient> Collector<C> {
    /// Build a collector for one role, restoring saved state per resource.
    pub fn new(
        role: Role,
        client: Arc<C>,
        coordinator: Arc<RateLimitCoordinator>,
        settings: Settings,
        catalog: &Catalog,
        shutdown: CancellationToken,
    ) -> Result<Self, CollectorError> {
        let names = match role {
            Role::Priority => &settings.config.priority,
            Role::Background => &settings.config.background,
        };

        let mut resources = Vec::new();
        for name in names {
            if !settings.wants(name) {
                continue;
            }
            let descriptor = catalog
                .get(name, None)
                .context(UnknownResourceSnafu { name: name.clone() })?;
            resources.push(CollectorResource {
                descriptor,
                state: PollState::cold(),
                flattener: Flattener::new(),
            });
        }

        let store = CheckpointStore::for_role(settings.config.state_dir(), role.as_str());
        if settings.reset {
            info!(role = %role, "Reset requested, ignoring saved state");
        } else {
            let saved = store.load();
            for resource in &mut resources {
                match saved.get(&resource.descriptor.ident()) {
                    Some(persisted) => resource.state.restore(persisted),
                    None => warn!(
                        role = %role,
                        resource = %resource.descriptor.ident(),
                        "No saved state, starting cold"
                    ),
                }
            }
        }

        // The background role runs at half batch size until its backlog
        // clears, so a priority poll is never starved behind a deep
        // catch-up window.
        let scale = match role {
            Role::Priority => BatchScale::full(settings.config.batch_scale),
            Role::Background => BatchScale::catching_up(settings.config.batch_scale),
        };

        Ok(Self {
            role,
            client,
            coordinator,
            scale,
            settings,
            store,
            resources,
            shutdown,
            cycles: 0,
        })
    }

    /// Live scheduling state for a resource, by identifier.
    pub fn poll_state(&self, ident: &str) -> Option<&PollState> {
        self.resources
            .iter()
            .find(|r| r.descriptor.ident() == ident)
            .map(|r| &r.state)
    }

    fn next_due(&self, now: f64) -> Option<usize> {
        next_due(&self.resources, now)
    }

    /// Run the collector loop until shutdown (or one cycle in single mode).
    pub async fn run(&mut self) -> Result<(), CollectorError> {
        if self.resources.is_empty() {
            info!(role = %self.role, "No resources assigned, collector idle");
            return Ok(());
        }
        info!(
            role = %self.role,
            resources = self.resources.len(),
            "Collector started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let now = now_secs();
            let due_in = match self.next_due(now) {
                Some(idx) => self.resources[idx].state.next_poll_at - now,
                None => break,
            };
            // Single mode polls the selected resource immediately, even
            // when it is not yet due.
            if due_in > 0.0 && !self.settings.single {
                // Having to wait means the backlog is gone.
                if self.scale.caught_up() {
                    info!(role = %self.role, "Backlog cleared, restoring full batch size");
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(due_in)) => {}
                }
            }
            self.run_once().await?;
            if self.settings.single {
                break;
            }
        }

        info!(role = %self.role, "Collector stopped");
        Ok(())
    }

    /// Poll the next due resource and persist state (unless in single
    /// mode, which leaves saved state untouched).
    pub async fn run_once(&mut self) -> Result<(), CollectorError> {
        let now = now_secs();
        let Some(idx) = self.next_due(now) else {
            return Ok(());
        };
        self.poll(idx).await?;

        self.cycles += 1;
        if self.cycles % SCHEDULE_REPORT_CYCLES == 0 {
            self.log_schedule();
        }
        if !self.settings.single {
            self.persist();
        }
        Ok(())
    }

    /// One full poll cycle for one resource.
    async fn poll(&mut self, idx: usize) -> Result<(), CollectorError> {
        let descriptor = self.resources[idx].descriptor.clone();
        let mut state = self.resources[idx].state.clone();
        let started = now_secs();
        state.poll_started_at = started;

        // Once a day every record gets a full drift pass; resources whose
        // records mutate in place also get their time cursor zeroed so the
        // pass sees the whole population.
        let forced_check =
            started - state.last_schema_check_at > FORCED_CHECK_INTERVAL_SECS;
        if forced_check {
            debug!(resource = %descriptor.ident(), "Running full schema check this cycle");
            if descriptor.full_refresh_on_check && !descriptor.is_snapshot {
                state.min_time_cursor = 0.0;
            }
        }
        let drift = &self.settings.config.drift;
        let (types_policy, enums_policy) = if forced_check {
            (SamplePolicy::Always, SamplePolicy::Always)
        } else {
            (drift.types, drift.enums)
        };

        let query = Query::for_resource(
            &descriptor,
            &state,
            self.coordinator.limits(),
            self.scale.factor(),
            started,
        );
        debug!(
            role = %self.role,
            resource = %descriptor.ident(),
            ?query,
            "Polling"
        );

        let sub_tables = selected_sub_tables(&descriptor);
        let mut counters = DriftCounters::new(
            descriptor.ident(),
            types_policy,
            enums_policy,
            drift.stride,
        );
        let mut sub_counters: HashMap<String, DriftCounters> = sub_tables
            .iter()
            .map(|(table_path, _)| {
                (
                    table_path.clone(),
                    DriftCounters::new(table_path.clone(), types_policy, enums_policy, drift.stride),
                )
            })
            .collect();

        let mut sinks = open_sinks(
            self.settings.config.output_dir.as_path(),
            &descriptor,
            &sub_tables,
        )?;

        let client = self.client.clone();
        let coordinator = self.coordinator.clone();
        let outcome = match self.role {
            Role::Priority => {
                with_priority_gate(
                    &coordinator,
                    consume_stream(
                        client.as_ref(),
                        &descriptor,
                        &query,
                        &mut self.resources[idx].flattener,
                        &mut sinks,
                        &mut counters,
                        &mut sub_counters,
                        &sub_tables,
                        None,
                    ),
                )
                .await?
            }
            Role::Background => {
                consume_stream(
                    client.as_ref(),
                    &descriptor,
                    &query,
                    &mut self.resources[idx].flattener,
                    &mut sinks,
                    &mut counters,
                    &mut sub_counters,
                    &sub_tables,
                    Some(coordinator.as_ref()),
                )
                .await?
            }
        };
        let finished = now_secs();

        match outcome {
            StreamOutcome::Failed(e) => {
                warn!(
                    role = %self.role,
                    resource = %descriptor.ident(),
                    error = %e,
                    backoff_secs = TRANSPORT_BACKOFF_SECS,
                    "Poll failed, backing off"
                );
                emit!(PollFailed {
                    resource: descriptor.ident(),
                });
                // Cursors and the learned rate stay untouched so the retry
                // repeats the same window.
                state.next_poll_at = finished + TRANSPORT_BACKOFF_SECS;
                sinks.abandon();
            }
            StreamOutcome::Completed {
                record_count,
                timing,
                max_id,
            } => {
                if record_count == 0 && !descriptor.is_snapshot && state.records_per_hour > 0.0 {
                    error!(
                        resource = %descriptor.ident(),
                        min_time = state.min_time_cursor,
                        "Active resource returned no records; if its history \
                         was purged server-side, restart with --reset"
                    );
                }

                let rate = estimator::updated_rate(
                    &descriptor,
                    state.records_per_hour,
                    record_count,
                    &timing,
                    finished,
                );
                state.records_per_hour = rate;
                emit!(LearnedRate {
                    resource: descriptor.ident(),
                    records_per_hour: rate,
                });

                if let Some(last) = timing.last {
                    state.max_time_seen = state.max_time_seen.max(last);
                }
                if descriptor.is_snapshot {
                    state.last_cursor_id = state.last_cursor_id.max(max_id);
                } else {
                    state.min_time_cursor = state.max_time_seen;
                }
                state.next_poll_at = finished.max(started + descriptor.poll_period_secs);
                if forced_check {
                    state.last_schema_check_at = finished;
                }

                self.report_drift(&descriptor, &counters, &sub_counters, &sub_tables);

                let parent_rows = sinks.parent_rows();
                let sub_rows = sinks.sub_rows();
                sinks.finalize()?;

                emit!(RecordsCollected {
                    count: parent_rows + sub_rows,
                    resource: descriptor.ident(),
                });
                emit!(PollCompleted {
                    resource: descriptor.ident(),
                    duration: Duration::from_secs_f64((finished - started).max(0.0)),
                });
                info!(
                    role = %self.role,
                    resource = %descriptor.ident(),
                    records = record_count,
                    rows = parent_rows + sub_rows,
                    records_per_hour = %format!("{rate:.1}"),
                    "Poll complete"
                );
            }
        }

        let stream_errors = self.client.error_count();
        if stream_errors > 0 {
            warn!(
                resource = %descriptor.ident(),
                errors = stream_errors,
                "Stream reported per-page errors"
            );
        }

        self.resources[idx].state = state;
        Ok(())
    }

    fn report_drift(
        &self,
        descriptor: &ResourceDescriptor,
        counters: &DriftCounters,
        sub_counters: &HashMap<String, DriftCounters>,
        sub_tables: &[(String, &ResourceDescriptor)],
    ) {
        let mut tables: Vec<(&DriftCounters, &ResourceDescriptor)> = vec![(counters, descriptor)];
        for (table_path, sub_descriptor) in sub_tables {
            if let Some(sub) = sub_counters.get(table_path) {
                tables.push((sub, sub_descriptor));
            }
        }
        for (table_counters, table_descriptor) in tables {
            if !table_counters.enabled() {
                continue;
            }
            let (has_errors, report) = table_counters.report(table_descriptor);
            if report.is_empty() {
                continue;
            }
            if has_errors {
                error!(resource = %descriptor.ident(), "Schema drift:\n{report}");
                emit!(DriftErrors {
                    resource: descriptor.ident(),
                });
            } else {
                info!(resource = %descriptor.ident(), "Schema notes:\n{report}");
            }
        }
    }

    /// Save every resource's persisted state under this role's file.
    ///
    /// A save failure costs at most one cycle of progress, so it logs and
    /// moves on rather than stopping collection.
    fn persist(&self) {
        let states: HashMap<String, PersistedState> = self
            .resources
            .iter()
            .map(|r| (r.descriptor.ident(), r.state.persisted()))
            .collect();
        match self.store.save(&states) {
            Ok(()) => emit!(CheckpointSaved {
                role: self.role.as_str(),
            }),
            Err(e) => warn!(
                role = %self.role,
                error = %e,
                "Failed to save checkpoint, continuing"
            ),
        }
    }

    fn log_schedule(&self) {
        for resource in &self.resources {
            debug!(
                role = %self.role,
                resource = %resource.descriptor.ident(),
                next_poll_at = resource.state.next_poll_at,
                records_per_hour = %format!("{:.1}", resource.state.records_per_hour),
                "Schedule"
            );
        }
    }
}

/// Result of draining one record stream.
enum StreamOutcome {
    Completed {
        record_count: u64,
        timing: BatchTiming,
        /// Highest primary-key value seen (snapshot cursor).
        max_id: i64,
    },
    Failed(TransportError),
}

/// Pick the next resource to poll.
///
/// Any overdue snapshot wins over everything else, since a snapshot that
/// slips misses current state for good. Otherwise the earliest due
/// resource is next.
fn next_due(resources: &[CollectorResource], now: f64) -> Option<usize> {
    let overdue_snapshot = resources
        .iter()
        .enumerate()
        .filter(|(_, r)| r.descriptor.is_snapshot && r.state.next_poll_at <= now)
        .min_by(|a, b| a.1.state.next_poll_at.total_cmp(&b.1.state.next_poll_at))
        .map(|(i, _)| i);
    if overdue_snapshot.is_some() {
        return overdue_snapshot;
    }
    resources
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.state.next_poll_at.total_cmp(&b.1.state.next_poll_at))
        .map(|(i, _)| i)
}

/// Run one poll's batch while holding the priority gate.
///
/// Both settling windows elapse whether or not the batch succeeds; a hard
/// failure must not leave the gate released without the trailing settle.
async fn with_priority_gate<T>(
    coordinator: &RateLimitCoordinator,
    work: impl std::future::Future<Output = Result<T, CollectorError>>,
) -> Result<T, CollectorError> {
    let gate = coordinator.begin_priority().await;
    let result = work.await;
    gate.release().await;
    result
}

/// Open the stream and drain it, flattening and writing every record.
///
/// A structural fault drops the one record; a transport fault ends the
/// batch. Sink errors are the only hard failures. The background role
/// passes the coordinator as `pacer`: the drain then waits at the rate
/// gate before every pull, so no page request goes out while a priority
/// poll holds the gate.
#[allow(clippy::too_many_arguments)]
async fn consume_stream<C: ApiClient + ?Sized>(
    client: &C,
    descriptor: &ResourceDescriptor,
    query: &Query,
    flattener: &mut Flattener,
    sinks: &mut SinkSet,
    counters: &mut DriftCounters,
    sub_counters: &mut HashMap<String, DriftCounters>,
    sub_tables: &[(String, &ResourceDescriptor)],
    pacer: Option<&RateLimitCoordinator>,
) -> Result<StreamOutcome, CollectorError> {
    if let Some(coordinator) = pacer {
        coordinator.background_checkpoint().await;
    }
    let mut stream = match client.records(descriptor, query).await {
        Ok(stream) => stream,
        Err(e) => return Ok(StreamOutcome::Failed(e)),
    };

    let mut record_count: u64 = 0;
    let mut timing = BatchTiming::default();
    let mut max_id: i64 = 0;

    loop {
        if let Some(coordinator) = pacer {
            coordinator.background_checkpoint().await;
        }
        let Some(item) = stream.next().await else {
            break;
        };
        let record = match item {
            Ok(record) => record,
            Err(e) => return Ok(StreamOutcome::Failed(e)),
        };
        let Flattened { row, sub_rows } = match flattener.flatten(&record, descriptor) {
            Ok(flattened) => flattened,
            Err(e) => {
                error!(
                    resource = %descriptor.ident(),
                    error = %e,
                    "Dropping malformed record"
                );
                emit!(RecordDropped {
                    resource: descriptor.ident(),
                });
                continue;
            }
        };

        if let Some(secs) = descriptor
            .time_field
            .as_ref()
            .and_then(|field| row.get(field))
            .and_then(event_secs)
        {
            timing.observe(secs);
        }
        if let Some(id) = descriptor
            .key_fields
            .first()
            .and_then(|key| row.get(key))
            .and_then(Value::as_i64)
        {
            max_id = max_id.max(id);
        }

        counters.observe(&row, descriptor);
        sinks.write_parent(&row)?;
        record_count += 1;

        for sub in &sub_rows {
            if let Some(sub_descriptor) = sub_tables
                .iter()
                .find(|(path, _)| path == &sub.table_path)
                .map(|(_, d)| *d)
            {
                if let Some(sub_counter) = sub_counters.get_mut(&sub.table_path) {
                    sub_counter.observe(&sub.row, sub_descriptor);
                }
            }
            // Rows with none of the sub-table's own fields carry nothing
            // beyond the copied parent keys.
            if sub.has_selected {
                sinks.write_sub(&sub.table_path, &sub.row)?;
            }
        }
    }

    Ok(StreamOutcome::Completed {
        record_count,
        timing,
        max_id,
    })
}

/// All sub-tables with output of their own, recursively, keyed by the
/// chained table path the flattener emits.
fn selected_sub_tables(descriptor: &ResourceDescriptor) -> Vec<(String, &ResourceDescriptor)> {
    fn walk<'a>(
        descriptor: &'a ResourceDescriptor,
        prefix: &str,
        out: &mut Vec<(String, &'a ResourceDescriptor)>,
    ) {
        for (field_path, sub) in &descriptor.sub_tables {
            if !sub.descriptor.has_selected_output() {
                continue;
            }
            let table_path = if prefix.is_empty() {
                field_path.clone()
            } else {
                format!("{prefix}_{field_path}")
            };
            out.push((table_path.clone(), &sub.descriptor));
            walk(&sub.descriptor, &table_path, out);
        }
    }
    let mut out = Vec::new();
    walk(descriptor, "", &mut out);
    out
}

/// Open the parent sink and one sub sink per selected sub-table.
///
/// File stems carry the poll's start time in millis so successive polls
/// of the same resource never collide.
fn open_sinks(
    output_dir: &std::path::Path,
    descriptor: &ResourceDescriptor,
    sub_tables: &[(String, &ResourceDescriptor)],
) -> Result<SinkSet, CollectorError> {
    let stem = format!(
        "{}_{}",
        chrono::Utc::now().timestamp_millis(),
        descriptor.ident()
    );
    let parent = CsvSink::open(output_dir, &stem, descriptor.select.clone())?;
    let mut sinks = SinkSet::new(parent);
    for (table_path, sub_descriptor) in sub_tables {
        let sub_stem = format!("{stem}_{table_path}");
        let sink = CsvSink::open(output_dir, &sub_stem, sub_descriptor.select.clone())?;
        sinks.add_sub_sink(table_path.clone(), sink);
    }
    Ok(sinks)
}

/// Discover rate limits, then run both collector roles to completion.
pub async fn run_collectors<C: ApiClient + 'static>(
    client: Arc<C>,
    settings: Settings,
    catalog: &Catalog,
    shutdown: CancellationToken,
) -> Result<(), CollectorError> {
    let limits = client
        .rate_limits()
        .await
        .context(RateLimitDiscoverySnafu)?;
    info!(
        window_secs = limits.window_size_secs,
        segments = limits.segment_count,
        max_page_size = limits.max_page_size,
        "Discovered server rate limits"
    );
    let coordinator = Arc::new(RateLimitCoordinator::new(limits));

    let mut collectors = Vec::new();
    for role in [Role::Priority, Role::Background] {
        collectors.push(Collector::new(
            role,
            client.clone(),
            coordinator.clone(),
            settings.clone(),
            catalog,
            shutdown.clone(),
        )?);
    }

    let mut handles: JoinSet<(Role, Result<(), CollectorError>)> = JoinSet::new();
    for mut collector in collectors {
        handles.spawn(async move {
            let role = collector.role;
            let result = collector.run().await;
            (role, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = handles.join_next().await {
        match joined {
            Ok((role, Ok(()))) => info!(role = %role, "Collector finished"),
            Ok((role, Err(e))) => {
                error!(role = %role, error = %e, "Collector failed");
                // One failed role should not strand the other mid-poll.
                shutdown.cancel();
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "Collector task panicked");
                shutdown.cancel();
                first_error.get_or_insert(CollectorError::TaskJoin { source: e });
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::api::{RateLimits, RecordStream};
    use crate::catalog::{DeclaredType, FieldDef, ScalarKind};
    use crate::error::ConfigError;

    fn snapshot(name: &str) -> CollectorResource {
        CollectorResource {
            descriptor: Arc::new(ResourceDescriptor::new(name, true)),
            state: PollState::cold(),
            flattener: Flattener::new(),
        }
    }

    fn incremental(name: &str) -> CollectorResource {
        CollectorResource {
            descriptor: Arc::new(ResourceDescriptor::new(name, false)),
            state: PollState::cold(),
            flattener: Flattener::new(),
        }
    }

    fn test_limits(window_secs: f64) -> RateLimits {
        RateLimits {
            window_size_secs: window_secs,
            segment_count: 6,
            max_page_size: 1000,
            per_user_threshold: 100,
        }
    }

    /// Yields five records, 30s of fetch latency apiece, counting each
    /// pull as it starts.
    struct PagedClient {
        fetches: Arc<AtomicU64>,
    }

    #[async_trait]
    impl ApiClient for PagedClient {
        async fn rate_limits(&self) -> Result<RateLimits, TransportError> {
            Ok(test_limits(60.0))
        }

        async fn records(
            &self,
            _descriptor: &ResourceDescriptor,
            _query: &Query,
        ) -> Result<RecordStream, TransportError> {
            let fetches = self.fetches.clone();
            Ok(stream::unfold(0u32, move |n| {
                let fetches = fetches.clone();
                async move {
                    if n == 5 {
                        return None;
                    }
                    fetches.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Some((Ok(json!({"id": n})), n + 1))
                }
            })
            .boxed())
        }
    }

    #[test]
    fn test_overdue_snapshot_preempts_earlier_incremental() {
        let mut resources = vec![incremental("ClientSessions"), snapshot("Radios")];
        resources[0].state.next_poll_at = 50.0;
        resources[1].state.next_poll_at = 90.0;

        // Both overdue at t=100: the snapshot wins despite being later.
        assert_eq!(next_due(&resources, 100.0), Some(1));
        // Snapshot not yet due at t=80: earliest due wins.
        assert_eq!(next_due(&resources, 80.0), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_pull_waits_for_priority_gate() {
        let coordinator = Arc::new(RateLimitCoordinator::new(test_limits(60.0)));
        let fetches = Arc::new(AtomicU64::new(0));

        let pacer = coordinator.clone();
        let counter = fetches.clone();
        let drain = tokio::spawn(async move {
            let dir = tempfile::tempdir().unwrap();
            let descriptor = ResourceDescriptor::new("Radios", true).with_select(&["id"]);
            let sink = CsvSink::open(dir.path(), "radios", descriptor.select.clone()).unwrap();
            let mut sinks = SinkSet::new(sink);
            let mut flattener = Flattener::new();
            let mut counters = DriftCounters::new(
                descriptor.ident(),
                SamplePolicy::Disabled,
                SamplePolicy::Disabled,
                20,
            );
            let mut sub_counters = HashMap::new();
            let client = PagedClient { fetches: counter };
            consume_stream(
                &client,
                &descriptor,
                &Query::default(),
                &mut flattener,
                &mut sinks,
                &mut counters,
                &mut sub_counters,
                &[],
                Some(pacer.as_ref()),
            )
            .await
        });

        // Let the background stream get a couple of pulls in.
        tokio::time::sleep(Duration::from_secs(45)).await;
        let gate = coordinator.begin_priority().await;
        let while_held = fetches.load(Ordering::Relaxed);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(
            fetches.load(Ordering::Relaxed),
            while_held,
            "background pulled a page while the priority gate was held"
        );

        gate.release().await;
        let outcome = drain.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            StreamOutcome::Completed {
                record_count: 5,
                ..
            }
        ));
        assert_eq!(fetches.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_gate_settles_and_frees_after_hard_failure() {
        let coordinator = RateLimitCoordinator::new(test_limits(60.0));

        let started = tokio::time::Instant::now();
        let result: Result<(), CollectorError> = with_priority_gate(&coordinator, async {
            Err(CollectorError::from(ConfigError::EmptyOutputDir))
        })
        .await;
        assert!(result.is_err());
        // Both settling windows elapse on the failure path too.
        assert!(started.elapsed() >= Duration::from_secs(120));

        // The gate must be free again for the background role.
        tokio::time::timeout(Duration::from_secs(5), coordinator.background_checkpoint())
            .await
            .unwrap();
    }

    #[test]
    fn test_selected_sub_tables_chains_nested_paths() {
        let grandchild = ResourceDescriptor::new("rates", false).with_select(&["rate"]);
        let child = ResourceDescriptor::new("radios", false)
            .with_select(&["slot"])
            .with_sub_table("rates", "rate", grandchild);
        let quiet = ResourceDescriptor::new("quiet", false);
        let parent = ResourceDescriptor::new("AccessPoints", true)
            .with_field("name", FieldDef::new(DeclaredType::Scalar {
                scalar: ScalarKind::Text,
            }))
            .with_sub_table("radios", "radio", child)
            .with_sub_table("quiet", "entry", quiet);

        let mut tables: Vec<String> = selected_sub_tables(&parent)
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        tables.sort();
        assert_eq!(tables, vec!["radios".to_string(), "radios_rates".to_string()]);
    }
}

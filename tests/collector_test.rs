//! Integration tests for the collector cycle against a mock API client.
//!
//! These cover the end-to-end path: selection, polling, flattening, CSV
//! output with the rename-on-success completion signal, and checkpoint
//! persistence. Unit tests for individual components live in their
//! respective modules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use squall::api::{ApiClient, Query, RateLimits, RecordStream, TransportError};
use squall::catalog::ResourceDescriptor;
use squall::checkpoint::{CheckpointStore, PersistedState};
use squall::config::{DriftConfig, MetricsConfig, ServerConfig};
use squall::ratelimit::RateLimitCoordinator;
use squall::{Catalog, Collector, Config, Role, Settings, run_collectors};

struct MockClient {
    records: Vec<Value>,
    fail_mid_stream: bool,
}

#[async_trait]
impl ApiClient for MockClient {
    async fn rate_limits(&self) -> Result<RateLimits, TransportError> {
        Ok(limits())
    }

    async fn records(
        &self,
        descriptor: &ResourceDescriptor,
        _query: &Query,
    ) -> Result<RecordStream, TransportError> {
        let mut items: Vec<Result<Value, TransportError>> =
            self.records.iter().cloned().map(Ok).collect();
        if self.fail_mid_stream {
            items.push(Err(TransportError::Reset {
                resource: descriptor.name.clone(),
            }));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

fn limits() -> RateLimits {
    RateLimits {
        window_size_secs: 0.0,
        segment_count: 6,
        max_page_size: 1000,
        per_user_threshold: 100,
    }
}

fn test_config(dir: &Path) -> Config {
    let config = Config {
        server: ServerConfig {
            base_url: "https://prime.example.edu/webacs/api".to_string(),
            username: "collector".to_string(),
            password: "secret".to_string(),
            timeout_secs: 5,
        },
        output_dir: dir.join("out"),
        state_dir: Some(dir.join("state")),
        catalog: dir.join("catalog.yaml"),
        priority: Vec::new(),
        background: vec!["ClientSessions".to_string()],
        drift: DriftConfig::default(),
        batch_scale: 1.0,
        metrics: MetricsConfig::default(),
    };
    std::fs::create_dir_all(&config.output_dir).unwrap();
    std::fs::create_dir_all(config.state_dir()).unwrap();
    config
}

fn test_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.insert(
        ResourceDescriptor::new("ClientSessions", false)
            .with_time_field("eventTime")
            .with_key_fields(&["id"])
            .with_select(&["id", "ssid"])
            .with_poll_period(3600.0),
    );
    catalog
}

/// Two session records half an hour apart, ending now (epoch millis).
fn session_records() -> Vec<Value> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    vec![
        json!({"id": 7, "ssid": "eduroam", "eventTime": now_ms - 1_800_000}),
        json!({"id": 9, "ssid": "guest", "eventTime": now_ms}),
    ]
}

fn output_names(config: &Config) -> Vec<String> {
    std::fs::read_dir(&config.output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect()
}

fn background_collector(
    config: Config,
    client: MockClient,
    reset: bool,
    single: bool,
) -> Collector<MockClient> {
    let mut settings = Settings::new(config);
    settings.reset = reset;
    settings.single = single;
    let coordinator = Arc::new(RateLimitCoordinator::new(limits()));
    Collector::new(
        Role::Background,
        Arc::new(client),
        coordinator,
        settings,
        &test_catalog(),
        CancellationToken::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_single_cycle_writes_csv_and_skips_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut settings = Settings::new(config.clone());
    settings.single = true;

    let client = Arc::new(MockClient {
        records: session_records(),
        fail_mid_stream: false,
    });
    run_collectors(client, settings, &test_catalog(), CancellationToken::new())
        .await
        .unwrap();

    let names = output_names(&config);
    let finalized: Vec<_> = names
        .iter()
        .filter(|n| n.ends_with("_ClientSessions.csv"))
        .collect();
    assert_eq!(finalized.len(), 1, "expected one finalized file: {names:?}");
    assert!(!names.iter().any(|n| n.ends_with(".part")));

    let contents = std::fs::read_to_string(config.output_dir.join(finalized[0])).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines[0], "id,ssid");
    assert_eq!(lines.len(), 3);

    // Single mode never touches saved state.
    assert!(!config.state_dir().join("background.json").exists());
}

#[tokio::test]
async fn test_successful_poll_advances_state_and_persists() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let client = MockClient {
        records: session_records(),
        fail_mid_stream: false,
    };
    let mut collector = background_collector(config.clone(), client, false, false);
    collector.run_once().await.unwrap();

    let now = squall::timeutil::now_secs();
    let state = collector.poll_state("ClientSessions").unwrap();
    assert!(state.records_per_hour > 0.0);
    // Cursor advanced to the latest event time, which is roughly now.
    assert!(state.min_time_cursor > now - 10.0);
    assert!(state.max_time_seen >= state.min_time_cursor);
    // Next poll one period out from the poll start.
    assert!(state.next_poll_at > now + 3000.0);
    assert!(state.next_poll_at < now + 4000.0);

    let saved = CheckpointStore::for_role(config.state_dir(), "background").load();
    assert_eq!(
        saved.get("ClientSessions").unwrap().records_per_hour,
        state.records_per_hour
    );
}

#[tokio::test]
async fn test_transport_fault_backs_off_without_touching_rate() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let t0 = squall::timeutil::now_secs() - 7200.0;
    let mut saved = HashMap::new();
    saved.insert(
        "ClientSessions".to_string(),
        PersistedState {
            last_cursor_id: 0,
            min_time_cursor: t0,
            max_time_seen: t0,
            next_poll_at: 0.0,
            records_per_hour: 120.0,
            poll_started_at: 0.0,
        },
    );
    CheckpointStore::for_role(config.state_dir(), "background")
        .save(&saved)
        .unwrap();

    let client = MockClient {
        records: session_records(),
        fail_mid_stream: true,
    };
    let mut collector = background_collector(config.clone(), client, false, false);
    collector.run_once().await.unwrap();

    let now = squall::timeutil::now_secs();
    let state = collector.poll_state("ClientSessions").unwrap();
    // The learned rate and cursors survive a failed batch untouched; only
    // the schedule moves, four hours out.
    assert_eq!(state.records_per_hour, 120.0);
    assert_eq!(state.min_time_cursor, t0);
    assert!(state.next_poll_at > now + 4.0 * 3600.0 - 10.0);
    assert!(state.next_poll_at < now + 4.0 * 3600.0 + 10.0);

    // The provisional file is left un-renamed.
    let names = output_names(&config);
    assert!(names.iter().any(|n| n.ends_with(".part")), "{names:?}");
    assert!(!names.iter().any(|n| n.ends_with(".csv")));
}

#[tokio::test(start_paused = true)]
async fn test_single_cycle_polls_immediately_when_not_due() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    // The saved schedule puts the resource an hour out.
    let mut saved = HashMap::new();
    saved.insert(
        "ClientSessions".to_string(),
        PersistedState {
            next_poll_at: squall::timeutil::now_secs() + 3600.0,
            ..Default::default()
        },
    );
    CheckpointStore::for_role(config.state_dir(), "background")
        .save(&saved)
        .unwrap();

    let client = MockClient {
        records: session_records(),
        fail_mid_stream: false,
    };
    let mut collector = background_collector(config.clone(), client, false, true);

    let started = tokio::time::Instant::now();
    collector.run().await.unwrap();

    // No waiting out the schedule in single mode.
    assert!(
        started.elapsed() < std::time::Duration::from_secs(60),
        "single cycle slept until the resource came due"
    );
    let names = output_names(&config);
    assert!(
        names.iter().any(|n| n.ends_with("_ClientSessions.csv")),
        "{names:?}"
    );
}

#[tokio::test]
async fn test_reset_ignores_saved_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let mut saved = HashMap::new();
    saved.insert(
        "ClientSessions".to_string(),
        PersistedState {
            records_per_hour: 120.0,
            next_poll_at: 9.0e9,
            ..Default::default()
        },
    );
    CheckpointStore::for_role(config.state_dir(), "background")
        .save(&saved)
        .unwrap();

    let client = MockClient {
        records: Vec::new(),
        fail_mid_stream: false,
    };
    let collector = background_collector(config, client, true, false);

    let state = collector.poll_state("ClientSessions").unwrap();
    assert_eq!(state.records_per_hour, 0.0);
    assert_eq!(state.next_poll_at, 0.0);
}

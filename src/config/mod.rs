//! Configuration for the squall collector.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::drift::{DEFAULT_SAMPLE_STRIDE, SamplePolicy};
use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Upstream API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the API, e.g. "https://ncs01.example.edu/webacs/api".
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Request timeout in seconds. Session resources are slow to page.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    180
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Drift-sampling policy, independently configurable per category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Policy for runtime-type checking.
    #[serde(default)]
    pub types: SamplePolicy,
    /// Policy for enumeration-value checking.
    #[serde(default)]
    pub enums: SamplePolicy,
    /// Stride for the periodic policy: every Nth record.
    #[serde(default = "default_stride")]
    pub stride: u32,
}

fn default_stride() -> u32 {
    DEFAULT_SAMPLE_STRIDE
}

// An absent `drift:` section must behave like an empty one, so the
// defaults here stay in lockstep with the serde field defaults.
impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            types: SamplePolicy::default(),
            enums: SamplePolicy::default(),
            stride: DEFAULT_SAMPLE_STRIDE,
        }
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

/// Main configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Directory receiving output CSV files.
    pub output_dir: PathBuf,
    /// Directory holding per-role checkpoint files. Defaults to the
    /// output directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Path to the schema-catalog YAML file.
    pub catalog: PathBuf,
    /// Resources polled by the priority collector.
    #[serde(default)]
    pub priority: Vec<String>,
    /// Resources polled by the background collector.
    #[serde(default)]
    pub background: Vec<String>,
    #[serde(default)]
    pub drift: DriftConfig,
    /// Target batch-size scaling factor applied to every request window.
    #[serde(default = "default_batch_scale")]
    pub batch_scale: f64,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_batch_scale() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputDir);
        }
        if self.priority.is_empty() && self.background.is_empty() {
            return Err(ConfigError::NoResources);
        }
        if self.batch_scale <= 0.0 {
            return Err(ConfigError::InvalidBatchScale {
                value: self.batch_scale,
            });
        }
        Ok(())
    }

    /// Checkpoint directory, defaulting to the output directory.
    pub fn state_dir(&self) -> &std::path::Path {
        self.state_dir.as_deref().unwrap_or(&self.output_dir)
    }
}

/// Runtime settings: the file configuration plus the CLI surface.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    /// Perform exactly one selection-and-poll, then exit without
    /// persisting checkpoint state.
    pub single: bool,
    /// Skip loading saved state; start every resource cold.
    pub reset: bool,
    /// Restrict collection to these resource names (empty = all).
    pub include: Vec<String>,
    /// Resource names excluded from collection.
    pub exclude: Vec<String>,
}

impl Settings {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            single: false,
            reset: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Whether a resource participates in collection under the
    /// include/exclude filters.
    pub fn wants(&self, name: &str) -> bool {
        if self.exclude.iter().any(|n| n == name) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  base_url: https://ncs01.example.edu/webacs/api
  username: collector
  password: hunter2
output_dir: ./files
catalog: ./catalog.yaml
background: [ClientSessions]
"#;

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.server.timeout_secs, 180);
        assert_eq!(config.batch_scale, 1.0);
        assert_eq!(config.drift.stride, DEFAULT_SAMPLE_STRIDE);
        assert_eq!(config.drift.types, SamplePolicy::Disabled);
        assert_eq!(DriftConfig::default().stride, DEFAULT_SAMPLE_STRIDE);
        assert_eq!(config.metrics.address, "0.0.0.0:9090");
        assert_eq!(config.state_dir(), config.output_dir.as_path());
    }

    #[test]
    fn test_no_resources_rejected() {
        let contents = MINIMAL.replace("background: [ClientSessions]", "");
        assert!(matches!(
            Config::parse(&contents),
            Err(ConfigError::NoResources)
        ));
    }

    #[test]
    fn test_bad_batch_scale_rejected() {
        let contents = format!("{MINIMAL}batch_scale: -1.0\n");
        assert!(matches!(
            Config::parse(&contents),
            Err(ConfigError::InvalidBatchScale { .. })
        ));
    }

    #[test]
    fn test_settings_include_exclude_filters() {
        let mut settings = Settings::new(Config::parse(MINIMAL).unwrap());
        assert!(settings.wants("ClientSessions"));

        settings.exclude.push("ClientSessions".to_string());
        assert!(!settings.wants("ClientSessions"));

        settings.include.push("Radios".to_string());
        assert!(settings.wants("Radios"));
        assert!(!settings.wants("Devices"));
    }
}

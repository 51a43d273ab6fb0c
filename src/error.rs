//! Error types for the squall collector.

use snafu::prelude::*;

pub use crate::api::TransportError;

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Output directory is empty.
    #[snafu(display("Output directory cannot be empty"))]
    EmptyOutputDir,

    /// No resources assigned to either collector role.
    #[snafu(display("No resources configured for collection"))]
    NoResources,

    /// Batch scale factor is not positive.
    #[snafu(display("Batch scale must be positive, got {value}"))]
    InvalidBatchScale { value: f64 },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

/// Errors that can occur loading the schema catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Failed to read the catalog file.
    #[snafu(display("Failed to read catalog file {path}"))]
    CatalogRead {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse the catalog file.
    #[snafu(display("Failed to parse catalog file {path}"))]
    CatalogParse {
        path: String,
        source: serde_yaml::Error,
    },

    /// A configured resource has no catalog entry.
    #[snafu(display("Resource {name} is not defined in the catalog"))]
    UnknownResource { name: String },
}

/// Errors that can occur during checkpoint persistence.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Failed to write the checkpoint temp file.
    #[snafu(display("Failed to write checkpoint {path}"))]
    CheckpointWrite {
        path: String,
        source: std::io::Error,
    },

    /// Failed to rename the temp file over the checkpoint.
    #[snafu(display("Failed to commit checkpoint {path}"))]
    CheckpointRename {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize checkpoint state.
    #[snafu(display("Failed to serialize checkpoint state"))]
    CheckpointSerialize { source: serde_json::Error },
}

/// Errors that can occur writing CSV output.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Failed to create the provisional output file.
    #[snafu(display("Failed to create output file {path}"))]
    SinkCreate {
        path: String,
        source: std::io::Error,
    },

    /// Failed to write a row, even after lossy re-encoding.
    #[snafu(display("Failed to write row to {path}"))]
    SinkWrite { path: String, source: csv::Error },

    /// Failed to flush buffered rows.
    #[snafu(display("Failed to flush output file {path}"))]
    SinkFlush {
        path: String,
        source: std::io::Error,
    },

    /// Failed to rename the provisional file to its final name.
    #[snafu(display("Failed to finalize output file {path}"))]
    SinkRename {
        path: String,
        source: std::io::Error,
    },
}

/// Errors raised while flattening a single record.
///
/// These abort processing of the offending record only; the resource poll
/// continues with the next record.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FlattenError {
    /// The record (or a sub-table element) is not a JSON object.
    #[snafu(display("Expected an object at {path}"))]
    NotAnObject { path: String },

    /// A declared sub-table node is missing its inner list key.
    #[snafu(display("Sub-table {path} does not have a {inner_key} element"))]
    MissingInnerKey { path: String, inner_key: String },

    /// A declared sub-table's inner element is not a list.
    #[snafu(display("Sub-table {path}[{inner_key}] is not a list"))]
    NotAList { path: String, inner_key: String },

    /// The parent row is missing a primary-key value to copy into children.
    #[snafu(display("Cannot copy missing key {key} into sub-table {path}"))]
    MissingParentKey { key: String, path: String },
}

/// Top-level collector errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CollectorError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Catalog error.
    #[snafu(display("Catalog error: {source}"))]
    Catalog { source: CatalogError },

    /// Rate-limit discovery failed; the collector cannot proceed without
    /// known rate parameters.
    #[snafu(display("Rate-limit discovery failed: {source}"))]
    RateLimitDiscovery { source: TransportError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Sink error.
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Failed to start the metrics exporter.
    #[snafu(display("Failed to start metrics exporter: {source}"))]
    MetricsInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

impl From<ConfigError> for CollectorError {
    fn from(source: ConfigError) -> Self {
        CollectorError::Config { source }
    }
}

impl From<CatalogError> for CollectorError {
    fn from(source: CatalogError) -> Self {
        CollectorError::Catalog { source }
    }
}

impl From<CheckpointError> for CollectorError {
    fn from(source: CheckpointError) -> Self {
        CollectorError::Checkpoint { source }
    }
}

impl From<SinkError> for CollectorError {
    fn from(source: SinkError) -> Self {
        CollectorError::Sink { source }
    }
}

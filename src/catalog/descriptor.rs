//! Resource descriptors: the declared shape of one pollable API resource.
//!
//! A descriptor carries everything the collector needs to know about a
//! resource up front: whether a poll is a full snapshot or an incremental
//! batch, where event time lives, the primary keys, the declared type of
//! every field path, the declared sub-tables, and which field paths are
//! selected for output. Field paths are underscore-joined, matching the
//! flattened column names.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Kinds of scalar values a field can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Text,
    Integer,
    Float,
    Boolean,
}

/// Declared type of a field path, resolved once at catalog load.
///
/// This is the single dispatch point for per-field behavior in flattening
/// and drift checking; no further runtime type inspection happens past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclaredType {
    /// A plain scalar of the given kind.
    Scalar { scalar: ScalarKind },
    /// An enumeration with a closed set of allowed text values.
    Enumeration { values: BTreeSet<String> },
    /// A timestamp whose UTC offset suffix must be corrected on output.
    CorrectedTimestamp,
    /// A list passed through verbatim as one value (not a sub-table).
    Array,
}

/// Declared definition of a single field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(flatten)]
    pub declared: DeclaredType,
    /// Whether drift in this field escalates to an error.
    #[serde(default = "default_check")]
    pub check: bool,
}

fn default_check() -> bool {
    true
}

impl FieldDef {
    pub fn new(declared: DeclaredType) -> Self {
        Self {
            declared,
            check: true,
        }
    }

    pub fn unchecked(declared: DeclaredType) -> Self {
        Self {
            declared,
            check: false,
        }
    }
}

/// A declared nested table under a field path.
///
/// The node in the data is `{inner_key: [elements]}`; each element becomes
/// one row in the sub-table's own output, never in the parent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTableDef {
    /// Key of the list inside the sub-table node.
    pub inner_key: String,
    /// Descriptor for the rows of this sub-table.
    pub descriptor: ResourceDescriptor,
}

/// The declared shape of one pollable resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource name, as known to the API server.
    pub name: String,
    /// API version; "v1" is elided from output file names.
    #[serde(default = "default_version")]
    pub version: String,
    /// True when each poll returns the complete current entity set.
    #[serde(default)]
    pub is_snapshot: bool,
    /// Name of the record's event-time attribute in flattened form.
    #[serde(default)]
    pub time_field: Option<String>,
    /// Max acceptable gap in seconds between now and the batch's time span
    /// before the batch is judged stale.
    #[serde(default = "default_rollup_tolerance")]
    pub rollup_tolerance_secs: f64,
    /// Base polling cadence in seconds.
    #[serde(default = "default_poll_period")]
    pub poll_period_secs: f64,
    /// Primary-key field paths, copied into every sub-table row.
    #[serde(default)]
    pub key_fields: Vec<String>,
    /// Declared type per field path.
    #[serde(default)]
    pub fields: HashMap<String, FieldDef>,
    /// Declared sub-tables per field path.
    #[serde(default)]
    pub sub_tables: HashMap<String, SubTableDef>,
    /// Output-selected field paths, in CSV column order.
    #[serde(default)]
    pub select: Vec<String>,
    /// Re-read all records (zero the time cursor) on the daily forced
    /// schema check, for resources that only report updated entities.
    #[serde(default)]
    pub full_refresh_on_check: bool,
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_rollup_tolerance() -> f64 {
    3600.0
}

fn default_poll_period() -> f64 {
    3600.0
}

impl ResourceDescriptor {
    /// Create a descriptor with defaults; builder methods fill the rest.
    pub fn new(name: impl Into<String>, is_snapshot: bool) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            is_snapshot,
            time_field: None,
            rollup_tolerance_secs: default_rollup_tolerance(),
            poll_period_secs: default_poll_period(),
            key_fields: Vec::new(),
            fields: HashMap::new(),
            sub_tables: HashMap::new(),
            select: Vec::new(),
            full_refresh_on_check: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = Some(field.into());
        self
    }

    pub fn with_rollup_tolerance(mut self, secs: f64) -> Self {
        self.rollup_tolerance_secs = secs;
        self
    }

    pub fn with_poll_period(mut self, secs: f64) -> Self {
        self.poll_period_secs = secs;
        self
    }

    pub fn with_key_fields(mut self, keys: &[&str]) -> Self {
        self.key_fields = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_field(mut self, path: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(path.into(), def);
        self
    }

    pub fn with_sub_table(
        mut self,
        path: impl Into<String>,
        inner_key: impl Into<String>,
        descriptor: ResourceDescriptor,
    ) -> Self {
        self.sub_tables.insert(
            path.into(),
            SubTableDef {
                inner_key: inner_key.into(),
                descriptor,
            },
        );
        self
    }

    pub fn with_select(mut self, paths: &[&str]) -> Self {
        self.select = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Identifier used in file names and checkpoint keys.
    ///
    /// "v1" is elided, matching historical output naming.
    pub fn ident(&self) -> String {
        if self.version == "v1" {
            self.name.clone()
        } else {
            format!("{}{}", self.name, self.version)
        }
    }

    /// Whether the path is selected for output.
    pub fn is_selected(&self, path: &str) -> bool {
        self.select.iter().any(|s| s == path)
    }

    /// Whether anything beyond the key fields is selected.
    ///
    /// A sub-table whose selection is only the copied parent keys has
    /// nothing of its own to output, so no sink is opened for it.
    pub fn has_selected_output(&self) -> bool {
        self.select.iter().any(|s| !self.key_fields.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_elides_v1() {
        let desc = ResourceDescriptor::new("ClientSessions", false);
        assert_eq!(desc.ident(), "ClientSessions");

        let desc = desc.with_version("v4");
        assert_eq!(desc.ident(), "ClientSessionsv4");
    }

    #[test]
    fn test_has_selected_output_keys_only() {
        let desc = ResourceDescriptor::new("Radios", true)
            .with_key_fields(&["mac"])
            .with_select(&["mac"]);
        assert!(!desc.has_selected_output());

        let desc = desc.with_select(&["mac", "slot"]);
        assert!(desc.has_selected_output());
    }

    #[test]
    fn test_declared_type_yaml_round_trip() {
        let def = FieldDef::new(DeclaredType::Enumeration {
            values: ["UP", "DOWN"].iter().map(|s| s.to_string()).collect(),
        });
        let yaml = serde_yaml::to_string(&def).unwrap();
        let restored: FieldDef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, def);
        assert!(restored.check);
    }
}

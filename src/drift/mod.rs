//! Schema-drift sampling and reporting.
//!
//! Observes a configurable sample of flattened records and reports
//! field/type/enumeration mismatches against the declared schema at the
//! end of each poll cycle. Drift never blocks data flow; the report is
//! routed to error-level logging only when it contains a hard type/enum
//! violation or an unexpected field marked check-worthy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{DeclaredType, ResourceDescriptor, ScalarKind};
use crate::flatten::FlatRow;

/// Default stride for periodic sampling: every Nth record.
pub const DEFAULT_SAMPLE_STRIDE: u32 = 20;

/// How often a forced full pass runs regardless of policy, in seconds.
pub const FORCED_CHECK_INTERVAL_SECS: f64 = 24.0 * 3600.0;

/// Sampling policy for one checking category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplePolicy {
    /// Never sample.
    #[default]
    Disabled,
    /// Sample every Nth record (the configured stride).
    Periodic,
    /// Sample every record.
    Always,
}

impl SamplePolicy {
    /// Initial countdown value; negative disables the counter.
    fn countdown(self, stride: u32) -> i64 {
        match self {
            SamplePolicy::Disabled => -1,
            SamplePolicy::Periodic => i64::from(stride.max(1)),
            SamplePolicy::Always => 1,
        }
    }
}

/// Runtime kind of an observed JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Integer,
    Float,
    Text,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueKind::Integer,
            Value::Number(_) => ValueKind::Float,
            Value::String(_) => ValueKind::Text,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }

    /// Whether this runtime kind satisfies the declared type.
    fn matches(self, declared: &DeclaredType) -> bool {
        match declared {
            DeclaredType::Scalar { scalar } => match scalar {
                ScalarKind::Text => self == ValueKind::Text,
                ScalarKind::Integer => self == ValueKind::Integer,
                // Integral JSON numbers are acceptable floats
                ScalarKind::Float => matches!(self, ValueKind::Float | ValueKind::Integer),
                ScalarKind::Boolean => self == ValueKind::Boolean,
            },
            DeclaredType::Enumeration { .. } | DeclaredType::CorrectedTimestamp => {
                self == ValueKind::Text
            }
            DeclaredType::Array => self == ValueKind::Array,
        }
    }
}

/// Per-cycle drift counters for one table or sub-table.
///
/// Rebuilt each poll cycle that samples; observing counts runtime kinds by
/// field and values by enumeration field, at the configured stride.
#[derive(Debug)]
pub struct DriftCounters {
    table_name: String,
    types_countdown: i64,
    types_stride: i64,
    enums_countdown: i64,
    enums_stride: i64,
    field_kinds: HashMap<String, HashMap<ValueKind, u64>>,
    enum_values: HashMap<String, HashMap<String, u64>>,
}

impl DriftCounters {
    pub fn new(
        table_name: impl Into<String>,
        types: SamplePolicy,
        enums: SamplePolicy,
        stride: u32,
    ) -> Self {
        let types_stride = types.countdown(stride);
        let enums_stride = enums.countdown(stride);
        Self {
            table_name: table_name.into(),
            types_countdown: types_stride,
            types_stride,
            enums_countdown: enums_stride,
            enums_stride,
            field_kinds: HashMap::new(),
            enum_values: HashMap::new(),
        }
    }

    /// Whether either category samples at all this cycle.
    pub fn enabled(&self) -> bool {
        self.types_stride > 0 || self.enums_stride > 0
    }

    /// Sample one flattened record per the countdown in each category.
    pub fn observe(&mut self, row: &FlatRow, descriptor: &ResourceDescriptor) {
        self.enums_countdown -= 1;
        self.types_countdown -= 1;

        if self.enums_countdown == 0 {
            for (field, value) in row {
                let declared = descriptor.fields.get(field).map(|f| &f.declared);
                if matches!(declared, Some(DeclaredType::Enumeration { .. })) {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    *self
                        .enum_values
                        .entry(field.clone())
                        .or_default()
                        .entry(text)
                        .or_insert(0) += 1;
                }
            }
            self.enums_countdown = self.enums_stride;
        }

        if self.types_countdown == 0 {
            for (field, value) in row {
                *self
                    .field_kinds
                    .entry(field.clone())
                    .or_default()
                    .entry(ValueKind::of(value))
                    .or_insert(0) += 1;
            }
            self.types_countdown = self.types_stride;
        }
    }

    /// Compare everything observed this cycle against the declared schema.
    ///
    /// Returns `(has_error, report)`; an empty report means nothing to say.
    pub fn report(&self, descriptor: &ResourceDescriptor) -> (bool, String) {
        let mut error = false;
        let mut lines = String::new();

        if !descriptor.has_selected_output() {
            return (false, lines);
        }

        // Every selected field must be present, correctly typed, and (for
        // enumerations) within the declared value set.
        for field in &descriptor.select {
            let declared = descriptor.fields.get(field).map(|f| &f.declared);

            match self.field_kinds.get(field) {
                Some(kinds) => {
                    if let Some(declared) = declared {
                        let mismatched: Vec<String> = kinds
                            .iter()
                            .filter(|(kind, _)| !kind.matches(declared))
                            .map(|(kind, count)| format!("{count} {}", kind.name()))
                            .collect();
                        if !mismatched.is_empty() {
                            error = true;
                            lines.push_str(&format!(
                                "{}.{field} has {}\n",
                                self.table_name,
                                mismatched.join(", ")
                            ));
                        }
                    }
                }
                None if self.types_stride > 0 => {
                    lines.push_str(&format!("{}.{field} has no data\n", self.table_name));
                }
                None => {}
            }

            if let (Some(DeclaredType::Enumeration { values }), Some(observed)) =
                (declared, self.enum_values.get(field))
            {
                let outside: Vec<String> = observed
                    .iter()
                    .filter(|(value, _)| !values.contains(*value))
                    .map(|(value, count)| format!("{count} {value}"))
                    .collect();
                if !outside.is_empty() {
                    error = true;
                    lines.push_str(&format!(
                        "{}.{field} has {}\n",
                        self.table_name,
                        outside.join(", ")
                    ));
                }
            }
        }

        // Fields present in data but not selected: unexpected. An error
        // only when the catalog marks the field check-worthy (unknown
        // fields are always check-worthy).
        for (field, kinds) in &self.field_kinds {
            if descriptor.is_selected(field) {
                continue;
            }
            let (known, check) = match descriptor.fields.get(field) {
                Some(def) => (true, def.check),
                None => (false, true),
            };
            error = error || check;
            let counts: Vec<String> = kinds
                .iter()
                .map(|(kind, count)| format!("{count} {}", kind.name()))
                .collect();
            lines.push_str(&format!(
                "{} {} field {field} has {}\n",
                self.table_name,
                if known { "unselected" } else { "unknown" },
                counts.join(", ")
            ));
        }

        (error, lines)
    }
}

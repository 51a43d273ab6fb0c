//! Record flattening and sub-table emission.
//!
//! Turns one nested API record into a flat row keyed by underscore-joined
//! field paths, plus zero or more sub-table rows. Each tree node takes two
//! passes: a scalar pass copies leaf values (applying declared per-field
//! corrections), then a structural pass recurses into compound structures
//! and declared sub-tables. Sub-table rows carry the parent's primary-key
//! values, are flattened into their own fresh result, and never contribute
//! to the parent's flat row.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::error;

use crate::catalog::{DeclaredType, ResourceDescriptor};
use crate::error::FlattenError;
use crate::timeutil::fix_utc_offset;

/// One flat output row: field path to scalar (or passthrough array) value.
pub type FlatRow = HashMap<String, Value>;

/// A row emitted for a declared sub-table.
#[derive(Debug)]
pub struct SubRow {
    /// Sub-table path, chained with underscores for nested sub-tables;
    /// names the sub-table's output sink.
    pub table_path: String,
    pub row: FlatRow,
    /// Whether at least one of the sub-table's selected fields is present.
    /// Rows without any selected field are sampled for drift but not
    /// written.
    pub has_selected: bool,
}

/// Result of flattening one record.
#[derive(Debug)]
pub struct Flattened {
    pub row: FlatRow,
    pub sub_rows: Vec<SubRow>,
}

/// Flattener for one resource, alive for the process lifetime.
///
/// Tracks which undeclared list fields have already been reported so a
/// schema-definition gap alerts once, not once per record.
#[derive(Debug, Default)]
pub struct Flattener {
    registered_arrays: HashSet<String>,
}

impl Flattener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten one record tree.
    ///
    /// A structural fault (malformed sub-table node, missing parent key)
    /// aborts this record only.
    pub fn flatten(
        &mut self,
        record: &Value,
        descriptor: &ResourceDescriptor,
    ) -> Result<Flattened, FlattenError> {
        let tree = record.as_object().ok_or_else(|| FlattenError::NotAnObject {
            path: descriptor.name.clone(),
        })?;

        let mut row = FlatRow::new();
        let mut sub_rows = Vec::new();
        self.walk(tree, descriptor, "", "", &mut row, &mut sub_rows)?;
        Ok(Flattened { row, sub_rows })
    }

    fn walk(
        &mut self,
        tree: &Map<String, Value>,
        descriptor: &ResourceDescriptor,
        path: &str,
        table_prefix: &str,
        row: &mut FlatRow,
        sub_rows: &mut Vec<SubRow>,
    ) -> Result<(), FlattenError> {
        // First pass: simple elements, because one might be a key the
        // second pass copies into sub-table rows.
        for (key, value) in tree {
            let field_path = join_path(path, key);
            if descriptor.sub_tables.contains_key(&field_path) || value.is_object() {
                continue;
            }
            if value.is_array() {
                self.passthrough_array(descriptor, path, &field_path, value, row);
                continue;
            }
            match descriptor.fields.get(&field_path).map(|f| &f.declared) {
                Some(DeclaredType::CorrectedTimestamp) => {
                    let corrected = match value.as_str() {
                        Some(s) => Value::String(fix_utc_offset(s)),
                        None => value.clone(),
                    };
                    row.insert(field_path, corrected);
                }
                _ => {
                    row.insert(field_path, value.clone());
                }
            }
        }

        // Second pass: sub-tables and compound elements.
        for (key, value) in tree {
            let field_path = join_path(path, key);
            if let Some(sub) = descriptor.sub_tables.get(&field_path) {
                if !sub.descriptor.has_selected_output() {
                    continue;
                }
                self.emit_sub_table(
                    &field_path,
                    sub.inner_key.as_str(),
                    &sub.descriptor,
                    descriptor,
                    value,
                    table_prefix,
                    row,
                    sub_rows,
                )?;
            } else if let Some(compound) = value.as_object() {
                self.walk(compound, descriptor, &field_path, table_prefix, row, sub_rows)?;
            }
        }
        Ok(())
    }

    /// Lists are either a declared array (passed through verbatim under the
    /// parent path) or a schema-definition gap: reported once, then treated
    /// permissively so the data still flows to output.
    fn passthrough_array(
        &mut self,
        descriptor: &ResourceDescriptor,
        path: &str,
        field_path: &str,
        value: &Value,
        row: &mut FlatRow,
    ) {
        let parent_declared_array = matches!(
            descriptor.fields.get(path).map(|f| &f.declared),
            Some(DeclaredType::Array)
        );
        let out_path = if path.is_empty() { field_path } else { path };
        if !parent_declared_array && self.registered_arrays.insert(out_path.to_string()) {
            error!(
                resource = %descriptor.name,
                field = out_path,
                "Undefined array field, registering permissively"
            );
        }
        row.insert(out_path.to_string(), value.clone());
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_sub_table(
        &mut self,
        field_path: &str,
        inner_key: &str,
        sub_descriptor: &ResourceDescriptor,
        parent_descriptor: &ResourceDescriptor,
        node: &Value,
        table_prefix: &str,
        parent_row: &FlatRow,
        sub_rows: &mut Vec<SubRow>,
    ) -> Result<(), FlattenError> {
        // The node shape is {inner_key: [elements]}
        let inner = node
            .get(inner_key)
            .ok_or_else(|| FlattenError::MissingInnerKey {
                path: field_path.to_string(),
                inner_key: inner_key.to_string(),
            })?;
        let elements = inner.as_array().ok_or_else(|| FlattenError::NotAList {
            path: field_path.to_string(),
            inner_key: inner_key.to_string(),
        })?;

        let table_path = join_under(table_prefix, field_path);

        for element in elements {
            let mut element = element
                .as_object()
                .ok_or_else(|| FlattenError::NotAnObject {
                    path: table_path.clone(),
                })?
                .clone();

            // Copy the parent's primary keys so each sub-table row can be
            // correlated back to its parent independently.
            for key in &parent_descriptor.key_fields {
                let value =
                    parent_row
                        .get(key)
                        .ok_or_else(|| FlattenError::MissingParentKey {
                            key: key.clone(),
                            path: table_path.clone(),
                        })?;
                element.insert(key.clone(), value.clone());
            }

            let mut row = FlatRow::new();
            self.walk(&element, sub_descriptor, "", &table_path, &mut row, sub_rows)?;

            let has_selected = sub_descriptor
                .select
                .iter()
                .any(|field| row.contains_key(field));
            sub_rows.push(SubRow {
                table_path: table_path.clone(),
                row,
                has_selected,
            });
        }
        Ok(())
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}_{key}")
    }
}

fn join_under(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}_{path}")
    }
}

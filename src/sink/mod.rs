//! CSV output sinks.
//!
//! One appendable, header-then-rows CSV file per resource (and per
//! sub-table), named by a timestamp-prefixed resource identifier. Rows are
//! written to a provisional `.part` file; only a successful, complete poll
//! cycle renames it to `.csv`. The rename is the completion signal
//! downstream consumers rely on — a transport fault leaves the `.part`
//! file behind, visibly excluded from consumption.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::Value;
use snafu::ResultExt;
use tracing::warn;

use crate::error::{SinkCreateSnafu, SinkError, SinkFlushSnafu, SinkRenameSnafu, SinkWriteSnafu};
use crate::flatten::FlatRow;

/// Provisional extension while a poll cycle is in flight.
const PART_EXT: &str = "part";
/// Final extension applied on successful completion.
const FINAL_EXT: &str = "csv";

/// One CSV output file, provisional until finalized.
pub struct CsvSink {
    part_path: PathBuf,
    final_path: PathBuf,
    writer: csv::Writer<File>,
    columns: Vec<String>,
    rows_written: u64,
}

impl CsvSink {
    /// Open the provisional file and write the header row.
    ///
    /// Columns are the resource's selected field paths, in declared order.
    pub fn open(dir: &Path, file_stem: &str, columns: Vec<String>) -> Result<Self, SinkError> {
        let part_path = dir.join(format!("{file_stem}.{PART_EXT}"));
        let final_path = dir.join(format!("{file_stem}.{FINAL_EXT}"));

        let file = File::create(&part_path).context(SinkCreateSnafu {
            path: part_path.display().to_string(),
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&columns).context(SinkWriteSnafu {
            path: part_path.display().to_string(),
        })?;

        Ok(Self {
            part_path,
            final_path,
            writer,
            columns,
            rows_written: 0,
        })
    }

    /// Write one flattened row, in column order; absent fields are empty.
    ///
    /// On an encoding fault the row is retried once with backslash-escaped
    /// text (lossy for the bytes, lossless for the structure), then the
    /// error propagates.
    pub fn write_row(&mut self, row: &FlatRow) -> Result<(), SinkError> {
        let fields: Vec<String> = self
            .columns
            .iter()
            .map(|column| row.get(column).map(render_field).unwrap_or_default())
            .collect();

        if let Err(e) = self.writer.write_record(&fields) {
            warn!(
                path = %self.part_path.display(),
                error = %e,
                "Row write failed, retrying with escaped text"
            );
            let escaped: Vec<String> = fields.iter().map(|f| escape_lossy(f)).collect();
            self.writer.write_record(&escaped).context(SinkWriteSnafu {
                path: self.part_path.display().to_string(),
            })?;
        }
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush and rename the provisional file to its final name.
    pub fn finalize(mut self) -> Result<PathBuf, SinkError> {
        self.writer.flush().context(SinkFlushSnafu {
            path: self.part_path.display().to_string(),
        })?;
        std::fs::rename(&self.part_path, &self.final_path).context(SinkRenameSnafu {
            path: self.final_path.display().to_string(),
        })?;
        Ok(self.final_path)
    }

    /// Flush and close, leaving the provisional name in place.
    pub fn abandon(mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(
                path = %self.part_path.display(),
                error = %e,
                "Failed flushing abandoned output file"
            );
        }
    }
}

/// Render one value as a CSV field. Compound values stay embedded JSON.
fn render_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        compound => compound.to_string(),
    }
}

fn escape_lossy(field: &str) -> String {
    field
        .chars()
        .flat_map(|c| {
            if c.is_ascii() {
                vec![c]
            } else {
                c.escape_default().collect()
            }
        })
        .collect()
}

/// The open sinks for one poll cycle: the resource's own file plus one per
/// sub-table with selected output.
pub struct SinkSet {
    parent: CsvSink,
    sub_sinks: HashMap<String, CsvSink>,
}

impl SinkSet {
    pub fn new(parent: CsvSink) -> Self {
        Self {
            parent,
            sub_sinks: HashMap::new(),
        }
    }

    pub fn add_sub_sink(&mut self, table_path: impl Into<String>, sink: CsvSink) {
        self.sub_sinks.insert(table_path.into(), sink);
    }

    pub fn write_parent(&mut self, row: &FlatRow) -> Result<(), SinkError> {
        self.parent.write_row(row)
    }

    pub fn write_sub(&mut self, table_path: &str, row: &FlatRow) -> Result<(), SinkError> {
        match self.sub_sinks.get_mut(table_path) {
            Some(sink) => sink.write_row(row),
            None => Ok(()),
        }
    }

    pub fn parent_rows(&self) -> u64 {
        self.parent.rows_written()
    }

    pub fn sub_rows(&self) -> u64 {
        self.sub_sinks.values().map(CsvSink::rows_written).sum()
    }

    /// Finalize every sink; the renames are the completion signal.
    pub fn finalize(self) -> Result<(), SinkError> {
        self.parent.finalize()?;
        for (_, sink) in self.sub_sinks {
            sink.finalize()?;
        }
        Ok(())
    }

    /// Leave every file at its provisional name.
    pub fn abandon(self) {
        self.parent.abandon();
        for (_, sink) in self.sub_sinks {
            sink.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn columns() -> Vec<String> {
        vec!["mac".to_string(), "slot".to_string()]
    }

    fn row(mac: &str, slot: i64) -> FlatRow {
        let mut row = FlatRow::new();
        row.insert("mac".to_string(), json!(mac));
        row.insert("slot".to_string(), json!(slot));
        row
    }

    #[test]
    fn test_finalize_renames_part_to_csv() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvSink::open(dir.path(), "1700000000000_Radios", columns()).unwrap();
        sink.write_row(&row("aa:bb", 1)).unwrap();

        assert!(dir.path().join("1700000000000_Radios.part").exists());
        let final_path = sink.finalize().unwrap();

        assert!(!dir.path().join("1700000000000_Radios.part").exists());
        assert_eq!(final_path, dir.path().join("1700000000000_Radios.csv"));

        let contents = std::fs::read_to_string(final_path).unwrap();
        assert_eq!(contents, "mac,slot\naa:bb,1\n");
    }

    #[test]
    fn test_abandon_leaves_provisional_file() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvSink::open(dir.path(), "1700000000000_Radios", columns()).unwrap();
        sink.write_row(&row("aa:bb", 1)).unwrap();
        sink.abandon();

        assert!(dir.path().join("1700000000000_Radios.part").exists());
        assert!(!dir.path().join("1700000000000_Radios.csv").exists());
    }

    #[test]
    fn test_absent_fields_written_empty_in_column_order() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvSink::open(dir.path(), "t", columns()).unwrap();

        let mut partial = FlatRow::new();
        partial.insert("slot".to_string(), json!(3));
        // Extra fields not in the selected columns are not written
        partial.insert("extra".to_string(), json!("x"));
        sink.write_row(&partial).unwrap();

        let path = sink.finalize().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "mac,slot\n,3\n");
    }

    #[test]
    fn test_compound_values_written_as_json() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvSink::open(dir.path(), "t", vec!["ips".to_string()]).unwrap();

        let mut row = FlatRow::new();
        row.insert("ips".to_string(), json!(["10.0.0.1", "10.0.0.2"]));
        sink.write_row(&row).unwrap();

        let path = sink.finalize().unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains(r#""[""10.0.0.1"",""10.0.0.2""]""#));
    }

    #[test]
    fn test_sink_set_routes_sub_rows_and_counts_separately() {
        let dir = TempDir::new().unwrap();
        let parent = CsvSink::open(dir.path(), "t", columns()).unwrap();
        let sub = CsvSink::open(dir.path(), "t_ssids", vec!["name".to_string()]).unwrap();

        let mut sinks = SinkSet::new(parent);
        sinks.add_sub_sink("ssids", sub);

        sinks.write_parent(&row("aa:bb", 1)).unwrap();
        let mut sub_row = FlatRow::new();
        sub_row.insert("name".to_string(), json!("eduroam"));
        sinks.write_sub("ssids", &sub_row).unwrap();
        sinks.write_sub("ssids", &sub_row).unwrap();
        // Unknown sub-table paths are ignored (no sink was opened)
        sinks.write_sub("radios", &sub_row).unwrap();

        assert_eq!(sinks.parent_rows(), 1);
        assert_eq!(sinks.sub_rows(), 2);
        sinks.finalize().unwrap();

        assert!(dir.path().join("t.csv").exists());
        assert!(dir.path().join("t_ssids.csv").exists());
    }

    #[test]
    fn test_escape_lossy_keeps_ascii() {
        assert_eq!(escape_lossy("plain"), "plain");
        assert_eq!(escape_lossy("héllo"), "h\\u{e9}llo");
    }
}

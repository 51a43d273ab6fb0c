//! Checkpoint persistence for resumable polling.
//!
//! Each collector role owns one checkpoint file mapping resource name to
//! its persisted scheduling state.
//!
//! # Atomic Writes
//!
//! Checkpoint updates use the atomic write pattern:
//! 1. Write to temp file: `{role}.json.tmp`
//! 2. Rename to final path: `{role}.json`
//!
//! A crash mid-write can never corrupt the last good checkpoint.

pub mod state;

pub use state::{PersistedState, PollState};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{CheckpointError, CheckpointRenameSnafu, CheckpointSerializeSnafu, CheckpointWriteSnafu};

/// Loads and saves one collector role's checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint path for a role under the given state directory.
    pub fn for_role(state_dir: &Path, role: &str) -> Self {
        Self::new(state_dir.join(format!("{role}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint mapping.
    ///
    /// Fails soft: a missing or unparseable file is a warned cold start
    /// returning an empty map, never an error.
    pub fn load(&self) -> HashMap<String, PersistedState> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "No checkpoint file, continuing as cold start"
                );
                return HashMap::new();
            }
        };

        match serde_json::from_str::<HashMap<String, PersistedState>>(&contents) {
            Ok(map) => {
                debug!(
                    path = %self.path.display(),
                    resources = map.len(),
                    "Loaded checkpoint"
                );
                map
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to parse checkpoint, continuing as cold start"
                );
                HashMap::new()
            }
        }
    }

    /// Save the full checkpoint mapping atomically (write temp, rename).
    pub fn save(&self, states: &HashMap<String, PersistedState>) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(states).context(CheckpointSerializeSnafu)?;
        let display = self.path.display().to_string();

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, json).context(CheckpointWriteSnafu {
            path: display.clone(),
        })?;
        std::fs::rename(&tmp, &self.path).context(CheckpointRenameSnafu { path: display })?;

        debug!(path = %self.path.display(), resources = states.len(), "Saved checkpoint");
        Ok(())
    }
}

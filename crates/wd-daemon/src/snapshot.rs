//! Durable supervisor state between runs.
//!
//! The snapshot pairs the replayed [`WorkflowState`] with the log offset it
//! was derived from, so a restart can resume tailing where it stopped instead
//! of replaying the whole log. A missing or unreadable snapshot is never
//! fatal; the supervisor just falls back to a full replay.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use wd_analysis::workflow::WorkflowState;
use wd_core::fsio;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Workflow state as of a particular byte offset in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub state: WorkflowState,
    /// Offset of the first log byte the state has NOT seen.
    pub log_offset: u64,
    pub saved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed snapshot persistence with atomic replacement.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last saved snapshot. Returns `None` when the file is missing
    /// (first run) or unusable; corruption is logged and treated as absent so
    /// the caller rebuilds from the log instead of refusing to start.
    pub fn load(&self) -> Option<SupervisorSnapshot> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read snapshot; falling back to full replay"
                );
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "snapshot is corrupt; falling back to full replay"
                );
                None
            }
        }
    }

    /// Persist `state` together with the offset it corresponds to.
    pub fn save(&self, state: &WorkflowState, log_offset: u64) -> Result<(), SnapshotError> {
        let snapshot = SupervisorSnapshot {
            state: state.clone(),
            log_offset,
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        fsio::write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

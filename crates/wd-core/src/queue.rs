use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fsio;
use crate::types::{QueueTask, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// TaskFilter / QueueStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub source: Option<String>,
    /// Expired tasks are hidden unless explicitly requested.
    pub include_expired: bool,
}

impl TaskFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        }
    }
}

/// Per-status counts for the supervision report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub expired: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed + self.expired
    }
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// File-backed task queue: one JSON document holding an array of tasks.
///
/// The file is shared with external drain processes that read tasks and mark
/// their status. Every operation re-reads the file before mutating so those
/// external updates are never clobbered, and every write goes through an
/// atomic replace. Expired tasks are pruned on write rather than retried
/// forever.
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Submit a task. When a pending task with the same signature already
    /// exists the submission merges into it and the existing id is returned,
    /// so at-least-once producers never create duplicate pending work.
    pub fn add_task(&self, task: QueueTask) -> Result<Uuid> {
        let mut tasks = self.load()?;
        let now = Utc::now();
        tasks.retain(|t| !t.is_expired(now));

        let signature = task.signature();
        if let Some(existing) = tasks
            .iter()
            .find(|t| t.status == TaskStatus::Pending && t.signature() == signature)
        {
            debug!(
                task_id = %existing.id,
                signature = %signature,
                "merged duplicate submission into existing pending task"
            );
            return Ok(existing.id);
        }

        let id = task.id;
        tasks.push(task);
        self.persist(&tasks)?;
        Ok(id)
    }

    /// Tasks matching the filter, highest priority first, oldest first within
    /// a priority.
    pub fn tasks(&self, filter: &TaskFilter) -> Result<Vec<QueueTask>> {
        let now = Utc::now();
        let mut tasks: Vec<QueueTask> = self
            .load()?
            .into_iter()
            .filter(|t| filter.include_expired || !t.is_expired(now))
            .filter(|t| filter.status.as_ref().map_or(true, |s| &t.status == s))
            .filter(|t| filter.source.as_deref().map_or(true, |s| t.source == s))
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    /// Pending tasks that have not expired. Expiry is honored here even
    /// before the next write cycle prunes the records.
    pub fn pending_count(&self) -> Result<usize> {
        let now = Utc::now();
        Ok(self
            .load()?
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && !t.is_expired(now))
            .count())
    }

    /// Move a task through its status lifecycle. Backward moves are rejected.
    pub fn mark_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut tasks = self.load()?;
        let now = Utc::now();
        tasks.retain(|t| !t.is_expired(now));

        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(QueueError::TaskNotFound(id))?;
        if !task.status.can_transition_to(&status) {
            return Err(QueueError::InvalidTransition {
                from: task.status.clone(),
                to: status,
            });
        }
        task.status = status;
        self.persist(&tasks)?;
        Ok(())
    }

    /// Signatures of every task on file, regardless of status. Used at
    /// startup to avoid re-queuing issues that already produced work.
    pub fn signatures(&self) -> Result<HashSet<String>> {
        Ok(self.load()?.iter().map(|t| t.signature()).collect())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for task in self.load()? {
            if task.is_expired(now) {
                stats.expired += 1;
                continue;
            }
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Read the queue file. Missing means empty; corrupt JSON is recovered
    /// as empty (with a warning) so a damaged file cannot take the engine
    /// down — the next write replaces it.
    fn load(&self) -> Result<Vec<QueueTask>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(tasks) => Ok(tasks),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "queue file is corrupt; treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    fn persist(&self, tasks: &[QueueTask]) -> Result<()> {
        let json = serde_json::to_string_pretty(tasks)?;
        fsio::write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

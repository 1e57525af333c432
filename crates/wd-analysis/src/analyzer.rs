use chrono::{DateTime, Utc};
use tracing::debug;
use wd_core::config::{ChainConfig, DetectorConfig};
use wd_core::types::LogEntry;

use crate::detect::{CadenceCtx, EntryCtx, CADENCE_DETECTORS, ENTRY_DETECTORS};
use crate::issue::Issue;
use crate::workflow::WorkflowState;

/// Feeds entries through the workflow state and runs the detector catalogue.
///
/// Single-writer: the supervisor owns exactly one `Analyzer` and applies
/// entries in file order, so detection is deterministic for a given log.
pub struct Analyzer {
    state: WorkflowState,
    chain: ChainConfig,
    detectors: DetectorConfig,
}

impl Analyzer {
    pub fn new(chain: ChainConfig, detectors: DetectorConfig) -> Self {
        Self {
            state: WorkflowState::new(),
            chain,
            detectors,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Adopt a previously snapshotted state.
    pub fn restore(&mut self, state: WorkflowState) {
        self.state = state;
    }

    /// Apply one entry and report everything the entry detectors flag.
    pub fn observe(&mut self, entry: &LogEntry) -> Vec<Issue> {
        let record = self.state.apply(entry, &self.chain);
        let ctx = EntryCtx {
            state: &self.state,
            record: &record,
            entry,
            cfg: &self.detectors,
            chain: &self.chain,
        };
        let mut issues = Vec::new();
        for (name, detector) in ENTRY_DETECTORS {
            if let Some(issue) = detector(&ctx) {
                debug!(
                    detector = name,
                    kind = %issue.kind,
                    confidence = issue.confidence,
                    "detector fired"
                );
                issues.push(issue);
            }
        }
        issues
    }

    /// Run the absence detectors against `now`.
    pub fn evaluate_absence(&self, now: DateTime<Utc>) -> Vec<Issue> {
        let ctx = CadenceCtx {
            state: &self.state,
            now,
            cfg: &self.detectors,
            chain: &self.chain,
        };
        let mut issues = Vec::new();
        for (name, detector) in CADENCE_DETECTORS {
            if let Some(issue) = detector(&ctx) {
                debug!(
                    detector = name,
                    kind = %issue.kind,
                    confidence = issue.confidence,
                    "detector fired"
                );
                issues.push(issue);
            }
        }
        issues
    }

    /// Replay a full log from scratch. Produces the same state streaming
    /// would have; the collected issues let recovery decide what was already
    /// acted on. No absence sweep runs during replay.
    pub fn rebuild(&mut self, entries: &[LogEntry]) -> Vec<Issue> {
        self.state = WorkflowState::new();
        let mut issues = Vec::new();
        for entry in entries {
            issues.extend(self.observe(entry));
        }
        issues
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

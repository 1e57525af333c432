//! Detector catalogue.
//!
//! Detectors are stateless functions over the workflow state: entry detectors
//! run once per applied entry, cadence detectors run on the supervisor's
//! timer with an injected `now` so absence of activity is judged without any
//! detector holding a clock of its own. Registration is a pair of const
//! tables; the analyzer runs every detector and collects every firing, it
//! never picks a single winner.

pub mod cadence;
pub mod entry;

use chrono::{DateTime, Utc};
use wd_core::config::{ChainConfig, DetectorConfig};
use wd_core::types::LogEntry;

use crate::issue::Issue;
use crate::workflow::{StepRecord, WorkflowState};

/// What an entry detector sees: the state *after* the entry was applied,
/// plus the pre-transition facts captured while applying it.
pub struct EntryCtx<'a> {
    pub state: &'a WorkflowState,
    pub record: &'a StepRecord,
    pub entry: &'a LogEntry,
    pub cfg: &'a DetectorConfig,
    pub chain: &'a ChainConfig,
}

/// What a cadence detector sees on an absence sweep.
pub struct CadenceCtx<'a> {
    pub state: &'a WorkflowState,
    pub now: DateTime<Utc>,
    pub cfg: &'a DetectorConfig,
    pub chain: &'a ChainConfig,
}

pub type EntryDetector = fn(&EntryCtx<'_>) -> Option<Issue>;
pub type CadenceDetector = fn(&CadenceCtx<'_>) -> Option<Issue>;

/// Entry-driven detectors, run in table order on every applied entry.
pub const ENTRY_DETECTORS: &[(&str, EntryDetector)] = &[
    ("loop_repetition", entry::loop_repetition),
    ("regression", entry::regression),
    ("out_of_order", entry::out_of_order),
    ("tdd_violation", entry::tdd_violation),
    ("explicit_failure", entry::explicit_failure),
    ("agent_failure", entry::agent_failure),
    ("chain_broken", entry::chain_broken),
    ("abandoned_agent", entry::abandoned_agent),
];

/// Absence-driven detectors, run in table order on every cadence sweep.
pub const CADENCE_DETECTORS: &[(&str, CadenceDetector)] = &[
    ("stuck_phase", cadence::stuck_phase),
    ("silence", cadence::silence),
    ("missing_milestone", cadence::missing_milestone),
    ("velocity_decline", cadence::velocity_decline),
    ("agent_silence", cadence::agent_silence),
    ("abrupt_stop", cadence::abrupt_stop),
    ("partial_completion", cadence::partial_completion),
    ("incomplete_chain", cadence::incomplete_chain),
];

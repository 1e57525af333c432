use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wd_core::config::ChainConfig;
use wd_core::types::{EventKind, LogEntry};

/// Milestone history retained for velocity calculations.
const MILESTONE_HISTORY: usize = 256;

/// Key for the completion/failure records: `command` or `command/phase`.
pub fn scope_key(command: &str, phase: Option<&str>) -> String {
    match phase {
        Some(phase) => format!("{}/{}", command, phase),
        None => command.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ActiveAgent / RepeatTracker
// ---------------------------------------------------------------------------

/// A delegated worker that spawned and has not reported completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub kind: String,
    pub parent: Option<String>,
    /// The command it was spawned under.
    pub command: String,
    pub spawned_at: DateTime<Utc>,
}

/// Consecutive observations of the same (command, phase, event) triple.
/// Milestones reset the tracker: visible progress makes a retry legitimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatTracker {
    pub command: String,
    pub phase: Option<String>,
    pub event: EventKind,
    pub count: u32,
    /// Exemplar first observation, kept as evidence.
    pub first: LogEntry,
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// Pre-transition facts captured while applying one entry. Detectors need
/// these because `apply` has already advanced the state by the time they run.
#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    pub prev_command: Option<String>,
    pub prev_command_open: bool,
    pub prev_phase: Option<String>,
    pub prev_phase_open: bool,
    pub prev_phase_entry: Option<LogEntry>,
    /// The declared chain predecessor that had not completed when this
    /// command started.
    pub predecessor_incomplete: Option<String>,
    /// A `complete` arrived for a command that never logged `start`.
    pub completed_without_start: bool,
    /// Workers still active under a command when it closed, as (id, agent).
    pub orphaned_agents: Vec<(String, ActiveAgent)>,
    /// Repeat count after applying this entry.
    pub repeat_count: u32,
    pub repeat_first: Option<LogEntry>,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Single-writer model of what the monitored workflow is doing right now.
///
/// Mutated exclusively through `apply`; every time field derives from entry
/// timestamps rather than the wall clock, so replaying a log always
/// reconstructs the exact same state that live streaming produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub command: Option<String>,
    pub phase: Option<String>,
    pub command_started_at: Option<DateTime<Utc>>,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Milestone timestamps, clamped non-decreasing in insertion order.
    pub milestones: Vec<DateTime<Utc>>,
    pub entries_since_milestone: u64,
    /// Worker id -> agent, for everything spawned and not yet completed.
    pub active_agents: BTreeMap<String, ActiveAgent>,
    /// Next expected position in the declared chain.
    pub chain_index: usize,
    pub seen_starts: BTreeSet<String>,
    pub completed_commands: Vec<String>,
    pub failed_commands: BTreeSet<String>,
    /// Command -> set of phases that completed for it.
    pub completed_phases: BTreeMap<String, BTreeSet<String>>,
    /// Scope key -> completion time, for regression checks.
    pub completions: BTreeMap<String, DateTime<Utc>>,
    pub last_completed_command: Option<String>,
    pub last_event: Option<EventKind>,
    pub repeat: Option<RepeatTracker>,
    /// Anchor entries kept as evidence for the absence-based detectors.
    pub phase_opened_by: Option<LogEntry>,
    pub command_started_by: Option<LogEntry>,
    pub last_entry: Option<LogEntry>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into the state, returning the pre-transition facts the
    /// detectors need.
    pub fn apply(&mut self, entry: &LogEntry, chain: &ChainConfig) -> StepRecord {
        let mut record = StepRecord {
            prev_command: self.command.clone(),
            prev_command_open: self.command.is_some(),
            prev_phase: self.phase.clone(),
            prev_phase_open: self.phase.is_some(),
            prev_phase_entry: self.phase_opened_by.clone(),
            ..Default::default()
        };

        match &entry.event {
            EventKind::Start => {
                if let Some(prev) = chain.predecessor(&entry.command) {
                    if !self.completions.contains_key(&scope_key(&prev.name, None)) {
                        record.predecessor_incomplete = Some(prev.name.clone());
                    }
                }
                self.seen_starts.insert(entry.command.clone());
                self.command = Some(entry.command.clone());
                self.command_started_at = Some(entry.ts);
                self.command_started_by = Some(entry.clone());
                self.phase = None;
                self.phase_started_at = None;
                self.phase_opened_by = None;
            }
            EventKind::PhaseStart => {
                self.adopt_command(entry);
                if let Some(phase) = &entry.phase {
                    self.phase = Some(phase.clone());
                    self.phase_started_at = Some(entry.ts);
                    self.phase_opened_by = Some(entry.clone());
                }
            }
            EventKind::PhaseComplete => {
                self.adopt_command(entry);
                if let Some(phase) = &entry.phase {
                    self.completed_phases
                        .entry(entry.command.clone())
                        .or_default()
                        .insert(phase.clone());
                    self.completions
                        .insert(scope_key(&entry.command, Some(phase)), entry.ts);
                    if self.phase.as_deref() == Some(phase.as_str()) {
                        self.phase = None;
                        self.phase_started_at = None;
                        self.phase_opened_by = None;
                    }
                }
            }
            EventKind::Milestone => {
                let ts = match self.milestones.last() {
                    Some(last) if *last > entry.ts => *last,
                    _ => entry.ts,
                };
                self.milestones.push(ts);
                if self.milestones.len() > MILESTONE_HISTORY {
                    let excess = self.milestones.len() - MILESTONE_HISTORY;
                    self.milestones.drain(..excess);
                }
                self.repeat = None;
            }
            EventKind::AgentSpawn => {
                self.adopt_command(entry);
                if let Some(agent) = &entry.agent {
                    self.active_agents.insert(
                        agent.id.clone(),
                        ActiveAgent {
                            kind: agent.kind.clone(),
                            parent: agent.parent.clone(),
                            command: entry.command.clone(),
                            spawned_at: entry.ts,
                        },
                    );
                }
            }
            EventKind::AgentComplete => {
                if let Some(agent) = &entry.agent {
                    self.active_agents.remove(&agent.id);
                }
            }
            EventKind::Complete => {
                record.completed_without_start = !self.seen_starts.contains(&entry.command);
                record.orphaned_agents = self.agents_under(&entry.command);
                self.completions
                    .insert(scope_key(&entry.command, None), entry.ts);
                if !self.completed_commands.iter().any(|c| c == &entry.command) {
                    self.completed_commands.push(entry.command.clone());
                }
                if chain.position(&entry.command) == Some(self.chain_index) {
                    self.chain_index += 1;
                }
                self.last_completed_command = Some(entry.command.clone());
                self.close_command();
            }
            EventKind::Failed => {
                record.orphaned_agents = self.agents_under(&entry.command);
                self.failed_commands.insert(entry.command.clone());
                self.close_command();
            }
        }

        // Worker fan-out under one command is parallelism, not repetition:
        // agent events neither feed nor reset the tracker.
        if !matches!(
            entry.event,
            EventKind::Milestone | EventKind::AgentSpawn | EventKind::AgentComplete
        ) {
            self.track_repeat(entry);
            if let Some(tracker) = &self.repeat {
                record.repeat_count = tracker.count;
                record.repeat_first = Some(tracker.first.clone());
            }
        }

        self.entries_since_milestone = match entry.event {
            EventKind::Milestone => 0,
            _ => self.entries_since_milestone + 1,
        };
        // Clamped: producer clocks may skew, activity never moves backward.
        self.last_activity_at = Some(match self.last_activity_at {
            Some(prev) if prev > entry.ts => prev,
            _ => entry.ts,
        });
        self.last_event = Some(entry.event.clone());
        self.last_entry = Some(entry.clone());

        record
    }

    /// Fraction of the declared chain completed in order.
    pub fn chain_progress(&self, chain: &ChainConfig) -> f64 {
        if chain.is_empty() {
            return 0.0;
        }
        self.chain_index.min(chain.len()) as f64 / chain.len() as f64
    }

    /// Gaps between consecutive milestones, oldest first.
    pub fn milestone_gaps(&self) -> Vec<chrono::Duration> {
        self.milestones
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    /// A `phase_start` entry for a command the state never saw `start` for
    /// adopts that command; the stale open phase (if any) belongs to the
    /// previous command and is dropped.
    fn adopt_command(&mut self, entry: &LogEntry) {
        if self.command.as_deref() != Some(entry.command.as_str()) {
            self.command = Some(entry.command.clone());
            self.command_started_at = Some(entry.ts);
            self.command_started_by = Some(entry.clone());
            self.phase = None;
            self.phase_started_at = None;
            self.phase_opened_by = None;
        }
    }

    fn close_command(&mut self) {
        self.command = None;
        self.command_started_at = None;
        self.command_started_by = None;
        self.phase = None;
        self.phase_started_at = None;
        self.phase_opened_by = None;
    }

    fn agents_under(&self, command: &str) -> Vec<(String, ActiveAgent)> {
        self.active_agents
            .iter()
            .filter(|(_, agent)| agent.command == command)
            .map(|(id, agent)| (id.clone(), agent.clone()))
            .collect()
    }

    fn track_repeat(&mut self, entry: &LogEntry) {
        let same_triple = self.repeat.as_ref().is_some_and(|t| {
            t.command == entry.command && t.phase == entry.phase && t.event == entry.event
        });
        if same_triple {
            if let Some(tracker) = self.repeat.as_mut() {
                tracker.count += 1;
            }
        } else {
            self.repeat = Some(RepeatTracker {
                command: entry.command.clone(),
                phase: entry.phase.clone(),
                event: entry.event.clone(),
                count: 1,
                first: entry.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

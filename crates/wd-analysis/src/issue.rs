use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wd_core::types::{LogEntry, SALIENT_CONTEXT_KEYS};

// ---------------------------------------------------------------------------
// IssueKind
// ---------------------------------------------------------------------------

/// The catalogue of problems the analyzer can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Same (command, phase, event) repeating with no intervening milestone.
    Loop,
    /// A phase open past its timeout with no completion.
    StuckPhase,
    /// A scope that previously completed now reports failure.
    Regression,
    /// A phase started while a different declared phase was still open.
    OutOfOrder,
    /// The workflow logged a `failed` event.
    ExplicitFailure,
    /// A delegated worker reported a failed result.
    AgentFailure,
    /// A later phase started before the test-writing phase ever completed.
    TddViolation,
    /// A command ran outside the declared chain order.
    ChainBroken,
    /// No entries at all for longer than expected.
    Silence,
    /// Entries keep flowing but milestones stopped.
    MissingMilestone,
    /// Milestone cadence fell well below the established pace.
    VelocityDecline,
    /// A command completed cleanly but its chain successor never started.
    IncompleteChain,
    /// A delegated worker has been running past its expected lifetime.
    AgentSilence,
    /// All signals ceased while a command was mid-flight.
    AbruptStop,
    /// The workflow went quiet between commands with the chain partly done.
    PartialCompletion,
    /// A command closed while its delegated workers were still active.
    AbandonedAgent,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Loop => "loop",
            IssueKind::StuckPhase => "stuck_phase",
            IssueKind::Regression => "regression",
            IssueKind::OutOfOrder => "out_of_order",
            IssueKind::ExplicitFailure => "explicit_failure",
            IssueKind::AgentFailure => "agent_failure",
            IssueKind::TddViolation => "tdd_violation",
            IssueKind::ChainBroken => "chain_broken",
            IssueKind::Silence => "silence",
            IssueKind::MissingMilestone => "missing_milestone",
            IssueKind::VelocityDecline => "velocity_decline",
            IssueKind::IncompleteChain => "incomplete_chain",
            IssueKind::AgentSilence => "agent_silence",
            IssueKind::AbruptStop => "abrupt_stop",
            IssueKind::PartialCompletion => "partial_completion",
            IssueKind::AbandonedAgent => "abandoned_agent",
        }
    }

    /// Whether automated remediation is known safe for this kind. Rides along
    /// on generated tasks; the response class itself is confidence-driven.
    pub fn auto_fixable(&self) -> bool {
        matches!(
            self,
            IssueKind::Loop
                | IssueKind::StuckPhase
                | IssueKind::Regression
                | IssueKind::ExplicitFailure
                | IssueKind::AgentFailure
        )
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A detected problem, produced by one detector pass. Transient: issues are
/// turned into queue tasks and notifications, never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    /// In [0, 1]. The intervention engine reads this, never mutates it.
    pub confidence: f64,
    pub description: String,
    /// Supporting entries, oldest first.
    pub evidence: Vec<LogEntry>,
    pub suggested_action: String,
    pub auto_fixable: bool,
    pub command: Option<String>,
    pub phase: Option<String>,
    pub agent_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(
        kind: IssueKind,
        confidence: f64,
        description: impl Into<String>,
        suggested_action: impl Into<String>,
    ) -> Self {
        let auto_fixable = kind.auto_fixable();
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            evidence: Vec::new(),
            suggested_action: suggested_action.into(),
            auto_fixable,
            command: None,
            phase: None,
            agent_id: None,
            detected_at: Utc::now(),
        }
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.detected_at = ts;
        self
    }

    pub fn in_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_evidence(mut self, entry: &LogEntry) -> Self {
        self.evidence.push(entry.clone());
        self
    }

    /// The salient context pairs, in the same fixed order the queue uses.
    pub fn salient_context(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        for key in SALIENT_CONTEXT_KEYS {
            let value = match *key {
                "command" => self.command.as_deref(),
                "phase" => self.phase.as_deref(),
                "agent_id" => self.agent_id.as_deref(),
                _ => None,
            };
            if let Some(value) = value {
                pairs.push((*key, value));
            }
        }
        pairs
    }

    /// Dedup key for this issue as submitted by `source`. Produces the same
    /// string as `QueueTask::signature()` for the task generated from it.
    pub fn signature(&self, source: &str) -> String {
        let mut sig = format!("{}:{}", source, self.kind.as_str());
        for (key, value) in self.salient_context() {
            sig.push_str(&format!(":{}={}", key, value));
        }
        sig
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// The event vocabulary of the workflow log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    PhaseStart,
    PhaseComplete,
    Milestone,
    AgentSpawn,
    AgentComplete,
    Complete,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::PhaseStart => "phase_start",
            EventKind::PhaseComplete => "phase_complete",
            EventKind::Milestone => "milestone",
            EventKind::AgentSpawn => "agent_spawn",
            EventKind::AgentComplete => "agent_complete",
            EventKind::Complete => "complete",
            EventKind::Failed => "failed",
        }
    }

    /// Returns `true` for events that close out a command.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Complete | EventKind::Failed)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentRef
// ---------------------------------------------------------------------------

/// Descriptor of a delegated worker attached to a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// One event from the workflow log. Immutable once parsed.
///
/// Ordering between entries is defined by file position, never by `ts`:
/// producer clocks are allowed to skew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub phase: Option<String>,
    pub event: EventKind,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub agent: Option<AgentRef>,
}

impl LogEntry {
    pub fn new(ts: DateTime<Utc>, command: impl Into<String>, event: EventKind) -> Self {
        Self {
            ts,
            command: command.into(),
            phase: None,
            event,
            data: serde_json::Map::new(),
            agent: None,
        }
    }

    /// String value from the `data` payload, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Compact one-line rendering used in prompts and notifications.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} {} {}",
            self.ts.format("%Y-%m-%dT%H:%M:%SZ"),
            self.command,
            self.event
        );
        if let Some(phase) = &self.phase {
            out.push_str(&format!(" phase={}", phase));
        }
        if let Some(agent) = &self.agent {
            out.push_str(&format!(" agent={}", agent.id));
        }
        if !self.data.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.data) {
                out.push_str(&format!(" data={}", json));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// TaskPriority / TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    /// Status never moves backward.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// QueueTask
// ---------------------------------------------------------------------------

/// Context keys that participate in the dedup signature. Everything else in
/// `context` is advisory detail for the handler.
pub const SALIENT_CONTEXT_KEYS: &[&str] = &["command", "phase", "agent_id"];

/// A durable unit of remediation work.
///
/// `anomaly` is a free string rather than a closed enum so that external
/// producers (the webhook ingress, drift checkers) can submit kinds this
/// crate does not define while still honoring the dedup contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: Uuid,
    pub priority: TaskPriority,
    pub source: String,
    pub anomaly: String,
    pub prompt: String,
    pub handler: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn new(
        source: impl Into<String>,
        anomaly: impl Into<String>,
        prompt: impl Into<String>,
        handler: impl Into<String>,
        priority: TaskPriority,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            priority,
            source: source.into(),
            anomaly: anomaly.into(),
            prompt: prompt.into(),
            handler: handler.into(),
            context: BTreeMap::new(),
            status: TaskStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Stable dedup key: source, anomaly type, and the salient context keys
    /// in fixed order. Two tasks describing the same underlying problem
    /// produce the same signature.
    pub fn signature(&self) -> String {
        let mut sig = format!("{}:{}", self.source, self.anomaly);
        for key in SALIENT_CONTEXT_KEYS {
            if let Some(value) = self.context.get(*key) {
                sig.push_str(&format!(":{}={}", key, value));
            }
        }
        sig
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.warden/config.toml`.
///
/// Every section and field has a default, so a missing file or a sparse one
/// is always valid. `WARDEN_CONFIG` overrides the file location.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub detectors: DetectorConfig,
    #[serde(default)]
    pub intervention: InterventionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load config from `WARDEN_CONFIG` or `~/.warden/config.toml`, falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var("WARDEN_CONFIG") {
            Ok(p) => PathBuf::from(p),
            Err(_) => Self::default_path(),
        };
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.chain.validate()?;
        self.detectors.validate()?;
        self.intervention.validate()?;
        self.supervisor.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        warden_home().join("config.toml")
    }
}

fn warden_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "text" for a terminal, "json" for running under a log collector.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"text\" or \"json\", not '{}'",
                other
            ))),
        }
    }
}

fn default_project_name() -> String {
    "warden".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for warden's own files (queue, snapshot). Created at startup.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// The event log the monitored workflow appends to. Project-local by
    /// default; polled rather than awaited when missing.
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            event_log: default_event_log(),
            queue_file: default_queue_file(),
            snapshot_file: default_snapshot_file(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    warden_home()
}
fn default_event_log() -> PathBuf {
    PathBuf::from(".warden/events.log")
}
fn default_queue_file() -> PathBuf {
    warden_home().join("queue.json")
}
fn default_snapshot_file() -> PathBuf {
    warden_home().join("supervisor-state.json")
}

// ---------------------------------------------------------------------------
// Chain — the expected command sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    /// Declared phase order within the command. Empty means phases are not
    /// constrained for this command.
    #[serde(default)]
    pub phases: Vec<String>,
    /// When true, the first phase is the test-writing phase and must
    /// complete before any later phase starts.
    #[serde(default)]
    pub tdd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_commands")]
    pub commands: Vec<CommandSpec>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            commands: default_chain_commands(),
        }
    }
}

impl ChainConfig {
    /// Position of a command in the chain, if declared.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.name == name)
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// The declared predecessor of `name`, if any.
    pub fn predecessor(&self, name: &str) -> Option<&CommandSpec> {
        match self.position(name) {
            Some(pos) if pos > 0 => self.commands.get(pos - 1),
            _ => None,
        }
    }

    /// The declared successor of `name`, if any.
    pub fn successor(&self, name: &str) -> Option<&CommandSpec> {
        self.position(name).and_then(|pos| self.commands.get(pos + 1))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commands.is_empty() {
            return Err(ConfigError::Validation(
                "chain.commands must not be empty".to_string(),
            ));
        }
        let mut names = std::collections::BTreeSet::new();
        for command in &self.commands {
            let name = command.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "chain.commands entries must have non-empty name".to_string(),
                ));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::Validation(format!(
                    "chain.commands contains duplicate command '{}'",
                    name
                )));
            }
            let mut phases = std::collections::BTreeSet::new();
            for phase in &command.phases {
                if !phases.insert(phase.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "chain command '{}' declares duplicate phase '{}'",
                        name, phase
                    )));
                }
            }
            if command.tdd && command.phases.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "chain command '{}' is marked tdd but declares no phases",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn default_chain_commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "plan".to_string(),
            phases: vec!["explore".to_string(), "draft".to_string()],
            tdd: false,
        },
        CommandSpec {
            name: "build".to_string(),
            phases: vec![
                "red".to_string(),
                "green".to_string(),
                "refactor".to_string(),
            ],
            tdd: true,
        },
        CommandSpec {
            name: "verify".to_string(),
            phases: vec!["test".to_string(), "review".to_string()],
            tdd: false,
        },
        CommandSpec {
            name: "ship".to_string(),
            phases: vec!["merge".to_string()],
            tdd: false,
        },
    ]
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Repetitions of the same (command, phase, event) triple, with no
    /// intervening milestone, that count as a loop.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    #[serde(default = "default_phase_timeout_secs")]
    pub default_phase_timeout_secs: u64,
    /// Per-phase overrides, keyed by phase name.
    #[serde(default)]
    pub phase_timeout_secs: BTreeMap<String, u64>,
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    #[serde(default = "default_hard_stop_timeout_secs")]
    pub hard_stop_timeout_secs: u64,
    #[serde(default = "default_milestone_interval_secs")]
    pub milestone_interval_secs: u64,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// How long a completed command's chain successor may take to start.
    #[serde(default = "default_next_command_timeout_secs")]
    pub next_command_timeout_secs: u64,
    /// Milestone gaps averaged when judging velocity.
    #[serde(default = "default_velocity_window")]
    pub velocity_window: usize,
    /// Current gap must exceed factor x the window average to count as decline.
    #[serde(default = "default_velocity_factor")]
    pub velocity_factor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            loop_threshold: default_loop_threshold(),
            default_phase_timeout_secs: default_phase_timeout_secs(),
            phase_timeout_secs: BTreeMap::new(),
            silence_timeout_secs: default_silence_timeout_secs(),
            hard_stop_timeout_secs: default_hard_stop_timeout_secs(),
            milestone_interval_secs: default_milestone_interval_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            next_command_timeout_secs: default_next_command_timeout_secs(),
            velocity_window: default_velocity_window(),
            velocity_factor: default_velocity_factor(),
        }
    }
}

impl DetectorConfig {
    /// Timeout for a named phase, falling back to the default.
    pub fn phase_timeout(&self, phase: &str) -> chrono::Duration {
        let secs = self
            .phase_timeout_secs
            .get(phase)
            .copied()
            .unwrap_or(self.default_phase_timeout_secs);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn silence_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.silence_timeout_secs as i64)
    }

    pub fn hard_stop_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hard_stop_timeout_secs as i64)
    }

    pub fn milestone_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.milestone_interval_secs as i64)
    }

    pub fn agent_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_timeout_secs as i64)
    }

    pub fn next_command_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.next_command_timeout_secs as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_threshold == 0 {
            return Err(ConfigError::Validation(
                "detectors.loop_threshold must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("detectors.default_phase_timeout_secs", self.default_phase_timeout_secs),
            ("detectors.silence_timeout_secs", self.silence_timeout_secs),
            ("detectors.hard_stop_timeout_secs", self.hard_stop_timeout_secs),
            ("detectors.milestone_interval_secs", self.milestone_interval_secs),
            ("detectors.agent_timeout_secs", self.agent_timeout_secs),
            ("detectors.next_command_timeout_secs", self.next_command_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be positive", name)));
            }
        }
        if self.silence_timeout_secs >= self.hard_stop_timeout_secs {
            return Err(ConfigError::Validation(
                "detectors.silence_timeout_secs must be below hard_stop_timeout_secs".to_string(),
            ));
        }
        if self.next_command_timeout_secs >= self.hard_stop_timeout_secs {
            return Err(ConfigError::Validation(
                "detectors.next_command_timeout_secs must be below hard_stop_timeout_secs"
                    .to_string(),
            ));
        }
        if self.velocity_window < 2 {
            return Err(ConfigError::Validation(
                "detectors.velocity_window must be at least 2".to_string(),
            ));
        }
        if self.velocity_factor < 1.0 {
            return Err(ConfigError::Validation(
                "detectors.velocity_factor must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_loop_threshold() -> u32 {
    3
}
fn default_phase_timeout_secs() -> u64 {
    600
}
fn default_silence_timeout_secs() -> u64 {
    300
}
fn default_hard_stop_timeout_secs() -> u64 {
    900
}
fn default_milestone_interval_secs() -> u64 {
    180
}
fn default_agent_timeout_secs() -> u64 {
    600
}
fn default_next_command_timeout_secs() -> u64 {
    300
}
fn default_velocity_window() -> usize {
    4
}
fn default_velocity_factor() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionConfig {
    /// Confidence strictly above this auto-remediates.
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,
    /// Confidence at or above this (and not above auto) suggests an action.
    #[serde(default = "default_suggest_threshold")]
    pub suggest_threshold: f64,
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    /// Minimum gap between notifications for the same still-firing issue.
    #[serde(default = "default_renotify_cooldown_secs")]
    pub renotify_cooldown_secs: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            auto_threshold: default_auto_threshold(),
            suggest_threshold: default_suggest_threshold(),
            task_ttl_secs: default_task_ttl_secs(),
            renotify_cooldown_secs: default_renotify_cooldown_secs(),
        }
    }
}

impl InterventionConfig {
    pub fn task_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_ttl_secs as i64)
    }

    pub fn renotify_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renotify_cooldown_secs as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.suggest_threshold && self.suggest_threshold <= 1.0) {
            return Err(ConfigError::Validation(
                "intervention.suggest_threshold must be in (0, 1]".to_string(),
            ));
        }
        if !(0.0 < self.auto_threshold && self.auto_threshold <= 1.0) {
            return Err(ConfigError::Validation(
                "intervention.auto_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.suggest_threshold > self.auto_threshold {
            return Err(ConfigError::Validation(
                "intervention.suggest_threshold must not exceed auto_threshold".to_string(),
            ));
        }
        if self.task_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "intervention.task_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_auto_threshold() -> f64 {
    0.9
}
fn default_suggest_threshold() -> f64 {
    0.7
}
fn default_task_ttl_secs() -> u64 {
    86_400
}
fn default_renotify_cooldown_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Log poll interval for the tailer.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the absence-based detectors are re-evaluated.
    #[serde(default = "default_cadence_interval_secs")]
    pub cadence_interval_secs: u64,
    /// Upper bound on a single notification send.
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
    /// How often the supervision report is logged.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cadence_interval_secs: default_cadence_interval_secs(),
            notify_timeout_ms: default_notify_timeout_ms(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cadence_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cadence_interval_secs)
    }

    pub fn notify_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn report_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.report_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "supervisor.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.cadence_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.cadence_interval_secs must be positive".to_string(),
            ));
        }
        if self.notify_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "supervisor.notify_timeout_ms must be positive".to_string(),
            ));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.report_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_cadence_interval_secs() -> u64 {
    30
}
fn default_notify_timeout_ms() -> u64 {
    2_000
}
fn default_report_interval_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

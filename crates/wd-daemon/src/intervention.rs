use tracing::debug;
use wd_analysis::issue::{Issue, IssueKind};
use wd_core::config::InterventionConfig;
use wd_core::types::{QueueTask, TaskPriority};

use crate::notify::{Notification, NotifyLevel};

/// Queue-task source tag for everything this engine submits.
const SOURCE: &str = "supervisor";

/// How the engine responds to one issue, decided purely by confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Confident enough to hand straight to an autonomous worker.
    AutoRemediate,
    /// Queue for review alongside a suggestion.
    NotifySuggest,
    /// Observation only; no queued work.
    NotifyOnly,
}

/// One issue turned into concrete outputs.
#[derive(Debug, Clone)]
pub struct Intervention {
    pub class: ResponseClass,
    /// Present for the two task-bearing classes.
    pub task: Option<QueueTask>,
    pub notification: Notification,
}

/// Maps issues to graduated responses. Thresholds come from config and are
/// never hard-coded here; the band edges are inclusive on the suggest side
/// and exclusive on the auto side, so a confidence of exactly `auto`
/// suggests rather than remediates.
pub struct InterventionEngine {
    cfg: InterventionConfig,
}

impl InterventionEngine {
    pub fn new(cfg: &InterventionConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn source(&self) -> &'static str {
        SOURCE
    }

    pub fn classify(&self, confidence: f64) -> ResponseClass {
        if confidence > self.cfg.auto_threshold {
            ResponseClass::AutoRemediate
        } else if confidence >= self.cfg.suggest_threshold {
            ResponseClass::NotifySuggest
        } else {
            ResponseClass::NotifyOnly
        }
    }

    pub fn generate(&self, issue: &Issue) -> Intervention {
        let class = self.classify(issue.confidence);
        debug!(kind = %issue.kind, confidence = issue.confidence, class = ?class, "classified issue");
        let task = match class {
            ResponseClass::AutoRemediate => Some(self.build_task(issue, true)),
            ResponseClass::NotifySuggest => Some(self.build_task(issue, false)),
            ResponseClass::NotifyOnly => None,
        };
        let notification = build_notification(issue, class);
        Intervention {
            class,
            task,
            notification,
        }
    }

    fn build_task(&self, issue: &Issue, auto: bool) -> QueueTask {
        let mut task = QueueTask::new(
            SOURCE,
            issue.kind.as_str(),
            render_prompt(issue, auto),
            handler_for(issue.kind),
            priority_for(issue.kind, auto),
            self.cfg.task_ttl(),
        );
        // Salient context drives the dedup signature; the extras are
        // informational for whoever drains the task.
        for (key, value) in issue.salient_context() {
            task.context.insert(key.to_string(), value.to_string());
        }
        task.context
            .insert("auto_fixable".to_string(), issue.auto_fixable.to_string());
        task.context
            .insert("confidence".to_string(), format!("{:.2}", issue.confidence));
        task
    }
}

/// Deterministic worker-type suggestion per issue kind.
fn handler_for(kind: IssueKind) -> &'static str {
    use IssueKind::*;
    match kind {
        ExplicitFailure | AgentFailure | Regression => "debugger",
        ChainBroken | OutOfOrder | TddViolation => "reviewer",
        Loop | StuckPhase | AbruptStop | PartialCompletion | IncompleteChain | AbandonedAgent => {
            "recovery"
        }
        Silence | MissingMilestone | VelocityDecline | AgentSilence => "investigator",
    }
}

fn priority_for(kind: IssueKind, auto: bool) -> TaskPriority {
    if !auto {
        return TaskPriority::Medium;
    }
    match kind {
        IssueKind::ExplicitFailure | IssueKind::AgentFailure | IssueKind::Regression => {
            TaskPriority::Critical
        }
        _ => TaskPriority::High,
    }
}

/// The prompt an autonomous worker (or a human) picks up with the task.
fn render_prompt(issue: &Issue, auto: bool) -> String {
    let mut prompt = format!(
        "Issue: {} (confidence {:.2})\n{}\n",
        issue.kind, issue.confidence, issue.description
    );
    if !issue.evidence.is_empty() {
        prompt.push_str("\nLog evidence:\n");
        for entry in &issue.evidence {
            prompt.push_str("  ");
            prompt.push_str(&entry.render());
            prompt.push('\n');
        }
    }
    prompt.push_str("\nSuggested action: ");
    prompt.push_str(&issue.suggested_action);
    prompt.push('\n');
    if auto {
        prompt.push_str("This issue is considered safe to remediate autonomously; apply the fix and report what changed.\n");
    } else {
        prompt.push_str("Propose a fix and wait for review before applying it.\n");
    }
    prompt
}

fn build_notification(issue: &Issue, class: ResponseClass) -> Notification {
    let scope = issue.command.as_deref().unwrap_or("workflow");
    let title = format!("[{}] {}", scope, issue.kind);
    let (level, message) = match class {
        ResponseClass::AutoRemediate => (
            NotifyLevel::Info,
            format!("{} (queued for auto-remediation)", issue.description),
        ),
        ResponseClass::NotifySuggest => (
            NotifyLevel::Warning,
            format!(
                "{}\nSuggested: {}",
                issue.description, issue.suggested_action
            ),
        ),
        ResponseClass::NotifyOnly => (NotifyLevel::Info, issue.description.clone()),
    };
    Notification::new(title, message, level)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wd_core::config::InterventionConfig;
    use wd_core::types::{EventKind, LogEntry};

    fn engine() -> InterventionEngine {
        InterventionEngine::new(&InterventionConfig::default())
    }

    fn issue(kind: IssueKind, confidence: f64) -> Issue {
        Issue::new(kind, confidence, "something happened", "do something")
            .in_command("build")
            .in_phase("red")
    }

    #[test]
    fn classification_bands_are_half_open() {
        let engine = engine();
        // Defaults: auto 0.9, suggest 0.7.
        assert_eq!(engine.classify(0.95), ResponseClass::AutoRemediate);
        assert_eq!(engine.classify(0.901), ResponseClass::AutoRemediate);
        assert_eq!(engine.classify(0.90), ResponseClass::NotifySuggest);
        assert_eq!(engine.classify(0.70), ResponseClass::NotifySuggest);
        assert_eq!(engine.classify(0.699), ResponseClass::NotifyOnly);
        assert_eq!(engine.classify(0.1), ResponseClass::NotifyOnly);
    }

    #[test]
    fn auto_remediation_gets_a_task_and_an_info_notification() {
        let out = engine().generate(&issue(IssueKind::ExplicitFailure, 0.95));
        assert_eq!(out.class, ResponseClass::AutoRemediate);
        let task = out.task.expect("auto class queues a task");
        assert_eq!(task.priority, TaskPriority::Critical);
        assert_eq!(task.handler, "debugger");
        assert_eq!(out.notification.level, NotifyLevel::Info);
        assert!(out.notification.message.contains("auto-remediation"));
    }

    #[test]
    fn suggestions_queue_medium_priority_review_work() {
        let out = engine().generate(&issue(IssueKind::ChainBroken, 0.75));
        assert_eq!(out.class, ResponseClass::NotifySuggest);
        let task = out.task.expect("suggest class queues a task");
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.handler, "reviewer");
        assert_eq!(out.notification.level, NotifyLevel::Warning);
        assert!(out.notification.message.contains("Suggested:"));
    }

    #[test]
    fn low_confidence_notifies_without_queueing() {
        let out = engine().generate(&issue(IssueKind::Silence, 0.6));
        assert_eq!(out.class, ResponseClass::NotifyOnly);
        assert!(out.task.is_none());
        assert_eq!(out.notification.level, NotifyLevel::Info);
    }

    #[test]
    fn task_signature_matches_the_issue_signature() {
        let issue = issue(IssueKind::Loop, 0.92);
        let engine = engine();
        let task = engine.generate(&issue).task.expect("task");
        assert_eq!(task.signature(), issue.signature(engine.source()));
    }

    #[test]
    fn prompt_carries_evidence_and_the_suggested_action() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut evidence = LogEntry::new(ts, "build", EventKind::PhaseStart);
        evidence.phase = Some("red".to_string());
        let issue = issue(IssueKind::Loop, 0.92).with_evidence(&evidence);

        let task = engine().generate(&issue).task.expect("task");
        assert!(task.prompt.contains("Issue: loop"));
        assert!(task.prompt.contains("build"));
        assert!(task.prompt.contains("Suggested action: do something"));
        assert!(task.prompt.contains("remediate autonomously"));
    }

    #[test]
    fn handler_mapping_is_total_over_all_kinds() {
        use IssueKind::*;
        for kind in [
            Loop,
            StuckPhase,
            Regression,
            OutOfOrder,
            ExplicitFailure,
            AgentFailure,
            TddViolation,
            ChainBroken,
            Silence,
            MissingMilestone,
            VelocityDecline,
            IncompleteChain,
            AgentSilence,
            AbruptStop,
            PartialCompletion,
            AbandonedAgent,
        ] {
            assert!(!handler_for(kind).is_empty());
        }
    }

    #[test]
    fn context_includes_salient_keys_and_extras() {
        let task = engine()
            .generate(&issue(IssueKind::Loop, 0.92))
            .task
            .expect("task");
        assert_eq!(task.context.get("command").map(String::as_str), Some("build"));
        assert_eq!(task.context.get("phase").map(String::as_str), Some("red"));
        assert_eq!(
            task.context.get("auto_fixable").map(String::as_str),
            Some("true")
        );
    }
}

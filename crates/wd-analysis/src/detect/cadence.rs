//! Absence-driven detectors: each compares state timestamps against the
//! injected sweep time. Nothing here reads the wall clock, which keeps
//! sweeps deterministic under test and during replay.

use crate::detect::CadenceCtx;
use crate::issue::{Issue, IssueKind};
use crate::workflow::ActiveAgent;

use wd_core::types::EventKind;

/// A phase open past its configured timeout. Exactly at the boundary is
/// still on time; confidence scales with the overshoot up to one full
/// timeout past it.
pub fn stuck_phase(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let phase = ctx.state.phase.as_deref()?;
    let started = ctx.state.phase_started_at?;
    let timeout = ctx.cfg.phase_timeout(phase);
    let elapsed = ctx.now - started;
    if elapsed <= timeout {
        return None;
    }
    let overshoot = elapsed - timeout;
    let ratio = (overshoot.num_milliseconds() as f64 / timeout.num_milliseconds().max(1) as f64)
        .min(1.0);
    let confidence = 0.7 + 0.2 * ratio;
    let command = ctx.state.command.as_deref().unwrap_or("unknown");

    let mut issue = Issue::new(
        IssueKind::StuckPhase,
        confidence,
        format!(
            "phase '{}' of '{}' has been open for {}s, past its {}s timeout",
            phase,
            command,
            elapsed.num_seconds(),
            timeout.num_seconds()
        ),
        "Look at what the phase is waiting on: finish it, fail it, or raise its timeout if this pace is expected",
    )
    .at(ctx.now)
    .in_command(command)
    .in_phase(phase);
    if let Some(opened) = &ctx.state.phase_opened_by {
        issue = issue.with_evidence(opened);
    }
    if let Some(last) = &ctx.state.last_entry {
        if ctx.state.phase_opened_by.as_ref() != Some(last) {
            issue = issue.with_evidence(last);
        }
    }
    Some(issue)
}

/// No entries at all while a command is open. Hands over to `abrupt_stop`
/// once the hard-stop window elapses.
pub fn silence(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let command = ctx.state.command.as_deref()?;
    let last = ctx.state.last_activity_at?;
    let elapsed = ctx.now - last;
    if elapsed <= ctx.cfg.silence_timeout() || elapsed > ctx.cfg.hard_stop_timeout() {
        return None;
    }

    let mut issue = Issue::new(
        IssueKind::Silence,
        0.60,
        format!(
            "no entries for {}s while '{}' is open",
            elapsed.num_seconds(),
            command
        ),
        "Peek at the session; long quiet stretches usually mean a stall or a detached process",
    )
    .at(ctx.now)
    .in_command(command);
    if let Some(last_entry) = &ctx.state.last_entry {
        issue = issue.with_evidence(last_entry);
    }
    Some(issue)
}

/// Entries are flowing but no milestone has landed for longer than the
/// expected cadence. Quiet when nothing is flowing at all (that is
/// `silence`'s territory).
pub fn missing_milestone(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let command = ctx.state.command.as_deref()?;
    let last = ctx.state.last_activity_at?;
    if ctx.state.entries_since_milestone == 0 {
        return None;
    }
    if ctx.now - last > ctx.cfg.silence_timeout() {
        return None;
    }
    let anchor = ctx
        .state
        .milestones
        .last()
        .copied()
        .or(ctx.state.command_started_at)?;
    let elapsed = ctx.now - anchor;
    if elapsed <= ctx.cfg.milestone_interval() {
        return None;
    }

    let mut issue = Issue::new(
        IssueKind::MissingMilestone,
        0.55,
        format!(
            "'{}' is active with entries flowing but has logged no milestone for {}s (expected every {}s)",
            command,
            elapsed.num_seconds(),
            ctx.cfg.milestone_interval().num_seconds()
        ),
        "Verify real progress is being made; busy output without milestones often means churn",
    )
    .at(ctx.now)
    .in_command(command);
    if let Some(last_entry) = &ctx.state.last_entry {
        issue = issue.with_evidence(last_entry);
    }
    Some(issue)
}

/// The gap since the last milestone is far above the recent average gap.
pub fn velocity_decline(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let command = ctx.state.command.as_deref()?;
    let gaps = ctx.state.milestone_gaps();
    if gaps.len() < ctx.cfg.velocity_window {
        return None;
    }
    let last_milestone = *ctx.state.milestones.last()?;
    let window = &gaps[gaps.len() - ctx.cfg.velocity_window..];
    let avg_ms =
        window.iter().map(|gap| gap.num_milliseconds()).sum::<i64>() as f64 / window.len() as f64;
    if avg_ms <= 0.0 {
        return None;
    }
    let current_ms = (ctx.now - last_milestone).num_milliseconds() as f64;
    if current_ms <= avg_ms * ctx.cfg.velocity_factor {
        return None;
    }

    Some(
        Issue::new(
            IssueKind::VelocityDecline,
            0.50,
            format!(
                "milestones for '{}' were landing every ~{}s, but it has now been {}s since the last one",
                command,
                (avg_ms / 1000.0).round() as i64,
                (current_ms / 1000.0).round() as i64
            ),
            "Progress is slowing; check whether the current step is harder than planned or quietly stuck",
        )
        .at(ctx.now)
        .in_command(command),
    )
}

/// A delegated worker running past its timeout with no completion.
pub fn agent_silence(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let timeout = ctx.cfg.agent_timeout();
    let mut overdue: Vec<(&String, &ActiveAgent)> = ctx
        .state
        .active_agents
        .iter()
        .filter(|(_, agent)| ctx.now - agent.spawned_at > timeout)
        .collect();
    if overdue.is_empty() {
        return None;
    }
    overdue.sort_by_key(|(_, agent)| agent.spawned_at);
    let (oldest_id, oldest) = overdue[0];

    let mut description = format!(
        "worker '{}' ({}) spawned under '{}' {}s ago and has not completed",
        oldest_id,
        oldest.kind,
        oldest.command,
        (ctx.now - oldest.spawned_at).num_seconds()
    );
    if overdue.len() > 1 {
        description.push_str(&format!("; {} more also overdue", overdue.len() - 1));
    }

    Some(
        Issue::new(
            IssueKind::AgentSilence,
            0.60,
            description,
            "Check whether the worker is still doing anything useful, and collect or respawn it",
        )
        .at(ctx.now)
        .in_command(&oldest.command)
        .for_agent(oldest_id),
    )
}

/// A command open and then nothing at all past the hard-stop window.
/// Confidence scales with how much of the chain was already done.
pub fn abrupt_stop(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    let command = ctx.state.command.as_deref()?;
    let last = ctx.state.last_activity_at?;
    let elapsed = ctx.now - last;
    if elapsed <= ctx.cfg.hard_stop_timeout() {
        return None;
    }
    let confidence = 0.5 + 0.4 * ctx.state.chain_progress(ctx.chain);

    let mut issue = Issue::new(
        IssueKind::AbruptStop,
        confidence,
        format!(
            "'{}' went dark mid-run: nothing logged for {}s (hard stop is {}s)",
            command,
            elapsed.num_seconds(),
            ctx.cfg.hard_stop_timeout().num_seconds()
        ),
        format!(
            "The workflow looks dead; inspect the session and restart '{}' from its last recorded milestone",
            command
        ),
    )
    .at(ctx.now)
    .in_command(command);
    if let Some(started) = &ctx.state.command_started_by {
        issue = issue.with_evidence(started);
    }
    if let Some(last_entry) = &ctx.state.last_entry {
        if ctx.state.command_started_by.as_ref() != Some(last_entry) {
            issue = issue.with_evidence(last_entry);
        }
    }
    Some(issue)
}

/// No command open, the chain partly done, and nothing heard for the
/// hard-stop window: the workflow stopped between commands and never came
/// back.
pub fn partial_completion(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    if ctx.state.command.is_some() {
        return None;
    }
    if ctx.state.chain_index == 0 || ctx.state.chain_index >= ctx.chain.len() {
        return None;
    }
    let last = ctx.state.last_activity_at?;
    if ctx.now - last <= ctx.cfg.hard_stop_timeout() {
        return None;
    }
    let next = ctx.chain.commands.get(ctx.state.chain_index)?;
    let confidence = 0.45 + 0.35 * ctx.state.chain_progress(ctx.chain);

    let mut issue = Issue::new(
        IssueKind::PartialCompletion,
        confidence,
        format!(
            "the chain stopped after {}/{} commands; nothing has happened for {}s and '{}' never ran",
            ctx.state.chain_index,
            ctx.chain.len(),
            (ctx.now - last).num_seconds(),
            next.name
        ),
        format!("Resume the chain by running '{}'", next.name),
    )
    .at(ctx.now)
    .in_command(&next.name);
    if let Some(last_entry) = &ctx.state.last_entry {
        issue = issue.with_evidence(last_entry);
    }
    Some(issue)
}

/// The last command completed cleanly but its chain successor has not
/// started within the follow-on window. Hands over to `partial_completion`
/// once the hard-stop window elapses.
pub fn incomplete_chain(ctx: &CadenceCtx<'_>) -> Option<Issue> {
    if ctx.state.command.is_some() {
        return None;
    }
    if ctx.state.last_event != Some(EventKind::Complete) {
        return None;
    }
    let next = ctx.chain.commands.get(ctx.state.chain_index)?;
    let last = ctx.state.last_activity_at?;
    let elapsed = ctx.now - last;
    if elapsed <= ctx.cfg.next_command_timeout() || elapsed > ctx.cfg.hard_stop_timeout() {
        return None;
    }
    let prev = ctx
        .state
        .last_completed_command
        .as_deref()
        .unwrap_or("the previous command");
    let confidence = 0.55 + 0.25 * ctx.state.chain_progress(ctx.chain);

    let mut issue = Issue::new(
        IssueKind::IncompleteChain,
        confidence,
        format!(
            "'{}' finished but '{}' has not started after {}s",
            prev,
            next.name,
            elapsed.num_seconds()
        ),
        format!("Kick off '{}' or record why the chain is paused", next.name),
    )
    .at(ctx.now)
    .in_command(&next.name);
    if let Some(last_entry) = &ctx.state.last_entry {
        issue = issue.with_evidence(last_entry);
    }
    Some(issue)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use wd_core::config::{ChainConfig, DetectorConfig};
    use wd_core::types::{AgentRef, LogEntry};

    use crate::detect::{CadenceCtx, CADENCE_DETECTORS};
    use crate::workflow::WorkflowState;

    fn ts(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(sec)
    }

    fn entry(sec: i64, command: &str, event: EventKind) -> LogEntry {
        LogEntry::new(ts(sec), command, event)
    }

    fn phase_entry(sec: i64, command: &str, phase: &str, event: EventKind) -> LogEntry {
        let mut e = entry(sec, command, event);
        e.phase = Some(phase.to_string());
        e
    }

    fn apply_all(state: &mut WorkflowState, entries: &[LogEntry]) {
        let chain = ChainConfig::default();
        for e in entries {
            state.apply(e, &chain);
        }
    }

    fn sweep_one(
        state: &WorkflowState,
        now: DateTime<Utc>,
        detector: fn(&CadenceCtx<'_>) -> Option<Issue>,
    ) -> Option<Issue> {
        let chain = ChainConfig::default();
        let cfg = DetectorConfig::default();
        let ctx = CadenceCtx {
            state,
            now,
            cfg: &cfg,
            chain: &chain,
        };
        detector(&ctx)
    }

    // Defaults: phase timeout 600s, silence 300s, hard stop 900s, milestone
    // interval 180s, agent timeout 600s, next-command window 300s.

    #[test]
    fn stuck_phase_boundary_is_exclusive() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "build", EventKind::Start),
                phase_entry(0, "build", "red", EventKind::PhaseStart),
            ],
        );

        assert!(sweep_one(&state, ts(600), stuck_phase).is_none());

        let issue = sweep_one(&state, ts(601), stuck_phase).unwrap();
        assert_eq!(issue.kind, IssueKind::StuckPhase);
        assert!(issue.confidence >= 0.7 && issue.confidence < 0.71);
        assert_eq!(issue.phase.as_deref(), Some("red"));
        assert!(!issue.evidence.is_empty());
    }

    #[test]
    fn stuck_phase_confidence_scales_with_overshoot() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[phase_entry(0, "build", "red", EventKind::PhaseStart)],
        );

        // One full timeout past the deadline caps the ramp at 0.9.
        let issue = sweep_one(&state, ts(1200), stuck_phase).unwrap();
        assert!((issue.confidence - 0.9).abs() < 1e-9);
        let later = sweep_one(&state, ts(5000), stuck_phase).unwrap();
        assert!((later.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn silence_fires_only_inside_its_window() {
        let mut state = WorkflowState::new();
        apply_all(&mut state, &[entry(0, "build", EventKind::Start)]);

        assert!(sweep_one(&state, ts(300), silence).is_none());
        let issue = sweep_one(&state, ts(301), silence).unwrap();
        assert_eq!(issue.kind, IssueKind::Silence);
        assert!(issue.confidence < 0.7);
        // Past the hard stop the abrupt-stop detector owns the signal.
        assert!(sweep_one(&state, ts(901), silence).is_none());
        assert!(sweep_one(&state, ts(901), abrupt_stop).is_some());
    }

    #[test]
    fn silence_requires_an_open_command() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Complete),
            ],
        );
        assert!(sweep_one(&state, ts(400), silence).is_none());
    }

    #[test]
    fn missing_milestone_needs_entries_flowing() {
        let mut state = WorkflowState::new();
        apply_all(&mut state, &[entry(0, "build", EventKind::Start)]);

        // Active recently, no milestone since start, past the interval.
        let mut active = state.clone();
        apply_all(
            &mut active,
            &[phase_entry(150, "build", "red", EventKind::PhaseStart)],
        );
        let issue = sweep_one(&active, ts(200), missing_milestone).unwrap();
        assert_eq!(issue.kind, IssueKind::MissingMilestone);
        assert!(issue.confidence < 0.7);

        // Totally silent for longer than the silence window: not this
        // detector's call.
        assert!(sweep_one(&state, ts(400), missing_milestone).is_none());
    }

    #[test]
    fn missing_milestone_anchors_on_the_latest_milestone() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "build", EventKind::Start),
                entry(190, "build", EventKind::Milestone),
                phase_entry(210, "build", "red", EventKind::PhaseStart),
            ],
        );

        // The interval counts from the milestone at t=190, not from the start.
        assert!(sweep_one(&state, ts(365), missing_milestone).is_none());
        let issue = sweep_one(&state, ts(372), missing_milestone).unwrap();
        assert_eq!(issue.kind, IssueKind::MissingMilestone);
    }

    #[test]
    fn velocity_decline_compares_against_the_recent_average() {
        let mut state = WorkflowState::new();
        let mut entries = vec![entry(0, "build", EventKind::Start)];
        for i in 0..5 {
            entries.push(entry(i * 60, "build", EventKind::Milestone));
        }
        apply_all(&mut state, &entries);

        // Average gap 60s, factor 2.0: fires once the current gap passes 120s.
        assert!(sweep_one(&state, ts(240 + 120), velocity_decline).is_none());
        let issue = sweep_one(&state, ts(240 + 121), velocity_decline).unwrap();
        assert_eq!(issue.kind, IssueKind::VelocityDecline);
        assert!(issue.confidence < 0.7);
    }

    #[test]
    fn velocity_decline_needs_enough_history() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "build", EventKind::Start),
                entry(0, "build", EventKind::Milestone),
                entry(60, "build", EventKind::Milestone),
            ],
        );
        assert!(sweep_one(&state, ts(1000), velocity_decline).is_none());
    }

    #[test]
    fn agent_silence_reports_the_oldest_overdue_worker() {
        let mut state = WorkflowState::new();
        let mut spawn_a = entry(0, "build", EventKind::AgentSpawn);
        spawn_a.agent = Some(AgentRef {
            kind: "tester".into(),
            id: "a1".into(),
            parent: None,
        });
        let mut spawn_b = entry(50, "build", EventKind::AgentSpawn);
        spawn_b.agent = Some(AgentRef {
            kind: "builder".into(),
            id: "b2".into(),
            parent: None,
        });
        apply_all(&mut state, &[spawn_a, spawn_b]);

        assert!(sweep_one(&state, ts(600), agent_silence).is_none());

        let issue = sweep_one(&state, ts(700), agent_silence).unwrap();
        assert_eq!(issue.kind, IssueKind::AgentSilence);
        assert_eq!(issue.agent_id.as_deref(), Some("a1"));
        assert!(issue.description.contains("1 more"));
    }

    #[test]
    fn abrupt_stop_confidence_scales_with_chain_progress() {
        let mut state = WorkflowState::new();
        apply_all(&mut state, &[entry(0, "plan", EventKind::Start)]);
        let early = sweep_one(&state, ts(1000), abrupt_stop).unwrap();
        assert!((early.confidence - 0.5).abs() < 1e-9);

        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Complete),
                entry(20, "build", EventKind::Start),
            ],
        );
        let later = sweep_one(&state, ts(1000), abrupt_stop).unwrap();
        assert!(later.confidence > early.confidence);
    }

    #[test]
    fn partial_completion_fires_between_commands_after_the_hard_stop() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Complete),
            ],
        );

        assert!(sweep_one(&state, ts(10 + 900), partial_completion).is_none());
        let issue = sweep_one(&state, ts(10 + 901), partial_completion).unwrap();
        assert_eq!(issue.kind, IssueKind::PartialCompletion);
        assert!(issue.description.contains("'build'"));
        assert_eq!(issue.command.as_deref(), Some("build"));
    }

    #[test]
    fn partial_completion_needs_chain_progress() {
        let state = WorkflowState::new();
        assert!(sweep_one(&state, ts(5000), partial_completion).is_none());
    }

    #[test]
    fn incomplete_chain_names_the_missing_successor() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Complete),
            ],
        );

        assert!(sweep_one(&state, ts(10 + 300), incomplete_chain).is_none());
        let issue = sweep_one(&state, ts(10 + 301), incomplete_chain).unwrap();
        assert_eq!(issue.kind, IssueKind::IncompleteChain);
        assert!(issue.description.contains("'build'"));
        // Past the hard stop the partial-completion detector owns it.
        assert!(sweep_one(&state, ts(10 + 901), incomplete_chain).is_none());
    }

    #[test]
    fn incomplete_chain_requires_a_clean_completion() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Failed),
            ],
        );
        assert!(sweep_one(&state, ts(10 + 301), incomplete_chain).is_none());
    }

    #[test]
    fn healthy_mid_work_state_is_quiet_across_the_catalogue() {
        let mut state = WorkflowState::new();
        apply_all(
            &mut state,
            &[
                entry(0, "plan", EventKind::Start),
                entry(10, "plan", EventKind::Complete),
                entry(20, "build", EventKind::Start),
                entry(30, "build", EventKind::Milestone),
                phase_entry(40, "build", "red", EventKind::PhaseStart),
            ],
        );

        let chain = ChainConfig::default();
        let cfg = DetectorConfig::default();
        let ctx = CadenceCtx {
            state: &state,
            now: ts(100),
            cfg: &cfg,
            chain: &chain,
        };
        for (name, detector) in CADENCE_DETECTORS {
            assert!(detector(&ctx).is_none(), "{} fired on a healthy state", name);
        }
    }

    #[test]
    fn finished_chain_is_quiet_forever() {
        let mut state = WorkflowState::new();
        let mut entries = Vec::new();
        for (i, name) in ["plan", "build", "verify", "ship"].into_iter().enumerate() {
            let base = i as i64 * 100;
            entries.push(entry(base, name, EventKind::Start));
            entries.push(entry(base + 50, name, EventKind::Complete));
        }
        apply_all(&mut state, &entries);

        let chain = ChainConfig::default();
        let cfg = DetectorConfig::default();
        let ctx = CadenceCtx {
            state: &state,
            now: ts(100_000),
            cfg: &cfg,
            chain: &chain,
        };
        for (name, detector) in CADENCE_DETECTORS {
            assert!(detector(&ctx).is_none(), "{} fired after a clean finish", name);
        }
    }
}

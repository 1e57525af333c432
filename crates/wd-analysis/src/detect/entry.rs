//! Entry-driven detectors: each looks at one applied entry plus the state
//! around it and decides whether something is wrong right now.

use chrono::{DateTime, Utc};
use wd_core::types::{EventKind, LogEntry};

use crate::detect::EntryCtx;
use crate::issue::{Issue, IssueKind};
use crate::workflow::{scope_key, WorkflowState};

/// Repeat ceiling for the loop confidence ramp.
const LOOP_CONFIDENCE_CAP: f64 = 0.98;

/// The completion record (if any) that a `failed` entry contradicts. Prefers
/// the narrower `command/phase` scope over the command scope.
fn prior_completion(
    state: &WorkflowState,
    entry: &LogEntry,
) -> Option<(String, DateTime<Utc>)> {
    if let Some(phase) = &entry.phase {
        let key = scope_key(&entry.command, Some(phase));
        if let Some(ts) = state.completions.get(&key) {
            return Some((key, *ts));
        }
    }
    let key = scope_key(&entry.command, None);
    state.completions.get(&key).map(|ts| (key, *ts))
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Same (command, phase, event) triple repeating with no milestone between.
pub fn loop_repetition(ctx: &EntryCtx<'_>) -> Option<Issue> {
    let threshold = ctx.cfg.loop_threshold;
    if ctx.record.repeat_count < threshold {
        return None;
    }
    let over = ctx.record.repeat_count - threshold;
    let confidence = (0.9 + 0.02 * f64::from(over)).min(LOOP_CONFIDENCE_CAP);

    let scope = match &ctx.entry.phase {
        Some(phase) => format!("'{}' phase '{}'", ctx.entry.command, phase),
        None => format!("'{}'", ctx.entry.command),
    };
    let mut issue = Issue::new(
        IssueKind::Loop,
        confidence,
        format!(
            "{} logged {} {} consecutive times with no milestone in between",
            scope,
            ctx.entry.event.as_str(),
            ctx.record.repeat_count
        ),
        "Break the cycle: compare the repeated attempts, fix the blocker they share, or roll back to the last recorded milestone",
    )
    .at(ctx.entry.ts)
    .in_command(&ctx.entry.command);
    if let Some(phase) = &ctx.entry.phase {
        issue = issue.in_phase(phase);
    }
    if let Some(first) = &ctx.record.repeat_first {
        issue = issue.with_evidence(first);
    }
    Some(issue.with_evidence(ctx.entry))
}

/// A scope that previously completed now reports failure.
pub fn regression(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.entry.event != EventKind::Failed {
        return None;
    }
    let (scope, completed_at) = prior_completion(ctx.state, ctx.entry)?;

    let mut issue = Issue::new(
        IssueKind::Regression,
        0.92,
        format!(
            "'{}' failed after completing at {}",
            scope,
            completed_at.format("%Y-%m-%dT%H:%M:%SZ")
        ),
        "Previously working functionality broke: diff against the state at the earlier completion and restore it",
    )
    .at(ctx.entry.ts)
    .in_command(&ctx.entry.command);
    if let Some(phase) = &ctx.entry.phase {
        issue = issue.in_phase(phase);
    }
    Some(issue.with_evidence(ctx.entry))
}

/// A declared phase starts while a different declared phase of the same
/// command is still open.
pub fn out_of_order(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.entry.event != EventKind::PhaseStart {
        return None;
    }
    let phase = ctx.entry.phase.as_deref()?;
    let spec = ctx.chain.command(&ctx.entry.command)?;
    if !spec.phases.iter().any(|p| p == phase) {
        return None;
    }
    if !ctx.record.prev_phase_open
        || ctx.record.prev_command.as_deref() != Some(ctx.entry.command.as_str())
    {
        return None;
    }
    let prev = ctx.record.prev_phase.as_deref()?;
    // Re-entering the same phase is the loop detector's territory.
    if prev == phase || !spec.phases.iter().any(|p| p == prev) {
        return None;
    }

    let mut issue = Issue::new(
        IssueKind::OutOfOrder,
        0.90,
        format!(
            "phase '{}' of '{}' started while '{}' was still open",
            phase, ctx.entry.command, prev
        ),
        format!(
            "Close out '{}' (complete it or record its failure) before moving on, or back out the premature '{}'",
            prev, phase
        ),
    )
    .at(ctx.entry.ts)
    .in_command(&ctx.entry.command)
    .in_phase(phase);
    if let Some(prev_entry) = &ctx.record.prev_phase_entry {
        issue = issue.with_evidence(prev_entry);
    }
    Some(issue.with_evidence(ctx.entry))
}

/// For a TDD-disciplined command, a later phase starts before the leading
/// test-writing phase has ever completed.
pub fn tdd_violation(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.entry.event != EventKind::PhaseStart {
        return None;
    }
    let phase = ctx.entry.phase.as_deref()?;
    let spec = ctx.chain.command(&ctx.entry.command)?;
    if !spec.tdd {
        return None;
    }
    let first = spec.phases.first()?;
    if phase == first || !spec.phases.iter().any(|p| p == phase) {
        return None;
    }
    let first_completed = ctx
        .state
        .completed_phases
        .get(&ctx.entry.command)
        .is_some_and(|phases| phases.contains(first));
    if first_completed {
        return None;
    }

    Some(
        Issue::new(
            IssueKind::TddViolation,
            0.90,
            format!(
                "'{}' is TDD-disciplined but phase '{}' started before '{}' ever completed",
                ctx.entry.command, phase, first
            ),
            format!(
                "Pause implementation and drive '{}' to completion first so a failing test exists before code is written",
                first
            ),
        )
        .at(ctx.entry.ts)
        .in_command(&ctx.entry.command)
        .in_phase(phase)
        .with_evidence(ctx.entry),
    )
}

/// A plain `failed` event. Failures that contradict an earlier completion are
/// reported as regressions instead, not twice.
pub fn explicit_failure(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.entry.event != EventKind::Failed {
        return None;
    }
    if prior_completion(ctx.state, ctx.entry).is_some() {
        return None;
    }

    let reason = ctx
        .entry
        .data_str("reason")
        .or_else(|| ctx.entry.data_str("error"));
    let description = match reason {
        Some(reason) => format!("'{}' reported failure: {}", ctx.entry.command, reason),
        None => format!("'{}' reported failure", ctx.entry.command),
    };
    let mut issue = Issue::new(
        IssueKind::ExplicitFailure,
        0.95,
        description,
        format!(
            "Inspect the failure and the entries leading up to it, fix the cause, and restart '{}'",
            ctx.entry.command
        ),
    )
    .at(ctx.entry.ts)
    .in_command(&ctx.entry.command);
    if let Some(phase) = &ctx.entry.phase {
        issue = issue.in_phase(phase);
    }
    Some(issue.with_evidence(ctx.entry))
}

/// A worker finished but its payload says it failed.
pub fn agent_failure(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.entry.event != EventKind::AgentComplete {
        return None;
    }
    if ctx.entry.data_str("status") != Some("failed") {
        return None;
    }
    let agent = ctx.entry.agent.as_ref()?;

    Some(
        Issue::new(
            IssueKind::AgentFailure,
            0.92,
            format!(
                "worker '{}' ({}) under '{}' completed with status \"failed\"",
                agent.id, agent.kind, ctx.entry.command
            ),
            "Read the worker's output, fix or re-scope its assignment, and respawn it",
        )
        .at(ctx.entry.ts)
        .in_command(&ctx.entry.command)
        .for_agent(&agent.id)
        .with_evidence(ctx.entry),
    )
}

/// The declared command chain was violated: a start without its predecessor
/// completing, or a completion for a command that never started.
pub fn chain_broken(ctx: &EntryCtx<'_>) -> Option<Issue> {
    match ctx.entry.event {
        EventKind::Start => {
            let pred = ctx.record.predecessor_incomplete.as_deref()?;
            let description = if ctx.state.failed_commands.contains(pred) {
                format!(
                    "'{}' started but its predecessor '{}' failed",
                    ctx.entry.command, pred
                )
            } else {
                format!(
                    "'{}' started but its predecessor '{}' has not completed",
                    ctx.entry.command, pred
                )
            };
            Some(
                Issue::new(
                    IssueKind::ChainBroken,
                    0.75,
                    description,
                    format!(
                        "Confirm '{}' actually finished (or re-run it) before letting '{}' proceed",
                        pred, ctx.entry.command
                    ),
                )
                .at(ctx.entry.ts)
                .in_command(&ctx.entry.command)
                .with_evidence(ctx.entry),
            )
        }
        EventKind::Complete => {
            if !ctx.record.completed_without_start {
                return None;
            }
            // Commands outside the declared chain are not judged.
            ctx.chain.command(&ctx.entry.command)?;
            Some(
                Issue::new(
                    IssueKind::ChainBroken,
                    0.85,
                    format!(
                        "'{}' completed without ever logging a start",
                        ctx.entry.command
                    ),
                    "Verify the completion is real; a missing start usually means the log skipped a run or the completion is spurious",
                )
                .at(ctx.entry.ts)
                .in_command(&ctx.entry.command)
                .with_evidence(ctx.entry),
            )
        }
        _ => None,
    }
}

/// A command closed while workers spawned under it were still active.
pub fn abandoned_agent(ctx: &EntryCtx<'_>) -> Option<Issue> {
    if ctx.record.orphaned_agents.is_empty() {
        return None;
    }
    let ids: Vec<&str> = ctx
        .record
        .orphaned_agents
        .iter()
        .map(|(id, _)| id.as_str())
        .collect();

    Some(
        Issue::new(
            IssueKind::AbandonedAgent,
            0.80,
            format!(
                "'{}' closed leaving {} worker(s) still active: {}",
                ctx.entry.command,
                ids.len(),
                ids.join(", ")
            ),
            "Collect or terminate the orphaned workers; their results were never folded back in",
        )
        .at(ctx.entry.ts)
        .in_command(&ctx.entry.command)
        .for_agent(ids[0])
        .with_evidence(ctx.entry),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use wd_analysis::analyzer::Analyzer;
use wd_analysis::issue::{Issue, IssueKind};
use wd_core::config::{ChainConfig, DetectorConfig};
use wd_core::log_reader::LogReader;
use wd_core::types::{EventKind, LogEntry};

fn ts(sec: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(sec)
}

fn entry(sec: i64, command: &str, event: EventKind) -> LogEntry {
    LogEntry::new(ts(sec), command, event)
}

fn phase(sec: i64, command: &str, phase: &str, event: EventKind) -> LogEntry {
    let mut e = entry(sec, command, event);
    e.phase = Some(phase.to_string());
    e
}

fn append_lines(path: &Path, lines: &[String]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log for append");
    for line in lines {
        writeln!(file, "{}", line).expect("append line");
    }
}

fn append(path: &Path, entries: &[LogEntry]) {
    let lines: Vec<String> = entries
        .iter()
        .map(|e| serde_json::to_string(e).expect("serialize entry"))
        .collect();
    append_lines(path, &lines);
}

fn analyzer() -> Analyzer {
    Analyzer::new(ChainConfig::default(), DetectorConfig::default())
}

#[test]
fn streaming_and_replay_converge_on_the_same_state() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("events.log");

    let batch_one = vec![
        entry(0, "plan", EventKind::Start),
        phase(5, "plan", "explore", EventKind::PhaseStart),
        entry(20, "plan", EventKind::Milestone),
    ];
    let batch_two = vec![
        phase(30, "plan", "explore", EventKind::PhaseComplete),
        entry(40, "plan", EventKind::Complete),
    ];
    let batch_three = vec![
        entry(50, "build", EventKind::Start),
        phase(55, "build", "red", EventKind::PhaseStart),
    ];

    // Stream the log in three increments, the way the live tail sees it.
    let mut reader = LogReader::new(&log);
    let mut streamed = analyzer();
    for batch in [&batch_one, &batch_two, &batch_three] {
        append(&log, batch);
        let read = reader.read_new().expect("incremental read");
        assert!(!read.truncated);
        for e in &read.entries {
            streamed.observe(e);
        }
    }

    // Replay the same file from zero in one pass.
    let mut replay_reader = LogReader::new(&log);
    let entries = replay_reader.read_all().expect("full read");
    assert_eq!(entries.len(), 7);
    let mut replayed = analyzer();
    replayed.rebuild(&entries);

    assert_eq!(streamed.state(), replayed.state());
    assert_eq!(reader.offset(), replay_reader.offset());
}

#[test]
fn a_partial_trailing_line_is_deferred_to_the_next_read() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("events.log");

    let first = serde_json::to_string(&entry(0, "plan", EventKind::Start)).expect("serialize");
    let second = serde_json::to_string(&phase(5, "plan", "explore", EventKind::PhaseStart))
        .expect("serialize");
    let (head, tail) = second.split_at(second.len() / 2);

    // The writer flushed mid-line: only the complete first entry is visible.
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .expect("open log");
    write!(file, "{}\n{}", first, head).expect("partial write");
    drop(file);

    let mut reader = LogReader::new(&log);
    let batch = reader.read_new().expect("read");
    assert_eq!(batch.entries.len(), 1);

    // The rest of the line lands; the deferred entry parses whole.
    let mut file = OpenOptions::new().append(true).open(&log).expect("reopen");
    writeln!(file, "{}", tail).expect("finish line");
    drop(file);

    let batch = reader.read_new().expect("read again");
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].phase.as_deref(), Some("explore"));
}

#[test]
fn three_phase_restarts_raise_exactly_one_loop() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("events.log");
    append(
        &log,
        &[
            entry(0, "plan", EventKind::Start),
            entry(10, "plan", EventKind::Complete),
            entry(20, "build", EventKind::Start),
            phase(30, "build", "red", EventKind::PhaseStart),
            phase(40, "build", "red", EventKind::PhaseStart),
            phase(50, "build", "red", EventKind::PhaseStart),
        ],
    );

    let mut reader = LogReader::new(&log);
    let entries = reader.read_all().expect("read");
    let mut analyzer = analyzer();
    let issues: Vec<Issue> = entries.iter().flat_map(|e| analyzer.observe(e)).collect();

    assert_eq!(issues.len(), 1, "got {:?}", issues);
    assert_eq!(issues[0].kind, IssueKind::Loop);
    assert!(issues[0].confidence >= 0.9);
    assert!(issues[0].description.contains("red"));
    assert_eq!(issues[0].command.as_deref(), Some("build"));
}

#[test]
fn a_milestone_between_restarts_resets_the_loop_count() {
    let mut analyzer = analyzer();
    let mut issues = Vec::new();
    for e in [
        phase(0, "build", "red", EventKind::PhaseStart),
        phase(10, "build", "red", EventKind::PhaseStart),
        entry(20, "build", EventKind::Milestone),
        phase(30, "build", "red", EventKind::PhaseStart),
        phase(40, "build", "red", EventKind::PhaseStart),
    ] {
        issues.extend(analyzer.observe(&e));
    }
    assert!(issues.is_empty(), "got {:?}", issues);

    // The third consecutive restart after the milestone does fire.
    issues.extend(analyzer.observe(&phase(50, "build", "red", EventKind::PhaseStart)));
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::Loop);
}

#[test]
fn completing_a_command_that_never_started_lands_in_the_suggest_band() {
    let mut analyzer = analyzer();
    analyzer.observe(&entry(0, "plan", EventKind::Start));
    analyzer.observe(&entry(10, "plan", EventKind::Complete));

    let issues = analyzer.observe(&entry(20, "build", EventKind::Complete));
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::ChainBroken);
    assert!(issues[0].confidence >= 0.7 && issues[0].confidence < 0.9);
}

#[test]
fn stuck_phase_boundary_is_exclusive_end_to_end() {
    let mut analyzer = analyzer();
    analyzer.observe(&entry(0, "plan", EventKind::Start));
    analyzer.observe(&entry(5, "plan", EventKind::Complete));
    analyzer.observe(&entry(10, "build", EventKind::Start));
    analyzer.observe(&phase(10, "build", "red", EventKind::PhaseStart));

    // Default phase timeout is 600s, counted from the phase start.
    let at_boundary = analyzer.evaluate_absence(ts(10 + 600));
    assert!(
        !at_boundary.iter().any(|i| i.kind == IssueKind::StuckPhase),
        "fired exactly at the timeout: {:?}",
        at_boundary
    );

    let past_boundary = analyzer.evaluate_absence(ts(10 + 601));
    let stuck = past_boundary
        .iter()
        .find(|i| i.kind == IssueKind::StuckPhase)
        .expect("stuck phase one second past the timeout");
    assert!(stuck.confidence >= 0.7 && stuck.confidence <= 0.9);
    assert_eq!(stuck.phase.as_deref(), Some("red"));
}

#[test]
fn an_empty_or_missing_log_yields_zero_state_and_no_issues() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("never-written.log");

    let mut reader = LogReader::new(&log);
    let batch = reader.read_new().expect("missing file is not an error");
    assert!(batch.entries.is_empty());
    assert_eq!(batch.offset, 0);

    let mut analyzer = analyzer();
    let issues = analyzer.rebuild(&batch.entries);
    assert!(issues.is_empty());
    assert_eq!(analyzer.state(), &Default::default());
}

#[test]
fn summary_and_malformed_lines_do_not_derail_analysis() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("events.log");

    let start = serde_json::to_string(&entry(0, "plan", EventKind::Start)).expect("serialize");
    let complete =
        serde_json::to_string(&entry(10, "plan", EventKind::Complete)).expect("serialize");
    append_lines(
        &log,
        &[
            start,
            "## Summary: exploration went fine".to_string(),
            "{\"ts\": not json".to_string(),
            complete,
        ],
    );

    let mut reader = LogReader::new(&log);
    let entries = reader.read_all().expect("read");
    assert_eq!(entries.len(), 2);
    assert_eq!(reader.malformed_count(), 1);

    let mut analyzer = analyzer();
    for e in &entries {
        analyzer.observe(e);
    }
    assert_eq!(analyzer.state().completed_commands, vec!["plan".to_string()]);
}

#[test]
fn truncation_is_surfaced_so_the_caller_can_rebuild() {
    let dir = TempDir::new().expect("tempdir");
    let log = dir.path().join("events.log");
    append(
        &log,
        &[
            entry(0, "plan", EventKind::Start),
            entry(10, "plan", EventKind::Complete),
            entry(20, "build", EventKind::Start),
        ],
    );

    let mut reader = LogReader::new(&log);
    let mut analyzer = analyzer();
    for e in reader.read_new().expect("read").entries {
        analyzer.observe(&e);
    }
    assert_eq!(analyzer.state().command.as_deref(), Some("build"));

    // The producer rotated the file: shorter content, fresh run.
    std::fs::write(&log, "").expect("truncate");
    append(&log, &[entry(0, "plan", EventKind::Start)]);

    let batch = reader.read_new().expect("read after truncation");
    assert!(batch.truncated);

    // The supervisor's answer to `truncated` is a full replay.
    let entries = reader.read_all().expect("replay");
    analyzer.rebuild(&entries);
    assert_eq!(analyzer.state().command.as_deref(), Some("plan"));
    assert!(analyzer.state().completed_commands.is_empty());
}

//! The supervision engine.
//!
//! One [`Supervisor`] owns the whole pipeline: it resumes or replays workflow
//! state at startup, tails the event log, runs the detector catalogue on every
//! new entry and on a fixed cadence, and turns each issue into a graduated
//! intervention. Its only outputs are the task queue, the state snapshot, and
//! notifications; the monitored workflow is never touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use wd_analysis::analyzer::Analyzer;
use wd_analysis::issue::Issue;
use wd_core::config::Config;
use wd_core::log_reader::{LogReader, LogTailer, ReadBatch};
use wd_core::queue::QueueStore;
use wd_core::shutdown::ShutdownSignal;

use crate::intervention::InterventionEngine;
use crate::notify::{Notifier, TracingNotifier};
use crate::snapshot::{SnapshotError, SnapshotStore};

// ---------------------------------------------------------------------------
// SupervisionReport
// ---------------------------------------------------------------------------

/// Counters accumulated over one run of the supervision loop, logged on the
/// report interval and once more at shutdown.
#[derive(Debug, Clone, Default)]
pub struct SupervisionReport {
    pub entries_processed: u64,
    pub batches: u64,
    pub malformed_lines: u64,
    pub issues_detected: u64,
    pub tasks_queued: u64,
    pub tasks_merged: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Continuously running supervision engine.
///
/// Single consumer of the log tailer and single writer of workflow state, so
/// detection stays deterministic: replaying the same log yields the same
/// issues in the same order.
pub struct Supervisor {
    config: Config,
    analyzer: Analyzer,
    queue: QueueStore,
    snapshots: SnapshotStore,
    engine: InterventionEngine,
    notifier: Arc<dyn Notifier>,
    shutdown: ShutdownSignal,
    /// Last notification time per issue signature, for the renotify cooldown.
    last_notified: HashMap<String, DateTime<Utc>>,
    counters: SupervisionReport,
    /// Byte offset of the last complete log line folded into the state.
    log_offset: u64,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self::with_notifier(config, Arc::new(TracingNotifier))
    }

    /// Build with a custom notification channel (tests inject one here).
    pub fn with_notifier(config: Config, notifier: Arc<dyn Notifier>) -> Self {
        let analyzer = Analyzer::new(config.chain.clone(), config.detectors.clone());
        let queue = QueueStore::new(&config.paths.queue_file);
        let snapshots = SnapshotStore::new(&config.paths.snapshot_file);
        let engine = InterventionEngine::new(&config.intervention);
        Self {
            analyzer,
            queue,
            snapshots,
            engine,
            notifier,
            shutdown: ShutdownSignal::new(),
            last_notified: HashMap::new(),
            counters: SupervisionReport::default(),
            log_offset: 0,
            config,
        }
    }

    /// Handle the binary wires to ctrl-c.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn report(&self) -> &SupervisionReport {
        &self.counters
    }

    // ------------------------------------------------------------------
    // Startup — resume from snapshot or replay the log
    // ------------------------------------------------------------------

    /// Recover workflow state and position the reader for tailing.
    ///
    /// With a usable snapshot the analyzer adopts it and only the entries
    /// past the snapshotted offset are caught up; those are genuinely new, so
    /// their issues dispatch normally. Without one (first run, corruption, or
    /// a snapshot pointing past the end of a shrunken log) the whole log is
    /// replayed, and the replayed issues are suppressed by any queue task
    /// that already carries their signature.
    fn bootstrap(&mut self) -> anyhow::Result<(LogReader, Vec<Issue>, bool)> {
        let log_path = self.config.paths.event_log.clone();
        let log_len = match std::fs::metadata(&log_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if let Some(snapshot) = self.snapshots.load() {
            if snapshot.log_offset <= log_len {
                info!(
                    offset = snapshot.log_offset,
                    saved_at = %snapshot.saved_at,
                    "resuming from state snapshot"
                );
                self.analyzer.restore(snapshot.state);
                self.log_offset = snapshot.log_offset;

                let mut reader = LogReader::with_offset(&log_path, snapshot.log_offset);
                let batch = reader.read_new()?;
                let (issues, suppress) = if batch.truncated {
                    // The log shrank between the length check and the read.
                    warn!("event log shrank during startup; rebuilding from the new contents");
                    (self.analyzer.rebuild(&batch.entries), true)
                } else {
                    let mut issues = Vec::new();
                    for entry in &batch.entries {
                        issues.extend(self.analyzer.observe(entry));
                    }
                    (issues, false)
                };
                self.counters.entries_processed += batch.entries.len() as u64;
                self.counters.malformed_lines = batch.malformed_total;
                self.log_offset = batch.offset;
                return Ok((reader, issues, suppress));
            }
            warn!(
                snapshot_offset = snapshot.log_offset,
                log_len, "snapshot is ahead of the log; replaying from the start"
            );
        }

        let mut reader = LogReader::new(&log_path);
        let entries = reader.read_all()?;
        info!(entries = entries.len(), "rebuilding workflow state from the event log");
        let issues = self.analyzer.rebuild(&entries);
        self.counters.entries_processed += entries.len() as u64;
        self.counters.malformed_lines = reader.malformed_count();
        self.log_offset = reader.offset();
        Ok((reader, issues, true))
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until shutdown. Consumes the supervisor; the final snapshot and a
    /// closing report are written on the way out.
    pub async fn run(mut self) -> anyhow::Result<()> {
        // Subscribe before the (potentially long) startup replay; a trigger
        // raised at any point is either delivered here or visible on the flag.
        let mut shutdown_rx = self.shutdown.subscribe();

        let (reader, startup_issues, suppress) = self.bootstrap()?;
        self.dispatch(startup_issues, suppress).await;
        if let Err(e) = self.persist_snapshot() {
            warn!(error = %e, "failed to persist state snapshot");
        }

        if self.shutdown.is_shutting_down() {
            info!("shutdown requested during startup; stopping before the tail begins");
            self.log_report();
            return Ok(());
        }

        let (batches, tail_handle) = LogTailer::spawn(
            reader,
            self.config.supervisor.poll_interval(),
            &self.shutdown,
        );

        let mut cadence_interval = tokio::time::interval(self.config.supervisor.cadence_interval());
        let mut report_interval = tokio::time::interval(self.config.supervisor.report_interval());
        // Consume the first immediate tick so loops don't all fire at t=0.
        cadence_interval.tick().await;
        report_interval.tick().await;

        info!(
            log = %self.config.paths.event_log.display(),
            queue = %self.queue.path().display(),
            "supervision loop running"
        );

        loop {
            tokio::select! {
                batch = batches.recv_async() => {
                    match batch {
                        Ok(batch) => self.process_batch(batch).await,
                        Err(_) => {
                            warn!("log tailer channel closed; stopping");
                            break;
                        }
                    }
                }
                _ = cadence_interval.tick() => {
                    let issues = self.analyzer.evaluate_absence(Utc::now());
                    self.dispatch(issues, false).await;
                }
                _ = report_interval.tick() => {
                    self.log_report();
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping supervision loop");
                    break;
                }
            }
        }

        if let Err(e) = self.persist_snapshot() {
            warn!(error = %e, "failed to persist final snapshot");
        }
        let _ = tail_handle.await;
        self.log_report();
        Ok(())
    }

    /// Fold one tailed batch into the state and act on what it surfaces.
    async fn process_batch(&mut self, batch: ReadBatch) {
        self.counters.batches += 1;
        let (issues, suppress) = if batch.truncated {
            warn!(
                entries = batch.entries.len(),
                "event log was truncated; rebuilding state from the new contents"
            );
            (self.analyzer.rebuild(&batch.entries), true)
        } else {
            let mut issues = Vec::new();
            for entry in &batch.entries {
                issues.extend(self.analyzer.observe(entry));
            }
            (issues, false)
        };
        self.counters.entries_processed += batch.entries.len() as u64;
        self.counters.malformed_lines = batch.malformed_total;
        self.log_offset = batch.offset;

        self.dispatch(issues, suppress).await;
        if let Err(e) = self.persist_snapshot() {
            warn!(error = %e, "failed to persist state snapshot");
        }
    }

    // ------------------------------------------------------------------
    // Issue dispatch
    // ------------------------------------------------------------------

    /// Route issues into interventions. With `suppress_known` (replayed
    /// histories), issues whose signature already exists on the queue in any
    /// status are skipped: that work was dispatched in a previous life.
    async fn dispatch(&mut self, issues: Vec<Issue>, suppress_known: bool) {
        if issues.is_empty() {
            return;
        }
        let known: HashSet<String> = if suppress_known {
            match self.queue.signatures() {
                Ok(signatures) => signatures,
                Err(e) => {
                    warn!(error = %e, "could not read queue signatures; replayed issues may re-dispatch");
                    HashSet::new()
                }
            }
        } else {
            HashSet::new()
        };

        for issue in issues {
            self.counters.issues_detected += 1;
            let signature = issue.signature(self.engine.source());
            if suppress_known && known.contains(&signature) {
                debug!(signature = %signature, "suppressing replayed issue already on the queue");
                continue;
            }
            self.handle_issue(issue, signature).await;
        }
    }

    async fn handle_issue(&mut self, issue: Issue, signature: String) {
        let intervention = self.engine.generate(&issue);
        info!(
            kind = %issue.kind,
            confidence = issue.confidence,
            class = ?intervention.class,
            command = issue.command.as_deref().unwrap_or("-"),
            "issue detected"
        );

        if let Some(task) = intervention.task {
            let id = task.id;
            match self.queue.add_task(task) {
                Ok(existing) if existing != id => {
                    self.counters.tasks_merged += 1;
                    debug!(task_id = %existing, "merged into existing pending task");
                }
                Ok(_) => self.counters.tasks_queued += 1,
                Err(e) => error!(error = %e, "failed to queue intervention task"),
            }
        }

        // The merge above only dedups still-pending work (expiry is not
        // refreshed, so abandoned tasks still age out); the human channel is
        // rate-limited separately.
        let now = Utc::now();
        if let Some(last) = self.last_notified.get(&signature) {
            if now - *last < self.config.intervention.renotify_cooldown() {
                debug!(signature = %signature, "renotify cooldown active; skipping notification");
                return;
            }
        }
        match tokio::time::timeout(
            self.config.supervisor.notify_timeout(),
            self.notifier.send(&intervention.notification),
        )
        .await
        {
            Ok(Ok(())) => {
                self.counters.notifications_sent += 1;
                prune_notified(
                    &mut self.last_notified,
                    now,
                    self.config.intervention.renotify_cooldown(),
                );
                self.last_notified.insert(signature, now);
            }
            Ok(Err(e)) => {
                self.counters.notifications_failed += 1;
                warn!(error = %e, "notification delivery failed");
            }
            Err(_) => {
                self.counters.notifications_failed += 1;
                warn!(
                    timeout_ms = self.config.supervisor.notify_timeout_ms,
                    "notification timed out"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence and reporting
    // ------------------------------------------------------------------

    fn persist_snapshot(&self) -> Result<(), SnapshotError> {
        self.snapshots.save(self.analyzer.state(), self.log_offset)
    }

    fn log_report(&self) {
        let stats = self.queue.stats().unwrap_or_default();
        info!(
            entries = self.counters.entries_processed,
            batches = self.counters.batches,
            malformed = self.counters.malformed_lines,
            issues = self.counters.issues_detected,
            tasks_queued = self.counters.tasks_queued,
            tasks_merged = self.counters.tasks_merged,
            notified = self.counters.notifications_sent,
            notify_failures = self.counters.notifications_failed,
            queue_pending = stats.pending,
            queue_in_progress = stats.in_progress,
            queue_done = stats.done,
            "supervision report"
        );
    }
}

/// Entries older than the cooldown no longer suppress anything; drop them so
/// the map tracks signatures still inside their window, not every signature
/// ever notified.
fn prune_notified(
    notified: &mut HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) {
    notified.retain(|_, at| now - *at < cooldown);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

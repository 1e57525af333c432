use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::shutdown::ShutdownSignal;
use crate::types::{EventKind, LogEntry};

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// Classification of a single log line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A well-formed JSON event record.
    Entry(LogEntry),
    /// A free-text human summary line (producers may interleave these); skipped.
    Summary,
    /// Looked like JSON but failed to parse; counted, never fatal.
    Malformed,
}

/// Classify one line of the event log.
///
/// A line starting with `{` is expected to be a JSON event record; anything
/// else (including blank lines) is a summary line for humans.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return ParsedLine::Summary;
    }
    match serde_json::from_str::<LogEntry>(trimmed) {
        Ok(entry) => ParsedLine::Entry(entry),
        Err(_) => ParsedLine::Malformed,
    }
}

// ---------------------------------------------------------------------------
// ReadBatch
// ---------------------------------------------------------------------------

/// Entries appended since the previous read, in file order.
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    pub entries: Vec<LogEntry>,
    /// Byte position after the last complete line consumed. Durable
    /// checkpointing of this value is the caller's job.
    pub offset: u64,
    /// The file shrank below the previous offset; the reader restarted from
    /// the beginning and the caller should rebuild derived state.
    pub truncated: bool,
    /// Cumulative malformed-line count for this reader.
    pub malformed_total: u64,
}

// ---------------------------------------------------------------------------
// LogReader
// ---------------------------------------------------------------------------

/// Incremental reader over the append-only event log.
///
/// The reader remembers a byte offset and only ever advances it past
/// `\n`-terminated lines, so a partially flushed trailing line is retried on
/// the next poll instead of being mis-parsed. A missing file is an empty
/// read, not an error: the workflow may simply not have started yet.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    offset: u64,
    malformed: u64,
    summaries: u64,
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_offset(path, 0)
    }

    /// Resume from a checkpointed offset (recovered from the state snapshot).
    pub fn with_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            malformed: 0,
            summaries: 0,
        }
    }

    /// Position at the current end of the file, skipping history.
    pub fn at_end(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let offset = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self::with_offset(path, offset))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    pub fn summary_count(&self) -> u64 {
        self.summaries
    }

    /// Read every complete line appended since the current offset.
    pub fn read_new(&mut self) -> std::io::Result<ReadBatch> {
        let mut truncated = false;
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadBatch {
                    offset: self.offset,
                    malformed_total: self.malformed,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };
        if meta.len() < self.offset {
            warn!(
                path = %self.path.display(),
                old_offset = self.offset,
                new_len = meta.len(),
                "event log shrank; restarting from the beginning"
            );
            self.offset = 0;
            truncated = true;
        }

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut start = 0usize;
        while let Some(pos) = bytes[start..].iter().position(|&b| b == b'\n') {
            let line_end = start + pos;
            let text = String::from_utf8_lossy(&bytes[start..line_end]);
            if !text.trim().is_empty() {
                match parse_line(&text) {
                    ParsedLine::Entry(entry) => entries.push(entry),
                    ParsedLine::Summary => self.summaries += 1,
                    ParsedLine::Malformed => {
                        self.malformed += 1;
                        warn!(
                            offset = self.offset + start as u64,
                            preview = %preview(&text),
                            "skipping malformed log line"
                        );
                    }
                }
            }
            start = line_end + 1;
        }
        self.offset += start as u64;

        Ok(ReadBatch {
            entries,
            offset: self.offset,
            truncated,
            malformed_total: self.malformed,
        })
    }

    /// Every entry from the start of the file. Leaves the reader positioned
    /// after the last complete line, ready to tail.
    pub fn read_all(&mut self) -> std::io::Result<Vec<LogEntry>> {
        self.offset = 0;
        Ok(self.read_new()?.entries)
    }

    /// Most recent entry before the current read position matching `command`
    /// and, when given, `event`. Scans backward; `None` when nothing matches.
    pub fn query_last(
        &self,
        command: &str,
        event: Option<EventKind>,
    ) -> std::io::Result<Option<LogEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut bytes = Vec::new();
        file.take(self.offset).read_to_end(&mut bytes)?;

        for line in bytes.split(|&b| b == b'\n').rev() {
            let text = String::from_utf8_lossy(line);
            if let ParsedLine::Entry(entry) = parse_line(&text) {
                if entry.command != command {
                    continue;
                }
                if let Some(kind) = &event {
                    if entry.event != *kind {
                        continue;
                    }
                }
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

fn preview(line: &str) -> &str {
    let trimmed = line.trim();
    let end = trimmed
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

// ---------------------------------------------------------------------------
// LogTailer — live-tail subscription
// ---------------------------------------------------------------------------

/// Polls the log on an interval and delivers non-empty batches over a flume
/// channel, the single consumer being the supervision loop.
pub struct LogTailer;

impl LogTailer {
    /// Spawn the tail task. The task exits on shutdown or when the receiver
    /// is dropped.
    pub fn spawn(
        mut reader: LogReader,
        poll_interval: Duration,
        shutdown: &ShutdownSignal,
    ) -> (flume::Receiver<ReadBatch>, JoinHandle<()>) {
        let (tx, rx) = flume::unbounded();
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A trigger can predate this task's subscription, so
                        // the flag is consulted as well as the broadcast.
                        if shutdown.is_shutting_down() {
                            debug!("tailer stopping; shutdown flag already set");
                            break;
                        }
                        match reader.read_new() {
                            Ok(batch) => {
                                if batch.entries.is_empty() && !batch.truncated {
                                    continue;
                                }
                                if tx.send_async(batch).await.is_err() {
                                    debug!("tail receiver dropped; stopping");
                                    break;
                                }
                            }
                            // Transient I/O errors retry on the next tick.
                            Err(e) => warn!(error = %e, "event log poll failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("tailer received shutdown");
                        break;
                    }
                }
            }
        });

        (rx, handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

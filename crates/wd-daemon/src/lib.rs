//! warden daemon — tails the workflow event log, feeds entries through the
//! analyzer, and turns detected issues into queued remediation tasks and
//! notifications.
//!
//! The daemon is deliberately passive toward the workflow it watches: it
//! never writes to the event log and never touches the working tree. Its
//! only outputs are the task queue, the state snapshot, and notifications.

pub mod intervention;
pub mod logging;
pub mod notify;
pub mod snapshot;
pub mod supervisor;

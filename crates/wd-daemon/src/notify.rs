use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    ChannelClosed(String),
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Severity shown to the human, mapped from the response class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub level: NotifyLevel,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, level: NotifyLevel) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            level,
            created_at: Utc::now(),
        }
    }
}

/// Delivery seam for notifications.
///
/// The supervision loop treats delivery as fire-and-forget under a bounded
/// timeout: a slow or broken sink is logged and skipped, never allowed to
/// stall detection.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Default sink: structured log lines at a level matching the severity.
/// Desktop or webhook sinks implement `Notifier` on top.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.level {
            NotifyLevel::Info => info!(title = %notification.title, "{}", notification.message),
            NotifyLevel::Warning => warn!(title = %notification.title, "{}", notification.message),
            NotifyLevel::Critical => {
                error!(title = %notification.title, "{}", notification.message)
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Notifications
//!
//! Fire-and-forget alerts for high-risk submissions, sandbox outages and
//! performance changes. Delivery happens on a detached task; the pipeline
//! never waits for a sink and ignores whatever it does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Notifications retained by [`RateLimitedNotifier`]
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Security,
    Error,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Info => write!(f, "info"),
            NotificationKind::Warning => write!(f, "warning"),
            NotificationKind::Security => write!(f, "security"),
            NotificationKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Sink that writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Info => info!(title = %n.title, "{}", n.message),
            NotificationKind::Warning => warn!(title = %n.title, "{}", n.message),
            NotificationKind::Security => warn!(title = %n.title, security = true, "{}", n.message),
            NotificationKind::Error => error!(title = %n.title, "{}", n.message),
        }
    }
}

/// Suppresses repeated titles within a window and keeps recent history
pub struct RateLimitedNotifier {
    inner: Arc<dyn NotificationSink>,
    window: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
    history: Mutex<VecDeque<Notification>>,
}

impl RateLimitedNotifier {
    pub fn new(inner: Arc<dyn NotificationSink>, window: Duration) -> Self {
        Self {
            inner,
            window,
            last_sent: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Delivered notifications, oldest first
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `title` may be sent now; marks it sent if so
    fn admit(&self, title: &str) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return true;
        };
        let now = Instant::now();
        match last_sent.get(title) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last_sent.insert(title.to_string(), now);
                true
            }
        }
    }
}

#[async_trait]
impl NotificationSink for RateLimitedNotifier {
    async fn notify(&self, notification: Notification) {
        if !self.admit(&notification.title) {
            debug!(title = %notification.title, "Notification suppressed by rate limit");
            return;
        }

        if let Ok(mut history) = self.history.lock() {
            history.push_back(notification.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        self.inner.notify(notification).await;
    }
}

/// Deliver on a detached task; the caller never waits
pub fn dispatch(sink: &Arc<dyn NotificationSink>, notification: Notification) -> JoinHandle<()> {
    let sink = Arc::clone(sink);
    tokio::spawn(async move { sink.notify(notification).await })
}

//! Run lifecycle observers: alert delivery and last-run bookkeeping.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use trailsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

use crate::config::TelegramCredentials;
use crate::RunSummary;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Completed(RunSummary),
    Failed(RunFailure),
}

/// Receives one event per finished run. Must not block.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Legacy Telegram Markdown control characters.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '[' | ']' | '(' | ')' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn alert_text(message: &str) -> String {
    format!("🚨 *Alert!* 🚨\n\n{}", escape_markdown(message))
}

#[derive(Clone)]
pub struct TelegramAlerter {
    http: Arc<HttpFetcher>,
    api_base: String,
    credentials: TelegramCredentials,
    pending: TaskTracker,
}

impl TelegramAlerter {
    pub fn new(credentials: TelegramCredentials, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: Arc::new(HttpFetcher::new(http)?),
            api_base: TELEGRAM_API_BASE.to_string(),
            credentials,
            pending: TaskTracker::new(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.credentials.bot_token
        )
    }

    /// Awaitable delivery, for callers that are about to exit.
    pub async fn notify(&self, message: &str) -> Result<(), FetchError> {
        let body = json!({
            "chat_id": self.credentials.chat_id,
            "text": alert_text(message),
            "parse_mode": "Markdown",
        });
        let resp = self.http.post_json_once(&self.send_url(), None, &body).await?;
        if !resp.status.is_success() {
            return Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: format!("{}/bot<redacted>/sendMessage", self.api_base),
            });
        }
        info!("alert delivered");
        Ok(())
    }

    /// Fire-and-forget delivery; failures are only logged.
    pub fn notify_detached(&self, message: String) {
        let alerter = self.clone();
        self.pending.spawn(async move {
            if let Err(err) = alerter.notify(&message).await {
                error!(error = %err, "alert delivery failed");
            }
        });
    }

    /// Waits for every detached delivery started so far. Call before the runtime shuts down.
    pub async fn flush(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }
}

impl RunObserver for TelegramAlerter {
    fn on_event(&self, event: &RunEvent) {
        if let RunEvent::Failed(failure) = event {
            self.notify_detached(format!("Trailer sync run {} failed: {}", failure.run_id, failure.error));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LastRun {
    Succeeded(RunSummary),
    Failed(RunFailure),
}

/// Keeps the most recent run outcome for the health surface.
#[derive(Debug, Clone, Default)]
pub struct LastRunRecorder {
    last: Arc<RwLock<Option<LastRun>>>,
}

impl LastRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<LastRun> {
        self.last.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl RunObserver for LastRunRecorder {
    fn on_event(&self, event: &RunEvent) {
        let last = match event {
            RunEvent::Completed(summary) => LastRun::Succeeded(summary.clone()),
            RunEvent::Failed(failure) => LastRun::Failed(failure.clone()),
        };
        *self.last.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(last);
    }
}

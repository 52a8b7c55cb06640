//! Bounded worker pool that sends batch documents with per-document retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};
use trailsync_storage::BackoffPolicy;

use crate::planner::BatchDocument;
use crate::SyncError;

/// How one attempt at a document failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    Retryable(String),
    Fatal(String),
}

impl DispatchFailure {
    pub fn message(&self) -> &str {
        match self {
            DispatchFailure::Retryable(m) | DispatchFailure::Fatal(m) => m,
        }
    }
}

/// Sends one rendered document to the board API.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, document: &BatchDocument) -> Result<Value, DispatchFailure>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    InFlight { attempt: usize },
    Succeeded { attempts: usize },
    RetryScheduled { attempt: usize, delay: Duration },
    Fatal { attempts: usize, message: String },
    Exhausted { attempts: usize, message: String },
}

/// Attempt counter and next delay for a single document.
#[derive(Debug, Clone)]
pub struct RetryState {
    backoff: BackoffPolicy,
    attempt: usize,
    state: DocumentState,
}

impl RetryState {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            attempt: 0,
            state: DocumentState::Pending,
        }
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> usize {
        match self.state {
            DocumentState::Pending => 0,
            _ => self.attempt + 1,
        }
    }

    pub fn begin(&mut self) -> usize {
        if let DocumentState::RetryScheduled { attempt, .. } = self.state {
            self.attempt = attempt;
        }
        self.state = DocumentState::InFlight { attempt: self.attempt };
        self.attempt
    }

    pub fn succeed(&mut self) {
        self.state = DocumentState::Succeeded {
            attempts: self.attempt + 1,
        };
    }

    /// Returns the delay before the next attempt, or `None` when the document is finished.
    pub fn fail(&mut self, failure: DispatchFailure) -> Option<Duration> {
        let attempts = self.attempt + 1;
        self.state = match failure {
            DispatchFailure::Fatal(message) => DocumentState::Fatal { attempts, message },
            DispatchFailure::Retryable(message) if self.attempt >= self.backoff.max_retries => {
                DocumentState::Exhausted { attempts, message }
            }
            DispatchFailure::Retryable(_) => DocumentState::RetryScheduled {
                attempt: self.attempt + 1,
                delay: self.backoff.delay_for_attempt(self.attempt),
            },
        };
        match self.state {
            DocumentState::RetryScheduled { delay, .. } => Some(delay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub backoff: BackoffPolicy,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub documents: usize,
    pub attempts: usize,
}

/// A failure that will be retried; only ever logged, callers see `DispatchExhausted`.
fn transient_error(document: &BatchDocument, failure: &DispatchFailure) -> SyncError {
    SyncError::DispatchRetryable {
        document: document.index,
        message: failure.message().to_string(),
    }
}

/// Drives one document to a terminal state.
pub async fn dispatch_document(
    executor: &dyn BatchExecutor,
    sleeper: &dyn Sleeper,
    backoff: BackoffPolicy,
    document: &BatchDocument,
) -> Result<usize, SyncError> {
    let mut retry = RetryState::new(backoff);
    loop {
        let attempt = retry.begin();
        match executor.execute(document).await {
            Ok(_) => {
                retry.succeed();
                return Ok(retry.attempts());
            }
            Err(failure) => {
                if let Some(delay) = retry.fail(failure.clone()) {
                    let notice = transient_error(document, &failure);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %notice, "retrying document");
                    sleeper.sleep(delay).await;
                    continue;
                }
                return Err(match retry.state() {
                    DocumentState::Exhausted { attempts, message } => SyncError::DispatchExhausted {
                        document: document.index,
                        attempts: *attempts,
                        message: message.clone(),
                    },
                    _ => SyncError::DispatchFatal {
                        document: document.index,
                        message: failure.message().to_string(),
                    },
                });
            }
        }
    }
}

/// Workers claim documents in index order from a shared cursor. A failed document stops
/// its worker; the others keep draining. The first failure is returned once all finish.
pub async fn dispatch_all(
    executor: &dyn BatchExecutor,
    sleeper: &dyn Sleeper,
    policy: DispatchPolicy,
    documents: &[BatchDocument],
) -> Result<DispatchReport, SyncError> {
    if documents.is_empty() {
        return Ok(DispatchReport::default());
    }

    let cursor = AtomicUsize::new(0);
    let workers = policy.concurrency.max(1).min(documents.len());

    let results = join_all((0..workers).map(|worker| {
        let cursor = &cursor;
        async move {
            let mut report = DispatchReport::default();
            loop {
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(document) = documents.get(idx) else {
                    return Ok::<DispatchReport, SyncError>(report);
                };
                match dispatch_document(executor, sleeper, policy.backoff, document)
                    .instrument(info_span!("dispatch", worker, document = document.index))
                    .await
                {
                    Ok(attempts) => {
                        report.documents += 1;
                        report.attempts += attempts;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }))
    .await;

    let mut total = DispatchReport::default();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) => {
                total.documents += report.documents;
                total.attempts += report.attempts;
            }
            Err(err) => {
                warn!(error = %err, "dispatch worker stopped");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            info!(documents = total.documents, attempts = total.attempts, "dispatched all documents");
            Ok(total)
        }
    }
}

//! Per-invocation context: request id, cancellation and progress reporting.

use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// One progress report for a running tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

/// Receives progress updates for a tool call.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Discards every update. Used when the caller did not ask for progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Everything a backend operation needs besides its arguments.
#[derive(Clone)]
pub struct OperationContext {
    pub request_id: String,
    pub cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl OperationContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Report progress out of 100.
    pub fn report(&self, percent: u32, message: impl Into<String>) {
        self.progress.report(ProgressUpdate {
            progress: f64::from(percent),
            total: Some(100.0),
            message: Some(message.into()),
        });
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("request_id", &self.request_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A short random id for correlating the log lines of one call.
pub fn new_request_id() -> String {
    format!("{:06x}", rand::thread_rng().gen_range(0..0x100_0000u32))
}

/// Shorten user text for log lines.
pub fn truncate_query(query: &str) -> String {
    const MAX_CHARS: usize = 50;
    if query.chars().count() <= MAX_CHARS {
        query.to_string()
    } else {
        let head: String = query.chars().take(MAX_CHARS).collect();
        format!("{head}...")
    }
}

/// `45s` or `5m 23s`.
pub fn format_elapsed(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

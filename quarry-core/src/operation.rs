//! State tracking for a single remote call.
//!
//! Every outbound request is represented by a [`RemoteOperation`]. Status
//! only moves forward: `Pending -> Running -> {Succeeded, Failed, Cancelled}`.
//! A terminal operation never changes again.

use serde::Serialize;
use tracing::error;

use crate::error::{ResearchError, Result};

/// Lifecycle state of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Map a Responses API `status` string.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(OperationStatus::Pending),
            "in_progress" => Some(OperationStatus::Running),
            "completed" => Some(OperationStatus::Succeeded),
            "failed" | "incomplete" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Running => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Which configured endpoint an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Primary,
    DeepResearch,
}

/// How the result of an operation is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Synchronous,
    Streaming,
    LongRunning,
}

/// Intermediate event observed while an operation runs.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    TextDelta(String),
    Citation { url: String, title: String },
    /// A hosted tool started (`web_search_call`, `code_interpreter_call`).
    ToolCall { kind: String },
    /// A poll observed this provider status.
    Polled { status: OperationStatus },
}

/// A single in-flight remote call.
#[derive(Debug)]
pub struct RemoteOperation {
    endpoint: EndpointKind,
    mode: OperationMode,
    status: OperationStatus,
    remote_id: Option<String>,
    partial_results: Vec<OperationEvent>,
    poll_count: u32,
}

impl RemoteOperation {
    pub fn new(endpoint: EndpointKind, mode: OperationMode) -> Self {
        Self {
            endpoint,
            mode,
            status: OperationStatus::Pending,
            remote_id: None,
            partial_results: Vec::new(),
            poll_count: 0,
        }
    }

    pub fn endpoint(&self) -> EndpointKind {
        self.endpoint
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn set_remote_id(&mut self, id: impl Into<String>) {
        self.remote_id = Some(id.into());
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    pub fn partial_results(&self) -> &[OperationEvent] {
        &self.partial_results
    }

    /// Move to `next`. Repeating the current status is a no-op; moving
    /// backwards or leaving a terminal status is rejected.
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if next == self.status {
            return Ok(());
        }
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            error!(
                endpoint = ?self.endpoint,
                remote_id = ?self.remote_id,
                from = %self.status,
                to = %next,
                "Rejected operation status regression"
            );
            return Err(ResearchError::protocol(format!(
                "Invalid operation state transition: {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record a poll that observed `status`, then transition to it.
    pub fn record_poll(&mut self, status: OperationStatus) -> Result<()> {
        self.poll_count += 1;
        self.partial_results.push(OperationEvent::Polled { status });
        self.transition(status)
    }

    pub fn record(&mut self, event: OperationEvent) {
        self.partial_results.push(event);
    }

    /// Number of hosted tool calls (searches, code runs) observed so far.
    pub fn tool_call_count(&self) -> usize {
        self.partial_results
            .iter()
            .filter(|e| matches!(e, OperationEvent::ToolCall { .. }))
            .count()
    }

    /// Characters of answer text streamed so far.
    pub fn streamed_chars(&self) -> usize {
        self.partial_results
            .iter()
            .map(|e| match e {
                OperationEvent::TextDelta(text) => text.chars().count(),
                _ => 0,
            })
            .sum()
    }
}

//! Error types for the Quarry core library.
//!
//! Uses `thiserror` for the public error taxonomy. Every failure a tool call can
//! produce maps onto one [`ResearchError`] variant, which decides whether the
//! failure is retried and how it is surfaced to the protocol caller.

use std::path::PathBuf;

/// Top-level error type for research operations.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    Validation { tool: String, reason: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Remote service error{}: {message}", status_suffix(.status))]
    RemoteService {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ResearchError {
    /// Create a validation error for the given tool.
    pub fn validation(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ResearchError::Validation {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport-level failure (connection reset, dropped stream, ...).
    pub fn transport(message: impl Into<String>) -> Self {
        ResearchError::RemoteService {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a malformed-payload failure. Never retried.
    pub fn protocol(message: impl Into<String>) -> Self {
        ResearchError::RemoteService {
            status: None,
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the operation that produced this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::RemoteService {
                retryable: true,
                ..
            }
        )
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ResearchError::Validation { .. } => "validation_error",
            ResearchError::Authentication { .. } => "authentication_error",
            ResearchError::RemoteService { .. } => "remote_service_error",
            ResearchError::Timeout { .. } => "timeout_error",
            ResearchError::Cancelled { .. } => "cancelled",
            ResearchError::Config(_) => "configuration_error",
        }
    }
}

impl From<reqwest::Error> for ResearchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let code = status.as_u16();
            ResearchError::RemoteService {
                status: Some(code),
                message: err.to_string(),
                retryable: code == 429 || status.is_server_error(),
            }
        } else if err.is_decode() {
            ResearchError::protocol(format!("Invalid response body: {err}"))
        } else {
            ResearchError::transport(format!("Request failed: {err}"))
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Missing required field: {field} (set {hint})")]
    MissingField { field: String, hint: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// A type alias for results using [`ResearchError`].
pub type Result<T> = std::result::Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = ResearchError::validation("web_research", "missing field `topic`");
        assert_eq!(
            err.to_string(),
            "Invalid arguments for tool 'web_research': missing field `topic`"
        );
    }

    #[test]
    fn test_error_display_remote_with_status() {
        let err = ResearchError::RemoteService {
            status: Some(503),
            message: "upstream unavailable".into(),
            retryable: true,
        };
        assert_eq!(
            err.to_string(),
            "Remote service error (HTTP 503): upstream unavailable"
        );

        let err = ResearchError::transport("connection reset");
        assert_eq!(err.to_string(), "Remote service error: connection reset");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = ResearchError::Timeout {
            operation: "deep_research".into(),
            timeout_secs: 1800,
        };
        assert_eq!(err.to_string(), "deep_research timed out after 1800s");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ResearchError::transport("peer closed").is_retryable());
        assert!(!ResearchError::protocol("bad json").is_retryable());
        assert!(!ResearchError::validation("ask", "empty").is_retryable());
        assert!(
            !ResearchError::Authentication {
                message: "expired".into()
            }
            .is_retryable()
        );
        assert!(
            !ResearchError::Timeout {
                operation: "ask".into(),
                timeout_secs: 30
            }
            .is_retryable()
        );
        assert!(
            !ResearchError::RemoteService {
                status: Some(400),
                message: "bad request".into(),
                retryable: false,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ResearchError::validation("ask", "x").kind(),
            "validation_error"
        );
        assert_eq!(
            ResearchError::Cancelled {
                operation: "ask".into()
            }
            .kind(),
            "cancelled"
        );
        let cfg: ResearchError = ConfigError::Invalid {
            message: "port".into(),
        }
        .into();
        assert_eq!(cfg.kind(), "configuration_error");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingField {
            field: "primary.endpoint".into(),
            hint: "AI_FOUNDRY_ENDPOINT".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required field: primary.endpoint (set AI_FOUNDRY_ENDPOINT)"
        );
    }
}

//! Errors of the MCP front-end and the JSON-RPC codes they map to.

use std::io;

/// Protocol-level failures. Tool failures are not here: they are reported
/// inside a successful `tools/call` result with `isError` set.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("JSON-RPC parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("Server not initialized")]
    NotInitialized,

    /// The stdio pipe or test channel failed. Never sent to a client.
    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),
}

impl McpError {
    pub fn error_code(&self) -> i64 {
        match self {
            McpError::ParseError { .. } => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::InternalError { .. } | McpError::Transport(_) => -32603,
            McpError::ToolNotFound { .. } => -32000,
            McpError::NotInitialized => -32003,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_json_rpc_codes() {
        let cases = [
            (McpError::ParseError { message: "truncated".into() }, -32700),
            (McpError::InvalidRequest { message: "duplicate id".into() }, -32600),
            (McpError::MethodNotFound { method: "resources/list".into() }, -32601),
            (McpError::InvalidParams { message: "missing name".into() }, -32602),
            (McpError::InternalError { message: "encode".into() }, -32603),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "{err}");
        }
    }

    #[test]
    fn test_quarry_specific_codes() {
        let unknown = McpError::ToolNotFound {
            name: "summarize".into(),
        };
        assert_eq!(unknown.error_code(), -32000);
        assert_eq!(unknown.to_string(), "Tool not found: summarize");
        assert_eq!(McpError::NotInitialized.error_code(), -32003);
    }

    #[test]
    fn test_broken_pipe_is_transport_failure() {
        let err: McpError = io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed").into();
        assert!(matches!(err, McpError::Transport(_)));
        assert_eq!(err.error_code(), -32603);
    }
}

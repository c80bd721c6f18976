//! MCP request handlers: routes JSON-RPC requests to the appropriate handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quarry_core::OperationContext;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CancelledParams, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcResponse, ListToolsResult, RequestId, ServerCapabilities, ServerInfo, ToolsCapability,
    negotiate_protocol_version,
};
use crate::registry::ToolRegistry;

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "quarry";

const INSTRUCTIONS: &str = "Web-grounded research tools. Use `ask` for quick factual \
    questions, `web_research` for most research (2-9 min), and `deep_research` only for \
    exhaustive, high-stakes investigations (5-30 min).";

/// Handles MCP protocol requests by delegating to the tool registry.
pub struct RequestHandler {
    registry: Arc<ToolRegistry>,
    initialized: AtomicBool,
    server_info: ServerInfo,
}

impl RequestHandler {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            initialized: AtomicBool::new(false),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// A handler that accepts tool requests without a prior `initialize`.
    /// Stateless HTTP clients may post `tools/call` on a fresh connection.
    pub fn stateless(registry: Arc<ToolRegistry>) -> Self {
        let handler = Self::new(registry);
        handler.initialized.store(true, Ordering::SeqCst);
        handler
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }

    /// Handle the `initialize` request.
    pub fn handle_initialize(&self, params: InitializeParams) -> Result<Value, McpError> {
        let protocol_version = negotiate_protocol_version(&params.protocol_version);
        info!(
            client = %params.client_info.name,
            client_version = ?params.client_info.version,
            requested = %params.protocol_version,
            protocol_version,
            "MCP client connecting"
        );

        self.initialized.store(true, Ordering::SeqCst);

        let result = InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            server_info: self.server_info.clone(),
            instructions: Some(INSTRUCTIONS.to_string()),
        };

        serde_json::to_value(result).map_err(|e| McpError::InternalError {
            message: format!("Failed to serialize initialize result: {e}"),
        })
    }

    /// Handle the `tools/list` request.
    pub fn handle_tools_list(&self) -> Result<Value, McpError> {
        self.ensure_initialized()?;

        let tools = self.registry.list();
        debug!(count = tools.len(), "Listing tools");

        serde_json::to_value(ListToolsResult { tools }).map_err(|e| McpError::InternalError {
            message: format!("Failed to serialize tools list: {e}"),
        })
    }

    /// Handle the `tools/call` request.
    pub async fn handle_tools_call(
        &self,
        params: CallToolParams,
        ctx: &OperationContext,
    ) -> Result<Value, McpError> {
        self.ensure_initialized()?;

        let result = self
            .registry
            .call(&params.name, params.arguments, ctx)
            .await?;

        serde_json::to_value(result).map_err(|e| McpError::InternalError {
            message: format!("Failed to serialize tool result: {e}"),
        })
    }

    /// Route a JSON-RPC method to the appropriate handler.
    ///
    /// `ctx` is used only by `tools/call`. Cancellation of in-flight calls is
    /// owned by the server loop, so `notifications/cancelled` is only
    /// acknowledged here.
    pub async fn route(
        &self,
        method: &str,
        params: Value,
        ctx: &OperationContext,
    ) -> Result<Value, McpError> {
        match method {
            "initialize" => {
                let params: InitializeParams = parse_params(method, params)?;
                self.handle_initialize(params)
            }
            "notifications/initialized" => {
                info!("MCP client initialized successfully");
                Ok(Value::Null)
            }
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => {
                let params: CallToolParams = parse_params(method, params)?;
                self.handle_tools_call(params, ctx).await
            }
            "notifications/cancelled" => {
                let params: CancelledParams = parse_params(method, params)?;
                debug!(request_id = %params.request_id, "Cancellation for a request not in flight");
                Ok(Value::Null)
            }
            _ if method.starts_with("notifications/") => {
                debug!(method, "Ignoring notification");
                Ok(Value::Null)
            }
            _ => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    /// Handle one decoded message. Returns `None` for notifications.
    pub async fn dispatch(
        &self,
        message: IncomingMessage,
        ctx: &OperationContext,
    ) -> Option<JsonRpcResponse> {
        let IncomingMessage {
            jsonrpc,
            id,
            method,
            params,
        } = message;

        let Some(id) = id else {
            if method == "tools/call" {
                // Nobody could receive the result or cancel the call.
                warn!("Dropping tools/call sent without an id");
                return None;
            }
            if let Err(e) = self.route(&method, params, ctx).await {
                debug!(method = %method, error = %e, "Notification handler error");
            }
            return None;
        };

        if jsonrpc != "2.0" {
            return Some(JsonRpcResponse::from_mcp_error(
                id,
                McpError::InvalidRequest {
                    message: format!("Expected jsonrpc version 2.0, got: {jsonrpc}"),
                },
            ));
        }

        debug!(method = %method, id = %id, "Processing request");
        Some(match self.route(&method, params, ctx).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::from_mcp_error(id, e),
        })
    }
}

/// Parse a raw JSON-RPC message, or build the error response for it.
pub fn parse_message(raw: &str) -> Result<IncomingMessage, JsonRpcResponse> {
    serde_json::from_str(raw).map_err(|e| {
        JsonRpcResponse::from_mcp_error(
            RequestId::Null,
            McpError::ParseError {
                message: format!("Invalid JSON-RPC message: {e}"),
            },
        )
    })
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, McpError> {
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
        message: format!("Invalid {method} params: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientCapabilities, ClientInfo, MCP_PROTOCOL_VERSION};
    use crate::registry::Tool;
    use async_trait::async_trait;
    use quarry_core::{ResearchResult, TokenUsage};
    use std::sync::atomic::AtomicUsize;

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "count"
        }

        fn description(&self) -> &str {
            "Counts invocations"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn failure_prefix(&self) -> &str {
            "Count failed: "
        }

        fn summary(&self, _args: &Value) -> String {
            String::new()
        }

        async fn invoke(
            &self,
            _args: Value,
            _ctx: &OperationContext,
        ) -> quarry_core::Result<ResearchResult> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ResearchResult {
                answer_text: "counted".into(),
                citations: vec![],
                duration_seconds: 0.0,
                model: "count-1".into(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn create_test_handler() -> RequestHandler {
        RequestHandler::new(Arc::new(ToolRegistry::new()))
    }

    fn init_params(version: &str) -> InitializeParams {
        InitializeParams {
            protocol_version: version.to_string(),
            capabilities: ClientCapabilities {},
            client_info: ClientInfo {
                name: "test-client".to_string(),
                version: Some("1.0".to_string()),
            },
        }
    }

    #[test]
    fn test_initialize() {
        let handler = create_test_handler();
        assert!(!handler.is_initialized());

        let result = handler
            .handle_initialize(init_params(MCP_PROTOCOL_VERSION))
            .unwrap();
        assert!(handler.is_initialized());

        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"].get("resources").is_none());
        assert_eq!(result["serverInfo"]["name"], "quarry");
        assert!(result["instructions"].as_str().unwrap().contains("web_research"));
    }

    #[test]
    fn test_initialize_echoes_older_supported_version() {
        let handler = create_test_handler();
        let result = handler.handle_initialize(init_params("2024-11-05")).unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
    }

    #[test]
    fn test_tools_list_not_initialized() {
        let handler = create_test_handler();
        let err = handler.handle_tools_list().unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));
    }

    #[test]
    fn test_stateless_handler_skips_initialize() {
        let handler = RequestHandler::stateless(Arc::new(ToolRegistry::new()));
        let result = handler.handle_tools_list().unwrap();
        assert_eq!(result["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_tools_call_not_initialized() {
        let handler = create_test_handler();
        let params = CallToolParams {
            name: "ask".to_string(),
            arguments: Some(json!({"question": "hello"})),
            meta: None,
        };
        let ctx = OperationContext::new("aaaaaa");
        let err = handler.handle_tools_call(params, &ctx).await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));
    }

    #[tokio::test]
    async fn test_route_ping_and_unknown_method() {
        let handler = create_test_handler();
        let ctx = OperationContext::new("aaaaaa");

        assert_eq!(handler.route("ping", Value::Null, &ctx).await.unwrap(), json!({}));

        let err = handler
            .route("resources/list", Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_route_invalid_initialize_params() {
        let handler = create_test_handler();
        let ctx = OperationContext::new("aaaaaa");
        let err = handler
            .route("initialize", json!({"bogus": true}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_notification_has_no_response() {
        let handler = create_test_handler();
        let ctx = OperationContext::new("aaaaaa");
        let message = parse_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(handler.dispatch(message, &ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_tools_call_without_id_is_not_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(CountingTool(calls.clone())))
            .unwrap();
        let handler = RequestHandler::stateless(Arc::new(registry));
        let ctx = OperationContext::new("aaaaaa");

        let message = parse_message(
            r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"count","arguments":{}}}"#,
        )
        .unwrap();
        assert!(handler.dispatch(message, &ctx).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let message = parse_message(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"count","arguments":{}}}"#,
        )
        .unwrap();
        let response = handler.dispatch(message, &ctx).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_wrong_jsonrpc_version() {
        let handler = create_test_handler();
        let ctx = OperationContext::new("aaaaaa");
        let message = parse_message(r#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#).unwrap();
        let response = handler.dispatch(message, &ctx).await.unwrap();
        assert_eq!(response.id, RequestId::Number(9));
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[test]
    fn test_parse_message_error_response() {
        let response = parse_message("not json").unwrap_err();
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.unwrap().code, -32700);
    }
}

//! # Quarry MCP
//!
//! Model Context Protocol (MCP) server exposing Quarry's research tools.
//!
//! The server speaks JSON-RPC 2.0 over stdio (NDJSON) or HTTP, so MCP hosts
//! can call `ask`, `web_research` and `deep_research`.
//!
//! ## Architecture
//!
//! ```text
//! Client <-> Transport (stdio/channel) <-> McpServer <-> RequestHandler
//!                 HTTP (axum) <-----------------^              |
//!                                                      ToolRegistry
//!                                                              |
//!                                                      ResearchBackend
//! ```
//!
//! Tool calls run concurrently, each in its own task with its own
//! cancellation token. Every outgoing message goes through one channel so
//! responses and progress notifications never interleave on the wire.

pub mod error;
pub mod handlers;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod tools;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use error::McpError;
use handlers::{RequestHandler, parse_message};
use protocol::{
    CallToolParams, CancelledParams, IncomingMessage, JsonRpcNotification, JsonRpcResponse,
    ProgressParams, ProgressToken, RequestId,
};
use quarry_core::context::new_request_id;
use quarry_core::{OperationContext, ProgressSink, ProgressUpdate};
use registry::ToolRegistry;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use transport::Transport;

pub use registry::Tool;
pub use tools::register_research_tools;

/// Messages queued for the writer half of the run loop.
enum Outgoing {
    /// A tool call finished. `body` is `None` when the call was cancelled,
    /// since a cancelled request gets no response.
    Reply { id: RequestId, body: Option<String> },
    Notification(String),
}

/// Forwards progress updates as `notifications/progress`.
struct ProgressNotifier {
    token: ProgressToken,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl ProgressSink for ProgressNotifier {
    fn report(&self, update: ProgressUpdate) {
        let params = ProgressParams {
            progress_token: self.token.clone(),
            progress: update.progress,
            total: update.total,
            message: update.message,
        };
        let note = match serde_json::to_value(params) {
            Ok(params) => JsonRpcNotification::new("notifications/progress", Some(params)),
            Err(e) => {
                warn!(error = %e, "Failed to encode progress notification");
                return;
            }
        };
        match serde_json::to_string(&note) {
            // The run loop may already be gone; progress is best-effort.
            Ok(body) => {
                let _ = self.outgoing.send(Outgoing::Notification(body));
            }
            Err(e) => warn!(error = %e, "Failed to encode progress notification"),
        }
    }
}

/// The MCP server that processes JSON-RPC messages over a transport.
pub struct McpServer {
    handler: Arc<RequestHandler>,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            handler: Arc::new(RequestHandler::new(Arc::new(registry))),
        }
    }

    pub fn handler(&self) -> Arc<RequestHandler> {
        self.handler.clone()
    }

    /// Check if the server has been initialized by a client.
    pub fn is_initialized(&self) -> bool {
        self.handler.is_initialized()
    }

    /// Process one raw message to completion, without progress reporting.
    /// Returns `None` for notifications.
    pub async fn process_message(&self, raw: &str) -> Option<JsonRpcResponse> {
        match parse_message(raw) {
            Ok(message) => {
                let ctx = OperationContext::new(new_request_id());
                self.handler.dispatch(message, &ctx).await
            }
            Err(response) => Some(response),
        }
    }

    /// Run the MCP server on the given transport until EOF or a transport error.
    ///
    /// On exit every in-flight tool call is cancelled and awaited before the
    /// transport is closed.
    pub async fn run<T: Transport>(&self, transport: &mut T) -> Result<(), McpError> {
        info!("MCP server starting");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let tracker = TaskTracker::new();
        let mut in_flight: HashMap<RequestId, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                read = transport.read_message() => {
                    let raw = match read {
                        Ok(Some(raw)) => raw,
                        Ok(None) => {
                            info!("Transport closed (EOF), shutting down MCP server");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Transport read error");
                            break;
                        }
                    };
                    if raw.trim().is_empty() {
                        continue;
                    }
                    debug!(message = %raw, "Received MCP message");
                    if let Some(reply) =
                        self.accept(&raw, &outgoing_tx, &tracker, &mut in_flight).await
                    {
                        transport.write_message(&reply).await?;
                    }
                }
                Some(out) = outgoing_rx.recv() => {
                    if let Some(body) = settle(out, &mut in_flight) {
                        transport.write_message(&body).await?;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Cancelling in-flight tool calls");
        }
        for token in in_flight.values() {
            token.cancel();
        }
        tracker.close();
        tracker.wait().await;
        drop(outgoing_tx);

        while let Some(out) = outgoing_rx.recv().await {
            if let Some(body) = settle(out, &mut in_flight) {
                if let Err(e) = transport.write_message(&body).await {
                    debug!(error = %e, "Dropping message after shutdown");
                    break;
                }
            }
        }

        transport.close().await?;
        info!("MCP server stopped");
        Ok(())
    }

    /// Handle one incoming message. Tool calls are spawned; everything else is
    /// answered inline and the encoded reply returned.
    async fn accept(
        &self,
        raw: &str,
        outgoing: &mpsc::UnboundedSender<Outgoing>,
        tracker: &TaskTracker,
        in_flight: &mut HashMap<RequestId, CancellationToken>,
    ) -> Option<String> {
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(response) => {
                warn!("Unparseable MCP message");
                return Some(encode(&response));
            }
        };

        if message.method == "tools/call"
            && message.jsonrpc == "2.0"
            && let Some(id) = message.id.clone()
        {
            if in_flight.contains_key(&id) {
                return Some(encode(&JsonRpcResponse::from_mcp_error(
                    id,
                    McpError::InvalidRequest {
                        message: "A request with this id is already in flight".into(),
                    },
                )));
            }
            let cancel = CancellationToken::new();
            in_flight.insert(id.clone(), cancel.clone());
            self.spawn_call(id, message, cancel, outgoing.clone(), tracker);
            return None;
        }

        if message.method == "notifications/cancelled" && message.id.is_none() {
            cancel_in_flight(message.params, in_flight);
            return None;
        }

        let ctx = OperationContext::new(new_request_id());
        self.handler
            .dispatch(message, &ctx)
            .await
            .map(|response| encode(&response))
    }

    fn spawn_call(
        &self,
        id: RequestId,
        message: IncomingMessage,
        cancel: CancellationToken,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        tracker: &TaskTracker,
    ) {
        let mut ctx = OperationContext::new(new_request_id()).with_cancel(cancel);
        if let Some(token) = progress_token(&message.params) {
            ctx = ctx.with_progress(Arc::new(ProgressNotifier {
                token,
                outgoing: outgoing.clone(),
            }));
        }
        debug!(id = %id, request_id = %ctx.request_id, "Dispatching tool call");

        let handler = self.handler.clone();
        tracker.spawn(async move {
            let response = handler.dispatch(message, &ctx).await;
            let body = if ctx.cancel.is_cancelled() {
                info!(id = %id, request_id = %ctx.request_id, "Tool call cancelled");
                None
            } else {
                response.map(|response| encode(&response))
            };
            let _ = outgoing.send(Outgoing::Reply { id, body });
        });
    }
}

/// Drop a finished call from the in-flight map; return what to write, if anything.
fn settle(out: Outgoing, in_flight: &mut HashMap<RequestId, CancellationToken>) -> Option<String> {
    match out {
        Outgoing::Reply { id, body } => {
            in_flight.remove(&id);
            body
        }
        Outgoing::Notification(body) => Some(body),
    }
}

fn cancel_in_flight(params: Value, in_flight: &HashMap<RequestId, CancellationToken>) {
    let params: CancelledParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "Malformed cancellation notification");
            return;
        }
    };
    match in_flight.get(&params.request_id) {
        Some(token) => {
            info!(id = %params.request_id, reason = ?params.reason, "Cancelling tool call");
            token.cancel();
        }
        None => debug!(id = %params.request_id, "Cancellation for unknown or finished request"),
    }
}

fn progress_token(params: &Value) -> Option<ProgressToken> {
    let params = CallToolParams::deserialize(params).ok()?;
    params.progress_token().cloned()
}

fn encode(response: &JsonRpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
            .to_string()
    })
}

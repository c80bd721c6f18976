//! HTTP front-end: JSON-RPC over `POST {mount_path}`, plus service info and a
//! liveness check.
//!
//! Each POST carries one JSON-RPC message and gets a JSON response.
//! A request runs in its own task; if the client disconnects first, the drop
//! guard cancels the call and the backend issues its remote cancel.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use quarry_core::OperationContext;
use quarry_core::config::ServerConfig;
use quarry_core::context::new_request_id;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::McpError;
use crate::handlers::{RequestHandler, SERVER_NAME, parse_message};
use crate::protocol::{JsonRpcResponse, RequestId};

#[derive(Clone)]
struct HttpState {
    handler: Arc<RequestHandler>,
    mount_path: String,
}

/// Build an axum Router with `/`, `/health` and the MCP route.
pub fn router(handler: Arc<RequestHandler>, mount_path: &str) -> Router {
    let state = HttpState {
        handler,
        mount_path: mount_path.to_string(),
    };
    Router::new()
        .route("/", get(root_info))
        .route("/health", get(health_handler))
        .route(mount_path, post(mcp_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_info(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "service": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "mcp_endpoint": state.mount_path,
        "health_endpoint": "/health",
        "description": format!("Quarry research MCP server - connect MCP clients to {}", state.mount_path),
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": SERVER_NAME }))
}

async fn mcp_handler(State(state): State<HttpState>, body: String) -> Response {
    let message = match parse_message(&body) {
        Ok(message) => message,
        Err(response) => {
            warn!("Unparseable MCP message over HTTP");
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let ctx = OperationContext::new(new_request_id()).with_cancel(cancel);
    let handler = state.handler.clone();

    let outcome = tokio::spawn(async move { handler.dispatch(message, &ctx).await }).await;
    guard.disarm();

    match outcome {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(error = %e, "MCP request task failed");
            let response = JsonRpcResponse::from_mcp_error(
                RequestId::Null,
                McpError::InternalError {
                    message: "request task failed".into(),
                },
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

/// Serve until Ctrl-C.
pub async fn serve(handler: Arc<RequestHandler>, config: &ServerConfig) -> Result<(), McpError> {
    let app = router(handler, &config.mount_path);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, mount_path = %config.mount_path, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Unable to listen for Ctrl-C; serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

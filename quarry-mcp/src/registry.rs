//! Tool Registry: holds the registered tools, validates arguments against
//! each tool's JSON Schema and turns outcomes into MCP tool results.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use quarry_core::context::{format_elapsed, truncate_query};
use quarry_core::{OperationContext, ResearchError, ResearchResult};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::protocol::{CallToolResult, McpTool, ToolContent};

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    /// Prefix for the text of a failed call, e.g. `"Request failed: "`.
    fn failure_prefix(&self) -> &str;

    /// The argument used to label this call in logs.
    fn summary(&self, args: &Value) -> String;

    /// Run the tool. Arguments have already passed schema validation.
    async fn invoke(
        &self,
        args: Value,
        ctx: &OperationContext,
    ) -> quarry_core::Result<ResearchResult>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
}

/// The tool registry holds all registered tools, in registration order.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. Fails on a duplicate name or an uncompilable schema.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), McpError> {
        let name = tool.name().to_string();
        if self.get(&name).is_some() {
            return Err(McpError::InternalError {
                message: format!("Tool already registered: {name}"),
            });
        }
        let schema = tool.input_schema();
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| McpError::InternalError {
                message: format!("Invalid input schema for tool '{name}': {e}"),
            })?;
        debug!(tool = %name, "Registering tool");
        self.tools.push(RegisteredTool { tool, validator });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entry(name).map(|entry| entry.tool.clone())
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|entry| entry.tool.name() == name)
    }

    /// Tool descriptors for `tools/list`.
    pub fn list(&self) -> Vec<McpTool> {
        self.tools
            .iter()
            .map(|entry| McpTool {
                name: entry.tool.name().to_string(),
                description: Some(entry.tool.description().to_string()),
                input_schema: entry.tool.input_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|entry| entry.tool.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check `args` against the named tool's schema.
    pub fn validate(&self, name: &str, args: &Value) -> Result<(), McpError> {
        let entry = self.entry(name).ok_or_else(|| McpError::ToolNotFound {
            name: name.to_string(),
        })?;
        check_schema(entry, args).map_err(|e| McpError::InvalidParams {
            message: e.to_string(),
        })
    }

    /// Validate and run a tool, producing the MCP result.
    ///
    /// Only an unknown tool name is a protocol error; every other failure,
    /// including invalid arguments, becomes an `isError` tool result.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &OperationContext,
    ) -> Result<CallToolResult, McpError> {
        let entry = self.entry(name).ok_or_else(|| McpError::ToolNotFound {
            name: name.to_string(),
        })?;
        let tool = &entry.tool;
        let args = arguments.unwrap_or_else(|| json!({}));

        if let Err(err) = check_schema(entry, &args) {
            warn!(request_id = %ctx.request_id, tool = name, error = %err, "Rejected tool arguments");
            return Ok(failure_result(tool.failure_prefix(), &err));
        }

        info!(
            request_id = %ctx.request_id,
            tool = name,
            query = %truncate_query(&tool.summary(&args)),
            "Tool call started"
        );
        let started = Instant::now();

        match tool.invoke(args, ctx).await {
            Ok(result) => {
                info!(
                    request_id = %ctx.request_id,
                    tool = name,
                    model = %result.model,
                    usage = %result.usage,
                    citations = result.citations.len(),
                    elapsed = %format_elapsed(started.elapsed().as_secs_f64()),
                    "Tool call finished"
                );
                Ok(success_result(&result))
            }
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    tool = name,
                    kind = err.kind(),
                    error = %err,
                    elapsed = %format_elapsed(started.elapsed().as_secs_f64()),
                    "Tool call failed"
                );
                Ok(failure_result(tool.failure_prefix(), &err))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_schema(entry: &RegisteredTool, args: &Value) -> Result<(), ResearchError> {
    entry
        .validator
        .validate(args)
        .map_err(|e| ResearchError::validation(entry.tool.name(), e.to_string()))
}

// ---------------------------------------------------------------------------
// Result formatting
// ---------------------------------------------------------------------------

/// Answer text, a Sources block when citations exist, and the structured form.
pub fn success_result(result: &ResearchResult) -> CallToolResult {
    let mut content = vec![ToolContent::text(result.answer_text.clone())];
    if !result.citations.is_empty() {
        let sources = result
            .citations
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. [{}]({})", i + 1, c.title, c.url))
            .collect::<Vec<_>>()
            .join("\n");
        content.push(ToolContent::text(format!("Sources:\n{sources}")));
    }
    CallToolResult {
        content,
        structured_content: serde_json::to_value(result).ok(),
        is_error: None,
    }
}

pub fn failure_result(prefix: &str, err: &ResearchError) -> CallToolResult {
    CallToolResult {
        content: vec![ToolContent::text(format!("{prefix}{err}"))],
        structured_content: Some(json!({
            "error": {
                "kind": err.kind(),
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            }
        })),
        is_error: Some(true),
    }
}

//! The three research tools exposed over MCP.
//!
//! Each tool decodes its arguments into a typed struct, rejects blank text and
//! hands off to a [`ResearchBackend`].

use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{OperationContext, ResearchBackend, ResearchError, ResearchResult};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::McpError;
use crate::registry::{Tool, ToolRegistry};

pub const ASK: &str = "ask";
pub const WEB_RESEARCH: &str = "web_research";
pub const DEEP_RESEARCH: &str = "deep_research";

#[derive(Debug, Deserialize)]
struct AskArgs {
    question: String,
}

#[derive(Debug, Deserialize)]
struct WebResearchArgs {
    topic: String,
}

#[derive(Debug, Deserialize)]
struct DeepResearchArgs {
    topic: String,
    #[serde(default)]
    skip_synthesis: bool,
}

fn decode<T: DeserializeOwned>(tool: &str, args: Value) -> quarry_core::Result<T> {
    serde_json::from_value(args).map_err(|e| ResearchError::validation(tool, e.to_string()))
}

fn require_text<'a>(tool: &str, field: &str, value: &'a str) -> quarry_core::Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ResearchError::validation(
            tool,
            format!("`{field}` must not be blank"),
        ));
    }
    Ok(trimmed)
}

fn text_arg(args: &Value, field: &str) -> String {
    args.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ── ask ─────────────────────────────────────────────────────────────

pub struct AskTool {
    backend: Arc<dyn ResearchBackend>,
}

impl AskTool {
    pub fn new(backend: Arc<dyn ResearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        ASK
    }

    fn description(&self) -> &str {
        "Answer questions conversationally with real-time web search. Fast responses for everyday queries."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "Question or topic to get a quick, conversational answer about"
                }
            },
            "required": ["question"]
        })
    }

    fn failure_prefix(&self) -> &str {
        "Request failed: "
    }

    fn summary(&self, args: &Value) -> String {
        text_arg(args, "question")
    }

    async fn invoke(
        &self,
        args: Value,
        ctx: &OperationContext,
    ) -> quarry_core::Result<ResearchResult> {
        let args: AskArgs = decode(ASK, args)?;
        let question = require_text(ASK, "question", &args.question)?;
        self.backend.ask(question, ctx).await
    }
}

// ── web_research ────────────────────────────────────────────────────

pub struct WebResearchTool {
    backend: Arc<dyn ResearchBackend>,
}

impl WebResearchTool {
    pub fn new(backend: Arc<dyn ResearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebResearchTool {
    fn name(&self) -> &str {
        WEB_RESEARCH
    }

    fn description(&self) -> &str {
        "Search the web iteratively, crawling 10-25 sources (2-9 min). DEFAULT for research \
         questions. Searches, reads, refines, repeats until comprehensive. Use for: market \
         analysis, technical topics, competitive research, \"tell me about X\". Only escalate \
         to deep_research for high-stakes verification."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "Research topic - crawls 10-25 web sources (2-9 min)"
                }
            },
            "required": ["topic"]
        })
    }

    fn failure_prefix(&self) -> &str {
        "Web research failed: "
    }

    fn summary(&self, args: &Value) -> String {
        text_arg(args, "topic")
    }

    async fn invoke(
        &self,
        args: Value,
        ctx: &OperationContext,
    ) -> quarry_core::Result<ResearchResult> {
        let args: WebResearchArgs = decode(WEB_RESEARCH, args)?;
        let topic = require_text(WEB_RESEARCH, "topic", &args.topic)?;
        self.backend.web_research(topic, ctx).await
    }
}

// ── deep_research ───────────────────────────────────────────────────

pub struct DeepResearchTool {
    backend: Arc<dyn ResearchBackend>,
}

impl DeepResearchTool {
    pub fn new(backend: Arc<dyn ResearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for DeepResearchTool {
    fn name(&self) -> &str {
        DEEP_RESEARCH
    }

    fn description(&self) -> &str {
        "Exhaustive research using the deep research model. VERY SLOW (5-30 min) and \
         EXPENSIVE. Use ONLY for: due diligence, high-stakes decisions, adversarial \
         verification, when web_research isn't thorough enough. For most research, use \
         web_research instead."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "High-stakes research requiring exhaustive verification (use sparingly)"
                },
                "skip_synthesis": {
                    "type": "boolean",
                    "default": false,
                    "description": "Return raw research without final polish (faster)"
                }
            },
            "required": ["topic"]
        })
    }

    fn failure_prefix(&self) -> &str {
        "Research failed: "
    }

    fn summary(&self, args: &Value) -> String {
        text_arg(args, "topic")
    }

    async fn invoke(
        &self,
        args: Value,
        ctx: &OperationContext,
    ) -> quarry_core::Result<ResearchResult> {
        let args: DeepResearchArgs = decode(DEEP_RESEARCH, args)?;
        let topic = require_text(DEEP_RESEARCH, "topic", &args.topic)?;
        self.backend
            .deep_research(topic, args.skip_synthesis, ctx)
            .await
    }
}

/// Register `ask`, `web_research` and `deep_research`, in that order.
pub fn register_research_tools(
    registry: &mut ToolRegistry,
    backend: Arc<dyn ResearchBackend>,
) -> Result<(), McpError> {
    registry.register(Arc::new(AskTool::new(backend.clone())))?;
    registry.register(Arc::new(WebResearchTool::new(backend.clone())))?;
    registry.register(Arc::new(DeepResearchTool::new(backend)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::TokenUsage;
    use std::sync::Mutex;

    /// Records every backend call it receives.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, call: String) -> quarry_core::Result<ResearchResult> {
            self.calls.lock().unwrap().push(call.clone());
            Ok(ResearchResult {
                answer_text: call,
                citations: vec![],
                duration_seconds: 0.1,
                model: "test-model".into(),
                usage: TokenUsage::default(),
            })
        }
    }

    #[async_trait]
    impl ResearchBackend for RecordingBackend {
        async fn ask(
            &self,
            question: &str,
            _ctx: &OperationContext,
        ) -> quarry_core::Result<ResearchResult> {
            self.answer(format!("ask:{question}"))
        }

        async fn web_research(
            &self,
            topic: &str,
            _ctx: &OperationContext,
        ) -> quarry_core::Result<ResearchResult> {
            self.answer(format!("web:{topic}"))
        }

        async fn deep_research(
            &self,
            topic: &str,
            skip_synthesis: bool,
            _ctx: &OperationContext,
        ) -> quarry_core::Result<ResearchResult> {
            self.answer(format!("deep:{topic}:{skip_synthesis}"))
        }
    }

    fn setup() -> (ToolRegistry, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let mut registry = ToolRegistry::new();
        register_research_tools(&mut registry, backend.clone()).unwrap();
        (registry, backend)
    }

    #[test]
    fn test_tools_registered_in_order() {
        let (registry, _) = setup();
        assert_eq!(registry.names(), vec![ASK, WEB_RESEARCH, DEEP_RESEARCH]);
    }

    #[tokio::test]
    async fn test_arguments_are_trimmed_and_routed() {
        let (registry, backend) = setup();
        let ctx = OperationContext::new("000001");

        registry
            .call(ASK, Some(json!({"question": "  why is the sky blue? "})), &ctx)
            .await
            .unwrap();
        registry
            .call(WEB_RESEARCH, Some(json!({"topic": "heat pumps"})), &ctx)
            .await
            .unwrap();
        registry
            .call(
                DEEP_RESEARCH,
                Some(json!({"topic": "grid storage", "skip_synthesis": true})),
                &ctx,
            )
            .await
            .unwrap();
        registry
            .call(DEEP_RESEARCH, Some(json!({"topic": "grid storage"})), &ctx)
            .await
            .unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                "ask:why is the sky blue?",
                "web:heat pumps",
                "deep:grid storage:true",
                "deep:grid storage:false",
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_topic_never_reaches_backend() {
        let (registry, backend) = setup();
        let ctx = OperationContext::new("000002");

        let result = registry
            .call(WEB_RESEARCH, Some(json!({"topic": "   "})), &ctx)
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert_eq!(
            result.structured_content.unwrap()["error"]["kind"],
            "validation_error"
        );
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_topic_uses_tool_prefix() {
        let (registry, backend) = setup();
        let ctx = OperationContext::new("000003");

        let result = registry
            .call(DEEP_RESEARCH, Some(json!({"skip_synthesis": true})), &ctx)
            .await
            .unwrap();

        let crate::protocol::ToolContent::Text { text } = &result.content[0];
        assert!(text.starts_with("Research failed: "));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_skip_synthesis_must_be_boolean() {
        let (registry, backend) = setup();
        let ctx = OperationContext::new("000004");

        let result = registry
            .call(
                DEEP_RESEARCH,
                Some(json!({"topic": "x", "skip_synthesis": "yes"})),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert!(backend.calls().is_empty());
    }
}

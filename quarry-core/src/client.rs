//! Inference client for Azure AI Foundry's Responses API.
//!
//! [`FoundryClient`] implements [`ResearchBackend`] on top of two endpoints:
//! the primary chat endpoint (quick answers, streamed web research and the
//! auxiliary steps of deep research) and the deep-research endpoint, where
//! work is submitted as a background response and polled until it finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PollingConfig, RetryConfig, ServiceConfig, TimeoutConfig};
use crate::context::{OperationContext, format_elapsed};
use crate::credential::Credential;
use crate::error::{ConfigError, ResearchError, Result};
use crate::normalize::{
    ResearchResult, StreamAccumulator, StreamStep, TokenUsage, dedup_citations, duration_seconds,
    failure_message, normalize_response,
};
use crate::operation::{
    EndpointKind, OperationEvent, OperationMode, OperationStatus, RemoteOperation,
};
use crate::prompts;
use crate::retry::{PollSchedule, sleep_or_cancel, with_retry};
use crate::sse::SseDecoder;

/// Budget for a single poll, submit or cancel request.
const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Body excerpts in error messages are capped at this many characters.
const ERROR_BODY_LIMIT: usize = 500;

/// The three research operations exposed as tools.
#[async_trait]
pub trait ResearchBackend: Send + Sync {
    /// Quick web-grounded answer.
    async fn ask(&self, question: &str, ctx: &OperationContext) -> Result<ResearchResult>;

    /// Iterative multi-source web research.
    async fn web_research(&self, topic: &str, ctx: &OperationContext) -> Result<ResearchResult>;

    /// Exhaustive deep research: triage, brief, background research and an
    /// optional synthesis pass.
    async fn deep_research(
        &self,
        topic: &str,
        skip_synthesis: bool,
        ctx: &OperationContext,
    ) -> Result<ResearchResult>;
}

/// A configured endpoint: base URL plus the deployment sent as `model`.
#[derive(Debug, Clone)]
struct Endpoint {
    kind: EndpointKind,
    base_url: String,
    deployment: String,
}

impl Endpoint {
    fn responses_url(&self) -> String {
        format!("{}/responses", self.base_url)
    }

    fn response_url(&self, id: &str) -> String {
        format!("{}/responses/{}", self.base_url, id)
    }

    fn cancel_url(&self, id: &str) -> String {
        format!("{}/responses/{}/cancel", self.base_url, id)
    }
}

/// One synchronous Responses call.
struct ChatRequest<'a> {
    phase: &'a str,
    system_prompt: &'a str,
    user_input: &'a str,
    web_search: bool,
    budget: Duration,
}

/// Client for the Foundry Responses API.
pub struct FoundryClient {
    http: reqwest::Client,
    credential: Arc<Credential>,
    primary: Endpoint,
    deep: Endpoint,
    retry: RetryConfig,
    polling: PollingConfig,
    timeouts: TimeoutConfig,
}

impl FoundryClient {
    /// Build a client from validated configuration.
    pub fn new(config: &ServiceConfig, credential: Arc<Credential>) -> Result<Self> {
        let endpoint = |kind, section: &crate::config::EndpointConfig, field: &str, hint: &str| {
            section
                .base_url()
                .map(|base| Endpoint {
                    kind,
                    base_url: base.to_string(),
                    deployment: section.deployment.clone(),
                })
                .ok_or_else(|| ConfigError::MissingField {
                    field: field.to_string(),
                    hint: hint.to_string(),
                })
        };
        let primary = endpoint(
            EndpointKind::Primary,
            &config.primary,
            "primary.endpoint",
            "AI_FOUNDRY_ENDPOINT",
        )?;
        let deep = endpoint(
            EndpointKind::DeepResearch,
            &config.deep_research,
            "deep_research.endpoint",
            "AI_FOUNDRY_DEEP_RESEARCH_ENDPOINT",
        )?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ResearchError::transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            credential,
            primary,
            deep,
            retry: config.retry.clone(),
            polling: config.polling.clone(),
            timeouts: config.timeouts.clone(),
        })
    }

    // ── HTTP plumbing ───────────────────────────────────────────────────────

    /// Send one authenticated request. A 401/403 invalidates the cached token
    /// and is retried once with a fresh one.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut refreshed = false;
        loop {
            let token = self.credential.token().await?;
            let mut request = self.http.request(method.clone(), url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            debug!(%method, url, "Sending Foundry request");
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body_text = response.text().await.unwrap_or_default();
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                if !refreshed {
                    warn!(%status, url, "Token rejected, refreshing and retrying once");
                    self.credential.invalidate().await;
                    refreshed = true;
                    continue;
                }
                return Err(ResearchError::Authentication {
                    message: format!(
                        "Endpoint rejected the access token (HTTP {}): {}",
                        status.as_u16(),
                        error_detail(&body_text)
                    ),
                });
            }
            return Err(map_http_error(status, &body_text));
        }
    }

    async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let response = self.send(method, url, body, Some(timeout)).await?;
        Ok(response.json::<Value>().await?)
    }

    // ── Synchronous calls ───────────────────────────────────────────────────

    /// One synchronous call on the primary endpoint, retried on transient
    /// failures and bounded by `request.budget`.
    async fn respond(
        &self,
        request: ChatRequest<'_>,
        ctx: &OperationContext,
    ) -> Result<ResearchResult> {
        let endpoint = &self.primary;
        let body = request_body(
            &endpoint.deployment,
            Some(request.system_prompt),
            request.user_input,
            if request.web_search {
                vec![web_search_tool()]
            } else {
                Vec::new()
            },
        );
        let url = endpoint.responses_url();
        let started_at = Utc::now();

        let payload = bounded(ctx, request.phase, request.budget, async {
            let mut op = RemoteOperation::new(endpoint.kind, OperationMode::Synchronous);
            op.transition(OperationStatus::Running)?;
            let payload = with_retry(&self.retry, &ctx.cancel, request.phase, |_| {
                self.send_json(Method::POST, &url, Some(&body), request.budget)
            })
            .await?;
            let status = provider_status(&payload).unwrap_or(OperationStatus::Succeeded);
            op.transition(status)?;
            if status != OperationStatus::Succeeded {
                return Err(ResearchError::protocol(failure_message(&payload)));
            }
            Ok::<_, ResearchError>(payload)
        })
        .await?;

        let result = normalize_response(&payload, started_at, Utc::now(), &endpoint.deployment);
        info!(
            request_id = %ctx.request_id,
            phase = request.phase,
            model = %result.model,
            duration = %format_elapsed(result.duration_seconds),
            chars = result.answer_text.len(),
            usage = %result.usage,
            "Phase complete"
        );
        Ok(result)
    }

    // ── Streaming ───────────────────────────────────────────────────────────

    /// Read one streamed response to its terminal event.
    async fn stream_once(&self, body: &Value, ctx: &OperationContext) -> Result<ResearchResult> {
        let endpoint = &self.primary;
        let started_at = Utc::now();
        let started = Instant::now();
        let log_every = Duration::from_secs(self.polling.progress_log_interval_secs.max(1));
        let mut last_log = Instant::now();

        let response = self
            .send(Method::POST, &endpoint.responses_url(), Some(body), None)
            .await?;

        let mut op = RemoteOperation::new(endpoint.kind, OperationMode::Streaming);
        let mut accumulator = StreamAccumulator::new();
        let mut decoder = SseDecoder::new();
        let mut byte_stream = response.bytes_stream();
        let mut terminal: Option<StreamStep> = None;

        'read: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk
                .map_err(|e| ResearchError::transport(format!("Stream interrupted: {e}")))?;
            for data in decoder.push(&chunk) {
                if let Some(step) = apply_stream_event(&mut op, &mut accumulator, &data)? {
                    terminal = Some(step);
                    break 'read;
                }
            }

            if last_log.elapsed() >= log_every {
                info!(
                    request_id = %ctx.request_id,
                    elapsed = %format_elapsed(started.elapsed().as_secs_f64()),
                    chars = op.streamed_chars(),
                    searches = op.tool_call_count(),
                    "Web research in progress"
                );
                last_log = Instant::now();
            }
        }
        if terminal.is_none()
            && let Some(data) = decoder.finish()
        {
            terminal = apply_stream_event(&mut op, &mut accumulator, &data)?;
        }

        match terminal {
            Some(StreamStep::Completed) => {
                let result = accumulator.finish(started_at, Utc::now(), &endpoint.deployment);
                info!(
                    request_id = %ctx.request_id,
                    duration = %format_elapsed(result.duration_seconds),
                    chars = result.answer_text.len(),
                    searches = op.tool_call_count(),
                    sources = result.citations.len(),
                    usage = %result.usage,
                    "Web research complete"
                );
                Ok(result)
            }
            Some(StreamStep::Failed(message)) => Err(ResearchError::RemoteService {
                status: None,
                message,
                retryable: false,
            }),
            _ => Err(ResearchError::transport(
                "Stream ended before the response completed",
            )),
        }
    }

    // ── Background operations ───────────────────────────────────────────────

    /// Submit a background response to the deep-research endpoint and poll it
    /// to completion. On timeout or cancellation a remote cancel is sent once.
    async fn run_background(&self, input: &str, ctx: &OperationContext) -> Result<ResearchResult> {
        let endpoint = &self.deep;
        let budget = self.timeouts.deep_research();
        let started_at = Utc::now();
        let mut op = RemoteOperation::new(endpoint.kind, OperationMode::LongRunning);
        let cancelled = || ResearchError::Cancelled {
            operation: "deep_research".to_string(),
        };
        let timed_out = || ResearchError::Timeout {
            operation: "deep_research".to_string(),
            timeout_secs: budget.as_secs(),
        };

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        let submit = self.submit_background(input, ctx);
        tokio::pin!(submit);

        let submitted = tokio::select! {
            created = &mut submit => Ok(created),
            _ = ctx.cancel.cancelled() => Err(cancelled()),
            _ = &mut deadline => Err(timed_out()),
        };
        let created = match submitted {
            Ok(created) => created?,
            Err(e) => {
                // The service may have accepted the submit already; its id is
                // needed to cancel the job.
                if let Ok(created) = submit.await
                    && let Some(id) = response_id(&created)
                {
                    self.cancel_remote(endpoint, id, &ctx.request_id).await;
                }
                return Err(e);
            }
        };

        let id = response_id(&created)
            .ok_or_else(|| ResearchError::protocol("Background response has no id"))?
            .to_string();
        op.set_remote_id(&id);
        op.transition(provider_status(&created).unwrap_or(OperationStatus::Pending))?;
        info!(request_id = %ctx.request_id, remote_id = %id, model = %endpoint.deployment, "Deep research submitted");

        let outcome = if op.is_terminal() {
            terminal_payload(op.status(), created)
        } else {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(cancelled()),
                _ = &mut deadline => Err(timed_out()),
                result = self.poll_background(&mut op, &id, ctx) => result,
            }
        };

        match outcome {
            Ok(payload) => {
                let result =
                    normalize_response(&payload, started_at, Utc::now(), &endpoint.deployment);
                info!(
                    request_id = %ctx.request_id,
                    polls = op.poll_count(),
                    duration = %format_elapsed(result.duration_seconds),
                    chars = result.answer_text.len(),
                    sources = result.citations.len(),
                    usage = %result.usage,
                    "Deep research complete"
                );
                Ok(result)
            }
            Err(e) => {
                if matches!(
                    e,
                    ResearchError::Timeout { .. } | ResearchError::Cancelled { .. }
                ) && !op.is_terminal()
                {
                    self.cancel_remote(endpoint, &id, &ctx.request_id).await;
                    // Partial results of an abandoned operation are dropped with it.
                    let _ = op.transition(OperationStatus::Cancelled);
                }
                Err(e)
            }
        }
    }

    async fn submit_background(&self, input: &str, ctx: &OperationContext) -> Result<Value> {
        let endpoint = &self.deep;
        let body = json!({
            "model": endpoint.deployment,
            "input": input,
            "background": true,
            "store": true,
            "tools": [web_search_tool(), code_interpreter_tool()],
        });

        let submit_url = endpoint.responses_url();
        with_retry(&self.retry, &ctx.cancel, "deep_research.submit", |_| {
            self.send_json(
                Method::POST,
                &submit_url,
                Some(&body),
                CONTROL_REQUEST_TIMEOUT,
            )
        })
        .await
    }

    async fn poll_background(
        &self,
        op: &mut RemoteOperation,
        id: &str,
        ctx: &OperationContext,
    ) -> Result<Value> {
        let endpoint = &self.deep;
        let poll_url = endpoint.response_url(id);
        let mut schedule = PollSchedule::new(&self.polling);
        let started = Instant::now();
        let log_every = Duration::from_secs(self.polling.progress_log_interval_secs.max(1));
        let mut last_log = Instant::now();

        loop {
            sleep_or_cancel(schedule.next_delay(), &ctx.cancel, "deep_research").await?;

            let payload = with_retry(&self.retry, &ctx.cancel, "deep_research.poll", |_| {
                self.send_json(Method::GET, &poll_url, None, CONTROL_REQUEST_TIMEOUT)
            })
            .await?;
            let status = provider_status(&payload).ok_or_else(|| {
                ResearchError::protocol(format!(
                    "Unrecognised response status: {}",
                    payload.get("status").unwrap_or(&Value::Null)
                ))
            })?;
            op.record_poll(status)?;

            if op.is_terminal() {
                return terminal_payload(status, payload);
            }

            let elapsed_secs = started.elapsed().as_secs();
            let elapsed = format_elapsed(elapsed_secs as f64);
            ctx.report(
                research_progress(elapsed_secs),
                format!("Researching... {elapsed} elapsed"),
            );
            if last_log.elapsed() >= log_every {
                info!(
                    request_id = %ctx.request_id,
                    remote_id = id,
                    status = %status,
                    polls = op.poll_count(),
                    elapsed = %elapsed,
                    "Deep research in progress"
                );
                last_log = Instant::now();
            }
        }
    }

    /// Best-effort remote cancel. Failures are logged, never surfaced.
    async fn cancel_remote(&self, endpoint: &Endpoint, id: &str, request_id: &str) {
        let url = endpoint.cancel_url(id);
        match self
            .send(Method::POST, &url, None, Some(CONTROL_REQUEST_TIMEOUT))
            .await
        {
            Ok(_) => info!(request_id, remote_id = id, "Remote operation cancelled"),
            Err(e) => warn!(request_id, remote_id = id, error = %e, "Remote cancel failed"),
        }
    }
}

#[async_trait]
impl ResearchBackend for FoundryClient {
    async fn ask(&self, question: &str, ctx: &OperationContext) -> Result<ResearchResult> {
        self.respond(
            ChatRequest {
                phase: "ask",
                system_prompt: prompts::ASK_PROMPT,
                user_input: question,
                web_search: true,
                budget: self.timeouts.ask(),
            },
            ctx,
        )
        .await
    }

    async fn web_research(&self, topic: &str, ctx: &OperationContext) -> Result<ResearchResult> {
        let mut body = request_body(
            &self.primary.deployment,
            Some(prompts::RESEARCH_PROMPT),
            topic,
            vec![web_search_tool()],
        );
        body["stream"] = Value::Bool(true);

        info!(request_id = %ctx.request_id, model = %self.primary.deployment, "Web research started");
        bounded(
            ctx,
            "web_research",
            self.timeouts.web_research(),
            with_retry(&self.retry, &ctx.cancel, "web_research", |_| {
                self.stream_once(&body, ctx)
            }),
        )
        .await
    }

    async fn deep_research(
        &self,
        topic: &str,
        skip_synthesis: bool,
        ctx: &OperationContext,
    ) -> Result<ResearchResult> {
        let started_at = Utc::now();
        let mut usage = TokenUsage::default();
        let chat_budget = self.timeouts.chat();

        ctx.report(0, "Analyzing query scope...");
        let triage = self
            .respond(
                ChatRequest {
                    phase: "triage",
                    system_prompt: prompts::TRIAGE_PROMPT,
                    user_input: topic,
                    web_search: false,
                    budget: chat_budget,
                },
                ctx,
            )
            .await?;
        usage.accumulate(triage.usage);
        let scope = prompts::scope_for_triage(&triage.answer_text);
        debug!(request_id = %ctx.request_id, scope, "Triage complete");

        ctx.report(5, "Creating research brief...");
        let brief_input = prompts::instruction_input(topic, scope);
        let brief = self
            .respond(
                ChatRequest {
                    phase: "brief",
                    system_prompt: prompts::INSTRUCTION_PROMPT,
                    user_input: &brief_input,
                    web_search: false,
                    budget: chat_budget,
                },
                ctx,
            )
            .await?;
        usage.accumulate(brief.usage);
        let instructions = if brief.answer_text.trim().is_empty() {
            warn!(request_id = %ctx.request_id, "Empty research brief, using the query directly");
            topic
        } else {
            brief.answer_text.as_str()
        };

        ctx.report(10, "Deep research in progress (this takes 5-30 minutes)...");
        let research = self
            .run_background(&prompts::research_input(instructions), ctx)
            .await?;
        usage.accumulate(research.usage);
        if research.answer_text.trim().is_empty() {
            return Err(ResearchError::protocol(
                "Research completed but no output was generated.",
            ));
        }

        let (answer_text, citations, done) = if skip_synthesis {
            (
                research.answer_text,
                research.citations,
                "Complete (synthesis skipped)",
            )
        } else {
            ctx.report(85, "Synthesizing final report...");
            let synthesis_input =
                prompts::synthesis_input(topic, scope, &research.answer_text);
            let synthesis = self
                .respond(
                    ChatRequest {
                        phase: "synthesis",
                        system_prompt: prompts::SYNTHESIS_PROMPT,
                        user_input: &synthesis_input,
                        web_search: false,
                        budget: chat_budget,
                    },
                    ctx,
                )
                .await?;
            usage.accumulate(synthesis.usage);
            let citations = dedup_citations(
                research
                    .citations
                    .into_iter()
                    .chain(synthesis.citations),
            );
            if synthesis.answer_text.trim().is_empty() {
                warn!(request_id = %ctx.request_id, "Empty synthesis, returning raw findings");
                (research.answer_text, citations, "Research complete")
            } else {
                (synthesis.answer_text, citations, "Research complete")
            }
        };

        ctx.report(100, done);
        Ok(ResearchResult {
            answer_text,
            citations,
            duration_seconds: duration_seconds(started_at, Utc::now()),
            model: research.model,
            usage,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Run `fut` under a wall-clock budget, stopping early on cancellation.
async fn bounded<T>(
    ctx: &OperationContext,
    operation: &str,
    budget: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ResearchError::Cancelled {
            operation: operation.to_string(),
        }),
        result = tokio::time::timeout(budget, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ResearchError::Timeout {
                operation: operation.to_string(),
                timeout_secs: budget.as_secs(),
            }),
        },
    }
}

/// Fold one SSE payload into the operation. Returns the step when it is
/// terminal.
fn apply_stream_event(
    op: &mut RemoteOperation,
    accumulator: &mut StreamAccumulator,
    data: &str,
) -> Result<Option<StreamStep>> {
    let event: Value = serde_json::from_str(data)
        .map_err(|e| ResearchError::protocol(format!("Invalid stream event: {e}")))?;
    let step = accumulator.apply(&event);
    match &step {
        StreamStep::Created { id } => {
            op.set_remote_id(id.clone());
            op.transition(OperationStatus::Running)?;
        }
        StreamStep::TextDelta(delta) => op.record(OperationEvent::TextDelta(delta.clone())),
        StreamStep::Citation(citation) => op.record(OperationEvent::Citation {
            url: citation.url.clone(),
            title: citation.title.clone(),
        }),
        StreamStep::ToolCall { kind } => op.record(OperationEvent::ToolCall { kind: kind.clone() }),
        StreamStep::Completed => {
            op.transition(OperationStatus::Succeeded)?;
            return Ok(Some(step));
        }
        StreamStep::Failed(_) => {
            op.transition(OperationStatus::Failed)?;
            return Ok(Some(step));
        }
        StreamStep::Ignored => {}
    }
    Ok(None)
}

fn terminal_payload(status: OperationStatus, payload: Value) -> Result<Value> {
    match status {
        OperationStatus::Succeeded => Ok(payload),
        OperationStatus::Cancelled => Err(ResearchError::RemoteService {
            status: None,
            message: "Research was cancelled by the service".to_string(),
            retryable: false,
        }),
        _ => Err(ResearchError::RemoteService {
            status: None,
            message: failure_message(&payload),
            retryable: false,
        }),
    }
}

fn response_id(payload: &Value) -> Option<&str> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn provider_status(payload: &Value) -> Option<OperationStatus> {
    payload
        .get("status")
        .and_then(Value::as_str)
        .and_then(OperationStatus::from_provider)
}

/// Progress percentage for the research phase: 10% plus 5% per elapsed
/// minute, capped at 80%.
fn research_progress(elapsed_secs: u64) -> u32 {
    (10 + elapsed_secs / 12).min(80) as u32
}

fn web_search_tool() -> Value {
    json!({"type": "web_search_preview"})
}

fn code_interpreter_tool() -> Value {
    json!({"type": "code_interpreter", "container": {"type": "auto"}})
}

/// Responses API request with a developer (system) message and a user message.
fn request_body(
    deployment: &str,
    system_prompt: Option<&str>,
    user_input: &str,
    tools: Vec<Value>,
) -> Value {
    let mut input = Vec::with_capacity(2);
    if let Some(system_prompt) = system_prompt {
        input.push(json!({
            "role": "developer",
            "content": [{"type": "input_text", "text": system_prompt}],
        }));
    }
    input.push(json!({
        "role": "user",
        "content": [{"type": "input_text", "text": user_input}],
    }));

    let mut body = json!({
        "model": deployment,
        "input": input,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }
    body
}

/// Pull `error.message` out of an error body, or fall back to a truncated body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(ERROR_BODY_LIMIT).collect())
}

/// Map a non-success, non-auth HTTP status to a [`ResearchError`].
fn map_http_error(status: StatusCode, body: &str) -> ResearchError {
    let code = status.as_u16();
    debug!(status = code, body = %body, "Foundry request failed");
    ResearchError::RemoteService {
        status: Some(code),
        message: error_detail(body),
        retryable: code == 429 || status.is_server_error(),
    }
}

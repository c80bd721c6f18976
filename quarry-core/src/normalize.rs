//! Response normalization: provider payloads and stream events into a flat
//! [`ResearchResult`].
//!
//! Everything here is pure. The Responses API nests answer text inside
//! `output[].content[]`; citations ride along as `url_citation` annotations on
//! each text segment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A source reference attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

impl std::fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in / {} out tokens",
            self.input_tokens, self.output_tokens
        )
    }
}

/// The flattened outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub duration_seconds: f64,
    pub model: String,
    pub usage: TokenUsage,
}

/// Seconds between two instants, never negative.
pub fn duration_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> f64 {
    let millis = (finished_at - started_at).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Keep the first occurrence of each URL, preserving order.
pub fn dedup_citations(citations: impl IntoIterator<Item = Citation>) -> Vec<Citation> {
    let mut seen = HashSet::new();
    citations
        .into_iter()
        .filter(|c| seen.insert(c.url.clone()))
        .collect()
}

/// Iterate the `output_text` content parts of every `message` output item.
fn output_text_parts(payload: &Value) -> impl Iterator<Item = &Value> {
    payload
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
}

/// Concatenate all answer text in a response payload.
///
/// Falls back to a top-level `output_text` field when the payload has no
/// message output.
pub fn extract_text(payload: &Value) -> String {
    let text: String = output_text_parts(payload)
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if !text.is_empty() {
        return text;
    }
    payload
        .get("output_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parse one annotation object, accepting only `url_citation`s with a URL.
pub fn parse_annotation(annotation: &Value) -> Option<Citation> {
    if annotation.get("type").and_then(Value::as_str) != Some("url_citation") {
        return None;
    }
    let url = annotation
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())?;
    let title = annotation
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(url);
    Some(Citation {
        url: url.to_string(),
        title: title.to_string(),
    })
}

/// All `url_citation` annotations in order, duplicates included.
fn raw_citations(payload: &Value) -> Vec<Citation> {
    output_text_parts(payload)
        .filter_map(|part| part.get("annotations").and_then(Value::as_array))
        .flatten()
        .filter_map(parse_annotation)
        .collect()
}

/// De-duplicated citations of a response payload.
pub fn extract_citations(payload: &Value) -> Vec<Citation> {
    dedup_citations(raw_citations(payload))
}

pub fn extract_usage(payload: &Value) -> TokenUsage {
    let usage = payload.get("usage");
    let field = |name: &str| {
        usage
            .and_then(|u| u.get(name))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
    }
}

/// Describe why a terminal, unsuccessful response ended.
pub fn failure_message(payload: &Value) -> String {
    if let Some(message) = payload
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }
    if let Some(reason) = payload
        .get("incomplete_details")
        .and_then(|d| d.get("reason"))
        .and_then(Value::as_str)
    {
        return format!("response incomplete: {reason}");
    }
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    format!("response ended with status '{status}'")
}

/// Build a [`ResearchResult`] from a completed response payload.
pub fn normalize_response(
    payload: &Value,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    fallback_model: &str,
) -> ResearchResult {
    ResearchResult {
        answer_text: extract_text(payload),
        citations: extract_citations(payload),
        duration_seconds: duration_seconds(started_at, finished_at),
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(fallback_model)
            .to_string(),
        usage: extract_usage(payload),
    }
}

// ── Streaming ───────────────────────────────────────────────────────────────

/// What a single stream event meant.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    Created { id: String },
    TextDelta(String),
    Citation(Citation),
    ToolCall { kind: String },
    Completed,
    Failed(String),
    Ignored,
}

/// Folds Responses API stream events into a final result.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    response_id: Option<String>,
    deltas: String,
    annotations: Vec<Citation>,
    completed: Option<Value>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded event.
    pub fn apply(&mut self, event: &Value) -> StreamStep {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "response.created" | "response.queued" | "response.in_progress" => {
                match event
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_str)
                {
                    Some(id) if self.response_id.is_none() => {
                        self.response_id = Some(id.to_string());
                        StreamStep::Created { id: id.to_string() }
                    }
                    _ => StreamStep::Ignored,
                }
            }
            "response.output_text.delta" => {
                let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
                self.deltas.push_str(delta);
                StreamStep::TextDelta(delta.to_string())
            }
            "response.output_text.annotation.added" => {
                match event.get("annotation").and_then(parse_annotation) {
                    Some(citation) => {
                        self.annotations.push(citation.clone());
                        StreamStep::Citation(citation)
                    }
                    None => StreamStep::Ignored,
                }
            }
            "response.web_search_call.in_progress" => StreamStep::ToolCall {
                kind: "web_search_call".to_string(),
            },
            "response.code_interpreter_call.in_progress" => StreamStep::ToolCall {
                kind: "code_interpreter_call".to_string(),
            },
            "response.completed" => {
                self.completed = Some(event.get("response").cloned().unwrap_or(Value::Null));
                StreamStep::Completed
            }
            "response.failed" | "response.incomplete" => StreamStep::Failed(failure_message(
                event.get("response").unwrap_or(&Value::Null),
            )),
            "error" => StreamStep::Failed(
                event
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream reported an error")
                    .to_string(),
            ),
            _ => StreamStep::Ignored,
        }
    }

    /// Produce the final result. The completed response's text wins over the
    /// accumulated deltas when it is non-empty.
    pub fn finish(
        self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        fallback_model: &str,
    ) -> ResearchResult {
        let completed = self.completed.unwrap_or(Value::Null);
        let completed_text = extract_text(&completed);
        let answer_text = if completed_text.is_empty() {
            self.deltas
        } else {
            completed_text
        };
        let citations = dedup_citations(
            self.annotations
                .into_iter()
                .chain(raw_citations(&completed)),
        );
        ResearchResult {
            answer_text,
            citations,
            duration_seconds: duration_seconds(started_at, finished_at),
            model: completed
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(fallback_model)
                .to_string(),
            usage: extract_usage(&completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn citation(url: &str, title: &str) -> Value {
        json!({"type": "url_citation", "url": url, "title": title, "start_index": 0, "end_index": 1})
    }

    fn payload() -> Value {
        json!({
            "id": "resp_1",
            "status": "completed",
            "model": "gpt-5.2-2025-12-01",
            "output": [
                {"type": "web_search_call", "id": "ws_1", "status": "completed"},
                {
                    "type": "message",
                    "role": "assistant",
                    "content": [
                        {
                            "type": "output_text",
                            "text": "Rust 1.0 shipped in 2015.",
                            "annotations": [
                                citation("https://blog.rust-lang.org/", "Rust Blog"),
                                citation("https://en.wikipedia.org/wiki/Rust", "Wikipedia"),
                            ]
                        },
                        {
                            "type": "output_text",
                            "text": " It is memory safe.",
                            "annotations": [
                                citation("https://blog.rust-lang.org/", "Rust Blog (again)"),
                                {"type": "file_citation", "file_id": "f_1"},
                            ]
                        }
                    ]
                }
            ],
            "usage": {"input_tokens": 120, "output_tokens": 45, "total_tokens": 165}
        })
    }

    #[test]
    fn test_extract_text_concatenates_segments() {
        assert_eq!(
            extract_text(&payload()),
            "Rust 1.0 shipped in 2015. It is memory safe."
        );
    }

    #[test]
    fn test_extract_text_falls_back_to_output_text() {
        let payload = json!({"output": [], "output_text": "flat answer"});
        assert_eq!(extract_text(&payload), "flat answer");
        assert_eq!(extract_text(&json!({})), "");
    }

    #[test]
    fn test_duplicate_url_kept_once_at_first_position() {
        let citations = extract_citations(&payload());
        assert_eq!(
            citations,
            vec![
                Citation {
                    url: "https://blog.rust-lang.org/".into(),
                    title: "Rust Blog".into()
                },
                Citation {
                    url: "https://en.wikipedia.org/wiki/Rust".into(),
                    title: "Wikipedia".into()
                },
            ]
        );
    }

    #[test]
    fn test_annotation_without_title_uses_url() {
        let c = parse_annotation(&json!({"type": "url_citation", "url": "https://a.example"}))
            .unwrap();
        assert_eq!(c.title, "https://a.example");
        assert!(parse_annotation(&json!({"type": "url_citation", "url": ""})).is_none());
    }

    #[test]
    fn test_normalize_response() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(2_500);
        let result = normalize_response(&payload(), start, end, "gpt-5.2");
        assert_eq!(result.model, "gpt-5.2-2025-12-01");
        assert_eq!(result.duration_seconds, 2.5);
        assert_eq!(
            result.usage,
            TokenUsage {
                input_tokens: 120,
                output_tokens: 45
            }
        );
        assert_eq!(result.citations.len(), 2);
    }

    #[test]
    fn test_duration_never_negative() {
        let now = Utc::now();
        assert_eq!(duration_seconds(now, now - chrono::Duration::seconds(5)), 0.0);
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(
            failure_message(&json!({"status": "failed", "error": {"code": "server_error", "message": "boom"}})),
            "boom"
        );
        assert_eq!(
            failure_message(&json!({"status": "incomplete", "incomplete_details": {"reason": "max_output_tokens"}})),
            "response incomplete: max_output_tokens"
        );
        assert_eq!(
            failure_message(&json!({"status": "cancelled"})),
            "response ended with status 'cancelled'"
        );
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.accumulate(TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
        });
        assert_eq!(total.total(), 18);
        assert_eq!(total.to_string(), "11 in / 7 out tokens");
    }

    #[test]
    fn test_stream_accumulation_prefers_completed_text() {
        let mut acc = StreamAccumulator::new();
        let steps: Vec<StreamStep> = [
            json!({"type": "response.created", "response": {"id": "resp_9", "status": "in_progress"}}),
            json!({"type": "response.web_search_call.in_progress", "item_id": "ws_1"}),
            json!({"type": "response.output_text.delta", "delta": "Hel"}),
            json!({"type": "response.output_text.delta", "delta": "lo"}),
            json!({"type": "response.output_text.annotation.added", "annotation": citation("https://x.example", "X")}),
            json!({"type": "response.completed", "response": payload()}),
        ]
        .iter()
        .map(|e| acc.apply(e))
        .collect();

        assert_eq!(
            steps[0],
            StreamStep::Created {
                id: "resp_9".into()
            }
        );
        assert_eq!(
            steps[1],
            StreamStep::ToolCall {
                kind: "web_search_call".into()
            }
        );
        assert_eq!(steps[5], StreamStep::Completed);
        assert_eq!(acc.response_id.as_deref(), Some("resp_9"));
        assert_eq!(acc.deltas.chars().count(), 5);

        let start = Utc::now();
        let result = acc.finish(start, start, "fallback");
        assert_eq!(result.answer_text, "Rust 1.0 shipped in 2015. It is memory safe.");
        let urls: Vec<&str> = result.citations.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://x.example",
                "https://blog.rust-lang.org/",
                "https://en.wikipedia.org/wiki/Rust"
            ]
        );
        assert_eq!(result.usage.input_tokens, 120);
    }

    #[test]
    fn test_stream_accumulation_falls_back_to_deltas() {
        let mut acc = StreamAccumulator::new();
        acc.apply(&json!({"type": "response.output_text.delta", "delta": "partial "}));
        acc.apply(&json!({"type": "response.output_text.delta", "delta": "answer"}));
        acc.apply(&json!({"type": "response.completed", "response": {"status": "completed", "output": []}}));
        let start = Utc::now();
        let result = acc.finish(start, start, "gpt-5.2");
        assert_eq!(result.answer_text, "partial answer");
        assert_eq!(result.model, "gpt-5.2");
    }

    #[test]
    fn test_stream_failure_events() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(
            acc.apply(&json!({"type": "error", "code": "rate_limit", "message": "slow down"})),
            StreamStep::Failed("slow down".into())
        );
        assert_eq!(
            acc.apply(&json!({"type": "response.incomplete", "response": {"status": "incomplete", "incomplete_details": {"reason": "content_filter"}}})),
            StreamStep::Failed("response incomplete: content_filter".into())
        );
        assert_eq!(
            acc.apply(&json!({"type": "response.output_item.added"})),
            StreamStep::Ignored
        );
    }
}

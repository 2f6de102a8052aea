// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-agnostic model client.
//!
//! Wraps a boxed [`Provider`] and adds the two behaviors every caller
//! needs and no caller should re-implement:
//!
//! - **Tool-call recovery** — `tool_use_failed` errors are parsed for the
//!   echoed generation and turned back into a valid response.
//! - **Retry with backoff** — transient errors retry up to the configured
//!   budget; rate limits back off linearly, everything else exponentially
//!   with jitter. Fatal errors surface immediately.
//!
//! Agent loops never retry the model themselves; this is the single retry
//! layer.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    anthropic::AnthropicProvider,
    error::ModelError,
    openai_compat::OpenAiCompatProvider,
    provider::{EventStream, Provider},
    recovery,
    CompletionRequest, ContentBlock, Message, ModelResponse, ResponseEvent, StopReason, ToolSpec,
    Usage,
};

pub struct ModelClient {
    provider: Box<dyn Provider>,
    max_retries: u32,
}

impl ModelClient {
    pub fn new(provider: Box<dyn Provider>, max_retries: u32) -> Self {
        Self { provider, max_retries: max_retries.max(1) }
    }

    /// Build a client from configuration. `provider = "anthropic"` selects
    /// the native driver; every other id speaks the OpenAI-compatible
    /// format, with known gateway ids resolving their default base URL.
    pub fn from_config(cfg: &foreman_config::Config) -> anyhow::Result<Self> {
        let api_key = cfg.resolve_api_key().unwrap_or_default();
        let provider: Box<dyn Provider> = match cfg.model.provider.as_str() {
            "anthropic" => Box::new(AnthropicProvider::new(api_key, cfg.model.base_url.clone())),
            other => {
                let base_url = cfg
                    .model
                    .base_url
                    .clone()
                    .or_else(|| OpenAiCompatProvider::default_base_url(other).map(String::from))
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "unknown model provider {other:?}: use anthropic, groq, together, \
                             openrouter, openai, or set model.base_url"
                        )
                    })?;
                // Leak the provider id once so the driver can hold a
                // 'static name; config is loaded once per process.
                let name: &'static str = Box::leak(other.to_string().into_boxed_str());
                Box::new(OpenAiCompatProvider::new(name, api_key, &base_url))
            }
        };
        Ok(Self::new(provider, cfg.model.max_retries))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Non-streaming completion with recovery and retry.
    pub async fn create(
        &self,
        model: &str,
        max_tokens: u32,
        system: &str,
        tools: &[ToolSpec],
        messages: &[Message],
    ) -> Result<ModelResponse, ModelError> {
        let req = CompletionRequest {
            model: model.to_string(),
            max_tokens,
            system: system.to_string(),
            tools: tools.to_vec(),
            messages: messages.to_vec(),
        };

        let mut last_err: Option<ModelError> = None;
        for attempt in 1..=self.max_retries {
            match self.provider.create(req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if let ModelError::ToolUseFailed { body } = &e {
                        if let Some(recovered) = recovery::parse_failed_tool_call(body) {
                            debug!(attempt, "recovered malformed tool call from error body");
                            return Ok(recovered);
                        }
                    }
                    if !e.is_transient() || attempt == self.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(&e, attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient model error; retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
            }
        }
        // Unreachable: the loop always returns on the last attempt.
        Err(last_err.unwrap_or(ModelError::Stream("retry loop exhausted".into())))
    }

    /// Streaming completion. Text deltas are read off the returned stream;
    /// `final_message()` assembles the accumulated response.
    ///
    /// When the provider rejects the generation up front with a
    /// recoverable `tool_use_failed`, the recovered response is returned
    /// as a pre-resolved stream so callers need no special path.
    pub async fn stream(
        &self,
        model: &str,
        max_tokens: u32,
        system: &str,
        tools: &[ToolSpec],
        messages: &[Message],
    ) -> Result<CompletionStream, ModelError> {
        let req = CompletionRequest {
            model: model.to_string(),
            max_tokens,
            system: system.to_string(),
            tools: tools.to_vec(),
            messages: messages.to_vec(),
        };

        let mut last_err: Option<ModelError> = None;
        for attempt in 1..=self.max_retries {
            match self.provider.stream(req.clone()).await {
                Ok(events) => return Ok(CompletionStream::new(events)),
                Err(e) => {
                    if let ModelError::ToolUseFailed { body } = &e {
                        if let Some(recovered) = recovery::parse_failed_tool_call(body) {
                            debug!(attempt, "recovered malformed tool call before streaming");
                            return Ok(CompletionStream::from_response(recovered));
                        }
                    }
                    if !e.is_transient() || attempt == self.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(&e, attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient model error; retrying stream");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(ModelError::Stream("retry loop exhausted".into())))
    }
}

/// Backoff schedule: rate limits wait ~1 s × attempt; everything else
/// doubles from a 0.5 s base. Both carry a small random jitter so herds
/// of agents do not retry in lockstep.
fn backoff_delay(err: &ModelError, attempt: u32) -> Duration {
    let base = match err {
        ModelError::RateLimited { .. } => 1.0 * attempt as f64,
        _ => 0.5 * f64::from(1u32 << (attempt - 1).min(6)),
    };
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    Duration::from_secs_f64(base + jitter)
}

// ─── Streaming accumulator ────────────────────────────────────────────────────

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Owns a provider event stream, yields text deltas, and accumulates the
/// final response. Tool-call fragments are keyed by the provider's
/// parallel-call `index` and reassembled in index order regardless of
/// arrival order.
pub struct CompletionStream {
    events: Option<EventStream>,
    text: String,
    pending: HashMap<u32, PendingToolCall>,
    usage: Usage,
    resolved: Option<ModelResponse>,
}

impl CompletionStream {
    pub(crate) fn new(events: EventStream) -> Self {
        Self {
            events: Some(events),
            text: String::new(),
            pending: HashMap::new(),
            usage: Usage::default(),
            resolved: None,
        }
    }

    /// A stream that is already complete (recovered response).
    pub(crate) fn from_response(resp: ModelResponse) -> Self {
        Self {
            events: None,
            text: String::new(),
            pending: HashMap::new(),
            usage: resp.usage,
            resolved: Some(resp),
        }
    }

    /// Next text delta, or `None` at end of stream. Tool-call and usage
    /// events are absorbed silently into the accumulator.
    ///
    /// The stream is taken out of `self` while polling so accumulator
    /// fields stay mutable; on a yielded delta it is put back, on end or
    /// error it stays consumed.
    pub async fn next_delta(&mut self) -> Result<Option<String>, ModelError> {
        let Some(mut events) = self.events.take() else {
            return Ok(None);
        };
        while let Some(ev) = events.next().await {
            match ev? {
                ResponseEvent::TextDelta(t) if !t.is_empty() => {
                    self.text.push_str(&t);
                    self.events = Some(events);
                    return Ok(Some(t));
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCallDelta { index, id, name, arguments } => {
                    let ptc = self.pending.entry(index).or_default();
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    if input_tokens > 0 {
                        self.usage.input_tokens = input_tokens;
                    }
                    if output_tokens > 0 {
                        self.usage.output_tokens = output_tokens;
                    }
                }
                ResponseEvent::Done => break,
            }
        }
        Ok(None)
    }

    /// Assemble the accumulated [`ModelResponse`]. Call after `next_delta`
    /// has returned `None`; calling earlier assembles whatever has arrived.
    pub fn final_message(mut self) -> ModelResponse {
        if let Some(resp) = self.resolved.take() {
            return resp;
        }

        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::text(std::mem::take(&mut self.text)));
        }

        let mut pending: Vec<(u32, PendingToolCall)> = self.pending.drain().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        let mut any_tool = false;
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping streamed tool call with empty name");
                continue;
            }
            any_tool = true;
            let input: Value = if ptc.args_buf.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&ptc.args_buf)
                    .or_else(|_| recovery::repair_json(&ptc.args_buf))
                    .unwrap_or_else(|_| {
                        warn!(tool_name = %ptc.name, "invalid streamed tool arguments; substituting {{}}");
                        Value::Object(Default::default())
                    })
            };
            let id = if ptc.id.is_empty() { format!("call_synthetic_{i}") } else { ptc.id };
            content.push(ContentBlock::tool_use(id, ptc.name, input));
        }

        let stop_reason = if any_tool { StopReason::ToolUse } else { StopReason::EndTurn };
        ModelResponse { content, stop_reason, usage: self.usage }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mock::ScriptedProvider;

    async fn drain(stream: &mut CompletionStream) -> String {
        let mut out = String::new();
        while let Some(delta) = stream.next_delta().await.unwrap() {
            out.push_str(&delta);
        }
        out
    }

    #[tokio::test]
    async fn create_returns_provider_response() {
        let client = ModelClient::new(
            Box::new(ScriptedProvider::always_text("hello")),
            3,
        );
        let r = client.create("m", 128, "sys", &[], &[Message::user("hi")]).await.unwrap();
        assert_eq!(r.joined_text(), "hello");
        assert_eq!(r.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn create_recovers_tool_use_failed() {
        let provider = ScriptedProvider::fail_then_text(
            ModelError::ToolUseFailed {
                body: r#"{"error":{"code":"tool_use_failed","failed_generation":"<function=goto>{\"url\": \"https://x\"}</function>"}}"#.into(),
            },
            "unused",
        );
        let client = ModelClient::new(Box::new(provider), 3);
        let r = client.create("m", 128, "", &[], &[Message::user("go")]).await.unwrap();
        assert_eq!(r.stop_reason, StopReason::ToolUse);
        match &r.content[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "goto");
                assert_eq!(input["url"], "https://x");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_retries_unrecoverable_transient_and_succeeds() {
        let provider = ScriptedProvider::fail_then_text(
            ModelError::ToolUseFailed { body: "tool_use_failed but nothing echoed".into() },
            "second try worked",
        );
        let client = ModelClient::new(Box::new(provider), 3);
        let r = client.create("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        assert_eq!(r.joined_text(), "second try worked");
    }

    #[tokio::test]
    async fn create_rate_limit_retries_then_succeeds() {
        let provider = ScriptedProvider::fail_then_text(
            ModelError::RateLimited { body: "429".into() },
            "after the wait",
        );
        let client = ModelClient::new(Box::new(provider), 3);
        let r = client.create("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        assert_eq!(r.joined_text(), "after the wait");
    }

    #[tokio::test]
    async fn create_fatal_error_bubbles_immediately() {
        let provider = ScriptedProvider::fail_then_text(
            ModelError::Api { provider: "test", status: 401, body: "bad key".into() },
            "never reached",
        );
        let client = ModelClient::new(Box::new(provider), 3);
        let err = client.create("m", 128, "", &[], &[Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, ModelError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn create_exhausts_retry_budget() {
        let provider = ScriptedProvider::always_fail(|| ModelError::RateLimited {
            body: "permanently throttled".into(),
        });
        let client = ModelClient::new(Box::new(provider), 2);
        let err = client.create("m", 128, "", &[], &[Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, ModelError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_final_message() {
        let provider = ScriptedProvider::new(vec![vec![
            ResponseEvent::TextDelta("hel".into()),
            ResponseEvent::TextDelta("lo".into()),
            ResponseEvent::Usage { input_tokens: 3, output_tokens: 7 },
            ResponseEvent::Done,
        ]]);
        let client = ModelClient::new(Box::new(provider), 3);
        let mut s = client.stream("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        assert_eq!(drain(&mut s).await, "hello");
        let resp = s.final_message();
        assert_eq!(resp.joined_text(), "hello");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.output_tokens, 7);
    }

    #[tokio::test]
    async fn stream_accumulates_out_of_order_tool_fragments_by_index() {
        let provider = ScriptedProvider::new(vec![vec![
            // Fragments for index 1 arrive before index 0 completes.
            ResponseEvent::ToolCallDelta { index: 0, id: "c0".into(), name: "grep".into(), arguments: String::new() },
            ResponseEvent::ToolCallDelta { index: 1, id: "c1".into(), name: "glob".into(), arguments: "{\"pat".into() },
            ResponseEvent::ToolCallDelta { index: 0, id: String::new(), name: String::new(), arguments: "{\"q\":\"x\"}".into() },
            ResponseEvent::ToolCallDelta { index: 1, id: String::new(), name: String::new(), arguments: "tern\":\"*.rs\"}".into() },
            ResponseEvent::Done,
        ]]);
        let client = ModelClient::new(Box::new(provider), 3);
        let mut s = client.stream("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        assert_eq!(drain(&mut s).await, "");
        let resp = s.final_message();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        let uses: Vec<(&str, &Value)> = resp
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
                _ => None,
            })
            .collect();
        assert_eq!(uses[0].0, "grep");
        assert_eq!(uses[0].1["q"], "x");
        assert_eq!(uses[1].0, "glob");
        assert_eq!(uses[1].1["pattern"], "*.rs");
    }

    #[tokio::test]
    async fn stream_recovery_produces_resolved_stream() {
        let provider = ScriptedProvider::fail_then_text(
            ModelError::ToolUseFailed {
                body: r#"{"error":{"failed_generation":"<function=look></function>","code":"tool_use_failed"}}"#.into(),
            },
            "unused",
        );
        let client = ModelClient::new(Box::new(provider), 3);
        let mut s = client.stream("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        assert_eq!(drain(&mut s).await, "", "recovered stream has no live deltas");
        let resp = s.final_message();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn stream_empty_tool_name_is_dropped() {
        let provider = ScriptedProvider::new(vec![vec![
            ResponseEvent::ToolCallDelta { index: 0, id: "c".into(), name: String::new(), arguments: "{}".into() },
            ResponseEvent::TextDelta("fallback text".into()),
            ResponseEvent::Done,
        ]]);
        let client = ModelClient::new(Box::new(provider), 3);
        let mut s = client.stream("m", 128, "", &[], &[Message::user("x")]).await.unwrap();
        drain(&mut s).await;
        let resp = s.final_message();
        assert_eq!(resp.stop_reason, StopReason::EndTurn, "nameless call cannot dispatch");
        assert_eq!(resp.joined_text(), "fallback text");
    }

    #[test]
    fn backoff_rate_limit_is_linear_in_attempt() {
        let e = ModelError::RateLimited { body: String::new() };
        let d1 = backoff_delay(&e, 1);
        let d3 = backoff_delay(&e, 3);
        assert!(d1 >= Duration::from_secs_f64(1.0) && d1 < Duration::from_secs_f64(1.3));
        assert!(d3 >= Duration::from_secs_f64(3.0) && d3 < Duration::from_secs_f64(3.3));
    }

    #[test]
    fn backoff_other_transient_is_exponential() {
        let e = ModelError::ToolUseFailed { body: String::new() };
        let d1 = backoff_delay(&e, 1);
        let d3 = backoff_delay(&e, 3);
        assert!(d1 >= Duration::from_secs_f64(0.5) && d1 < Duration::from_secs_f64(0.8));
        assert!(d3 >= Duration::from_secs_f64(2.0) && d3 < Duration::from_secs_f64(2.3));
    }

    #[tokio::test]
    async fn from_config_rejects_unknown_provider_without_base_url() {
        let mut cfg = foreman_config::Config::default();
        cfg.model.provider = "no-such-gateway".into();
        assert!(ModelClient::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn from_config_accepts_unknown_provider_with_base_url() {
        let mut cfg = foreman_config::Config::default();
        cfg.model.provider = "local-llama".into();
        cfg.model.base_url = Some("http://localhost:8080/v1".into());
        let client = ModelClient::from_config(&cfg).unwrap();
        assert_eq!(client.provider_name(), "local-llama");
    }

    #[test]
    fn request_json_is_clonable_for_retries() {
        // CompletionRequest must be Clone so each retry sends a fresh copy.
        let req = CompletionRequest {
            model: "m".into(),
            max_tokens: 1,
            system: "s".into(),
            tools: vec![],
            messages: vec![Message::user(json!({"k": "v"}).to_string())],
        };
        let _again = req.clone();
    }
}

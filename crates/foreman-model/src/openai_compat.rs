// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Several gateways (Groq, Together, OpenRouter, OpenAI itself, any local
//! server with a `base_url`) speak the same function-calling wire format.
//! This single driver covers all of them; the conversion between the
//! canonical block shape and the function-calling shape lives here.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    anthropic::drain_sse_lines,
    error::{classify_api_error, ModelError},
    provider::{EventStream, Provider},
    recovery,
    CompletionRequest, ContentBlock, Message, ModelResponse, ResponseEvent, Role, StopReason,
    Usage,
};

pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    api_key: String,
    chat_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// `base_url` ends before `/chat/completions`, e.g.
    /// `https://api.groq.com/openai/v1`.
    pub fn new(driver_name: &'static str, api_key: String, base_url: &str) -> Self {
        Self {
            driver_name,
            api_key,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            client: reqwest::Client::new(),
        }
    }

    /// Default endpoint for a known gateway id, if any.
    pub fn default_base_url(provider: &str) -> Option<&'static str> {
        match provider {
            "groq" => Some("https://api.groq.com/openai/v1"),
            "together" => Some("https://api.together.xyz/v1"),
            "openrouter" => Some("https://openrouter.ai/api/v1"),
            "openai" => Some("https://api.openai.com/v1"),
            _ => None,
        }
    }

    fn request_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let tools = build_openai_tools(&req.tools);
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": build_openai_messages(&req.system, &req.messages),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    async fn send(
        &self,
        req: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ModelError> {
        debug!(
            driver = %self.driver_name,
            model = %req.model,
            stream,
            tool_count = req.tools.len(),
            "sending completion request"
        );
        let resp = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(req, stream))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(self.driver_name, status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    async fn create(&self, req: CompletionRequest) -> Result<ModelResponse, ModelError> {
        let resp = self.send(&req, false).await?;
        let body: Value = resp.json().await?;
        parse_openai_response(&body)
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        let resp = self.send(&req, true).await?;
        let byte_stream = resp.bytes_stream();

        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_sse_lines(buf, parse_openai_event)
                    }
                    Err(e) => vec![Err(ModelError::Http(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Wire conversion ──────────────────────────────────────────────────────────

/// Wrap canonical tool specs in the function-calling envelope. The
/// `properties` key is guaranteed to exist — some gateways 400 without it.
pub(crate) fn build_openai_tools(tools: &[crate::ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let mut schema = t.input_schema.clone();
            if schema.get("properties").is_none() {
                schema["properties"] = json!({});
            }
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": schema,
                }
            })
        })
        .collect()
}

/// Convert canonical history to the function-calling shape:
/// - the system string becomes a leading `role: system` message;
/// - assistant tool-use turns carry concatenated text (or null) plus a
///   `tool_calls` array with JSON-serialized argument objects;
/// - user tool-result turns become one `role: tool` message per result.
pub(crate) fn build_openai_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(json!({ "role": "system", "content": system }));

    for m in messages {
        match m.role {
            Role::User => {
                if m.is_tool_results() {
                    for b in &m.content {
                        if let ContentBlock::ToolResult { tool_use_id, content } = b {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                    }
                } else {
                    out.push(json!({ "role": "user", "content": m.joined_text() }));
                }
            }
            Role::Assistant => {
                let tool_calls: Vec<Value> = m
                    .tool_uses()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })
                    })
                    .collect();

                let text = m.joined_text();
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
        }
    }
    out
}

/// Parse a non-streaming chat completion into the canonical response.
pub(crate) fn parse_openai_response(body: &Value) -> Result<ModelResponse, ModelError> {
    let message = body["choices"]
        .get(0)
        .map(|c| &c["message"])
        .ok_or_else(|| ModelError::Stream("response missing choices".into()))?;

    let mut content = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }

    let mut has_tool_calls = false;
    if let Some(calls) = message["tool_calls"].as_array() {
        for tc in calls {
            has_tool_calls = true;
            let args_raw = tc["function"]["arguments"].as_str().unwrap_or("");
            let input = if args_raw.is_empty() {
                json!({})
            } else {
                serde_json::from_str(args_raw)
                    .or_else(|_| recovery::repair_json(args_raw))
                    .unwrap_or_else(|_| json!({}))
            };
            content.push(ContentBlock::tool_use(
                tc["id"].as_str().unwrap_or(""),
                tc["function"]["name"].as_str().unwrap_or(""),
                input,
            ));
        }
    }

    let stop_reason = if has_tool_calls { StopReason::ToolUse } else { StopReason::EndTurn };
    let usage = Usage {
        input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(ModelResponse { content, stop_reason, usage })
}

fn parse_openai_event(data: &str) -> Option<Result<ResponseEvent, ModelError>> {
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;

    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(Ok(ResponseEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        }));
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        return Some(Ok(ResponseEvent::TextDelta(text.to_string())));
    }

    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ToolSpec;

    #[test]
    fn tools_are_wrapped_in_function_envelope() {
        let specs = vec![ToolSpec::new("goto", "navigate", json!({"type": "object", "properties": {"url": {"type": "string"}}}))];
        let tools = build_openai_tools(&specs);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "goto");
        assert_eq!(tools[0]["function"]["parameters"]["properties"]["url"]["type"], "string");
    }

    #[test]
    fn missing_properties_key_is_injected() {
        let specs = vec![ToolSpec::new("noop", "", json!({"type": "object"}))];
        let tools = build_openai_tools(&specs);
        assert!(tools[0]["function"]["parameters"]["properties"].is_object());
    }

    #[test]
    fn system_becomes_leading_system_message() {
        let msgs = build_openai_messages("be brief", &[Message::user("hi")]);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be brief");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn assistant_tool_use_turn_serializes_tool_calls() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("on it"),
            ContentBlock::tool_use("call_1", "goto", json!({"url": "https://x"})),
        ]);
        let msgs = build_openai_messages("", &[m]);
        let a = &msgs[1];
        assert_eq!(a["role"], "assistant");
        assert_eq!(a["content"], "on it");
        let calls = a["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["id"], "call_1");
        // Arguments must be the JSON-serialized object, not a nested object.
        let args: Value =
            serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["url"], "https://x");
    }

    #[test]
    fn assistant_tool_use_without_text_has_null_content() {
        let m = Message::assistant_blocks(vec![ContentBlock::tool_use("c", "t", json!({}))]);
        let msgs = build_openai_messages("", &[m]);
        assert!(msgs[1]["content"].is_null());
    }

    #[test]
    fn tool_results_become_one_tool_message_per_result() {
        let m = Message::tool_results(vec![
            ContentBlock::tool_result("c1", "first"),
            ContentBlock::tool_result("c2", "second"),
        ]);
        let msgs = build_openai_messages("", &[m]);
        assert_eq!(msgs.len(), 3); // system + two tool messages
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["tool_call_id"], "c1");
        assert_eq!(msgs[2]["tool_call_id"], "c2");
    }

    /// Round-trip law: converting canonical → function-calling form and
    /// back yields an equivalent canonical history (modulo key order).
    #[test]
    fn wire_conversion_round_trips() {
        let history = vec![
            Message::user("open the site"),
            Message::assistant_blocks(vec![
                ContentBlock::text("navigating"),
                ContentBlock::tool_use("call_a", "goto", json!({"url": "https://x"})),
            ]),
            Message::tool_results(vec![ContentBlock::tool_result("call_a", "loaded")]),
            Message::assistant("all done"),
        ];
        let wire = build_openai_messages("sys", &history);
        let back = canonical_from_openai(&wire);
        assert_eq!(back.len(), history.len());
        for (orig, round) in history.iter().zip(&back) {
            assert_eq!(orig.role, round.role);
            assert_eq!(orig.content, round.content);
        }
    }

    /// Test-only reverse conversion used by the round-trip law.
    fn canonical_from_openai(wire: &[Value]) -> Vec<Message> {
        let mut out: Vec<Message> = Vec::new();
        for m in wire {
            match m["role"].as_str().unwrap() {
                "system" => {}
                "user" => out.push(Message::user(m["content"].as_str().unwrap())),
                "tool" => {
                    let block = ContentBlock::tool_result(
                        m["tool_call_id"].as_str().unwrap(),
                        m["content"].as_str().unwrap(),
                    );
                    match out.last_mut() {
                        Some(last) if last.is_tool_results() => last.content.push(block),
                        _ => out.push(Message::tool_results(vec![block])),
                    }
                }
                "assistant" => {
                    let mut content = Vec::new();
                    if let Some(t) = m["content"].as_str() {
                        content.push(ContentBlock::text(t));
                    }
                    if let Some(calls) = m["tool_calls"].as_array() {
                        for c in calls {
                            content.push(ContentBlock::tool_use(
                                c["id"].as_str().unwrap(),
                                c["function"]["name"].as_str().unwrap(),
                                serde_json::from_str(c["function"]["arguments"].as_str().unwrap())
                                    .unwrap(),
                            ));
                        }
                    }
                    out.push(Message::assistant_blocks(content));
                }
                other => panic!("unexpected role {other}"),
            }
        }
        out
    }

    #[test]
    fn parse_response_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "function": { "name": "look", "arguments": "{}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 3 }
        });
        let r = parse_openai_response(&body).unwrap();
        assert_eq!(r.stop_reason, StopReason::ToolUse);
        assert_eq!(r.usage.input_tokens, 7);
        match &r.content[0] {
            ContentBlock::ToolUse { id, name, .. } => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "look");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn parse_response_unparseable_args_become_empty_object() {
        let body = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "c",
                        "function": { "name": "t", "arguments": "definitely not json" }
                    }]
                }
            }]
        });
        let r = parse_openai_response(&body).unwrap();
        match &r.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn parse_response_text_only_is_end_turn() {
        let body = json!({
            "choices": [{ "message": { "content": "hello" } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        });
        let r = parse_openai_response(&body).unwrap();
        assert_eq!(r.stop_reason, StopReason::EndTurn);
        assert_eq!(r.joined_text(), "hello");
    }

    #[test]
    fn event_done_sentinel() {
        let ev = parse_openai_event("[DONE]").unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::Done));
    }

    #[test]
    fn event_text_delta() {
        let ev = parse_openai_event(r#"{"choices":[{"delta":{"content":"hey"}}]}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hey"));
    }

    #[test]
    fn event_tool_call_delta_keeps_index() {
        let ev = parse_openai_event(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"id":"call_z","function":{"name":"grep","arguments":""}}]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(
            matches!(&ev, ResponseEvent::ToolCallDelta { index: 2, id, name, .. }
                if id == "call_z" && name == "grep")
        );
    }

    #[test]
    fn event_usage_chunk() {
        let ev = parse_openai_event(r#"{"usage":{"prompt_tokens":5,"completion_tokens":9}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ResponseEvent::Usage { input_tokens: 5, output_tokens: 9 }));
    }

    #[test]
    fn event_null_usage_falls_through_to_delta() {
        let ev = parse_openai_event(r#"{"usage":null,"choices":[{"delta":{"content":"x"}}]}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "x"));
    }
}

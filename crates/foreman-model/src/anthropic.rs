// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::{classify_api_error, ModelError},
    provider::{EventStream, Provider},
    CompletionRequest, ContentBlock, ModelResponse, ResponseEvent, StopReason, Usage,
};

/// Native messages-API driver.
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(req: &CompletionRequest, stream: bool) -> Value {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": build_anthropic_messages(&req.messages),
            "stream": stream,
        });
        if !req.system.is_empty() {
            body["system"] = json!(req.system);
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
        debug!(model = %req.model, stream, tool_count = req.tools.len(), "sending anthropic request");
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&Self::request_body(req, stream))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error("anthropic", status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn create(&self, req: CompletionRequest) -> Result<ModelResponse, ModelError> {
        let resp = self.send(&req, false).await?;
        let body: Value = resp.json().await?;
        parse_anthropic_response(&body)
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        let resp = self.send(&req, true).await?;
        let byte_stream = resp.bytes_stream();

        // SSE lines can be split across TCP chunks, so a remainder buffer
        // carries the incomplete tail forward; only '\n'-terminated lines
        // are parsed.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<ResponseEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_sse_lines(buf, parse_anthropic_event)
                    }
                    Err(e) => vec![Err(ModelError::Http(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain every complete `\n`-terminated SSE `data:` line from `buf` and map
/// it through `parse`. Shared by both drivers.
pub(crate) fn drain_sse_lines(
    buf: &mut String,
    parse: fn(&str) -> Option<Result<ResponseEvent, ModelError>>,
) -> Vec<Result<ResponseEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        if let Some(data) = line.strip_prefix("data: ") {
            if let Some(ev) = parse(data.trim()) {
                events.push(ev);
            }
        }
    }
    events
}

fn parse_anthropic_event(data: &str) -> Option<Result<ResponseEvent, ModelError>> {
    if data.is_empty() {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(Ok(ResponseEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }))
            } else {
                None
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    Some(Ok(ResponseEvent::TextDelta(text)))
                }
                "input_json_delta" => Some(Ok(ResponseEvent::ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                })),
                _ => None,
            }
        }
        "message_start" => v["message"]["usage"].as_object().map(|u| {
            Ok(ResponseEvent::Usage {
                input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                output_tokens: 0,
            })
        }),
        "message_delta" => v["usage"].as_object().map(|u| {
            Ok(ResponseEvent::Usage {
                input_tokens: 0,
                output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            })
        }),
        "message_stop" => Some(Ok(ResponseEvent::Done)),
        _ => None,
    }
}

/// Parse a non-streaming messages-API response body.
pub(crate) fn parse_anthropic_response(body: &Value) -> Result<ModelResponse, ModelError> {
    let raw_blocks = body["content"]
        .as_array()
        .ok_or_else(|| ModelError::Stream("response missing content array".into()))?;

    let mut content = Vec::with_capacity(raw_blocks.len());
    for b in raw_blocks {
        match b["type"].as_str().unwrap_or("") {
            "text" => content.push(ContentBlock::text(b["text"].as_str().unwrap_or(""))),
            "tool_use" => content.push(ContentBlock::tool_use(
                b["id"].as_str().unwrap_or(""),
                b["name"].as_str().unwrap_or(""),
                b["input"].clone(),
            )),
            _ => {}
        }
    }

    let stop_reason = match body["stop_reason"].as_str() {
        Some("tool_use") => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };
    let usage = Usage {
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(ModelResponse { content, stop_reason, usage })
}

/// Serialize canonical messages to the native wire format. The canonical
/// block shape already matches the wire, so each turn serializes directly.
pub(crate) fn build_anthropic_messages(messages: &[crate::Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            // Single plain-text turns collapse to a bare string for a
            // smaller request; everything else ships the block array.
            if let Some(text) = m.as_text() {
                json!({ "role": m.role, "content": text })
            } else {
                json!({ "role": m.role, "content": m.content })
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Malformed tool-call recovery.
//!
//! Some function-calling backends reject their own generated tool calls
//! with a `tool_use_failed` error whose body echoes the raw generation,
//! typically in a pseudo-XML shape:
//!
//! ```text
//! <function=goto>{"url": "https://example.com"}</function>
//! <function=type{"selector": "#email", "text": "hello"}</function>
//! <function=look></function>
//! deploy_agent={"agent": "coder", "task": "..."}
//! look({"selector": "#x"})
//! ```
//!
//! This module parses that text back into a valid [`ModelResponse`] so the
//! turn is not lost. If nothing can be recovered the caller retries.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::{ContentBlock, ModelResponse, StopReason, Usage};

/// Try to recover tool calls from a `tool_use_failed` error body.
/// Returns `None` when no pattern matches; the caller should retry.
pub fn parse_failed_tool_call(error_body: &str) -> Option<ModelResponse> {
    let failed_gen = extract_failed_generation(error_body)?;
    let calls = extract_calls(&failed_gen);
    if calls.is_empty() {
        return None;
    }

    let mut content = Vec::new();

    // Text before the first <function= tag is real assistant prose.
    if let Some(pos) = failed_gen.find("<function=") {
        let before = failed_gen[..pos].trim();
        if !before.is_empty() {
            content.push(ContentBlock::text(before));
        }
    }

    for (name, args_raw) in &calls {
        content.push(ContentBlock::tool_use(fresh_call_id(), name, parse_args(args_raw)));
    }

    debug!(
        count = calls.len(),
        names = ?calls.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
        "recovered malformed tool calls"
    );

    Some(ModelResponse {
        content,
        stop_reason: StopReason::ToolUse,
        usage: Usage::default(),
    })
}

/// Pull the echoed generation out of the error body.
///
/// Tried in order: a JSON envelope with `failed_generation` (top level or
/// nested under `error`), a quoted `failed_generation` field matched
/// textually, a bare `<function=…</function>` fragment, and the
/// `attempted to call tool '…'` phrasing.
fn extract_failed_generation(error_body: &str) -> Option<String> {
    if let Ok(v) = serde_json::from_str::<Value>(error_body) {
        let candidate = v["failed_generation"]
            .as_str()
            .or_else(|| v["error"]["failed_generation"].as_str());
        if let Some(s) = candidate {
            return Some(s.to_string());
        }
    }

    // Python-repr and JSON-ish textual fallbacks. Two separate patterns:
    // a character class would let an inner `"` terminate a `'`-quoted value.
    for pattern in [
        r#"(?s)'failed_generation':\s*'(.+?)'\s*\}"#,
        r#"(?s)"failed_generation":\s*"(.+?)"\s*\}"#,
    ] {
        if let Some(c) = Regex::new(pattern).ok()?.captures(error_body) {
            return Some(c[1].replace("\\\"", "\"").replace("\\'", "'"));
        }
    }

    if let Some(m) = Regex::new(r"(?s)<function=\w+.*?</function>")
        .ok()?
        .find(error_body)
    {
        return Some(m.as_str().to_string());
    }

    Regex::new(r"(?s)attempted to call tool\s*'(\w+=\{.+)")
        .ok()?
        .captures(error_body)
        .map(|c| c[1].trim_end_matches(['\'', '"']).to_string())
}

/// Extract `(name, raw_args)` pairs from the failed generation, in order:
/// 1. `<function=NAME>JSON</function>`
/// 2. `<function=NAMEJSON</function>` (missing `>`)
/// 3. `<function=NAME></function>` (no args)
/// 4. bare `NAME={...}`
/// 5. `NAME({...})`
fn extract_calls(failed_gen: &str) -> Vec<(String, String)> {
    // One pattern covers forms 1–3: the `>` after the name is optional and
    // the body may be empty.
    let xml = Regex::new(r"(?s)<function=(\w+)>?\s*(.*?)\s*<?/function>").unwrap();
    let calls: Vec<(String, String)> = xml
        .captures_iter(failed_gen)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    if !calls.is_empty() {
        return calls;
    }

    let trimmed = failed_gen.trim();
    if let Some(c) = Regex::new(r"(?s)^(\w+)\s*=\s*(\{.+\})\s*$").unwrap().captures(trimmed) {
        return vec![(c[1].to_string(), c[2].to_string())];
    }
    if let Some(c) = Regex::new(r"(?s)^(\w+)\s*\(\s*(\{.+\})\s*\)\s*$")
        .unwrap()
        .captures(trimmed)
    {
        return vec![(c[1].to_string(), c[2].to_string())];
    }
    Vec::new()
}

/// Parse a raw argument fragment, tolerating the artifacts these
/// generations carry: a trailing `>`, trailing commas, escaped quotes.
fn parse_args(raw: &str) -> Value {
    let mut args = raw.trim();
    if let Some(stripped) = args.strip_suffix('>') {
        args = stripped.trim_end();
    }
    if args.is_empty() || !args.starts_with('{') {
        return Value::Object(Default::default());
    }
    serde_json::from_str(args)
        .or_else(|_| repair_json(args))
        .unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Last-ditch repairs for almost-JSON argument objects: strip trailing
/// commas before closing braces/brackets and unescape `\"`.
pub(crate) fn repair_json(raw: &str) -> Result<Value, serde_json::Error> {
    let no_trailing_commas = Regex::new(r",\s*([}\]])").unwrap().replace_all(raw, "$1");
    match serde_json::from_str(&no_trailing_commas) {
        Ok(v) => Ok(v),
        Err(_) => {
            let unescaped = no_trailing_commas.replace("\\\"", "\"");
            serde_json::from_str(&unescaped)
        }
    }
}

/// Recovered calls get freshly generated ids in the provider's `call_`
/// style: 24 hex chars.
fn fresh_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

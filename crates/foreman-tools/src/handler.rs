// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Prefix that marks a dispatch result as a failure. Case-sensitive; the
/// agent loop's guard counters match on it verbatim.
pub const ERROR_PREFIX: &str = "ERROR:";

/// The narrow seam every capability sits behind.
///
/// A handler receives the tool name (one handler may serve several names)
/// and the parsed argument object, and returns a free-form string. It must
/// never panic or error across this boundary — failures are reported as an
/// `ERROR: …` string so the model sees them as a normal observation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn dispatch(&self, name: &str, input: &Map<String, Value>) -> String;
}

/// Wrap a failure message in the conventional prefix.
pub fn err(msg: impl std::fmt::Display) -> String {
    format!("{ERROR_PREFIX} {msg}")
}

/// True when a dispatch result signals failure.
pub fn is_error(result: &str) -> bool {
    result.starts_with(ERROR_PREFIX)
}

/// Fetch a required string argument or produce the conventional error.
pub fn require_str<'a>(input: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| err(format_args!("missing required '{key}' argument")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

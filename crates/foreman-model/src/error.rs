// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error taxonomy for the model layer.
///
/// The retry layer matches on the kind: `ToolUseFailed` and `RateLimited`
/// are transient (retried with backoff, the former after a recovery
/// attempt); everything else bubbles up to the caller immediately.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The provider rejected the model's own malformed tool output.
    /// `body` carries the raw error body, which usually echoes the failed
    /// generation and is fed to the recovery parser.
    #[error("tool_use_failed: {body}")]
    ToolUseFailed { body: String },

    /// Rate limit or quota backpressure.
    #[error("rate limited: {body}")]
    RateLimited { body: String },

    /// Any other non-2xx API response (auth, schema, quota exhaustion).
    #[error("{provider} error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// Transport-level failure.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed or truncated stream payload.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ModelError {
    /// Transient errors are retried inside the model client.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ToolUseFailed { .. } | Self::RateLimited { .. })
    }

    /// Raw error body, when one was captured.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::ToolUseFailed { body }
            | Self::RateLimited { body }
            | Self::Api { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Classify a non-success HTTP response into the right error kind by
/// inspecting the body. Providers bury the machine-readable code inside a
/// JSON envelope, but the discriminating substrings are stable.
pub fn classify_api_error(provider: &'static str, status: u16, body: String) -> ModelError {
    if body.contains("tool_use_failed") {
        return ModelError::ToolUseFailed { body };
    }
    if status == 429 || body.to_lowercase().contains("rate_limit") {
        return ModelError::RateLimited { body };
    }
    ModelError::Api { provider, status, body }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

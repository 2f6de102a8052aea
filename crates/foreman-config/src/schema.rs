// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" speaks the native messages API;
    /// "groq" | "together" | "openrouter" | "openai" (or any entry with a
    /// `base_url`) speak the OpenAI-compatible function-calling format.
    pub provider: String,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Base URL override for OpenAI-compatible gateways and local servers.
    pub base_url: Option<String>,
    /// Model used for complex work (planning, debugging, decomposition).
    #[serde(default = "default_heavy_model")]
    pub heavy_model: String,
    /// Model used for routine turns and classification.
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    /// Maximum tokens to request in a single completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Model-client retry budget for transient errors (>= 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_heavy_model() -> String {
    "llama-3.3-70b-versatile".into()
}
fn default_fast_model() -> String {
    "llama-3.1-8b-instant".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_retries() -> u32 {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "groq".into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            heavy_model: default_heavy_model(),
            fast_model: default_fast_model(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Per-agent step budget (model call + tool round = one step).
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Conversation trim suffix for the orchestrator (whole turns).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Emit a progress event every N steps.
    #[serde(default = "default_update_every")]
    pub update_every: u32,
    /// Tool results larger than this are truncated before entering the
    /// conversation history.
    #[serde(default = "default_tool_result_max_bytes")]
    pub tool_result_max_bytes: usize,
}

fn default_max_steps() -> u32 {
    40
}
fn default_history_limit() -> usize {
    40
}
fn default_update_every() -> u32 {
    3
}
fn default_tool_result_max_bytes() -> usize {
    8192
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            history_limit: default_history_limit(),
            update_every: default_update_every(),
            tool_result_max_bytes: default_tool_result_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Require user confirmation before destructive tool dispatches
    /// (rm -rf, file deletion, and friends).
    #[serde(default = "default_true")]
    pub confirm_destructive: bool,
    /// Inbound phrases that trigger the cooperative kill switch.
    #[serde(default = "default_kill_words")]
    pub kill_words: Vec<String>,
    /// Poll interval (seconds) for inbound-message channels.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_kill_words() -> Vec<String> {
    ["stop", "abort", "kill switch"].map(String::from).to_vec()
}
fn default_poll_interval() -> u64 {
    5
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            confirm_destructive: true,
            kill_words: default_kill_words(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Bounded history ring size for the in-process event bus.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_event_history() -> usize {
    200
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            event_history: default_event_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// HTTP port for the static dashboard UI. The WebSocket server binds
    /// `http_port + 1`.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Directory of built dashboard assets.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

fn default_http_port() -> u16 {
    8420
}
fn default_static_dir() -> String {
    "dashboard/dist".into()
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            static_dir: default_static_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay tunnel endpoint, e.g. `wss://relay.example.com/tunnel`.
    /// Empty = tunnel disabled.
    #[serde(default)]
    pub url: String,
    /// Long-lived shared secret presented by the tunnel as a query token.
    #[serde(default)]
    pub token: String,
    /// Passphrase exchanged for a short-lived dashboard JWT.
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory for memory files (context, preferences, logs).
    /// `~` is expanded at load time.
    #[serde(default = "default_memory_dir")]
    pub dir: String,
}

fn default_memory_dir() -> String {
    "~/.local/share/foreman".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
        }
    }
}

impl Config {
    /// Resolve the API key: explicit value wins, then the configured env
    /// var, then the conventional env var for the provider.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.model.api_key {
            if !k.is_empty() && !k.starts_with("YOUR_") {
                return Some(k.clone());
            }
        }
        if let Some(env) = &self.model.api_key_env {
            if let Ok(v) = std::env::var(env) {
                return Some(v);
            }
        }
        let conventional = match self.model.provider.as_str() {
            "anthropic" => "ANTHROPIC_API_KEY",
            "groq" => "GROQ_API_KEY",
            "together" => "TOGETHER_API_KEY",
            "openrouter" => "OPENROUTER_API_KEY",
            "openai" => "OPENAI_API_KEY",
            _ => return None,
        };
        std::env::var(conventional).ok()
    }

    /// Apply a dotted-path override (`update_config` dashboard command).
    ///
    /// Only a small allow-list of live-tunable keys is supported; anything
    /// else is rejected so a typo cannot silently corrupt runtime state.
    pub fn set_by_path(&mut self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        match key {
            "model.heavy_model" => {
                self.model.heavy_model = as_str(value)?;
            }
            "model.fast_model" => {
                self.model.fast_model = as_str(value)?;
            }
            "model.max_retries" => {
                self.model.max_retries = as_u64(value)?.max(1) as u32;
            }
            "agent.max_steps" => {
                self.agent.max_steps = as_u64(value)? as u32;
            }
            "agent.history_limit" => {
                self.agent.history_limit = as_u64(value)? as usize;
            }
            "safety.confirm_destructive" => {
                self.safety.confirm_destructive = value
                    .as_bool()
                    .ok_or_else(|| anyhow::anyhow!("expected boolean for {key}"))?;
            }
            other => anyhow::bail!("unknown or non-tunable config key: {other}"),
        }
        Ok(())
    }
}

fn as_str(v: &serde_json::Value) -> anyhow::Result<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("expected string value"))
}

fn as_u64(v: &serde_json::Value) -> anyhow::Result<u64> {
    v.as_u64().ok_or_else(|| anyhow::anyhow!("expected integer value"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_complete() {
        let c = Config::default();
        assert_eq!(c.agent.max_steps, 40);
        assert_eq!(c.agent.history_limit, 40);
        assert_eq!(c.events.event_history, 200);
        assert_eq!(c.model.max_retries, 3);
        assert!(c.safety.confirm_destructive);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.dashboard.http_port, 8420);
        assert_eq!(c.agent.tool_result_max_bytes, 8192);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = "model:\n  provider: anthropic\n  heavy_model: claude-sonnet-4-5\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.model.heavy_model, "claude-sonnet-4-5");
        assert_eq!(c.model.fast_model, default_fast_model());
        assert_eq!(c.agent.max_steps, 40);
    }

    #[test]
    fn resolve_api_key_prefers_explicit() {
        let mut c = Config::default();
        c.model.api_key = Some("sk-explicit".into());
        c.model.api_key_env = Some("DEFINITELY_NOT_SET_VAR_XYZ".into());
        assert_eq!(c.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn resolve_api_key_skips_placeholder() {
        let mut c = Config::default();
        c.model.api_key = Some("YOUR_KEY_HERE".into());
        c.model.provider = "definitely-unknown".into();
        assert!(c.resolve_api_key().is_none());
    }

    #[test]
    fn set_by_path_updates_known_key() {
        let mut c = Config::default();
        c.set_by_path("agent.max_steps", &serde_json::json!(12)).unwrap();
        assert_eq!(c.agent.max_steps, 12);
    }

    #[test]
    fn set_by_path_rejects_unknown_key() {
        let mut c = Config::default();
        let err = c.set_by_path("model.api_key", &serde_json::json!("sneaky"));
        assert!(err.is_err(), "credentials must not be tunable over the wire");
    }

    #[test]
    fn set_by_path_max_retries_floor_is_one() {
        let mut c = Config::default();
        c.set_by_path("model.max_retries", &serde_json::json!(0)).unwrap();
        assert_eq!(c.model.max_retries, 1);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.dashboard.http_port, c.dashboard.http_port);
        assert_eq!(back.model.heavy_model, c.model.heavy_model);
    }
}

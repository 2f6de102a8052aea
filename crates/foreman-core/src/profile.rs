// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Everything that parameterizes one specialist agent: identity, prompt,
/// budgets, and the fabricated-success guards.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Short routing key: "coder", "browser", "system", "research", "file".
    pub name: String,
    /// Human-readable name for logs and progress messages.
    pub display_name: String,
    pub system_prompt: String,
    pub model: String,
    pub max_tokens: u32,
    /// Step budget: one model call plus its tool round is one step.
    pub max_steps: u32,
    /// Emit a progress event every N steps.
    pub update_every: u32,
    /// Cap on tool uses honored per model turn; excess calls are answered
    /// with a SKIPPED result. None = unlimited.
    pub max_tools_per_step: Option<u32>,
    /// When true, `done` is rejected until `min_actions` dispatches have
    /// happened. Used by flows where success requires observable work
    /// (form filling, multi-step navigation).
    pub guard_min_actions: bool,
    pub min_actions: u32,
    /// Tool results larger than this are truncated before entering the
    /// conversation.
    pub tool_result_max_bytes: usize,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            system_prompt: String::new(),
            model: String::new(),
            max_tokens: 4096,
            max_steps: 40,
            update_every: 3,
            max_tools_per_step: None,
            guard_min_actions: false,
            min_actions: 4,
            tool_result_max_bytes: 8192,
        }
    }
}

/// Terminal outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub content: String,
    pub steps: u32,
    pub stuck: bool,
    pub stuck_reason: Option<String>,
}

impl AgentResult {
    pub fn done(summary: String, steps: u32) -> Self {
        Self { success: true, content: summary, steps, stuck: false, stuck_reason: None }
    }

    pub fn stuck(reason: String, steps: u32) -> Self {
        Self {
            success: false,
            content: format!("Stuck: {reason}"),
            steps,
            stuck: true,
            stuck_reason: Some(reason),
        }
    }
}

/// Optional per-run callbacks, mirroring the loop's lifecycle. All
/// default to no-ops.
pub trait AgentHooks: Send + Sync {
    fn on_start(&self, _task: &str) {}
    fn on_step(&self, _step: u32, _tool_name: &str, _result: &str) {}
    fn on_done(&self, _summary: &str) {}
    fn on_stuck(&self, _reason: &str) {}
}

/// The default hook set: does nothing.
pub struct NoHooks;

impl AgentHooks for NoHooks {}

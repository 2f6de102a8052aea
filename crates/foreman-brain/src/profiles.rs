// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use foreman_config::Config;
use foreman_core::AgentProfile;

use crate::prompts;

/// The five specialist roles the classifier routes to.
pub const SPECIALISTS: &[&str] = &["browser", "coder", "system", "research", "file"];

/// Build the profile for one specialist from runtime configuration.
/// Returns None for unknown agent names so callers can surface a clean
/// error instead of deploying a misconfigured agent.
pub fn profile_for(name: &str, config: &Config) -> Option<AgentProfile> {
    let (display, system_prompt) = match name {
        "browser" => ("Browser Agent", prompts::browser_prompt()),
        "coder" => ("Coder Agent", prompts::coder_prompt()),
        "system" => ("System Agent", prompts::system_prompt_agent()),
        "research" => ("Research Agent", prompts::research_prompt()),
        "file" => ("File Agent", prompts::file_prompt()),
        _ => return None,
    };

    let mut p = AgentProfile::new(name, display);
    p.system_prompt = system_prompt;
    p.max_tokens = config.model.max_tokens;
    p.max_steps = config.agent.max_steps;
    p.update_every = config.agent.update_every;
    p.tool_result_max_bytes = config.agent.tool_result_max_bytes;

    // Complex multi-step work goes to the heavy model; quick lookups and
    // file shuffling run on the fast one.
    p.model = match name {
        "browser" | "coder" => config.model.heavy_model.clone(),
        _ => config.model.fast_model.clone(),
    };

    // Browser flows batch poorly and invite fabricated success claims:
    // force step-by-step operation and demand observable progress before
    // accepting done.
    if name == "browser" {
        p.max_tools_per_step = Some(2);
        p.guard_min_actions = true;
        p.min_actions = 4;
    }

    Some(p)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

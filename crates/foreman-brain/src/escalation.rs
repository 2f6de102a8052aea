// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Escalation: turning a stuck sub-agent into the next action.
//!
//! The decision table is deterministic in the attempt number:
//!
//! | attempt | strategy  |
//! |---------|-----------|
//! | 1       | retry (same agent, synthesized guidance)   |
//! | 2       | reroute (untried alternative, or fall through) |
//! | 3       | decompose (same agent, partial-work framing)   |
//! | ≥4      | ask the user |
//!
//! A failure log keyed by task prefix prevents rerouting to an agent that
//! already failed the same task. The log is cleared when the top-level
//! task eventually succeeds.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Task identity for the failure log: the first 100 characters. Retries
/// rephrase details but keep the prefix stable.
const TASK_PREFIX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Retry,
    Reroute,
    Decompose,
    AskUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationDecision {
    pub strategy: Strategy,
    /// Agent to deploy next (None for ask-user).
    pub agent: Option<String>,
    /// Context injected into the next deployment.
    pub guidance: Option<String>,
    /// Human-facing message (ask-user only).
    pub user_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub agent: String,
    pub task_prefix: String,
    pub reason: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Which agents may take over which failed agent's task. Configuration,
/// not derived: a browser task must never land on an agent that cannot
/// browse.
pub fn default_reroute_map() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert("browser".to_string(), vec![]);
    map.insert("coder".to_string(), vec!["system".to_string()]);
    map.insert("system".to_string(), vec!["coder".to_string()]);
    map.insert("research".to_string(), vec!["browser".to_string()]);
    map.insert("file".to_string(), vec!["coder".to_string(), "system".to_string()]);
    map
}

pub struct EscalationManager {
    reroute_map: HashMap<String, Vec<String>>,
    failure_log: Mutex<Vec<FailureRecord>>,
}

impl EscalationManager {
    pub fn new(reroute_map: HashMap<String, Vec<String>>) -> Self {
        Self { reroute_map, failure_log: Mutex::new(Vec::new()) }
    }

    /// Decide what to do about a stuck agent. Also appends the failure to
    /// the log, so call exactly once per stuck signal.
    pub fn handle_stuck(
        &self,
        agent: &str,
        task: &str,
        stuck_reason: &str,
        attempt: u32,
    ) -> EscalationDecision {
        {
            let mut log = self.failure_log.lock().unwrap_or_else(|e| e.into_inner());
            log.push(FailureRecord {
                agent: agent.to_string(),
                task_prefix: prefix(task),
                reason: clip(stuck_reason, 500),
                attempt,
                timestamp: Utc::now(),
            });
        }

        match attempt {
            0 | 1 => EscalationDecision {
                strategy: Strategy::Retry,
                agent: Some(agent.to_string()),
                guidance: Some(self.retry_guidance(agent, stuck_reason)),
                user_message: None,
            },
            2 => match self.find_alternative(agent, task) {
                Some(alt) => EscalationDecision {
                    strategy: Strategy::Reroute,
                    agent: Some(alt),
                    guidance: Some(format!(
                        "Previous attempt by {agent} failed: {stuck_reason}\n\nTry a different \
                         approach to accomplish: {task}"
                    )),
                    user_message: None,
                },
                // No untried alternative: go straight to decomposition.
                None => self.decompose(agent, task, stuck_reason),
            },
            3 => self.decompose(agent, task, stuck_reason),
            _ => EscalationDecision {
                strategy: Strategy::AskUser,
                agent: None,
                guidance: None,
                user_message: Some(self.build_user_message(task, stuck_reason)),
            },
        }
    }

    fn decompose(&self, agent: &str, task: &str, stuck_reason: &str) -> EscalationDecision {
        EscalationDecision {
            strategy: Strategy::Decompose,
            agent: Some(agent.to_string()),
            guidance: Some(format!(
                "The full task failed. Try breaking it into smaller steps and doing the parts \
                 you CAN do.\n\nOriginal task: {task}\nPrevious failure: {stuck_reason}\n\nDo \
                 whatever partial work is possible and report what you accomplished vs what you \
                 couldn't do."
            )),
            user_message: None,
        }
    }

    /// Keyword-driven retry guidance, specialized per agent kind, always
    /// ending with the generic change-strategy rule.
    fn retry_guidance(&self, agent: &str, stuck_reason: &str) -> String {
        let reason = stuck_reason.to_lowercase();
        let mut lines = vec![
            format!("Your previous attempt failed with this reason: {stuck_reason}"),
            String::new(),
            "Guidance for retry:".to_string(),
        ];

        match agent {
            "browser" => {
                lines.push("- CRITICAL: inspect the page first to see what is ACTUALLY there".into());
                lines.push("- ONLY use selectors from the page inspection — never guess selector names".into());
                lines.push("- Many forms show ONE field at a time. Fill it, advance, then inspect again.".into());
                if reason.contains("click") || reason.contains("button") {
                    lines.push("- Use the button's visible text — not a bracketed label".into());
                    lines.push("- Try keyboard navigation (tab + enter) to reach the element".into());
                }
                if reason.contains("timeout") || reason.contains("load") {
                    lines.push("- Wait longer between actions (3-5 seconds)".into());
                    lines.push("- Check whether the page URL changed — you might be somewhere else".into());
                }
                if reason.contains("error") {
                    lines.push("- Check the page's error/alert region for messages".into());
                    lines.push("- If a username is taken, try a different one with random numbers".into());
                }
                if reason.contains("dropdown") || reason.contains("select") {
                    lines.push("- Select by the dropdown's label text, not a CSS selector".into());
                    lines.push("- Scroll down in case the options are below the fold".into());
                }
                if reason.contains("captcha") {
                    lines.push("- CAPTCHAs cannot be solved automatically. Report this to the user.".into());
                }
            }
            "coder" => {
                if reason.contains("error") || reason.contains("traceback") || reason.contains("panic") {
                    lines.push("- Read the full error message carefully".into());
                    lines.push("- Read the relevant file to understand the context".into());
                    lines.push("- Check for missing imports or dependencies".into());
                }
                if reason.contains("permission") {
                    lines.push("- Check file permissions with ls -la".into());
                    lines.push("- Consider whether elevated privileges are appropriate".into());
                }
                if reason.contains("not found") {
                    lines.push("- Search for the correct file/path with search_files".into());
                    lines.push("- Check whether the dependency is installed".into());
                }
            }
            "system" => {
                if reason.contains("app") {
                    lines.push("- Make sure the application name is exact (case-sensitive)".into());
                    lines.push("- Try launching it via run_command instead".into());
                }
                if reason.contains("click") {
                    lines.push("- Capture the screen state first to verify coordinates".into());
                    lines.push("- Try keyboard shortcuts instead of clicking".into());
                }
            }
            _ => {}
        }

        lines.push("- Try a completely different approach than what you tried before".into());
        lines.push(
            "- If the same method fails twice, it won't work a third time — change strategy".into(),
        );
        lines.join("\n")
    }

    /// First reroute target that has not already failed this task.
    fn find_alternative(&self, failed_agent: &str, task: &str) -> Option<String> {
        let alternatives = self.reroute_map.get(failed_agent)?;
        let task_prefix = prefix(task);
        let log = self.failure_log.lock().unwrap_or_else(|e| e.into_inner());
        let failed: Vec<&str> = log
            .iter()
            .filter(|f| f.task_prefix == task_prefix)
            .map(|f| f.agent.as_str())
            .collect();
        alternatives
            .iter()
            .find(|alt| !failed.contains(&alt.as_str()))
            .cloned()
    }

    fn build_user_message(&self, task: &str, reason: &str) -> String {
        let task_prefix = prefix(task);
        let log = self.failure_log.lock().unwrap_or_else(|e| e.into_inner());
        let relevant: Vec<&FailureRecord> =
            log.iter().filter(|f| f.task_prefix == task_prefix).collect();
        let attempts: String = relevant
            .iter()
            .rev()
            .take(4)
            .rev()
            .enumerate()
            .map(|(i, f)| format!("  {}. {}: {}", i + 1, f.agent, clip(&f.reason, 100)))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "I need help.\n\nTask: {}\n\nI tried {} approaches:\n{}\n\nLast error: {}\n\nWhat \
             should I do? Reply with instructions or 'skip' to move on.",
            clip(task, 300),
            relevant.len(),
            attempts,
            clip(reason, 300),
        )
    }

    /// Clear the log after a successful top-level task.
    pub fn clear_log(&self) {
        self.failure_log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn failure_count(&self) -> usize {
        self.failure_log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Per-agent failure totals for the dashboard.
    pub fn stats(&self) -> HashMap<String, usize> {
        let log = self.failure_log.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = HashMap::new();
        for f in log.iter() {
            *stats.entry(f.agent.clone()).or_insert(0) += 1;
        }
        stats
    }
}

impl Default for EscalationManager {
    fn default() -> Self {
        Self::new(default_reroute_map())
    }
}

fn prefix(task: &str) -> String {
    clip(task, TASK_PREFIX_CHARS)
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

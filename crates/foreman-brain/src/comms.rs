// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inter-agent communication: a shared key-addressed scratchpad and
//! one-shot handoff slots. All flow goes through the orchestrator — there
//! is no direct agent-to-agent channel.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ScratchpadEntry {
    pub key: String,
    pub value: Value,
    /// Free-form tag ("selectors", "credentials", "finding", ...) so a
    /// consumer can pull everything of one kind.
    pub kind: String,
    /// Which agent wrote it.
    pub writer: String,
    pub ts: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    scratchpad: HashMap<String, ScratchpadEntry>,
    /// agent name → formatted handoff context waiting for its next
    /// deployment. Popped (read-and-clear) atomically.
    handoffs: HashMap<String, String>,
}

/// Shared comms hub. One mutex guards both structures so a handoff that
/// references scratchpad keys is observed consistently.
#[derive(Default)]
pub struct AgentComms {
    inner: Mutex<Inner>,
}

impl AgentComms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, key: &str, value: Value, kind: &str, writer: &str) {
        let entry = ScratchpadEntry {
            key: key.to_string(),
            value,
            kind: kind.to_string(),
            writer: writer.to_string(),
            ts: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scratchpad
            .insert(key.to_string(), entry);
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scratchpad
            .get(key)
            .map(|e| e.value.clone())
    }

    pub fn read_by_kind(&self, kind: &str) -> HashMap<String, Value> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scratchpad
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Compact human-readable view for prompts and the dashboard.
    pub fn summary(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.scratchpad.is_empty() {
            return "Shared Scratchpad: empty".to_string();
        }
        let mut entries: Vec<&ScratchpadEntry> = inner.scratchpad.values().collect();
        entries.sort_by(|a, b| a.ts.cmp(&b.ts));
        let mut out = String::from("Shared Scratchpad:");
        for e in entries {
            let value = e.value.to_string();
            let value = if value.len() > 120 { format!("{}…", &value[..120]) } else { value };
            out.push_str(&format!("\n- [{}] {} (by {}): {}", e.kind, e.key, e.writer, value));
        }
        out
    }

    /// Record a handoff from one agent to another. The context is stored
    /// against the recipient and injected into its next deployment.
    pub fn handoff(&self, from: &str, to: &str, context: &str, task: &str) -> String {
        let task_line = if task.is_empty() {
            String::new()
        } else {
            format!("Task for you: {task}\n")
        };
        let text = format!(
            "=== HANDOFF FROM {} AGENT ===\n\
             Previous agent ({from}) worked on this task and provides context:\n\
             {context}\n\
             {task_line}=== END HANDOFF ===",
            from.to_uppercase(),
        );
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handoffs
            .insert(to.to_string(), text.clone());
        text
    }

    /// Pop the handoff waiting for `agent`, clearing the slot.
    pub fn take_handoff(&self, agent: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handoffs
            .remove(agent)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.scratchpad.clear();
        inner.handoffs.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let comms = AgentComms::new();
        comms.write("selectors", json!({"email": "#email"}), "selectors", "browser");
        assert_eq!(comms.read("selectors").unwrap()["email"], "#email");
    }

    #[test]
    fn read_missing_key_is_none() {
        let comms = AgentComms::new();
        assert!(comms.read("nope").is_none());
    }

    #[test]
    fn read_by_kind_filters() {
        let comms = AgentComms::new();
        comms.write("a", json!(1), "finding", "research");
        comms.write("b", json!(2), "finding", "research");
        comms.write("c", json!(3), "selectors", "browser");
        let findings = comms.read_by_kind("finding");
        assert_eq!(findings.len(), 2);
        assert!(findings.contains_key("a"));
        assert!(!findings.contains_key("c"));
    }

    #[test]
    fn overwrite_replaces_entry() {
        let comms = AgentComms::new();
        comms.write("k", json!("old"), "note", "coder");
        comms.write("k", json!("new"), "note", "coder");
        assert_eq!(comms.read("k").unwrap(), json!("new"));
    }

    #[test]
    fn summary_mentions_entries() {
        let comms = AgentComms::new();
        assert!(comms.summary().contains("empty"));
        comms.write("login_url", json!("https://x/login"), "finding", "research");
        let s = comms.summary();
        assert!(s.contains("Shared Scratchpad"));
        assert!(s.contains("login_url"));
        assert!(s.contains("research"));
    }

    #[test]
    fn handoff_is_consumed_exactly_once() {
        let comms = AgentComms::new();
        comms.handoff("research", "browser", "login page is at /signin", "log in there");
        let ctx = comms.take_handoff("browser").unwrap();
        assert!(ctx.contains("HANDOFF FROM RESEARCH AGENT"));
        assert!(ctx.contains("login page is at /signin"));
        assert!(ctx.contains("Task for you: log in there"));
        assert!(comms.take_handoff("browser").is_none(), "slot must clear on take");
    }

    #[test]
    fn handoff_without_task_omits_task_line() {
        let comms = AgentComms::new();
        comms.handoff("coder", "system", "binary built at /tmp/app", "");
        let ctx = comms.take_handoff("system").unwrap();
        assert!(!ctx.contains("Task for you"));
    }

    #[test]
    fn clear_empties_both_structures() {
        let comms = AgentComms::new();
        comms.write("k", json!(1), "note", "a");
        comms.handoff("a", "b", "ctx", "");
        comms.clear();
        assert!(comms.read("k").is_none());
        assert!(comms.take_handoff("b").is_none());
    }
}

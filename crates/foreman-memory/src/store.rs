// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Operator-facing memory: current context, learned preferences, project
//! notes, and an action history log. The dashboard reads and edits the
//! context/preferences documents; the orchestrator injects a bounded
//! summary into its system prompt.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How many recent actions the context summary includes.
const RECENT_ACTIONS: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
struct ActionEntry {
    ts: String,
    action: String,
    input: String,
    result: String,
    success: bool,
}

pub struct MemoryStore {
    context_file: PathBuf,
    preferences_file: PathBuf,
    history_file: PathBuf,
    projects_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let projects_dir = dir.join("projects");
        std::fs::create_dir_all(&projects_dir)?;

        let store = Self {
            context_file: dir.join("context.md"),
            preferences_file: dir.join("preferences.md"),
            history_file: dir.join("history.jsonl"),
            projects_dir,
            write_lock: Mutex::new(()),
        };

        if !store.context_file.exists() {
            store.write_file(&store.context_file, "# Current Context\n\n_No active task._\n");
        }
        if !store.preferences_file.exists() {
            store.write_file(&store.preferences_file, "# Preferences\n\n_Learning..._\n");
        }
        Ok(store)
    }

    fn write_file(&self, path: &PathBuf, content: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = std::fs::write(path, content) {
            warn!(path = %path.display(), error = %e, "cannot write memory file");
        }
    }

    fn read_file(&self, path: &PathBuf) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    // ── Context / preferences ────────────────────────────────────────────────

    pub fn context(&self) -> String {
        self.read_file(&self.context_file)
    }

    pub fn preferences(&self) -> String {
        self.read_file(&self.preferences_file)
    }

    pub fn update_context(&self, content: &str) {
        self.write_file(&self.context_file, content);
    }

    pub fn update_preferences(&self, content: &str) {
        self.write_file(&self.preferences_file, content);
    }

    /// Bounded memory block for the orchestrator's system prompt.
    pub fn context_summary(&self) -> String {
        let mut parts = Vec::new();
        let ctx = self.context();
        if !ctx.trim().is_empty() {
            parts.push(format!("### Current Context\n{ctx}"));
        }
        let prefs = self.preferences();
        if !prefs.trim().is_empty() {
            parts.push(format!("### Preferences\n{prefs}"));
        }
        let history = self.recent_history(RECENT_ACTIONS);
        if !history.is_empty() {
            parts.push(format!("### Recent Actions\n{history}"));
        }
        if parts.is_empty() {
            "_No memory yet._".to_string()
        } else {
            parts.join("\n\n")
        }
    }

    // ── Action history ───────────────────────────────────────────────────────

    pub fn log_action(&self, action: &str, input: &Value, result: &str, success: bool) {
        let entry = ActionEntry {
            ts: Utc::now().to_rfc3339(),
            action: action.to_string(),
            input: clip(&input.to_string(), 500),
            result: clip(result, 500),
            success,
        };
        let Ok(line) = serde_json::to_string(&entry) else { return };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = outcome {
            warn!(error = %e, "cannot append action history");
        }
    }

    fn recent_history(&self, n: usize) -> String {
        let Ok(text) = std::fs::read_to_string(&self.history_file) else {
            return String::new();
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .filter_map(|l| serde_json::from_str::<ActionEntry>(l).ok())
            .map(|e| {
                let status = if e.success { "ok" } else { "failed" };
                format!("[{status}] {}: {}", e.action, clip(&e.input, 80))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ── Save / recall (model-invoked tools) ──────────────────────────────────

    /// `category` ∈ preference | project | context | note.
    pub fn save(&self, category: &str, key: &str, value: &str) -> String {
        match category {
            "preference" => {
                let mut prefs = self.preferences();
                prefs.push_str(&format!("\n- **{key}**: {value}"));
                self.update_preferences(&prefs);
            }
            "project" => {
                let path = self.projects_dir.join(format!("{}.md", sanitize_key(key)));
                self.write_file(&path, &format!("# Project: {key}\n\n{value}\n"));
            }
            "context" => {
                self.update_context(&format!("# Current Context\n\n**{key}**: {value}\n"));
            }
            "note" => {
                self.log_action("note", &Value::String(key.to_string()), value, true);
            }
            other => return format!("ERROR: unknown memory category: {other}"),
        }
        format!("Saved to {category}: {key}")
    }

    /// Case-insensitive substring search over every memory surface.
    pub fn recall(&self, query: &str) -> String {
        let q = query.to_lowercase();
        let mut results = Vec::new();

        let ctx = self.context();
        if ctx.to_lowercase().contains(&q) {
            results.push(format!("[Context] {}", clip(&ctx, 500)));
        }
        let prefs = self.preferences();
        if prefs.to_lowercase().contains(&q) {
            results.push(format!("[Preferences] {}", clip(&prefs, 500)));
        }
        if let Ok(entries) = std::fs::read_dir(&self.projects_dir) {
            for entry in entries.flatten() {
                let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
                if content.to_lowercase().contains(&q) {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    results.push(format!("[Project: {name}] {}", clip(&content, 500)));
                }
            }
        }
        if let Ok(text) = std::fs::read_to_string(&self.history_file) {
            for line in text.lines() {
                if line.to_lowercase().contains(&q) {
                    results.push(format!("[History] {}", clip(line, 200)));
                }
            }
        }

        if results.is_empty() {
            format!("No memories found matching '{query}'")
        } else {
            results.truncate(10);
            results.join("\n\n")
        }
    }
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

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = MemoryStore::new(dir.path()).unwrap();
        (dir, s)
    }

    #[test]
    fn new_store_seeds_default_files() {
        let (_dir, s) = store();
        assert!(s.context().contains("No active task"));
        assert!(s.preferences().contains("Learning"));
    }

    #[test]
    fn save_preference_appends() {
        let (_dir, s) = store();
        let out = s.save("preference", "editor", "helix");
        assert!(out.contains("Saved"));
        assert!(s.preferences().contains("**editor**: helix"));
    }

    #[test]
    fn save_context_replaces() {
        let (_dir, s) = store();
        s.save("context", "project", "foreman");
        assert!(s.context().contains("**project**: foreman"));
        assert!(!s.context().contains("No active task"));
    }

    #[test]
    fn save_project_creates_file() {
        let (dir, s) = store();
        s.save("project", "web app", "uses axum");
        assert!(dir.path().join("projects/web_app.md").exists());
    }

    #[test]
    fn save_unknown_category_is_error() {
        let (_dir, s) = store();
        assert!(s.save("nonsense", "k", "v").starts_with("ERROR:"));
    }

    #[test]
    fn recall_finds_across_surfaces() {
        let (_dir, s) = store();
        s.save("preference", "lang", "rust always");
        s.save("project", "tool", "a rust CLI");
        let out = s.recall("rust");
        assert!(out.contains("[Preferences]"));
        assert!(out.contains("[Project:"));
    }

    #[test]
    fn recall_miss_reports_query() {
        let (_dir, s) = store();
        let out = s.recall("unobtainium");
        assert!(out.contains("unobtainium"));
    }

    #[test]
    fn context_summary_includes_recent_actions() {
        let (_dir, s) = store();
        s.log_action("run_command", &json!({"command": "ls"}), "ok", true);
        s.log_action("write_file", &json!({"path": "/tmp/x"}), "ERROR: denied", false);
        let summary = s.context_summary();
        assert!(summary.contains("[ok] run_command"));
        assert!(summary.contains("[failed] write_file"));
    }
}

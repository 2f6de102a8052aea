// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Outcome of one sub-agent deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// One appended record. Records are never edited — the log is the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryRecord {
    pub agent: String,
    pub task: String,
    pub outcome: Outcome,
    pub details: String,
    pub steps: u32,
    pub timestamp: DateTime<Utc>,
}

/// Bound on the context summary injected into sub-agent prompts.
const CONTEXT_MAX_CHARS: usize = 1200;

/// How many recent failures the context summary mentions.
const RECENT_FAILURES: usize = 3;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct AgentStats {
    pub successes: u32,
    pub failures: u32,
}

/// Per-agent outcome log: append-only JSONL on disk, one record per line.
/// Writes are synchronized; reads parse the whole file (the log is small
/// and bounded by task cadence, not event cadence).
pub struct AgentMemory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AgentMemory {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { path: dir.join("agents.jsonl"), write_lock: Mutex::new(()) })
    }

    pub fn record_success(&self, agent: &str, task: &str, details: &str, steps: u32) {
        self.append(agent, task, Outcome::Success, details, steps);
    }

    pub fn record_failure(&self, agent: &str, task: &str, details: &str, steps: u32) {
        self.append(agent, task, Outcome::Failure, details, steps);
    }

    fn append(&self, agent: &str, task: &str, outcome: Outcome, details: &str, steps: u32) {
        let record = AgentMemoryRecord {
            agent: agent.to_string(),
            task: truncate(task, 200),
            outcome,
            details: truncate(details, 500),
            steps,
            timestamp: Utc::now(),
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "cannot serialize agent memory record");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "cannot append agent memory record");
        }
    }

    fn read_all(&self) -> Vec<AgentMemoryRecord> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Human-readable summary of an agent's track record, bounded in
    /// length, for injection into its system prompt.
    pub fn get_context(&self, agent: &str) -> String {
        let records: Vec<AgentMemoryRecord> = self
            .read_all()
            .into_iter()
            .filter(|r| r.agent == agent)
            .collect();
        if records.is_empty() {
            return String::new();
        }

        let succ = records.iter().filter(|r| r.outcome == Outcome::Success).count();
        let fail = records.len() - succ;
        let mut out = format!(
            "Track record for {agent}: {succ} succeeded, {fail} failed out of {} deployments.",
            records.len()
        );

        let recent_failures: Vec<&AgentMemoryRecord> = records
            .iter()
            .rev()
            .filter(|r| r.outcome == Outcome::Failure)
            .take(RECENT_FAILURES)
            .collect();
        if !recent_failures.is_empty() {
            out.push_str("\nRecent failure patterns:");
            for r in recent_failures {
                out.push_str(&format!("\n- {}: {}", truncate(&r.task, 80), truncate(&r.details, 120)));
            }
        }

        truncate(&out, CONTEXT_MAX_CHARS)
    }

    pub fn get_all_stats(&self) -> HashMap<String, AgentStats> {
        let mut stats: HashMap<String, AgentStats> = HashMap::new();
        for r in self.read_all() {
            let entry = stats.entry(r.agent).or_default();
            match r.outcome {
                Outcome::Success => entry.successes += 1,
                Outcome::Failure => entry.failures += 1,
            }
        }
        stats
    }
}

fn truncate(s: &str, max: usize) -> String {
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

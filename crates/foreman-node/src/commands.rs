// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed dashboard commands, shared by the local WebSocket server and the
//! tunnel (commands arriving from the relay take the same path).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use foreman_brain::Orchestrator;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardCommand {
    GetStats,
    GetMemory,
    SaveMemory { field: String, content: String },
    SendTask { task: String },
    Kill,
    UpdateConfig { key: String, value: Value },
}

/// JSON error frame in the same envelope as bus events.
pub fn error_frame(message: &str) -> String {
    json!({
        "type": "error",
        "ts": chrono::Utc::now(),
        "data": { "message": message },
    })
    .to_string()
}

/// Execute one dashboard command against the brain. Returns the direct
/// reply frame, if the command has one; side effects (task processing,
/// kill, config updates) additionally surface as bus events.
pub async fn handle_command(brain: &Arc<Orchestrator>, cmd: DashboardCommand) -> Option<String> {
    match cmd {
        DashboardCommand::GetStats => {
            Some(json!({ "type": "stats", "data": brain.stats() }).to_string())
        }
        DashboardCommand::GetMemory => Some(
            json!({
                "type": "memory_data",
                "data": {
                    "context": brain.memory().context(),
                    "preferences": brain.memory().preferences(),
                }
            })
            .to_string(),
        ),
        DashboardCommand::SaveMemory { field, content } => {
            match field.as_str() {
                "context" => brain.memory().update_context(&content),
                "preferences" => brain.memory().update_preferences(&content),
                other => return Some(error_frame(&format!("unknown memory field: {other}"))),
            }
            Some(json!({ "type": "memory_saved", "data": { "field": field } }).to_string())
        }
        DashboardCommand::SendTask { task } => {
            if task.trim().is_empty() {
                return Some(error_frame("empty task"));
            }
            // Task processing must not block the socket loop; the task
            // lock inside the brain serializes execution.
            let brain = Arc::clone(brain);
            tokio::spawn(async move {
                brain.process_task(&task, "dashboard").await;
            });
            None
        }
        DashboardCommand::Kill => {
            info!("kill switch from dashboard");
            brain.kill_flag().store(true, Ordering::Relaxed);
            brain.bus().emit("kill_switch", json!({ "source": "dashboard" }));
            None
        }
        DashboardCommand::UpdateConfig { key, value } => {
            match brain.update_config(&key, &value) {
                Ok(()) => None, // config_updated event is the acknowledgment
                Err(e) => Some(error_frame(&e.to_string())),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

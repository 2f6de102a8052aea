// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::debug;

use foreman_model::ToolSpec;

use crate::handler::{err, require_str, ToolHandler};
use crate::safety::is_destructive;

/// Seam for the destructive-command confirmation round-trip. The runtime
/// wires this to the user channel; tests stub it.
#[async_trait]
pub trait DestructiveGate: Send + Sync {
    /// Return true to allow the command to run.
    async fn confirm(&self, command: &str) -> bool;
}

/// Runs shell commands with a timeout. Serves `run_command` and
/// `run_tests` (identical mechanics, different advertised intent).
pub struct ShellHandler {
    pub default_timeout_secs: u64,
    /// When set, destructive-looking commands must be confirmed first.
    pub gate: Option<Arc<dyn DestructiveGate>>,
}

impl Default for ShellHandler {
    fn default() -> Self {
        Self { default_timeout_secs: 60, gate: None }
    }
}

pub fn run_command_spec() -> ToolSpec {
    ToolSpec::new(
        "run_command",
        "Run a shell command (bash) and get the output. Use for: installing packages, \
         running scripts, git, building, any CLI task. For long commands, set a higher timeout.",
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 60)", "default": 60 }
            },
            "required": ["command"]
        }),
    )
}

pub fn run_tests_spec() -> ToolSpec {
    ToolSpec::new(
        "run_tests",
        "Run tests for the project. Provide the test command (e.g., 'cargo test', 'npm test', 'pytest'). \
         If the tests fail, read the failure output, fix the code, then call run_tests again.",
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Test command to run" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 120)", "default": 120 }
            },
            "required": ["command"]
        }),
    )
}

#[async_trait]
impl ToolHandler for ShellHandler {
    async fn dispatch(&self, name: &str, input: &Map<String, Value>) -> String {
        let command = match require_str(input, "command") {
            Ok(c) => c.to_string(),
            Err(e) => return e,
        };
        let default = if name == "run_tests" { 120 } else { self.default_timeout_secs };
        let timeout = input.get("timeout").and_then(Value::as_u64).unwrap_or(default);

        if is_destructive(&command) {
            if let Some(gate) = &self.gate {
                if !gate.confirm(&command).await {
                    return "Command cancelled by user.".to_string();
                }
            }
        }

        debug!(cmd = %command, timeout, "executing shell command");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut text = String::new();
                text.push_str(&String::from_utf8_lossy(&output.stdout));
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                if output.status.success() {
                    if text.trim().is_empty() {
                        "(command completed with no output)".to_string()
                    } else {
                        text
                    }
                } else {
                    err(format_args!(
                        "command exited with {}:\n{}",
                        output.status,
                        text.trim_end()
                    ))
                }
            }
            Ok(Err(e)) => err(format_args!("failed to spawn command: {e}")),
            Err(_) => err(format_args!("command timed out after {timeout}s: {command}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::is_error;

    fn args(command: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("command".into(), Value::String(command.into()));
        m
    }

    #[tokio::test]
    async fn echo_returns_stdout() {
        let h = ShellHandler::default();
        let out = h.dispatch("run_command", &args("echo hello")).await;
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn failing_command_is_error() {
        let h = ShellHandler::default();
        let out = h.dispatch("run_command", &args("exit 3")).await;
        assert!(is_error(&out));
        assert!(out.contains("exit"));
    }

    #[tokio::test]
    async fn missing_command_argument_is_error() {
        let h = ShellHandler::default();
        let out = h.dispatch("run_command", &Map::new()).await;
        assert!(is_error(&out));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let h = ShellHandler { default_timeout_secs: 1, gate: None };
        let out = h.dispatch("run_command", &args("sleep 10")).await;
        assert!(is_error(&out));
        assert!(out.contains("timed out"));
    }

    #[tokio::test]
    async fn empty_output_gets_placeholder() {
        let h = ShellHandler::default();
        let out = h.dispatch("run_command", &args("true")).await;
        assert!(out.contains("no output"));
    }

    struct DenyAll;

    #[async_trait]
    impl DestructiveGate for DenyAll {
        async fn confirm(&self, _command: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn destructive_command_denied_by_gate() {
        let h = ShellHandler { default_timeout_secs: 5, gate: Some(Arc::new(DenyAll)) };
        let out = h.dispatch("run_command", &args("rm -rf /tmp/whatever")).await;
        assert!(out.contains("cancelled"));
    }

    #[tokio::test]
    async fn destructive_command_runs_without_gate() {
        let h = ShellHandler::default();
        // Looks destructive to the matcher but is harmless.
        let out = h.dispatch("run_command", &args("echo rm -rf /")).await;
        assert!(out.contains("rm -rf /"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use foreman_model::ToolSpec;

use crate::handler::{err, ToolHandler};

/// Terminal tool: the agent claims completion. Intercepted by the agent
/// loop, never dispatched.
pub fn done_spec() -> ToolSpec {
    ToolSpec::new(
        "done",
        "Task is complete. Provide a detailed summary of what was accomplished, \
         including specifics (files created, commands run, results found, etc).",
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "Detailed summary of accomplishments" }
            },
            "required": ["summary"]
        }),
    )
}

/// Terminal tool: the agent cannot proceed. Intercepted by the agent loop
/// and escalated by the orchestrator.
pub fn stuck_spec() -> ToolSpec {
    ToolSpec::new(
        "stuck",
        "Cannot complete the task after trying multiple approaches. Explain exactly what \
         you tried and why each approach failed. The orchestrator will analyze this and \
         either retry with guidance, reroute to a different agent, or ask the user.",
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Detailed explanation: what you tried, why each approach failed, what info is missing"
                }
            },
            "required": ["reason"]
        }),
    )
}

/// True for the two terminal tools the loop intercepts.
pub fn is_terminal(name: &str) -> bool {
    name == "done" || name == "stuck"
}

/// Name-keyed tool registry: schemas for advertisement, handlers for
/// dispatch. The terminal tools are advertised by [`advertised_specs`]
/// but deliberately have no handler entry.
#[derive(Default)]
pub struct ToolRegistry {
    specs: HashMap<String, ToolSpec>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(spec.name.clone(), handler);
        self.specs.insert(spec.name.clone(), spec);
    }

    /// The tool list advertised to the model: every registered spec in
    /// name order, with `done` and `stuck` appended.
    pub fn advertised_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.specs.values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs.push(done_spec());
        specs.push(stuck_spec());
        specs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a call to its handler. Unknown names and terminal tools
    /// produce `ERROR:` results rather than panics — terminal tools must
    /// be intercepted before dispatch ever sees them.
    pub async fn dispatch(&self, name: &str, input: &Map<String, Value>) -> String {
        if is_terminal(name) {
            return err(format_args!("'{name}' is a terminal signal, not a dispatchable tool"));
        }
        match self.handlers.get(name) {
            Some(handler) => handler.dispatch(name, input).await,
            None => err(format_args!("unknown tool: {name}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

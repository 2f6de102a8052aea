// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use foreman_bus::EventBus;
use foreman_model::{ContentBlock, Message, ModelClient, StopReason};
use foreman_tools::{is_error, ToolRegistry};

use crate::profile::{AgentHooks, AgentProfile, AgentResult, NoHooks};

/// Nudge sent when the model answers with text only instead of acting.
const NUDGE: &str =
    "Use a tool to take action. If you're done, call done(summary). If stuck, call stuck(reason).";

/// Drives one specialist agent: model call, tool dispatch, terminal
/// signals, fabricated-success guards, step budget.
///
/// The loop never retries the model itself — transient errors are the
/// model client's concern; a surfaced error becomes a stuck result so the
/// orchestrator's escalation machinery takes over.
pub struct AgentRunner {
    client: Arc<ModelClient>,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    kill: Arc<AtomicBool>,
    profile: AgentProfile,
    hooks: Box<dyn AgentHooks>,
}

impl AgentRunner {
    pub fn new(
        client: Arc<ModelClient>,
        registry: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        kill: Arc<AtomicBool>,
        profile: AgentProfile,
    ) -> Self {
        Self { client, registry, bus, kill, profile, hooks: Box::new(NoHooks) }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Run the agent on `task`. `context` is orchestrator-supplied
    /// guidance (retry hints, handoff blobs, memory summaries) appended to
    /// the opening user message.
    pub async fn run(&self, task: &str, context: Option<&str>) -> AgentResult {
        let agent = self.profile.name.as_str();
        self.bus.emit("agent_started", json!({ "agent": agent, "task": clip(task, 300) }));
        self.hooks.on_start(task);

        let mut user_content = format!("Complete this task:\n\n{task}");
        if let Some(ctx) = context {
            user_content.push_str(&format!("\n\n## Additional Context\n{ctx}"));
        }
        let mut messages = vec![Message::user(user_content)];

        // Guard counters spanning the whole run.
        let mut dispatches: u32 = 0;
        let mut dispatch_errors: u32 = 0;

        for step in 1..=self.profile.max_steps {
            if self.kill.load(Ordering::Relaxed) {
                self.bus.emit("agent_cancelled", json!({ "agent": agent, "step": step }));
                return AgentResult::stuck("cancelled".into(), step);
            }

            self.bus.emit("agent_step", json!({ "agent": agent, "step": step, "max_steps": self.profile.max_steps }));

            let response = match self
                .client
                .create(
                    &self.profile.model,
                    self.profile.max_tokens,
                    &self.profile.system_prompt,
                    &self.registry.advertised_specs(),
                    &messages,
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    // Provider-fatal (or retry-exhausted) error: surface as
                    // stuck so escalation decides what happens next.
                    warn!(agent, step, error = %e, "model call failed");
                    self.bus.emit("agent_stuck", json!({ "agent": agent, "reason": format!("model call failed: {e}") }));
                    return AgentResult::stuck(format!("model call failed: {e}"), step);
                }
            };

            let mut tool_results: Vec<ContentBlock> = Vec::new();
            let mut tools_this_step: u32 = 0;

            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.trim().is_empty() {
                            debug!(agent, step, text = %clip(text, 200), "agent commentary");
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        if name == "done" {
                            let summary = input
                                .get("summary")
                                .and_then(Value::as_str)
                                .unwrap_or("Done.")
                                .to_string();
                            match self.reject_done(dispatches, dispatch_errors) {
                                Some(rejection) => {
                                    warn!(agent, step, %rejection, "rejecting done claim");
                                    tool_results.push(ContentBlock::tool_result(id, rejection));
                                    continue;
                                }
                                None => {
                                    self.hooks.on_done(&summary);
                                    self.bus.emit("agent_done", json!({ "agent": agent, "summary": clip(&summary, 500), "steps": step }));
                                    return AgentResult::done(summary, step);
                                }
                            }
                        }
                        if name == "stuck" {
                            let reason = input
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("Unknown reason.")
                                .to_string();
                            self.hooks.on_stuck(&reason);
                            self.bus.emit("agent_stuck", json!({ "agent": agent, "reason": clip(&reason, 500), "steps": step }));
                            return AgentResult::stuck(reason, step);
                        }

                        tools_this_step += 1;
                        if let Some(cap) = self.profile.max_tools_per_step {
                            if tools_this_step > cap {
                                tool_results.push(ContentBlock::tool_result(
                                    id,
                                    format!(
                                        "SKIPPED: You sent too many actions at once. Do at most \
                                         {cap} action(s) per step, observe the result, then decide \
                                         the next action."
                                    ),
                                ));
                                continue;
                            }
                        }

                        let args = as_object(input);
                        let result = self.registry.dispatch(name, &args).await;
                        let result = truncate_result(&result, self.profile.tool_result_max_bytes);

                        dispatches += 1;
                        if is_error(&result) {
                            dispatch_errors += 1;
                        }
                        debug!(agent, step, tool = %name, result = %clip(&result, 200), "tool dispatched");
                        self.hooks.on_step(step, name, &result);
                        tool_results.push(ContentBlock::tool_result(id, result));
                    }
                    ContentBlock::ToolResult { .. } => {
                        // Models do not emit tool_result blocks; ignore.
                    }
                }
            }

            if step % self.profile.update_every == 0 {
                self.bus.emit(
                    "agent_progress",
                    json!({
                        "agent": agent,
                        "step": step,
                        "dispatches": dispatches,
                        "errors": dispatch_errors,
                    }),
                );
            }

            if tool_results.is_empty() {
                if response.stop_reason == StopReason::EndTurn {
                    // Text-only answer mid-task: push the turn and nudge.
                    messages.push(Message::assistant_blocks(response.content.clone()));
                    messages.push(Message::user(NUDGE));
                    continue;
                }
                // Tool-use stop with nothing dispatchable (e.g. every call
                // dropped); nudge as well rather than resending unchanged
                // history.
                messages.push(Message::assistant_blocks(response.content.clone()));
                messages.push(Message::user(NUDGE));
                continue;
            }

            messages.push(Message::assistant_blocks(response.content.clone()));
            messages.push(Message::tool_results(tool_results));
        }

        let reason = format!("Reached max {} steps", self.profile.max_steps);
        self.bus.emit("agent_stuck", json!({ "agent": agent, "reason": reason, "steps": self.profile.max_steps }));
        AgentResult::stuck(reason, self.profile.max_steps)
    }

    /// Fabricated-success guards. Returns the rejection text when `done`
    /// must not be honored yet.
    fn reject_done(&self, dispatches: u32, errors: u32) -> Option<String> {
        if dispatches >= 3 && errors * 2 >= dispatches {
            return Some(format!(
                "REJECTED: You cannot claim success — {errors} of {dispatches} actions returned \
                 errors. Re-examine the current state and try a different approach. If truly \
                 stuck, call 'stuck' instead."
            ));
        }
        if self.profile.guard_min_actions && dispatches < self.profile.min_actions {
            return Some(format!(
                "REJECTED: Only {dispatches} action(s) taken — too few to have completed this \
                 task. Verify the goal state with your tools before calling done."
            ));
        }
        None
    }
}

fn as_object(input: &Value) -> Map<String, Value> {
    input.as_object().cloned().unwrap_or_default()
}

/// Truncate a dispatch result at a char boundary, marking the cut.
pub(crate) fn truncate_result(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [output truncated]", &s[..end])
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

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use foreman_model::{ModelError, ResponseEvent, ScriptedProvider, ToolSpec};
    use foreman_tools::ToolHandler;
    use serde_json::json;

    use super::*;

    fn tool_call(id: &str, name: &str, args: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args.into(),
            },
            ResponseEvent::Done,
        ]
    }

    fn done_call(summary: &str) -> Vec<ResponseEvent> {
        tool_call("term", "done", &json!({ "summary": summary }).to_string())
    }

    fn stuck_call(reason: &str) -> Vec<ResponseEvent> {
        tool_call("term", "stuck", &json!({ "reason": reason }).to_string())
    }

    struct FixedHandler(&'static str);

    #[async_trait]
    impl ToolHandler for FixedHandler {
        async fn dispatch(&self, _name: &str, _input: &Map<String, Value>) -> String {
            self.0.to_string()
        }
    }

    fn registry_with(name: &str, reply: &'static str) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(
            ToolSpec::new(name, "test tool", json!({"type": "object", "properties": {}})),
            Arc::new(FixedHandler(reply)),
        );
        reg
    }

    fn runner(scripts: Vec<Vec<ResponseEvent>>, registry: ToolRegistry, profile: AgentProfile) -> (AgentRunner, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(100));
        let client = Arc::new(ModelClient::new(Box::new(ScriptedProvider::new(scripts)), 1));
        let r = AgentRunner::new(
            client,
            Arc::new(registry),
            Arc::clone(&bus),
            Arc::new(AtomicBool::new(false)),
            profile,
        );
        (r, bus)
    }

    fn profile() -> AgentProfile {
        let mut p = AgentProfile::new("coder", "Coder Agent");
        p.model = "test-model".into();
        p.max_steps = 6;
        p
    }

    #[tokio::test]
    async fn done_terminates_with_success() {
        let (r, bus) = runner(vec![done_call("wrote the file")], registry_with("noop", "ok"), profile());
        let result = r.run("write a file", None).await;
        assert!(result.success);
        assert!(!result.stuck);
        assert_eq!(result.content, "wrote the file");
        assert_eq!(result.steps, 1);
        let types: Vec<String> = bus.history().iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(types.first().map(String::as_str), Some("agent_started"));
        assert!(types.contains(&"agent_done".to_string()));
    }

    #[tokio::test]
    async fn stuck_terminates_with_reason() {
        let (r, bus) = runner(vec![stuck_call("button not found")], registry_with("noop", "ok"), profile());
        let result = r.run("click it", None).await;
        assert!(!result.success);
        assert!(result.stuck);
        assert_eq!(result.stuck_reason.as_deref(), Some("button not found"));
        assert!(bus.history().iter().any(|e| e.event_type == "agent_stuck"));
    }

    #[tokio::test]
    async fn tool_dispatch_then_done() {
        let scripts = vec![
            tool_call("c1", "probe", "{}"),
            done_call("finished after probing"),
        ];
        let (r, _bus) = runner(scripts, registry_with("probe", "probe output"), profile());
        let result = r.run("probe the thing", None).await;
        assert!(result.success);
        assert_eq!(result.steps, 2);
    }

    #[tokio::test]
    async fn text_only_turn_gets_nudged() {
        let scripts = vec![
            vec![ResponseEvent::TextDelta("I think I should...".into()), ResponseEvent::Done],
            done_call("ok done"),
        ];
        let (r, _bus) = runner(scripts, registry_with("noop", "ok"), profile());
        let result = r.run("do something", None).await;
        assert!(result.success, "loop must continue after a nudge: {result:?}");
        assert_eq!(result.steps, 2);
    }

    #[tokio::test]
    async fn step_budget_exhaustion_is_stuck_max_steps() {
        let mut p = profile();
        p.max_steps = 3;
        // Model keeps calling a tool forever.
        let scripts = (0..5).map(|i| tool_call(&format!("c{i}"), "probe", "{}")).collect();
        let (r, _bus) = runner(scripts, registry_with("probe", "ok"), p);
        let result = r.run("never finishes", None).await;
        assert!(result.stuck);
        assert!(result.stuck_reason.unwrap().contains("max 3 steps"));
        assert_eq!(result.steps, 3);
    }

    #[tokio::test]
    async fn error_ratio_guard_rejects_done() {
        let failing = registry_with("probe", "ERROR: it broke");
        let scripts = vec![
            tool_call("c1", "probe", "{}"),
            tool_call("c2", "probe", "{}"),
            tool_call("c3", "probe", "{}"),
            done_call("pretending it worked"),
            stuck_call("fine, actually stuck"),
        ];
        let (r, _bus) = runner(scripts, failing, profile());
        let result = r.run("doomed task", None).await;
        // done was rejected, so the run ends with the stuck call.
        assert!(result.stuck);
        assert_eq!(result.stuck_reason.as_deref(), Some("fine, actually stuck"));
    }

    #[tokio::test]
    async fn min_action_guard_rejects_early_done() {
        let mut p = profile();
        p.guard_min_actions = true;
        p.min_actions = 4;
        let scripts = vec![
            done_call("instant success claim"),
            stuck_call("could not actually do it"),
        ];
        let (r, _bus) = runner(scripts, registry_with("noop", "ok"), p);
        let result = r.run("fill out the signup form", None).await;
        assert!(result.stuck, "premature done must be rejected: {result:?}");
    }

    #[tokio::test]
    async fn min_action_guard_allows_done_after_enough_actions() {
        let mut p = profile();
        p.guard_min_actions = true;
        p.min_actions = 2;
        p.max_steps = 8;
        let scripts = vec![
            tool_call("c1", "probe", "{}"),
            tool_call("c2", "probe", "{}"),
            done_call("did the work"),
        ];
        let (r, _bus) = runner(scripts, registry_with("probe", "ok"), p);
        let result = r.run("task", None).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn tools_per_step_cap_skips_excess() {
        let mut p = profile();
        p.max_tools_per_step = Some(1);
        let scripts = vec![
            vec![
                ResponseEvent::ToolCallDelta { index: 0, id: "c1".into(), name: "probe".into(), arguments: "{}".into() },
                ResponseEvent::ToolCallDelta { index: 1, id: "c2".into(), name: "probe".into(), arguments: "{}".into() },
                ResponseEvent::Done,
            ],
            done_call("ok"),
        ];
        let (r, _bus) = runner(scripts, registry_with("probe", "ok"), p);
        let result = r.run("task", None).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancellation_flag_stops_the_loop() {
        let bus = Arc::new(EventBus::new(100));
        let kill = Arc::new(AtomicBool::new(true));
        let client = Arc::new(ModelClient::new(
            Box::new(ScriptedProvider::always_text("never used")),
            1,
        ));
        let r = AgentRunner::new(client, Arc::new(registry_with("noop", "ok")), Arc::clone(&bus), kill, profile());
        let result = r.run("task", None).await;
        assert!(result.stuck);
        assert_eq!(result.stuck_reason.as_deref(), Some("cancelled"));
        assert!(bus.history().iter().any(|e| e.event_type == "agent_cancelled"));
    }

    #[tokio::test]
    async fn model_error_surfaces_as_stuck() {
        let bus = Arc::new(EventBus::new(100));
        let client = Arc::new(ModelClient::new(
            Box::new(ScriptedProvider::always_fail(|| ModelError::Api {
                provider: "test",
                status: 401,
                body: "bad key".into(),
            })),
            1,
        ));
        let r = AgentRunner::new(
            client,
            Arc::new(registry_with("noop", "ok")),
            bus,
            Arc::new(AtomicBool::new(false)),
            profile(),
        );
        let result = r.run("task", None).await;
        assert!(result.stuck);
        assert!(result.stuck_reason.unwrap().contains("model call failed"));
    }

    #[tokio::test]
    async fn context_is_appended_to_opening_message() {
        let provider = ScriptedProvider::new(vec![done_call("ok")]);
        let bus = Arc::new(EventBus::new(10));
        // Keep a handle on last_request through the Arc'd provider.
        let provider = Arc::new(provider);
        struct Wrap(Arc<ScriptedProvider>);
        #[async_trait]
        impl foreman_model::Provider for Wrap {
            fn name(&self) -> &str {
                self.0.name()
            }
            async fn create(
                &self,
                req: foreman_model::CompletionRequest,
            ) -> Result<foreman_model::ModelResponse, ModelError> {
                self.0.create(req).await
            }
            async fn stream(
                &self,
                req: foreman_model::CompletionRequest,
            ) -> Result<foreman_model::EventStream, ModelError> {
                self.0.stream(req).await
            }
        }
        let client = Arc::new(ModelClient::new(Box::new(Wrap(Arc::clone(&provider))), 1));
        let r = AgentRunner::new(
            client,
            Arc::new(registry_with("noop", "ok")),
            bus,
            Arc::new(AtomicBool::new(false)),
            profile(),
        );
        r.run("the task", Some("guidance from a previous failure")).await;
        let seen = provider.last_request.lock().unwrap();
        let first = seen.as_ref().unwrap().messages[0].as_text().unwrap().to_string();
        assert!(first.contains("the task"));
        assert!(first.contains("guidance from a previous failure"));
    }

    #[test]
    fn truncate_result_marks_the_cut() {
        let long = "x".repeat(100);
        let out = truncate_result(&long, 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with("[output truncated]"));
        assert_eq!(truncate_result("short", 10), "short");
    }
}

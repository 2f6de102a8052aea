// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The orchestrator: owns the user conversation, classifies inbound
//! messages, deploys specialists, applies escalation, and narrates
//! everything onto the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use foreman_bus::EventBus;
use foreman_config::Config;
use foreman_core::{conversation::trim_history, AgentResult, AgentRunner};
use foreman_memory::{AgentMemory, MemoryStore};
use foreman_model::{ContentBlock, Message, ModelClient, ToolSpec};
use foreman_tools::{builtin::shell::DestructiveGate, builtin_registry, ToolRegistry};

use crate::{
    classifier::{classify, classify_with_model, schedule_waves, SubTask, TaskPlan},
    comms::AgentComms,
    escalation::{EscalationManager, Strategy},
    profiles::profile_for,
    prompts,
};

/// Outbound channel to the human. The runtime ships an implementation
/// that emits `user_message` events for the dashboard; messaging bridges
/// (chat apps, SMS) plug in here.
#[async_trait]
pub trait UserChannel: Send + Sync {
    async fn notify(&self, message: &str);

    /// Ask and wait for a reply. Channels without an inbound side return
    /// None after notifying.
    async fn ask(&self, message: &str) -> Option<String> {
        self.notify(message).await;
        None
    }
}

/// Default channel: every outbound message becomes a `user_message` event.
pub struct EventUserChannel {
    bus: Arc<EventBus>,
}

impl EventUserChannel {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl UserChannel for EventUserChannel {
    async fn notify(&self, message: &str) {
        self.bus.emit("user_message", json!({ "message": message }));
    }
}

/// Destructive-command gate backed by the user channel: the command runs
/// only on an explicit affirmative reply. No inbound channel means no
/// confirmation, which means no run.
struct ConfirmGate {
    channel: Arc<dyn UserChannel>,
}

#[async_trait]
impl DestructiveGate for ConfirmGate {
    async fn confirm(&self, command: &str) -> bool {
        let prompt = format!(
            "A destructive command is about to run:\n\n{command}\n\nReply YES to confirm or NO to cancel."
        );
        match self.channel.ask(&prompt).await {
            Some(reply) => reply.to_lowercase().contains("yes"),
            None => false,
        }
    }
}

/// Keywords that route a turn to the heavy model.
const COMPLEX_KEYWORDS: &[&str] = &[
    "plan", "architect", "design", "debug", "fix", "analyze", "refactor", "why", "explain",
    "complex", "build", "create project", "set up", "configure", "optimize", "review",
];

pub struct Orchestrator {
    config: RwLock<Config>,
    client: Arc<ModelClient>,
    bus: Arc<EventBus>,
    escalation: EscalationManager,
    comms: AgentComms,
    agent_memory: AgentMemory,
    memory: MemoryStore,
    user_channel: Arc<dyn UserChannel>,
    kill: Arc<AtomicBool>,
    default_registry: Arc<ToolRegistry>,
    /// Per-agent tool registries; agents without an entry use the default
    /// builtin set. External collaborators (a browser driver, a platform
    /// automation bridge) install theirs here.
    registries: RwLock<HashMap<String, Arc<ToolRegistry>>>,
    conversation: tokio::sync::Mutex<Vec<Message>>,
    task_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        client: Arc<ModelClient>,
        bus: Arc<EventBus>,
        agent_memory: AgentMemory,
        memory: MemoryStore,
        user_channel: Option<Arc<dyn UserChannel>>,
    ) -> Arc<Self> {
        let user_channel =
            user_channel.unwrap_or_else(|| Arc::new(EventUserChannel::new(Arc::clone(&bus))));
        let gate: Option<Arc<dyn DestructiveGate>> = if config.safety.confirm_destructive {
            Some(Arc::new(ConfirmGate { channel: Arc::clone(&user_channel) }))
        } else {
            None
        };
        Arc::new(Self {
            config: RwLock::new(config),
            client,
            bus,
            escalation: EscalationManager::default(),
            comms: AgentComms::new(),
            agent_memory,
            memory,
            user_channel,
            kill: Arc::new(AtomicBool::new(false)),
            default_registry: Arc::new(builtin_registry(gate)),
            registries: RwLock::new(HashMap::new()),
            conversation: tokio::sync::Mutex::new(Vec::new()),
            task_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Install a custom tool registry for one specialist.
    pub fn register_agent_tools(&self, agent: &str, registry: Arc<ToolRegistry>) {
        self.registries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.to_string(), registry);
    }

    /// The cooperative kill flag. Dashboard, tunnel, and signal handlers
    /// share this handle.
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill)
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn comms(&self) -> &AgentComms {
        &self.comms
    }

    pub fn config_snapshot(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Live-tune a config key (dashboard `update_config`).
    pub fn update_config(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        self.config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_by_path(key, value)?;
        self.bus.emit("config_updated", json!({ "key": key, "value": value }));
        Ok(())
    }

    /// Aggregate statistics for the dashboard.
    pub fn stats(&self) -> Value {
        json!({
            "agents": self.agent_memory.get_all_stats(),
            "failures": self.escalation.stats(),
            "failures_total": self.escalation.failure_count(),
        })
    }

    /// Drop the conversation history (explicit user directive).
    pub async fn reset_conversation(&self) {
        self.conversation.lock().await.clear();
        self.bus.emit("status_change", json!({ "status": "online", "label": "READY" }));
    }

    /// Process one top-level task end to end. Serialized by the task
    /// lock: a second task blocks here until the current one finishes.
    pub async fn process_task(&self, task: &str, source: &str) -> String {
        // Kill phrases act immediately, without waiting for the task lock:
        // the running task observes the flag at its next step boundary.
        let lowered = task.to_lowercase();
        let is_kill = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            config.safety.kill_words.iter().any(|kw| lowered.contains(&kw.to_lowercase()))
        };
        if is_kill {
            self.kill.store(true, Ordering::Relaxed);
            self.bus.emit("kill_switch", json!({ "source": source }));
            return "Kill switch activated.".to_string();
        }

        let _task_guard = self.task_lock.lock().await;
        // A kill aimed at the previous task must not poison this one.
        self.kill.store(false, Ordering::Relaxed);

        info!(task = %clip(task, 120), source, "processing task");
        self.bus.emit("task_received", json!({ "task": task, "source": source }));
        self.bus
            .emit("status_change", json!({ "status": "working", "label": "WORKING" }));

        let reply = self.run_classified(task).await;

        self.bus
            .emit("status_change", json!({ "status": "online", "label": "ONLINE" }));
        reply
    }

    async fn run_classified(&self, task: &str) -> String {
        let basic = classify(task);

        // Plain chat answers directly — no deployment, no model classifier.
        if basic.category == "chat" && !basic.needs_model {
            return self.think(task).await;
        }

        let plan: TaskPlan = if basic.needs_model || basic.category == "multi" {
            let model = self.config_snapshot().model.fast_model;
            classify_with_model(task, &self.client, &model).await
        } else {
            TaskPlan {
                category: basic.category.clone(),
                agents: basic.agents.clone(),
                sub_tasks: vec![SubTask { agent: basic.category.clone(), task: task.to_string() }],
                dependencies: HashMap::new(),
            }
        };
        self.bus.emit(
            "task_classified",
            json!({ "category": &plan.category, "agents": &plan.agents, "sub_tasks": plan.sub_tasks.len() }),
        );

        if plan.category == "chat" || plan.sub_tasks.is_empty() {
            return self.think(task).await;
        }

        // Execute the DAG in dependency waves; tasks inside one wave run
        // concurrently on their own workers.
        let mut outcomes: Vec<(SubTask, AgentResult)> = Vec::new();
        for wave in schedule_waves(&plan) {
            let jobs = wave.iter().map(|&i| {
                let sub = plan.sub_tasks[i].clone();
                async move {
                    let result = self.deploy_with_escalation(&sub.agent, &sub.task).await;
                    (sub, result)
                }
            });
            let mut wave_results = futures::future::join_all(jobs).await;
            let cancelled = wave_results
                .iter()
                .any(|(_, r)| r.stuck_reason.as_deref() == Some("cancelled"));
            outcomes.append(&mut wave_results);
            if cancelled {
                break;
            }
        }

        if outcomes.iter().all(|(_, r)| r.success) {
            // The escalation log only matters while a task is failing.
            self.escalation.clear_log();
        }

        // Let the model compose the user-facing summary from the raw
        // deployment outcomes.
        let mut report = String::from("[deployment report]\n");
        for (sub, result) in &outcomes {
            let status = if result.success { "completed" } else { "FAILED" };
            report.push_str(&format!(
                "- {} agent {} ({} steps): {}\n",
                sub.agent,
                status,
                result.steps,
                clip(&result.content, 300)
            ));
        }
        let message = format!(
            "{task}\n\n{report}\nSummarize the outcome for the user in a few sentences. \
             Be specific about what was and was not accomplished."
        );
        self.think(&message).await
    }

    /// Deploy one specialist, cycling through the escalation ladder until
    /// success, cancellation, or ask-user.
    pub async fn deploy_with_escalation(&self, agent: &str, task: &str) -> AgentResult {
        let mut current = agent.to_string();
        let mut guidance: Option<String> = None;
        let mut attempt: u32 = 1;

        loop {
            let config = self.config_snapshot();
            let Some(profile) = profile_for(&current, &config) else {
                return AgentResult::stuck(format!("unknown agent: {current}"), 0);
            };

            let registry = self
                .registries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&current)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.default_registry));

            // Assemble the deployment context: pending handoff, track
            // record, escalation guidance.
            let mut parts: Vec<String> = Vec::new();
            if let Some(handoff) = self.comms.take_handoff(&current) {
                parts.push(handoff);
            }
            let track_record = self.agent_memory.get_context(&current);
            if !track_record.is_empty() {
                parts.push(track_record);
            }
            if let Some(g) = &guidance {
                parts.push(g.clone());
            }
            let context = if parts.is_empty() { None } else { Some(parts.join("\n\n")) };

            self.bus.emit(
                "agent_deployed",
                json!({ "agent": &current, "task": clip(task, 200), "attempt": attempt }),
            );

            let runner = AgentRunner::new(
                Arc::clone(&self.client),
                registry,
                Arc::clone(&self.bus),
                Arc::clone(&self.kill),
                profile,
            );
            let result = runner.run(task, context.as_deref()).await;

            if result.success {
                self.agent_memory
                    .record_success(&current, task, &result.content, result.steps);
                return result;
            }
            if result.stuck_reason.as_deref() == Some("cancelled") {
                return result;
            }

            let reason = result.stuck_reason.clone().unwrap_or_else(|| "unknown".into());
            self.agent_memory.record_failure(&current, task, &reason, result.steps);

            let decision = self.escalation.handle_stuck(&current, task, &reason, attempt);
            self.bus.emit(
                "escalation",
                json!({
                    "strategy": decision.strategy,
                    "from_agent": &current,
                    "to_agent": &decision.agent,
                    "attempt": attempt,
                }),
            );

            match decision.strategy {
                Strategy::Retry | Strategy::Decompose => {
                    guidance = decision.guidance;
                }
                Strategy::Reroute => {
                    if let Some(alt) = decision.agent {
                        current = alt;
                    }
                    guidance = decision.guidance;
                }
                Strategy::AskUser => {
                    if let Some(msg) = decision.user_message {
                        self.user_channel.notify(&msg).await;
                    }
                    return result;
                }
            }
            attempt += 1;
        }
    }

    /// One conversational exchange with the orchestrator model: streaming
    /// inference, tool dispatch, repeat until a plain text answer.
    pub async fn think(&self, user_message: &str) -> String {
        let config = self.config_snapshot();
        let mut conversation = self.conversation.lock().await;
        conversation.push(Message::user(user_message));

        let model = self.choose_model(user_message, &config);
        let tools = brain_tool_specs();
        // The orchestrator gets a deeper budget than its specialists: its
        // turns are mostly cheap delegations.
        let max_rounds = config.agent.max_steps.saturating_mul(2).max(10);

        for _round in 0..max_rounds {
            if self.kill.load(Ordering::Relaxed) {
                self.bus.emit("kill_switch", json!({ "source": "brain" }));
                return "Cancelled.".to_string();
            }

            // Trim before every model call, never mid-turn: the helper
            // only cuts at plain user-turn boundaries.
            trim_history(&mut conversation, config.agent.history_limit);

            self.bus.emit("thinking_start", json!({ "model": &model }));
            let system = self.system_prompt(&config);
            let started = Instant::now();

            let streamed = self
                .client
                .stream(&model, config.model.max_tokens, &system, &tools, &conversation)
                .await;

            let response = match streamed {
                Ok(mut stream) => {
                    let mut stream_error = None;
                    loop {
                        match stream.next_delta().await {
                            Ok(Some(delta)) => {
                                self.bus
                                    .emit("thinking", json!({ "text": delta, "model": &model }));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                stream_error = Some(e);
                                break;
                            }
                        }
                    }
                    match stream_error {
                        None => stream.final_message(),
                        Some(e) => {
                            // Mid-stream failure: fall back to one
                            // non-streaming call before giving up.
                            warn!(error = %e, "stream failed; non-streaming fallback");
                            match self
                                .client
                                .create(&model, config.model.max_tokens, &system, &tools, &conversation)
                                .await
                            {
                                Ok(r) => r,
                                Err(e2) => return self.surface_error(e2),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream setup failed; non-streaming fallback");
                    match self
                        .client
                        .create(&model, config.model.max_tokens, &system, &tools, &conversation)
                        .await
                    {
                        Ok(r) => r,
                        Err(e2) => return self.surface_error(e2),
                    }
                }
            };

            self.bus.emit(
                "api_call",
                json!({
                    "model": &model,
                    "tokens_in": response.usage.input_tokens,
                    "tokens_out": response.usage.output_tokens,
                    "duration": started.elapsed().as_secs_f64(),
                }),
            );

            conversation.push(Message::assistant_blocks(response.content.clone()));

            if !response.has_tool_use() {
                let text = response.joined_text();
                self.bus
                    .emit("task_completed", json!({ "response": clip(&text, 300) }));
                return text;
            }

            let mut results: Vec<ContentBlock> = Vec::new();
            for block in &response.content {
                let ContentBlock::ToolUse { id, name, input } = block else {
                    continue;
                };
                self.bus.emit(
                    "tool_called",
                    json!({ "tool_name": name, "tool_input": input }),
                );
                let t0 = Instant::now();
                let (content, success) = self.dispatch_brain_tool(name, input).await;
                self.bus.emit(
                    "tool_result",
                    json!({
                        "tool_name": name,
                        "content": clip(&content, 500),
                        "success": success,
                        "duration": t0.elapsed().as_secs_f64(),
                    }),
                );
                results.push(ContentBlock::tool_result(id, content));
            }
            conversation.push(Message::tool_results(results));
        }

        self.bus.emit("error", json!({ "message": "orchestrator round budget exhausted" }));
        "I ran out of reasoning budget on this one. Partial work may have completed; ask me to continue.".to_string()
    }

    fn surface_error(&self, e: foreman_model::ModelError) -> String {
        self.bus.emit("error", json!({ "message": format!("model API error: {e}") }));
        format!("Model API error: {e}")
    }

    async fn dispatch_brain_tool(&self, name: &str, input: &Value) -> (String, bool) {
        let args: Map<String, Value> = input.as_object().cloned().unwrap_or_default();
        let str_arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("").to_string();

        match name {
            "deploy_agent" => {
                let agent = str_arg("agent");
                let task = str_arg("task");
                if agent.is_empty() || task.is_empty() {
                    return ("ERROR: deploy_agent requires 'agent' and 'task'".into(), false);
                }
                let result = self.deploy_with_escalation(&agent, &task).await;
                if result.success {
                    (format!("Agent {agent} completed in {} steps: {}", result.steps, result.content), true)
                } else {
                    (format!("Agent {agent} failed: {}", result.content), false)
                }
            }
            "send_message" => {
                let message = str_arg("message");
                self.user_channel.notify(&message).await;
                ("Message sent.".into(), true)
            }
            "save_memory" => {
                let out = self
                    .memory
                    .save(&str_arg("category"), &str_arg("key"), &str_arg("value"));
                let ok = !out.starts_with("ERROR:");
                self.memory.log_action("save_memory", input, &out, ok);
                (out, ok)
            }
            "recall_memory" => (self.memory.recall(&str_arg("query")), true),
            other => (format!("ERROR: unknown tool: {other}"), false),
        }
    }

    fn choose_model(&self, message: &str, config: &Config) -> String {
        let lower = message.to_lowercase();
        if COMPLEX_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            config.model.heavy_model.clone()
        } else {
            config.model.fast_model.clone()
        }
    }

    fn system_prompt(&self, _config: &Config) -> String {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".into());
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        prompts::orchestrator_prompt(
            &cwd,
            &now,
            &self.memory.context_summary(),
            &self.comms.summary(),
        )
    }
}

/// The orchestrator's own tool set: delegation, user messaging, memory.
fn brain_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "deploy_agent",
            "Hand a task to a specialist agent. The specialist runs autonomously and reports \
             back. Give it a DETAILED, self-contained task description: URLs, exact values, \
             file paths, and what done looks like.",
            json!({
                "type": "object",
                "properties": {
                    "agent": {
                        "type": "string",
                        "enum": ["browser", "coder", "system", "research", "file"],
                        "description": "Which specialist to deploy"
                    },
                    "task": { "type": "string", "description": "Detailed task description" }
                },
                "required": ["agent", "task"]
            }),
        ),
        ToolSpec::new(
            "send_message",
            "Send a short message to the user: progress, questions, results.",
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "The message to send" }
                },
                "required": ["message"]
            }),
        ),
        ToolSpec::new(
            "save_memory",
            "Save information to persistent memory for later recall.",
            json!({
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": ["preference", "project", "context", "note"],
                        "description": "Category of memory"
                    },
                    "key": { "type": "string", "description": "Short label" },
                    "value": { "type": "string", "description": "The information to remember" }
                },
                "required": ["category", "key", "value"]
            }),
        ),
        ToolSpec::new(
            "recall_memory",
            "Search persistent memory for relevant information.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to search for" }
                },
                "required": ["query"]
            }),
        ),
    ]
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

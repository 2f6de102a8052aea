// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Task classification: which specialist(s) should handle an inbound
//! message, and how multi-agent work decomposes.
//!
//! Rule-based scoring runs first (instant, deterministic, side-effect
//! free); the model is consulted only for ambiguous or multi-category
//! tasks, with a strict-JSON prompt.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use foreman_model::{Message, ModelClient};

pub const CATEGORIES: &[&str] = &["browser", "coder", "system", "research", "file", "chat"];

/// Rule-based result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    /// "browser" | "coder" | "system" | "research" | "file" | "multi" | "chat"
    pub category: String,
    pub agents: Vec<String>,
    pub confidence: f32,
    /// True when the rule scores are too weak or too contested and the
    /// model should confirm/decompose.
    pub needs_model: bool,
}

/// Model-refined result: category plus an ordered sub-task plan with a
/// dependency DAG (sub-task index → indices it depends on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub category: String,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub agent: String,
    pub task: String,
}

fn pattern_table() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static TABLE: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("classifier pattern is valid"))
                .collect()
        };
        vec![
            (
                "browser",
                compile(&[
                    r"sign\s*up",
                    r"log\s*in",
                    r"create\s+account",
                    r"fill\s+(out|in)\s+form",
                    r"go\s+to\s+\S+\.\S+",
                    r"open\s+\S+\.\S+",
                    r"visit\s+\S+\.\S+",
                    r"browse\s+to",
                    r"click\s+on",
                    r"navigate\s+to",
                    r"on\s+the\s+(website|page)",
                    r"web\s*page",
                    r"(gmail|facebook|twitter|instagram|linkedin)",
                    r"(amazon|ebay|youtube|reddit|github\.com)",
                    r"\.com\b",
                    r"\.org\b",
                    r"\.io\b",
                    r"order\s+(from|on)",
                    r"book\s+(a|an|the)",
                    r"check\s+my\s+(email|inbox)",
                    r"submit\s+form",
                    r"search\s+(for|on|google|the\s+web)",
                    r"(https?://|www\.)\S+",
                ]),
            ),
            (
                "coder",
                compile(&[
                    r"(write|create|build|make)\s+(a\s+)?(script|program|app|application|website|api|server|bot|tool|function|class|module|package|library)",
                    r"(fix|debug|solve|resolve)\s+(the\s+)?(bug|error|issue|problem|crash)",
                    r"(refactor|optimize|improve|clean\s*up)\s+(the\s+)?code",
                    r"(deploy|push|release|publish|ship)",
                    r"(install|setup|configure|init)\s+(the\s+)?(project|package|dependency|environment)",
                    r"(unit\s*test|integration\s*test)",
                    r"git\s+(commit|push|pull|branch|merge|rebase|clone)",
                    r"(add|create|implement)\s+(a\s+)?(feature|endpoint|route|component|page)",
                    r"(pip|npm|cargo|brew)\s+install",
                    r"(run|execute)\s+(the\s+)?(tests?|script|server|build)",
                    r"\.(py|js|ts|html|css|json|yaml|yml|rb|go|rs|cpp|c|java|swift)\b",
                    r"(python|javascript|typescript|node|react|rust|django|flask|express)",
                    r"(dockerfile|docker|kubernetes|ci/cd|pipeline)",
                ]),
            ),
            (
                "system",
                compile(&[
                    r"open\s+(spotify|finder|terminal|safari|chrome|mail|calendar|notes|music|photos|messages|settings|preferences)",
                    r"(play|pause|skip|volume)\s+(music|song|track|podcast)",
                    r"(take|capture)\s+(a\s+)?screenshot",
                    r"(change|set|adjust|modify)\s+(the\s+)?(brightness|volume|wallpaper|theme|display|resolution)",
                    r"(lock|sleep|restart|shutdown|reboot)\s+(the\s+)?(machine|computer|screen)",
                    r"(organize|clean|tidy)\s+(the\s+)?desktop",
                    r"(connect|disconnect|pair)\s+(to\s+)?(bluetooth|wifi|headphones)",
                    r"system\s+(preferences|settings)",
                    r"keyboard\s+shortcut",
                    r"(notification|dock|menubar)",
                ]),
            ),
            (
                "research",
                compile(&[
                    r"(find|search|look\s+up|research|investigate|discover)\s+(the\s+)?(best|top|latest|cheapest|fastest|most|info|information|details|facts|data)",
                    r"(what|who|when|where|why|how)\s+(is|are|was|were|do|does|did|can|could|would|should)",
                    r"(compare|comparison|vs|versus|difference|between)",
                    r"(review|reviews|rating|ratings)\s+(of|for)",
                    r"(recommend|recommendation|suggest|suggestion)",
                    r"(price|cost|pricing)\s+(of|for|comparison)",
                    r"(weather|forecast|temperature)",
                    r"(news|latest|update|updates)\s+(about|on|for)",
                    r"(learn|explain|teach|tell)\s+(me\s+)?(about|how)",
                    r"(summary|summarize|overview|breakdown)\s+(of|about)",
                    r"(pros?\s+and\s+cons?)",
                ]),
            ),
            (
                "file",
                compile(&[
                    r"(find|locate|search\s+for)\s+(all\s+)?\S*(files?|documents?|photos?|images?|videos?|pdfs?)",
                    r"(organize|sort|arrange|group|categorize)\s+(my\s+)?(files?|folder|downloads?|desktop|documents?)",
                    r"(clean|clear|empty|purge)\s+(up\s+)?(the\s+)?(downloads?|desktop|trash|temp|cache)",
                    r"(backup|archive|compress|zip|tar)\s+",
                    r"(extract|unzip|untar|decompress)\s+",
                    r"(move|copy|rename|duplicate)\s+(all\s+)?(files?|folder|directory)",
                    r"(delete|remove|trash)\s+(all\s+)?(old|unused|duplicate|temp|temporary)",
                    r"(how\s+much\s+space|disk\s+usage|storage)",
                    r"(list|show|display)\s+(all\s+)?(files?|contents?)\s+(in|of)",
                    r"\d+\s*(mb|gb|kb|tb)\b",
                    r"(larger|bigger|smaller|over|under)\s+than\s+\d+",
                ]),
            ),
            (
                "chat",
                compile(&[
                    r"^(hi|hello|hey|sup|yo|thanks|thank\s+you|good\s+(morning|afternoon|evening|night)|how\s+are\s+you|what'?s?\s+up)",
                    r"^(ok|okay|cool|nice|great|awesome|perfect|got\s+it|understood)",
                    r"^(yes|no|yeah|nah|sure|nope)$",
                ]),
            ),
        ]
    })
}

/// Rule-based classification. A pure function of the task string:
/// deterministic, no side effects.
pub fn classify(task: &str) -> Classification {
    let task_lower = task.to_lowercase();
    let task_lower = task_lower.trim();

    let mut scores: Vec<(&str, usize)> = pattern_table()
        .iter()
        .map(|(cat, patterns)| {
            let score: usize = patterns.iter().map(|p| p.find_iter(task_lower).count()).sum();
            (*cat, score)
        })
        .collect();
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    let (top_cat, top_score) = scores[0];
    let (_, second_score) = scores[1];

    // No matches at all: probably chat, but let the model confirm.
    if top_score == 0 {
        return Classification {
            category: "chat".into(),
            agents: vec![],
            confidence: 0.3,
            needs_model: true,
        };
    }

    if top_cat == "chat" {
        return Classification {
            category: "chat".into(),
            agents: vec![],
            confidence: 0.8,
            needs_model: false,
        };
    }

    // Single dominant category.
    if top_score >= 2 && second_score <= 1 {
        return Classification {
            category: top_cat.into(),
            agents: vec![top_cat.into()],
            confidence: (0.5 + top_score as f32 * 0.1).min(0.9),
            needs_model: false,
        };
    }

    // Several strong categories: multi-agent, model decomposes.
    if top_score >= 2 && second_score >= 2 {
        let agents: Vec<String> = scores
            .iter()
            .filter(|(cat, score)| *score >= 2 && *cat != "chat")
            .map(|(cat, _)| cat.to_string())
            .collect();
        return Classification {
            category: "multi".into(),
            agents,
            confidence: 0.6,
            needs_model: true,
        };
    }

    // Weak single match.
    Classification {
        category: top_cat.into(),
        agents: vec![top_cat.into()],
        confidence: 0.4 + top_score as f32 * 0.1,
        needs_model: top_score < 2,
    }
}

const CLASSIFIER_SYSTEM: &str =
    "You are a task classifier. Output valid JSON only. No markdown, no explanation.";

fn classifier_prompt(task: &str) -> String {
    format!(
        r#"Classify this user task for an agent system. Choose which specialist agent(s) should handle it.

Available agents:
- browser — Web browsing, forms, web apps, online accounts, ordering
- coder — Writing code, building projects, debugging, git, deploying, terminal commands
- system — Desktop control: opening apps, keyboard shortcuts, screenshots, settings
- research — Finding information, comparing products, answering questions
- file — File management: organizing, finding, backup, compress, clean up

Task: {task}

Respond in this exact JSON format:
{{"category": "<single_best_category>", "agents": ["<agent1>"], "sub_tasks": [{{"agent": "<agent>", "task": "<specific_sub_task>"}}], "dependencies": {{"0": [], "1": [0]}}}}

Rules:
- "category" is the primary category
- "agents" lists ALL agents needed (can be 1 or more)
- "sub_tasks" breaks the work into specific tasks for each agent
- "dependencies" maps sub_task index to indices it depends on (empty list = independent)
- Keep sub_tasks SPECIFIC and ACTIONABLE
- If it's just a greeting or simple chat, use {{"category": "chat", "agents": [], "sub_tasks": [], "dependencies": {{}}}}

JSON:"#
    )
}

/// Model-backed classification for ambiguous or multi-agent tasks.
/// Falls back to the rule-based result on any model or parse failure.
pub async fn classify_with_model(
    task: &str,
    client: &ModelClient,
    model: &str,
) -> TaskPlan {
    let result = client
        .create(model, 1024, CLASSIFIER_SYSTEM, &[], &[Message::user(classifier_prompt(task))])
        .await;

    let text = match result {
        Ok(resp) => resp.joined_text(),
        Err(e) => {
            warn!(error = %e, "model classification failed; using rule-based result");
            return fallback_plan(task);
        }
    };

    match parse_plan_json(&text) {
        Some(plan) => plan,
        None => {
            warn!(reply = %text.chars().take(200).collect::<String>(), "unparseable classification reply; using rule-based result");
            fallback_plan(task)
        }
    }
}

/// Parse the model's JSON reply, tolerating Markdown code fences and
/// defaulting any missing field. The dependency DAG is validated: edges
/// out of range or self-referencing are dropped.
pub fn parse_plan_json(text: &str) -> Option<TaskPlan> {
    let stripped = strip_code_fence(text.trim());
    let v: Value = serde_json::from_str(stripped).ok()?;
    let mut plan = TaskPlan {
        category: v["category"].as_str().unwrap_or("chat").to_string(),
        agents: serde_json::from_value(v["agents"].clone()).unwrap_or_default(),
        sub_tasks: serde_json::from_value(v["sub_tasks"].clone()).unwrap_or_default(),
        dependencies: serde_json::from_value(v["dependencies"].clone()).unwrap_or_default(),
    };

    let n = plan.sub_tasks.len();
    plan.dependencies.retain(|k, _| k.parse::<usize>().map(|i| i < n).unwrap_or(false));
    for (k, deps) in plan.dependencies.iter_mut() {
        let own: usize = k.parse().unwrap_or(usize::MAX);
        deps.retain(|d| *d < n && *d != own);
    }
    Some(plan)
}

fn fallback_plan(task: &str) -> TaskPlan {
    let basic = classify(task);
    let sub_tasks = if basic.agents.is_empty() {
        vec![]
    } else {
        vec![SubTask { agent: basic.category.clone(), task: task.to_string() }]
    };
    TaskPlan {
        category: basic.category,
        agents: basic.agents,
        sub_tasks,
        dependencies: HashMap::new(),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start();
    rest.rsplit_once("```").map(|(body, _)| body.trim()).unwrap_or(rest)
}

/// Order sub-tasks into dependency waves: every task in wave N depends
/// only on tasks in earlier waves. Cycles and dangling edges were dropped
/// at parse time; any remaining unresolvable tasks land in a final wave.
pub fn schedule_waves(plan: &TaskPlan) -> Vec<Vec<usize>> {
    let n = plan.sub_tasks.len();
    let deps_of = |i: usize| -> Vec<usize> {
        plan.dependencies.get(&i.to_string()).cloned().unwrap_or_default()
    };

    let mut placed = vec![false; n];
    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut remaining = n;

    while remaining > 0 {
        let mut wave: Vec<usize> = (0..n)
            .filter(|&i| !placed[i] && deps_of(i).iter().all(|&d| placed[d]))
            .collect();
        if wave.is_empty() {
            // Cycle leftovers: run them together rather than dropping work.
            wave = (0..n).filter(|&i| !placed[i]).collect();
        }
        for &i in &wave {
            placed[i] = true;
        }
        remaining -= wave.len();
        waves.push(wave);
    }
    waves
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_chat_without_model() {
        let c = classify("hi");
        assert_eq!(c.category, "chat");
        assert!(c.agents.is_empty());
        assert!(!c.needs_model);
    }

    #[test]
    fn browser_task_is_dominant_single_category() {
        let c = classify("go to gmail.com and sign up for a new account");
        assert_eq!(c.category, "browser");
        assert_eq!(c.agents, vec!["browser"]);
        assert!(!c.needs_model);
        assert!(c.confidence >= 0.5);
    }

    #[test]
    fn coder_task_is_detected() {
        let c = classify("write a script to parse the logs and fix the bug in main.py");
        assert_eq!(c.category, "coder");
    }

    #[test]
    fn unmatched_input_needs_model() {
        let c = classify("zzz qqq xyzzy");
        assert_eq!(c.category, "chat");
        assert!(c.needs_model);
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn mixed_task_is_multi_and_needs_model() {
        let c = classify(
            "research the best static site generators, then write a script to build \
             and deploy the site, then go to netlify.com and sign up",
        );
        assert_eq!(c.category, "multi");
        assert!(c.agents.len() >= 2, "agents: {:?}", c.agents);
        assert!(c.needs_model);
    }

    #[test]
    fn classify_is_deterministic() {
        let task = "organize my downloads folder and delete old files";
        let a = classify(task);
        let b = classify(task);
        assert_eq!(a, b);
    }

    #[test]
    fn confidence_is_capped() {
        let c = classify(
            "go to amazon.com, click on the sign up form, log in, navigate to orders, \
             visit ebay.com, browse to github.com",
        );
        assert!(c.confidence <= 0.9);
    }

    #[test]
    fn plan_json_parses_plain() {
        let text = r#"{"category": "coder", "agents": ["coder"], "sub_tasks": [{"agent": "coder", "task": "write it"}], "dependencies": {"0": []}}"#;
        let plan = parse_plan_json(text).unwrap();
        assert_eq!(plan.category, "coder");
        assert_eq!(plan.sub_tasks.len(), 1);
    }

    #[test]
    fn plan_json_strips_markdown_fence() {
        let text = "```json\n{\"category\": \"file\", \"agents\": [\"file\"], \"sub_tasks\": [], \"dependencies\": {}}\n```";
        let plan = parse_plan_json(text).unwrap();
        assert_eq!(plan.category, "file");
    }

    #[test]
    fn plan_json_defaults_missing_fields() {
        let plan = parse_plan_json(r#"{"category": "research"}"#).unwrap();
        assert!(plan.agents.is_empty());
        assert!(plan.sub_tasks.is_empty());
        assert!(plan.dependencies.is_empty());
    }

    #[test]
    fn plan_json_drops_out_of_range_dependencies() {
        let text = r#"{"category": "multi", "agents": ["coder"], "sub_tasks": [{"agent": "coder", "task": "a"}], "dependencies": {"0": [5], "9": [0]}}"#;
        let plan = parse_plan_json(text).unwrap();
        assert!(plan.dependencies.get("0").unwrap().is_empty());
        assert!(!plan.dependencies.contains_key("9"));
    }

    #[test]
    fn plan_json_garbage_is_none() {
        assert!(parse_plan_json("not json at all").is_none());
    }

    #[test]
    fn waves_respect_dependencies() {
        let text = r#"{"category": "multi", "agents": ["research", "coder", "browser"],
            "sub_tasks": [
                {"agent": "research", "task": "find the target"},
                {"agent": "coder", "task": "build it"},
                {"agent": "browser", "task": "publish it"}
            ],
            "dependencies": {"1": [0], "2": [1]}}"#;
        let plan = parse_plan_json(text).unwrap();
        let waves = schedule_waves(&plan);
        assert_eq!(waves, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn independent_tasks_share_a_wave() {
        let text = r#"{"category": "multi", "agents": ["file", "coder"],
            "sub_tasks": [
                {"agent": "file", "task": "a"},
                {"agent": "coder", "task": "b"},
                {"agent": "browser", "task": "c"}
            ],
            "dependencies": {"2": [0, 1]}}"#;
        let plan = parse_plan_json(text).unwrap();
        let waves = schedule_waves(&plan);
        assert_eq!(waves, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn dependency_cycle_still_schedules_everything() {
        let text = r#"{"category": "multi", "agents": ["coder"],
            "sub_tasks": [{"agent": "coder", "task": "a"}, {"agent": "coder", "task": "b"}],
            "dependencies": {"0": [1], "1": [0]}}"#;
        let plan = parse_plan_json(text).unwrap();
        let waves = schedule_waves(&plan);
        let total: usize = waves.iter().map(Vec::len).sum();
        assert_eq!(total, 2);
    }
}

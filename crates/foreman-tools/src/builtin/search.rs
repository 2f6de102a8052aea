// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use walkdir::WalkDir;

use foreman_model::ToolSpec;

use crate::handler::{err, require_str, ToolHandler};

/// Cap on reported matches so a broad pattern cannot flood the context.
const MAX_RESULTS: usize = 200;

#[derive(Default)]
pub struct SearchHandler;

pub fn search_files_spec() -> ToolSpec {
    ToolSpec::new(
        "search_files",
        "Search for files by name pattern (glob) or search file contents (grep). Returns \
         matching file paths and, for content searches, the matching lines.",
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Search pattern — filename glob (e.g. '*.rs') or text to grep for" },
                "directory": { "type": "string", "description": "Directory to search in (default: current dir)" },
                "content_search": { "type": "boolean", "description": "If true, search inside file contents (grep). If false, search filenames.", "default": false }
            },
            "required": ["pattern"]
        }),
    )
}

#[async_trait]
impl ToolHandler for SearchHandler {
    async fn dispatch(&self, _name: &str, input: &Map<String, Value>) -> String {
        let pattern = match require_str(input, "pattern") {
            Ok(p) => p.to_string(),
            Err(e) => return e,
        };
        let dir = input
            .get("directory")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();
        let content_search = input
            .get("content_search")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Filesystem walking is blocking work; keep it off the runtime's
        // core threads.
        let result = tokio::task::spawn_blocking(move || {
            if content_search {
                grep_contents(&dir, &pattern)
            } else {
                match_names(&dir, &pattern)
            }
        })
        .await;

        match result {
            Ok(Ok(lines)) if lines.is_empty() => "No matches found.".to_string(),
            Ok(Ok(lines)) => lines.join("\n"),
            Ok(Err(e)) => err(e),
            Err(e) => err(format_args!("search task panicked: {e}")),
        }
    }
}

/// Filename search: the pattern is a glob (`*.rs`) compiled to a regex
/// anchored on the file name.
fn match_names(dir: &str, pattern: &str) -> Result<Vec<String>, String> {
    let regex = glob_to_regex(pattern)?;
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if out.len() >= MAX_RESULTS {
            break;
        }
        let name = entry.file_name().to_string_lossy();
        if regex.is_match(&name) {
            out.push(entry.path().display().to_string());
        }
    }
    Ok(out)
}

/// Content search: plain-text substring match, line by line.
fn grep_contents(dir: &str, pattern: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if out.len() >= MAX_RESULTS {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue; // binary or unreadable
        };
        for (lineno, line) in content.lines().enumerate() {
            if line.contains(pattern) {
                out.push(format!("{}:{}: {}", entry.path().display(), lineno + 1, line.trim()));
                if out.len() >= MAX_RESULTS {
                    break;
                }
            }
        }
    }
    Ok(out)
}

fn glob_to_regex(glob: &str) -> Result<Regex, String> {
    let mut re = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| format!("bad pattern '{glob}': {e}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

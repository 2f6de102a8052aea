// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use walkdir::WalkDir;

use foreman_model::ToolSpec;

use crate::handler::{err, require_str, ToolHandler};

/// File-management handler. One handler serves the whole file tool
/// family; the name routes to the operation.
#[derive(Default)]
pub struct FsHandler;

pub fn read_file_spec() -> ToolSpec {
    ToolSpec::new(
        "read_file",
        "Read the full contents of a file. Use absolute paths.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute path to the file" }
            },
            "required": ["path"]
        }),
    )
}

pub fn write_file_spec() -> ToolSpec {
    ToolSpec::new(
        "write_file",
        "Write content to a file. Creates parent directories automatically. Overwrites if file exists.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute path to the file" },
                "content": { "type": "string", "description": "Full file content to write" }
            },
            "required": ["path", "content"]
        }),
    )
}

pub fn edit_file_spec() -> ToolSpec {
    ToolSpec::new(
        "edit_file",
        "Surgically edit a file by replacing an exact string with new content. Use read_file \
         first to see the current content. The old_string must match EXACTLY (whitespace, \
         indentation, everything) and must be unique in the file.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute path to the file" },
                "old_string": { "type": "string", "description": "Exact text to find and replace (must be unique in file)" },
                "new_string": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_string", "new_string"]
        }),
    )
}

pub fn list_dir_spec() -> ToolSpec {
    ToolSpec::new(
        "list_dir",
        "List contents of a directory with file sizes.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute path to directory" }
            },
            "required": ["path"]
        }),
    )
}

pub fn move_spec() -> ToolSpec {
    ToolSpec::new(
        "move",
        "Move or rename a file or directory.",
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source path" },
                "destination": { "type": "string", "description": "Destination path" }
            },
            "required": ["source", "destination"]
        }),
    )
}

pub fn copy_spec() -> ToolSpec {
    ToolSpec::new(
        "copy",
        "Copy a file.",
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source path" },
                "destination": { "type": "string", "description": "Destination path" }
            },
            "required": ["source", "destination"]
        }),
    )
}

pub fn delete_spec() -> ToolSpec {
    ToolSpec::new(
        "delete",
        "Delete a file or directory. Use carefully.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to delete" },
                "recursive": { "type": "boolean", "description": "Delete directory recursively", "default": false }
            },
            "required": ["path"]
        }),
    )
}

pub fn tree_spec() -> ToolSpec {
    ToolSpec::new(
        "tree",
        "Show directory tree structure with depth limit.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path" },
                "depth": { "type": "integer", "description": "Max depth (default 3)", "default": 3 }
            },
            "required": ["path"]
        }),
    )
}

pub fn disk_usage_spec() -> ToolSpec {
    ToolSpec::new(
        "disk_usage",
        "Get disk usage / size of a file or directory.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to check" }
            },
            "required": ["path"]
        }),
    )
}

#[async_trait]
impl ToolHandler for FsHandler {
    async fn dispatch(&self, name: &str, input: &Map<String, Value>) -> String {
        match name {
            "read_file" => self.read_file(input).await,
            "write_file" => self.write_file(input).await,
            "edit_file" => self.edit_file(input).await,
            "list_dir" => self.list_dir(input).await,
            "move" => self.rename(input).await,
            "copy" => self.copy(input).await,
            "delete" => self.delete(input).await,
            "tree" => self.tree(input),
            "disk_usage" => self.disk_usage(input),
            other => err(format_args!("fs handler cannot serve '{other}'")),
        }
    }
}

impl FsHandler {
    async fn read_file(&self, input: &Map<String, Value>) -> String {
        let path = match require_str(input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => err(format_args!("cannot read {path}: {e}")),
        }
    }

    async fn write_file(&self, input: &Map<String, Value>) -> String {
        let (path, content) = match (require_str(input, "path"), require_str(input, "content")) {
            (Ok(p), Ok(c)) => (p, c),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        if let Some(parent) = std::path::Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return err(format_args!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => format!("Wrote {} bytes to {path}", content.len()),
            Err(e) => err(format_args!("cannot write {path}: {e}")),
        }
    }

    async fn edit_file(&self, input: &Map<String, Value>) -> String {
        let (path, old, new) = match (
            require_str(input, "path"),
            require_str(input, "old_string"),
            require_str(input, "new_string"),
        ) {
            (Ok(p), Ok(o), Ok(n)) => (p, o, n),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return e,
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return err(format_args!("cannot read {path}: {e}")),
        };
        let count = content.matches(old).count();
        if count == 0 {
            return err(format_args!(
                "old_string not found in {path}. Use read_file to check the current contents."
            ));
        }
        if count > 1 {
            return err(format_args!(
                "old_string found {count} times in {path}. Provide more surrounding context to make it unique."
            ));
        }
        let updated = content.replacen(old, new, 1);
        match tokio::fs::write(path, updated).await {
            Ok(()) => format!("Edited {path}"),
            Err(e) => err(format_args!("failed writing {path}: {e}")),
        }
    }

    async fn list_dir(&self, input: &Map<String, Value>) -> String {
        let path = match require_str(input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let mut rd = match tokio::fs::read_dir(path).await {
            Ok(rd) => rd,
            Err(e) => return err(format_args!("cannot list {path}: {e}")),
        };
        let mut lines = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(md) if md.is_dir() => lines.push(format!("{name}/")),
                Ok(md) => lines.push(format!("{name}  ({} bytes)", md.len())),
                Err(_) => lines.push(name),
            }
        }
        lines.sort();
        if lines.is_empty() {
            format!("{path} is empty")
        } else {
            lines.join("\n")
        }
    }

    async fn rename(&self, input: &Map<String, Value>) -> String {
        let (src, dst) = match (require_str(input, "source"), require_str(input, "destination")) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        match tokio::fs::rename(src, dst).await {
            Ok(()) => format!("Moved {src} -> {dst}"),
            Err(e) => err(format_args!("cannot move {src}: {e}")),
        }
    }

    async fn copy(&self, input: &Map<String, Value>) -> String {
        let (src, dst) = match (require_str(input, "source"), require_str(input, "destination")) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        match tokio::fs::copy(src, dst).await {
            Ok(bytes) => format!("Copied {src} -> {dst} ({bytes} bytes)"),
            Err(e) => err(format_args!("cannot copy {src}: {e}")),
        }
    }

    async fn delete(&self, input: &Map<String, Value>) -> String {
        let path = match require_str(input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let recursive = input.get("recursive").and_then(Value::as_bool).unwrap_or(false);
        let md = match tokio::fs::metadata(path).await {
            Ok(md) => md,
            Err(e) => return err(format_args!("cannot stat {path}: {e}")),
        };
        let result = if md.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_dir(path).await
            }
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => format!("Deleted {path}"),
            Err(e) => err(format_args!("cannot delete {path}: {e}")),
        }
    }

    fn tree(&self, input: &Map<String, Value>) -> String {
        let path = match require_str(input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let depth = input.get("depth").and_then(Value::as_u64).unwrap_or(3) as usize;
        let mut lines = Vec::new();
        for entry in WalkDir::new(path).max_depth(depth).into_iter().flatten() {
            let indent = "  ".repeat(entry.depth());
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!("{indent}{name}{suffix}"));
        }
        if lines.is_empty() {
            err(format_args!("not a directory: {path}"))
        } else {
            lines.join("\n")
        }
    }

    fn disk_usage(&self, input: &Map<String, Value>) -> String {
        let path = match require_str(input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let total: u64 = WalkDir::new(path)
            .into_iter()
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|md| md.is_file())
            .map(|md| md.len())
            .sum();
        format!("{path}: {total} bytes ({:.2} MB)", total as f64 / 1_048_576.0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

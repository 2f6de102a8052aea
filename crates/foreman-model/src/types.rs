// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single tagged block inside a conversation turn.
///
/// The canonical shape mirrors the native messages wire format: assistant
/// turns may mix `Text` and `ToolUse` blocks; the user turn that answers a
/// tool-using assistant turn is a list of `ToolResult` blocks matched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Parsed JSON argument object.
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult { tool_use_id: tool_use_id.into(), content: content.into() }
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in a conversation. Tool results ride in a user turn as a list
/// of `ToolResult` blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: vec![ContentBlock::text(text)] }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: vec![ContentBlock::text(text)] }
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    /// The user turn answering an assistant tool-use turn: one `ToolResult`
    /// block per tool use, in dispatch order.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: results }
    }

    /// Plain text of this turn, if it is a single text block.
    pub fn as_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [ContentBlock::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Every `ToolUse` block in this turn, in order.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    /// True when this user turn is a list of tool results.
    pub fn is_tool_results(&self) -> bool {
        self.role == Role::User
            && !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

// ─── Tool specs ───────────────────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema-shaped object describing the argument object.
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self { name: name.into(), description: description.into(), input_schema }
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolUse,
    EndTurn,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Normalized model response — identical shape for both provider flavors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ModelResponse {
    /// Concatenated text of all `Text` blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Request sent to a provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<Message>,
}

/// A single streamed event out of a provider.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text chunk.
    TextDelta(String),
    /// A tool-call fragment. `index` routes accumulation when a provider
    /// interleaves several parallel calls; id/name arrive on the first
    /// fragment, argument JSON accumulates across fragments.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Final token counts.
    Usage { input_tokens: u32, output_tokens: u32 },
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_message_is_single_text_block() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn tool_results_turn_is_detected() {
        let m = Message::tool_results(vec![ContentBlock::tool_result("t1", "ok")]);
        assert!(m.is_tool_results());
        assert!(m.as_text().is_none());
    }

    #[test]
    fn mixed_user_turn_is_not_tool_results() {
        let m = Message {
            role: Role::User,
            content: vec![ContentBlock::text("hi"), ContentBlock::tool_result("t1", "ok")],
        };
        assert!(!m.is_tool_results());
    }

    #[test]
    fn tool_uses_iterates_in_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("thinking"),
            ContentBlock::tool_use("a", "first", json!({})),
            ContentBlock::tool_use("b", "second", json!({})),
        ]);
        let names: Vec<&str> = m.tool_uses().map(|(_, n, _)| n).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn content_block_serializes_with_type_tag() {
        let b = ContentBlock::tool_use("call_1", "goto", json!({"url": "https://x"}));
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["id"], "call_1");
        assert_eq!(v["name"], "goto");
        assert_eq!(v["input"]["url"], "https://x");
    }

    #[test]
    fn content_block_round_trips() {
        let blocks = vec![
            ContentBlock::text("a"),
            ContentBlock::tool_use("id", "n", json!({"k": 1})),
            ContentBlock::tool_result("id", "out"),
        ];
        for b in blocks {
            let json = serde_json::to_string(&b).unwrap();
            let back: ContentBlock = serde_json::from_str(&json).unwrap();
            assert_eq!(back, b);
        }
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(serde_json::to_value(StopReason::ToolUse).unwrap(), "tool_use");
        assert_eq!(serde_json::to_value(StopReason::EndTurn).unwrap(), "end_turn");
    }

    #[test]
    fn joined_text_skips_tool_blocks() {
        let r = ModelResponse {
            content: vec![
                ContentBlock::text("hello "),
                ContentBlock::tool_use("i", "t", json!({})),
                ContentBlock::text("world"),
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        assert_eq!(r.joined_text(), "hello world");
        assert!(r.has_tool_use());
    }
}

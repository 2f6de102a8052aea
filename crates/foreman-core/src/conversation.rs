// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use foreman_model::Message;

/// Trim `messages` to at most `limit` trailing turns, then slide the cut
/// forward to a safe boundary: the suffix must start with a plain user
/// turn. Starting inside a tool-use/tool-result group would leave orphaned
/// result blocks whose matching tool-use ids were trimmed away, which
/// providers reject.
pub fn trim_history(messages: &mut Vec<Message>, limit: usize) {
    if messages.len() <= limit {
        return;
    }
    let mut start = messages.len() - limit;
    while start < messages.len() {
        let m = &messages[start];
        if m.role == foreman_model::Role::User && !m.is_tool_results() {
            break;
        }
        start += 1;
    }
    messages.drain(..start);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    client::CompletionStream,
    error::ModelError,
    provider::{EventStream, Provider},
    CompletionRequest, ModelResponse, ResponseEvent,
};

/// One scripted provider turn: either a sequence of stream events or an
/// error to surface.
pub enum ScriptedOutcome {
    Events(Vec<ResponseEvent>),
    Fail(ModelError),
}

/// Pre-scripted provider for tests. Each `create`/`stream` call pops the
/// next outcome from the front of the queue, so tests can specify exact
/// event sequences — including tool calls and errors — without network
/// access.
pub struct ScriptedProvider {
    outcomes: Mutex<Vec<ScriptedOutcome>>,
    fail_forever: Option<fn() -> ModelError>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn with_outcomes(outcomes: Vec<ScriptedOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            fail_forever: None,
            last_request: Mutex::new(None),
        }
    }

    /// Scripts of stream events only; the outer Vec is the ordered list of
    /// calls, the inner Vec the events for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self::with_outcomes(scripts.into_iter().map(ScriptedOutcome::Events).collect())
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage { input_tokens: 5, output_tokens: 5 },
            ResponseEvent::Done,
        ]])
    }

    /// Provider that emits a tool call on the first turn and a text reply
    /// on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }

    /// First call fails with `err`; the next call returns `text`.
    pub fn fail_then_text(err: ModelError, text: impl Into<String>) -> Self {
        Self::with_outcomes(vec![
            ScriptedOutcome::Fail(err),
            ScriptedOutcome::Events(vec![
                ResponseEvent::TextDelta(text.into()),
                ResponseEvent::Done,
            ]),
        ])
    }

    /// Every call fails with a freshly built error.
    pub fn always_fail(make: fn() -> ModelError) -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
            fail_forever: Some(make),
            last_request: Mutex::new(None),
        }
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        if let Some(make) = self.fail_forever {
            return ScriptedOutcome::Fail(make());
        }
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            ScriptedOutcome::Events(vec![
                ResponseEvent::TextDelta("[no more scripts]".into()),
                ResponseEvent::Done,
            ])
        } else {
            outcomes.remove(0)
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn create(&self, req: CompletionRequest) -> Result<ModelResponse, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        match self.next_outcome() {
            ScriptedOutcome::Fail(e) => Err(e),
            ScriptedOutcome::Events(events) => {
                // Reuse the streaming accumulator so create/stream agree on
                // assembly semantics.
                let wrapped: Vec<Result<ResponseEvent, ModelError>> =
                    events.into_iter().map(Ok).collect();
                let mut s = CompletionStream::new(Box::pin(stream::iter(wrapped)));
                while s.next_delta().await?.is_some() {}
                Ok(s.final_message())
            }
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        match self.next_outcome() {
            ScriptedOutcome::Fail(e) => Err(e),
            ScriptedOutcome::Events(events) => {
                let wrapped: Vec<Result<ResponseEvent, ModelError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

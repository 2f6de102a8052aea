// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{error::ModelError, CompletionRequest, ModelResponse, ResponseEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

/// One model API flavor. Two implementations exist: the native messages
/// API and the OpenAI-compatible function-calling API. Both normalize to
/// the same [`ModelResponse`] / [`ResponseEvent`] shapes so callers never
/// care which is behind the scenes.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id for logs and error messages.
    fn name(&self) -> &str;

    /// Non-streaming completion.
    async fn create(&self, req: CompletionRequest) -> Result<ModelResponse, ModelError>;

    /// Streaming completion. Yields events until `Done`.
    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError>;
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod anthropic;
mod client;
mod error;
mod mock;
mod openai_compat;
mod provider;
pub mod recovery;
mod types;

pub use anthropic::AnthropicProvider;
pub use client::{CompletionStream, ModelClient};
pub use error::ModelError;
pub use mock::{ScriptedOutcome, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{EventStream, Provider};
pub use types::*;

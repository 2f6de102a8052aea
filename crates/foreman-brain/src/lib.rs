// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod brain;
pub mod classifier;
mod comms;
mod escalation;
mod profiles;
pub mod prompts;

pub use brain::{EventUserChannel, Orchestrator, UserChannel};
pub use comms::{AgentComms, ScratchpadEntry};
pub use escalation::{
    default_reroute_map, EscalationDecision, EscalationManager, FailureRecord, Strategy,
};
pub use profiles::{profile_for, SPECIALISTS};

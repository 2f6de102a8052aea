// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod commands;
mod dashboard;
mod tunnel;

pub use commands::{handle_command, DashboardCommand};
pub use dashboard::run_dashboard;
pub use tunnel::Tunnel;

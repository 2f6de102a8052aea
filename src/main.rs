// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use foreman_brain::Orchestrator;
use foreman_bus::EventBus;
use foreman_memory::{AgentMemory, MemoryStore};
use foreman_model::ModelClient;
use foreman_node::{run_dashboard, Tunnel};
use foreman_relay::RelayOptions;

/// How long the idle loop waits between "still waiting" traces.
const IDLE_TRACE_SECS: u64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Relay => {
                return foreman_relay::run(RelayOptions::from_env()).await;
            }
            Commands::ShowConfig => {
                let config = foreman_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
        }
    }

    run_runtime(cli).await
}

async fn run_runtime(cli: Cli) -> anyhow::Result<()> {
    let config = foreman_config::load(cli.config.as_deref())?;

    let bus = Arc::new(EventBus::new(config.events.event_history));
    let client = Arc::new(ModelClient::from_config(&config).context("building model client")?);
    let agent_memory =
        AgentMemory::new(&config.memory.dir).context("opening agent outcome log")?;
    let memory = MemoryStore::new(&config.memory.dir).context("opening memory store")?;

    info!(provider = %client.provider_name(), "model client ready");

    let dashboard_cfg = config.dashboard.clone();
    let relay_cfg = config.relay.clone();
    let brain = Orchestrator::new(
        config,
        client,
        Arc::clone(&bus),
        agent_memory,
        memory,
        None,
    );

    // Local dashboard: static UI + telemetry/command WebSocket.
    {
        let brain = Arc::clone(&brain);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            if let Err(e) = run_dashboard(brain, bus, dashboard_cfg).await {
                warn!(error = %e, "dashboard server exited");
            }
        });
    }

    // Reverse tunnel to the public relay, when configured.
    if !relay_cfg.url.is_empty() {
        let tunnel = Tunnel::new(
            Arc::clone(&brain),
            Arc::clone(&bus),
            relay_cfg.url.clone(),
            relay_cfg.token.clone(),
        );
        tokio::spawn(tunnel.run());
        info!(relay = %relay_cfg.url, "tunnel starting");
    }

    // OS signals flip the same cooperative kill flag the dashboard uses;
    // a second Ctrl-C exits.
    {
        let kill = brain.kill_flag();
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut hits = 0u32;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                hits += 1;
                if hits == 1 {
                    info!("kill signal received; cancelling current work (Ctrl-C again to exit)");
                    kill.store(true, Ordering::Relaxed);
                    bus.emit("kill_switch", serde_json::json!({ "source": "signal" }));
                } else {
                    info!("shutting down");
                    std::process::exit(0);
                }
            }
        });
    }

    bus.emit(
        "status_change",
        serde_json::json!({ "status": "online", "label": "ONLINE" }),
    );
    info!("foreman online");

    if let Some(task) = &cli.task {
        let reply = brain.process_task(task, "cli").await;
        println!("{reply}");
    }

    // Tasks now arrive via the dashboard WebSocket or the relay tunnel;
    // this loop only keeps the process alive and leaves a trace while idle.
    loop {
        tokio::time::sleep(Duration::from_secs(IDLE_TRACE_SECS)).await;
        info!("still waiting for tasks");
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

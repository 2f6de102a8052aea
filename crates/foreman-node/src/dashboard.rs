// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local dashboard: static UI over HTTP on port P, telemetry + commands
//! over WebSocket on port P+1.
//!
//! On connect the WebSocket handler replays the bus history snapshot,
//! then bridges live events out and typed JSON commands in. Authentication
//! is deliberately absent here — the listeners are local; remote access
//! goes through the relay's token path.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderValue},
    response::Response,
    routing::get,
    Router,
};
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer};
use tracing::{debug, info, warn};

use foreman_brain::Orchestrator;
use foreman_bus::EventBus;
use foreman_config::DashboardConfig;

use crate::commands::{error_frame, handle_command, DashboardCommand};

#[derive(Clone)]
struct WsState {
    brain: Arc<Orchestrator>,
    bus: Arc<EventBus>,
}

/// Serve both listeners until the process exits.
pub async fn run_dashboard(
    brain: Arc<Orchestrator>,
    bus: Arc<EventBus>,
    config: DashboardConfig,
) -> anyhow::Result<()> {
    let http = serve_static(config.http_port, config.static_dir.clone());
    let ws = serve_ws(config.http_port + 1, brain, bus);
    tokio::try_join!(http, ws)?;
    Ok(())
}

/// Static UI files with no-cache headers so a rebuilt dashboard is picked
/// up on refresh.
async fn serve_static(port: u16, static_dir: String) -> anyhow::Result<()> {
    let app = Router::new()
        .fallback_service(ServeDir::new(&static_dir).append_index_html_on_directories(true))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, dir = %static_dir, "dashboard HTTP listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_ws(port: u16, brain: Arc<Orchestrator>, bus: Arc<EventBus>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(WsState { brain, bus });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard WebSocket listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    info!("dashboard client connected");

    // Replay history before subscribing so the client starts complete;
    // events emitted between snapshot and subscribe are a gap the next
    // reconnect covers (same contract as the original runtime).
    let mut events = state.bus.subscribe_stream();
    for event in state.bus.history() {
        if let Ok(json) = serde_json::to_string(&event) {
            if socket.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DashboardCommand>(&text) {
                            Ok(cmd) => {
                                debug!(?cmd, "dashboard command");
                                if let Some(reply) = handle_command(&state.brain, cmd).await {
                                    if socket.send(Message::Text(reply)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "invalid dashboard command");
                                let frame = error_frame(&format!("invalid command JSON: {e}"));
                                if socket.send(Message::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(error = %e, "dashboard socket recv error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(ev) => {
                        if let Ok(json) = serde_json::to_string(&ev) {
                            if socket.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!("dashboard client disconnected");
}

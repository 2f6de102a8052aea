// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reverse tunnel: a persistent outbound WebSocket to the remote relay.
//!
//! Every bus event is forwarded as a JSON frame; frames coming back are
//! dashboard commands relayed from remote browsers and take the same
//! command path as the local WebSocket server. The connection reconnects
//! forever with exponential backoff (1 s → 30 s cap) and a 15 s ping
//! keepalive.
//!
//! Backpressure: the tunnel's bus subscription is a bounded queue; events
//! emitted while the relay is unreachable or slow are dropped at the
//! bound, silently — telemetry is lossy by design, commands are not.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use foreman_brain::Orchestrator;
use foreman_bus::EventBus;

use crate::commands::{handle_command, DashboardCommand};

/// Queue depth for the tunnel's bus subscription.
const EVENT_QUEUE_DEPTH: usize = 512;

const RECONNECT_BASE_SECS: u64 = 1;
const RECONNECT_CAP_SECS: u64 = 30;
const PING_INTERVAL_SECS: u64 = 15;

pub struct Tunnel {
    brain: Arc<Orchestrator>,
    bus: Arc<EventBus>,
    relay_url: String,
    token: String,
}

impl Tunnel {
    pub fn new(
        brain: Arc<Orchestrator>,
        bus: Arc<EventBus>,
        relay_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self { brain, bus, relay_url: relay_url.into(), token: token.into() }
    }

    /// Maintain the tunnel forever.
    pub async fn run(self) {
        let mut delay = RECONNECT_BASE_SECS;
        loop {
            match self.run_connection(&mut delay).await {
                Ok(()) => info!("tunnel closed by relay; reconnecting"),
                Err(e) => warn!(error = %e, "tunnel error"),
            }
            debug!(delay, "tunnel reconnecting");
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = next_delay(delay);
        }
    }

    async fn run_connection(&self, delay: &mut u64) -> anyhow::Result<()> {
        let url = format!("{}?token={}", self.relay_url, self.token);
        info!(relay = %self.relay_url, "connecting to relay");
        let (ws, _) = connect_async(url.as_str()).await?;
        info!("tunnel established");
        *delay = RECONNECT_BASE_SECS;

        let (mut sink, mut stream) = ws.split();
        let mut events = self.bus.subscribe_stream_with_depth(EVENT_QUEUE_DEPTH);
        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    sink.send(WsMessage::Ping(Vec::new())).await?;
                }
                event = events.recv() => {
                    match event {
                        Some(ev) => {
                            let frame = serde_json::to_string(&ev)?;
                            sink.send(WsMessage::Text(frame)).await?;
                        }
                        None => anyhow::bail!("event bus closed"),
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(reply) = self.handle_frame(&text).await {
                                sink.send(WsMessage::Text(reply)).await?;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sink.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {} // binary / pong frames ignored
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Commands arriving through the tunnel take the same path as local
    /// dashboard commands; replies travel back through the tunnel so the
    /// relay can forward them to the asking browser.
    async fn handle_frame(&self, text: &str) -> Option<String> {
        if text == "pong" {
            return None;
        }
        match serde_json::from_str::<DashboardCommand>(text) {
            Ok(cmd) => {
                debug!(?cmd, "command via tunnel");
                handle_command(&self.brain, cmd).await
            }
            Err(e) => {
                debug!(error = %e, "ignoring unparseable tunnel frame");
                None
            }
        }
    }
}

fn next_delay(delay: u64) -> u64 {
    (delay * 2).min(RECONNECT_CAP_SECS)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use foreman_config::Config;
    use foreman_memory::{AgentMemory, MemoryStore};
    use foreman_model::{ModelClient, ScriptedProvider};
    use std::sync::atomic::Ordering;

    use super::*;

    fn tunnel() -> (Tunnel, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(50));
        let client = Arc::new(ModelClient::new(Box::new(ScriptedProvider::new(vec![])), 1));
        let brain = Orchestrator::new(
            Config::default(),
            client,
            Arc::clone(&bus),
            AgentMemory::new(dir.path().join("m")).unwrap(),
            MemoryStore::new(dir.path().join("s")).unwrap(),
            None,
        );
        (Tunnel::new(brain, Arc::clone(&bus), "ws://localhost:1/tunnel", "secret"), bus, dir)
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut d = RECONNECT_BASE_SECS;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(d);
            d = next_delay(d);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn pong_frames_are_ignored() {
        let (t, _bus, _dir) = tunnel();
        assert!(t.handle_frame("pong").await.is_none());
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let (t, _bus, _dir) = tunnel();
        assert!(t.handle_frame("{{{not json").await.is_none());
    }

    #[tokio::test]
    async fn kill_frame_sets_flag_and_emits() {
        let (t, bus, _dir) = tunnel();
        assert!(t.handle_frame(r#"{"type": "kill"}"#).await.is_none());
        assert!(t.brain.kill_flag().load(Ordering::Relaxed));
        assert!(bus.history().iter().any(|e| e.event_type == "kill_switch"));
    }

    #[tokio::test]
    async fn get_stats_frame_gets_a_reply() {
        let (t, _bus, _dir) = tunnel();
        let reply = t.handle_frame(r#"{"type": "get_stats"}"#).await.unwrap();
        assert!(reply.contains("stats"));
    }

    #[tokio::test]
    async fn send_task_frame_emits_task_received() {
        let (t, bus, _dir) = tunnel();
        // ScriptedProvider has no scripts; the spawned task will answer
        // with the fallback text. We only care about the emitted event.
        t.handle_frame(r#"{"type": "send_task", "task": "hi"}"#).await;
        // Give the spawned task a moment to start.
        for _ in 0..50 {
            if bus.history().iter().any(|e| e.event_type == "task_received") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task_received was never emitted");
    }
}

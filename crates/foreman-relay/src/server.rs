// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The remote relay: one agent tunnel in, N browser dashboards out.
//!
//! Frames from `/tunnel` are appended to a bounded history ring and
//! broadcast to every dashboard; frames from `/ws` are forwarded to the
//! tunnel (or answered with an error event when no agent is connected).
//! Dashboards authenticate with a short-lived HMAC token minted from a
//! passphrase; the tunnel presents the long-lived shared secret. Both are
//! query tokens, both failures close with code 4001.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use crate::jwt;

/// Close code for authentication failures, shared by both socket routes.
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Per-dashboard outbound queue depth. A slow browser loses events at
/// the bound rather than stalling the tunnel fan-out.
const DASHBOARD_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub port: u16,
    /// Shared secret presented by the agent tunnel.
    pub token: String,
    /// Passphrase exchanged for a dashboard token.
    pub passphrase: String,
    /// HMAC secret for dashboard tokens. Defaults to `token + "-jwt"`.
    pub jwt_secret: String,
    /// Built dashboard assets; served as an SPA when present.
    pub static_dir: String,
    /// Bounded event-history ring size.
    pub history: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        let token = "foreman-default-token-change-me".to_string();
        Self {
            port: 8420,
            jwt_secret: format!("{token}-jwt"),
            token,
            passphrase: "interstellar".into(),
            static_dir: "relay/static".into(),
            history: 200,
        }
    }
}

impl RelayOptions {
    /// Environment-driven configuration for containerized deployments.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(t) = std::env::var("FOREMAN_RELAY_TOKEN") {
            opts.jwt_secret = format!("{t}-jwt");
            opts.token = t;
        }
        if let Ok(p) = std::env::var("FOREMAN_PASSPHRASE") {
            opts.passphrase = p;
        }
        if let Ok(s) = std::env::var("FOREMAN_JWT_SECRET") {
            opts.jwt_secret = s;
        }
        if let Ok(p) = std::env::var("PORT") {
            if let Ok(port) = p.parse() {
                opts.port = port;
            }
        }
        opts
    }
}

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

struct RelayState {
    tunnel: Option<mpsc::Sender<String>>,
    dashboards: Vec<mpsc::Sender<String>>,
    history: VecDeque<Value>,
}

#[derive(Clone)]
struct AppState {
    opts: Arc<RelayOptions>,
    state: Arc<Mutex<RelayState>>,
    limiter: Arc<IpLimiter>,
    started: Arc<Instant>,
}

impl AppState {
    fn new(opts: RelayOptions) -> Self {
        // Rate limiting applies to failed passphrase attempts only:
        // 5 per minute with a burst of 2, loopback exempt.
        let quota = Quota::per_minute(NonZeroU32::new(5).expect("nonzero"))
            .allow_burst(NonZeroU32::new(2).expect("nonzero"));
        Self {
            opts: Arc::new(opts),
            state: Arc::new(Mutex::new(RelayState {
                tunnel: None,
                dashboards: Vec::new(),
                history: VecDeque::new(),
            })),
            limiter: Arc::new(RateLimiter::keyed(quota)),
            started: Arc::new(Instant::now()),
        }
    }

    fn add_event(&self, event: Value) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let cap = self.opts.history;
        if s.history.len() == cap {
            s.history.pop_front();
        }
        s.history.push_back(event);
    }

    /// Send to every dashboard; dead or saturated clients are pruned.
    fn broadcast(&self, frame: &str) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.dashboards
            .retain(|tx| tx.try_send(frame.to_string()).is_ok());
    }

    fn send_to_tunnel(&self, frame: &str) -> bool {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &s.tunnel {
            Some(tx) => {
                if tx.try_send(frame.to_string()).is_ok() {
                    true
                } else {
                    s.tunnel = None;
                    false
                }
            }
            None => false,
        }
    }

    fn tunnel_connected(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).tunnel.is_some()
    }
}

/// Run the relay until the process exits.
pub async fn run(opts: RelayOptions) -> anyhow::Result<()> {
    let port = opts.port;
    let static_dir = opts.static_dir.clone();
    let app_state = AppState::new(opts);

    let mut app = Router::new()
        .route("/api/auth", post(auth))
        .route("/api/health", get(health))
        .route("/ws", get(dashboard_ws))
        .route("/tunnel", get(tunnel_ws));

    let index = std::path::Path::new(&static_dir).join("index.html");
    if index.is_file() {
        // SPA fallback: unknown paths render the dashboard shell.
        app = app.fallback_service(ServeDir::new(&static_dir).fallback(ServeFile::new(index)));
    } else {
        app = app.route("/", get(no_dashboard));
    }

    let app = app.with_state(app_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "relay listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

// ── HTTP endpoints ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AuthBody {
    #[serde(default)]
    passphrase: String,
}

async fn auth(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<AuthBody>,
) -> Response {
    let ok: bool = body
        .passphrase
        .as_bytes()
        .ct_eq(app.opts.passphrase.as_bytes())
        .into();
    if ok {
        let token = jwt::create_token(&app.opts.jwt_secret, "dashboard", 24);
        return Json(json!({ "token": token })).into_response();
    }

    let ip = addr.ip();
    if !is_loopback(ip) && app.limiter.check_key(&ip).is_err() {
        warn!(%ip, "auth rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }
    warn!(%ip, "invalid passphrase");
    (StatusCode::UNAUTHORIZED, "Invalid passphrase").into_response()
}

async fn health(State(app): State<AppState>) -> Json<Value> {
    let (clients, buffered) = {
        let s = app.state.lock().unwrap_or_else(|e| e.into_inner());
        (s.dashboards.len(), s.history.len())
    };
    Json(json!({
        "status": "ok",
        "tunnel_connected": app.tunnel_connected(),
        "dashboard_clients": clients,
        "events_buffered": buffered,
        "uptime": app.started.elapsed().as_secs(),
    }))
}

async fn no_dashboard(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "relay running",
        "dashboard": "no static assets found",
        "tunnel_connected": app.tunnel_connected(),
    }))
}

// ── WebSocket routes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: String,
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "Unauthorized".into(),
        })))
        .await;
}

fn tunnel_status_event(connected: bool) -> Value {
    json!({
        "type": "tunnel_status",
        "ts": chrono::Utc::now(),
        "data": { "connected": connected },
    })
}

async fn dashboard_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(app): State<AppState>,
) -> Response {
    let authorized = jwt::verify_token(&app.opts.jwt_secret, &query.token).is_some();
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            close_unauthorized(socket).await;
            return;
        }
        handle_dashboard(socket, app).await;
    })
}

async fn handle_dashboard(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Register the outbound queue and snapshot history under one lock so
    // two dashboards connecting at the same instant each get the full
    // history exactly once.
    let (tx, mut rx) = mpsc::channel::<String>(DASHBOARD_QUEUE);
    let replay: Vec<Value> = {
        let mut s = app.state.lock().unwrap_or_else(|e| e.into_inner());
        s.dashboards.push(tx);
        s.history.iter().cloned().collect()
    };
    info!("dashboard connected");

    for event in replay {
        if sink.send(Message::Text(event.to_string())).await.is_err() {
            return;
        }
    }
    let status = tunnel_status_event(app.tunnel_connected());
    if sink.send(Message::Text(status.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            if sink.send(Message::Text("pong".into())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        // Commands go to the agent; without a tunnel the
                        // browser gets an error event back.
                        if !app.send_to_tunnel(&text) {
                            let err = json!({
                                "type": "error",
                                "ts": chrono::Utc::now(),
                                "data": { "message": "Agent not connected. Start the tunnel." },
                            });
                            if sink.send(Message::Text(err.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    info!("dashboard disconnected");
    // The dashboard's sender is pruned lazily on the next broadcast.
}

async fn tunnel_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(app): State<AppState>,
) -> Response {
    let authorized: bool = query
        .token
        .as_bytes()
        .ct_eq(app.opts.token.as_bytes())
        .into();
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            warn!("tunnel auth failed");
            close_unauthorized(socket).await;
            return;
        }
        handle_tunnel(socket, app).await;
    })
}

async fn handle_tunnel(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(DASHBOARD_QUEUE);
    {
        let mut s = app.state.lock().unwrap_or_else(|e| e.into_inner());
        // Last tunnel wins; a stale connection's queue just goes dead.
        s.tunnel = Some(tx);
    }
    info!("agent tunnel connected");
    app.broadcast(&tunnel_status_event(true).to_string());

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            if sink.send(Message::Text("pong".into())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        if let Ok(event) = serde_json::from_str::<Value>(&text) {
                            app.add_event(event);
                        }
                        app.broadcast(&text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    {
        let mut s = app.state.lock().unwrap_or_else(|e| e.into_inner());
        s.tunnel = None;
    }
    info!("agent tunnel disconnected");
    app.broadcast(&tunnel_status_event(false).to_string());
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppState {
        AppState::new(RelayOptions { history: 3, ..RelayOptions::default() })
    }

    #[test]
    fn history_ring_is_bounded_in_order() {
        let app = app();
        for i in 0..10 {
            app.add_event(json!({ "i": i }));
        }
        let s = app.state.lock().unwrap();
        let is: Vec<i64> = s.history.iter().map(|e| e["i"].as_i64().unwrap()).collect();
        assert_eq!(is, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn broadcast_prunes_dead_dashboards() {
        let app = app();
        let (tx_alive, mut rx_alive) = mpsc::channel(8);
        let (tx_dead, rx_dead) = mpsc::channel(8);
        drop(rx_dead);
        {
            let mut s = app.state.lock().unwrap();
            s.dashboards.push(tx_alive);
            s.dashboards.push(tx_dead);
        }
        app.broadcast("hello");
        assert_eq!(rx_alive.recv().await.unwrap(), "hello");
        assert_eq!(app.state.lock().unwrap().dashboards.len(), 1);
    }

    #[tokio::test]
    async fn send_to_tunnel_reports_absence() {
        let app = app();
        assert!(!app.send_to_tunnel("frame"));
        let (tx, mut rx) = mpsc::channel(8);
        app.state.lock().unwrap().tunnel = Some(tx);
        assert!(app.send_to_tunnel("frame"));
        assert_eq!(rx.recv().await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn dead_tunnel_is_cleared_on_send() {
        let app = app();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        app.state.lock().unwrap().tunnel = Some(tx);
        assert!(!app.send_to_tunnel("frame"));
        assert!(!app.tunnel_connected());
    }

    #[test]
    fn tunnel_status_event_shape() {
        let ev = tunnel_status_event(true);
        assert_eq!(ev["type"], "tunnel_status");
        assert_eq!(ev["data"]["connected"], true);
        assert!(ev["ts"].is_string());
    }

    #[test]
    fn options_default_derives_jwt_secret_from_token() {
        let opts = RelayOptions::default();
        assert!(opts.jwt_secret.starts_with(&opts.token));
        assert!(opts.jwt_secret.ends_with("-jwt"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Process-wide event bus carrying runtime telemetry.
//!
//! Every state change in the runtime (agent steps, tool calls, thinking
//! deltas, tunnel status) is emitted here as a typed JSON event. Three
//! consumer classes exist:
//!
//! - **Stream subscribers** (dashboard sockets, the tunnel): each owns a
//!   bounded channel. `emit` never blocks — when a subscriber's queue is
//!   full the event is dropped for that subscriber; when the receiving
//!   half is gone the subscriber is pruned from the set.
//! - **Sync subscribers**: per-type callbacks invoked inline on emit.
//! - **History readers**: a bounded ring of the most recent events,
//!   replayed to late-joining dashboards.
//!
//! Within one subscriber events arrive in emit order; no cross-subscriber
//! ordering is guaranteed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Default bounded-history ring size.
pub const DEFAULT_HISTORY: usize = 200;

/// Default queue depth for stream subscribers.
pub const DEFAULT_STREAM_DEPTH: usize = 256;

/// One telemetry event. Serializable as JSON for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing per process; survivors in the history ring keep
    /// emit order.
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub data: Value,
}

type SyncCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Inner {
    history: VecDeque<Event>,
    capacity: usize,
    next_seq: u64,
    last_ts: DateTime<Utc>,
    stream_subs: Vec<mpsc::Sender<Event>>,
    sync_subs: HashMap<String, Vec<SyncCallback>>,
}

/// The bus itself. Cheap to clone via `Arc<EventBus>`; all mutation is
/// serialized behind one mutex.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(history_capacity),
                capacity: history_capacity.max(1),
                next_seq: 0,
                last_ts: Utc::now(),
                stream_subs: Vec::new(),
                sync_subs: HashMap::new(),
            }),
        }
    }

    /// Emit an event to every subscriber and record it in the history ring.
    /// Non-blocking; safe to call from any task or thread.
    pub fn emit(&self, event_type: &str, data: Value) {
        let (event, callbacks) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            // Timestamps must be non-decreasing even if the system clock
            // steps backwards under us.
            let now = Utc::now().max(inner.last_ts);
            inner.last_ts = now;
            let event = Event {
                seq: inner.next_seq,
                event_type: event_type.to_string(),
                ts: now,
                data,
            };
            inner.next_seq += 1;

            if inner.history.len() == inner.capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());

            // Fan out to stream subscribers. try_send keeps emit
            // non-blocking: Full drops this event for that subscriber,
            // Closed prunes the subscriber entirely.
            inner.stream_subs.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(event_type, "stream subscriber queue full; event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });

            let callbacks = inner
                .sync_subs
                .get(event_type)
                .map(|cbs| cbs.to_vec())
                .unwrap_or_default();
            (event, callbacks)
        };

        // Invoke sync callbacks outside the lock so a callback that emits
        // does not deadlock.
        for cb in callbacks {
            cb(&event);
        }
    }

    /// Register a push-streaming subscriber with the default queue depth.
    pub fn subscribe_stream(&self) -> mpsc::Receiver<Event> {
        self.subscribe_stream_with_depth(DEFAULT_STREAM_DEPTH)
    }

    /// Register a push-streaming subscriber with an explicit queue depth.
    /// The depth is the subscriber's backpressure bound: events beyond it
    /// are dropped until the consumer catches up.
    pub fn subscribe_stream_with_depth(&self, depth: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stream_subs
            .push(tx);
        rx
    }

    /// Register an inline callback for a single event type.
    pub fn subscribe_sync(&self, event_type: &str, callback: impl Fn(&Event) + Send + Sync + 'static) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sync_subs
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Snapshot copy of the history ring, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Number of live stream subscribers (for the health endpoint).
    pub fn stream_subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stream_subs
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn emitted_event_lands_in_history() {
        let bus = EventBus::new(10);
        bus.emit("agent_started", json!({"agent": "coder"}));
        let hist = bus.history();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].event_type, "agent_started");
        assert_eq!(hist[0].data["agent"], "coder");
    }

    #[test]
    fn history_ring_never_exceeds_capacity() {
        let bus = EventBus::new(5);
        for i in 0..12 {
            bus.emit("tick", json!({ "i": i }));
        }
        let hist = bus.history();
        assert_eq!(hist.len(), 5);
        // Survivors are the most recent, in emit order.
        let is: Vec<i64> = hist.iter().map(|e| e.data["i"].as_i64().unwrap()).collect();
        assert_eq!(is, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let bus = EventBus::new(100);
        for _ in 0..20 {
            bus.emit("tick", json!({}));
        }
        let hist = bus.history();
        for pair in hist.windows(2) {
            assert!(pair[1].seq > pair[0].seq);
            assert!(pair[1].ts >= pair[0].ts, "timestamps must be non-decreasing");
        }
    }

    #[test]
    fn event_serializes_with_type_field() {
        let bus = EventBus::new(4);
        bus.emit("tool_called", json!({"tool_name": "shell"}));
        let json = serde_json::to_value(&bus.history()[0]).unwrap();
        assert_eq!(json["type"], "tool_called");
        assert!(json["ts"].is_string());
    }

    #[tokio::test]
    async fn stream_subscriber_receives_in_emit_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe_stream();
        bus.emit("a", json!({}));
        bus.emit("b", json!({}));
        assert_eq!(rx.recv().await.unwrap().event_type, "a");
        assert_eq!(rx.recv().await.unwrap().event_type, "b");
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_events_but_keeps_subscriber() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe_stream_with_depth(2);
        for i in 0..5 {
            bus.emit("tick", json!({ "i": i }));
        }
        assert_eq!(bus.stream_subscriber_count(), 1, "subscriber must survive overflow");
        // Only the first two fit the queue.
        assert_eq!(rx.recv().await.unwrap().data["i"], 0);
        assert_eq!(rx.recv().await.unwrap().data["i"], 1);
        // Drain the queue; subsequent emits arrive again.
        bus.emit("tick", json!({ "i": 99 }));
        assert_eq!(rx.recv().await.unwrap().data["i"], 99);
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let bus = EventBus::new(10);
        let rx = bus.subscribe_stream();
        drop(rx);
        bus.emit("tick", json!({}));
        assert_eq!(bus.stream_subscriber_count(), 0);
    }

    #[test]
    fn sync_subscriber_fires_for_matching_type_only() {
        let bus = EventBus::new(10);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits2 = Arc::clone(&hits);
        bus.subscribe_sync("kill_switch", move |ev| {
            hits2.lock().unwrap().push(ev.data.clone());
        });
        bus.emit("tick", json!({}));
        bus.emit("kill_switch", json!({"source": "dashboard"}));
        let got = hits.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["source"], "dashboard");
    }

    #[test]
    fn sync_subscriber_may_emit_without_deadlock() {
        let bus = Arc::new(EventBus::new(10));
        let bus2 = Arc::clone(&bus);
        bus.subscribe_sync("task_received", move |_| {
            bus2.emit("status_change", json!({"status": "working"}));
        });
        bus.emit("task_received", json!({"task": "x"}));
        let types: Vec<String> = bus.history().iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(types, vec!["task_received", "status_change"]);
    }
}

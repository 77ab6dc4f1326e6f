//! Web console backend.
//!
//! A thin HTTP/WebSocket surface over the session registry. The JSON API
//! exposes exactly the registry's four operations plus the history list;
//! the `/rt` WebSocket pushes notifier events so a UI knows when to
//! re-query. The console renders nothing itself; it is a consumer of
//! core state, not part of the core.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cloudtun_invocation::TunnelInvocation;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::notify::{Event, EventNotifier, EventStream, EVENT_QUEUE_DEPTH};
use crate::session::SessionRegistry;
use crate::store::Store;

/// Interval between heartbeat events pushed to console clients.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state behind every handler.
#[derive(Clone)]
struct ConsoleState {
    registry: SessionRegistry,
    store: Store,
    fanout: Arc<Fanout>,
}

/// Best-effort event fan-out to any number of WebSocket clients.
///
/// Each client gets its own small queue; a slow client loses events, a
/// closed client is forgotten. Nothing here can back-pressure the
/// notifier or another client.
struct Fanout {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl Fanout {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(tx);
        rx
    }

    fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            // Slow client: drop this event for it, keep the client.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.len()
    }

    /// Consume the notifier stream until it ends.
    async fn run(self: Arc<Self>, mut events: EventStream) {
        while let Some(event) = events.next().await {
            self.publish(event);
        }
    }
}

/// Serve the console until the process ends.
///
/// Consumes the single notifier stream and fans it out; also ticks a
/// heartbeat so clients can tell a quiet tunnel set from a dead socket.
pub async fn serve(
    addr: SocketAddr,
    registry: SessionRegistry,
    store: Store,
    notifier: EventNotifier,
    events: EventStream,
) -> Result<()> {
    let fanout = Arc::new(Fanout::new());
    tokio::spawn(Arc::clone(&fanout).run(events));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            notifier.publish(Event::Heartbeat);
        }
    });

    let state = ConsoleState {
        registry,
        store,
        fanout,
    };
    let app = Router::new()
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/stop", post(stop_session))
        .route("/api/ports/{port}", get(port_status))
        .route("/api/history", get(list_history))
        .route("/rt", get(realtime))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind console on {addr}"))?;
    info!(addr = %listener.local_addr()?, "Console listening");
    axum::serve(listener, app).await.context("console server failed")
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    record: TunnelInvocation,
    local_port: u16,
    kind: &'static str,
}

async fn list_sessions(State(state): State<ConsoleState>) -> Json<Vec<SessionInfo>> {
    let sessions = state
        .registry
        .active_sessions()
        .await
        .into_iter()
        .map(|invocation| SessionInfo {
            local_port: invocation.local_port(),
            kind: invocation.kind().as_str(),
            record: invocation,
        })
        .collect();
    Json(sessions)
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    record: String,
}

async fn start_session(
    State(state): State<ConsoleState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    let invocation: TunnelInvocation = match request.record.parse() {
        Ok(invocation) => invocation,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            );
        }
    };

    match state.registry.start_session(invocation).await {
        Ok(accepted) => (StatusCode::OK, Json(json!({ "accepted": accepted }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn stop_session(
    State(state): State<ConsoleState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    let invocation: TunnelInvocation = match request.record.parse() {
        Ok(invocation) => invocation,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            );
        }
    };

    state.registry.stop_session(&invocation).await;
    (StatusCode::OK, Json(json!({ "stopped": true })))
}

async fn port_status(
    State(state): State<ConsoleState>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    Json(state.registry.port_status(port).await)
}

async fn list_history(State(state): State<ConsoleState>) -> impl IntoResponse {
    match crate::history::list(&state.store) {
        Ok(records) => (StatusCode::OK, Json(json!(records))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Versioned frame pushed over the realtime socket.
#[derive(Debug, Serialize)]
struct RealtimeMessage {
    v: u32,
    #[serde(rename = "type")]
    kind: &'static str,
    data: serde_json::Value,
}

impl RealtimeMessage {
    fn for_event(event: Event) -> Self {
        let data = match event {
            Event::Heartbeat => json!(chrono::Utc::now().timestamp()),
            Event::MembershipChanged => serde_json::Value::Null,
        };
        Self {
            v: 1,
            kind: event.as_str(),
            data,
        }
    }
}

async fn realtime(State(state): State<ConsoleState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let events = state.fanout.subscribe();
    ws.on_upgrade(move |socket| client_loop(socket, events))
}

/// Push events to one client until either side goes away.
async fn client_loop(socket: WebSocket, mut events: mpsc::Receiver<Event>) {
    debug!("Console client connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let message = RealtimeMessage::for_event(event);
                let Ok(payload) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    // Inbound frames are ignored; the API is the command
                    // surface. Close/error ends the client.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Console client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_delivers_to_every_subscriber() {
        let fanout = Fanout::new();
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        fanout.publish(Event::MembershipChanged);
        assert_eq!(a.recv().await, Some(Event::MembershipChanged));
        assert_eq!(b.recv().await, Some(Event::MembershipChanged));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events_but_stays() {
        let fanout = Fanout::new();
        let mut slow = fanout.subscribe();

        for _ in 0..(EVENT_QUEUE_DEPTH * 2) {
            fanout.publish(Event::Heartbeat);
        }
        assert_eq!(fanout.subscriber_count(), 1);

        // Only a queue's worth arrived; the tail was dropped.
        let mut received = 0;
        while slow.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn closed_subscriber_is_forgotten() {
        let fanout = Fanout::new();
        let rx = fanout.subscribe();
        drop(rx);

        fanout.publish(Event::MembershipChanged);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn realtime_frames_are_versioned() {
        let message = RealtimeMessage::for_event(Event::MembershipChanged);
        let payload = serde_json::to_value(&message).unwrap();
        assert_eq!(payload["v"], 1);
        assert_eq!(payload["type"], "membership-changed");
        assert!(payload["data"].is_null());
    }
}

//! HTTP surface of the bridge: axum router and handlers.
//!
//! - `POST /bridge/message` — accept a payload for a recipient.
//! - `GET /bridge/events` — SSE stream for one or more recipient ids.
//! - `GET /bridge/poll` — single-shot long poll.
//! - `GET /bridge/health`, `GET /bridge/stats` — liveness and introspection.
//!
//! All validation failures are parameter-shaped 400s naming the offending
//! field; the engine behind this layer never surfaces errors to senders.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::address::ClientId;
use crate::clock::{Clock, OffsetClock, SystemClock};
use crate::clog;
use crate::config::{Config, MAX_POLL_TIMEOUT_SECS};
use crate::ingress::Dispatcher;
use crate::logging;
use crate::registry::Registry;
use crate::session::{DeliverySession, SessionEvent};
use crate::store::{MemStorage, Storage, StoreConfig};

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct BridgeState {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    config: Config,
    delivered: Arc<AtomicU64>,
    started_at: Instant,
}

impl BridgeState {
    pub fn new(config: Config) -> Self {
        let clock: Arc<dyn Clock> = if config.clock_offset_ms != 0 {
            Arc::new(OffsetClock::new(SystemClock, config.clock_offset_ms))
        } else {
            Arc::new(SystemClock)
        };
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new(
            StoreConfig {
                max_messages: config.max_messages,
                max_queue_bytes: config.max_queue_bytes,
            },
            clock.clone(),
        ));
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            registry.clone(),
            clock.clone(),
            config.max_ttl,
            config.max_payload_bytes,
        ));
        Self {
            storage,
            registry,
            dispatcher,
            clock,
            config,
            delivered: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

pub fn app(state: BridgeState) -> Router {
    let body_limit = state.config.max_payload_bytes.saturating_mul(2).max(4096);
    Router::new()
        .route("/bridge/message", post(send_message))
        .route("/bridge/events", get(subscribe_events))
        .route("/bridge/poll", get(poll_messages))
        .route("/bridge/health", get(healthcheck))
        .route("/bridge/stats", get(bridge_stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "message": message, "statusCode": 400 })),
    )
        .into_response()
}

fn ok_response() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "OK", "statusCode": 200 })),
    )
        .into_response()
}

/// Parse one address parameter, mapping failures to the boundary error shape.
fn parse_address(name: &str, raw: &str) -> Result<ClientId, Response> {
    ClientId::parse(raw)
        .map_err(|err| bad_request(&format!("failed to parse the \"{name}\" param: {err}")))
}

/// Parse a comma-separated recipient list, deduplicated.
fn parse_address_list(name: &str, raw: &str) -> Result<Vec<ClientId>, Response> {
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let id = parse_address(name, part)?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[derive(Deserialize)]
struct SendQuery {
    client_id: Option<String>,
    to: Option<String>,
    ttl: Option<String>,
    topic: Option<String>,
}

async fn send_message(
    State(state): State<BridgeState>,
    Query(query): Query<SendQuery>,
    body: Bytes,
) -> Response {
    let Some(client_id) = query.client_id else {
        return bad_request("param \"client_id\" not present");
    };
    let Some(to) = query.to else {
        return bad_request("param \"to\" not present");
    };
    let Some(ttl) = query.ttl else {
        return bad_request("param \"ttl\" not present");
    };

    let from = match parse_address("client_id", &client_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let to = match parse_address("to", &to) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let ttl_seconds: i64 = match ttl.trim().parse() {
        Ok(value) => value,
        Err(_) => return bad_request("param \"ttl\" invalid"),
    };

    match state
        .dispatcher
        .send(Some(from), to, body.to_vec(), ttl_seconds, query.topic)
    {
        Ok(_) => ok_response(),
        Err(err) => bad_request(&err.to_string()),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    client_id: Option<String>,
    last_event_id: Option<String>,
}

/// Resolve the resume cursor: query parameter first, then the standard
/// `Last-Event-ID` reconnect header, else "from the beginning".
fn resume_cursor(raw: Option<&str>, headers: &HeaderMap) -> Result<u64, Response> {
    let raw = raw.map(str::to_string).or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    match raw {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| bad_request("param \"last_event_id\" invalid")),
    }
}

/// Channel depth between a session task and its SSE body. Small: the session
/// re-drains from its cursor, backpressure here never loses messages.
const SSE_CHANNEL_CAPACITY: usize = 32;

async fn subscribe_events(
    State(state): State<BridgeState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(client_id) = query.client_id else {
        return bad_request("param \"client_id\" not present");
    };
    let recipients = match parse_address_list("client_id", &client_id) {
        Ok(ids) => ids,
        Err(response) => return response,
    };
    let cursor = match resume_cursor(query.last_event_id.as_deref(), &headers) {
        Ok(value) => value,
        Err(response) => return response,
    };

    let label = logging::client_id(recipients[0].as_str());
    clog!(
        "bridge: stream attached {label}{} (cursor {cursor})",
        if recipients.len() > 1 {
            format!(" (+{} more)", recipients.len() - 1)
        } else {
            String::new()
        }
    );

    let session = DeliverySession::attach(
        state.storage.clone(),
        state.registry.clone(),
        &recipients,
        cursor,
        state.delivered.clone(),
    );
    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let heartbeat = state.config.heartbeat;
    tokio::spawn(async move {
        let end = session.run_streaming(tx, heartbeat).await;
        clog!("bridge: stream {} {label}", end.as_str());
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(match event {
            SessionEvent::Heartbeat => Event::default().event("heartbeat").data("heartbeat"),
            SessionEvent::Message(item) => Event::default()
                .id(item.sequence.to_string())
                .event("message")
                .data(item.event_data()),
        })
    });
    Sse::new(stream).into_response()
}

#[derive(Deserialize)]
struct PollQuery {
    client_id: Option<String>,
    last_event_id: Option<String>,
    timeout: Option<String>,
}

async fn poll_messages(
    State(state): State<BridgeState>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(client_id) = query.client_id else {
        return bad_request("param \"client_id\" not present");
    };
    let recipients = match parse_address_list("client_id", &client_id) {
        Ok(ids) => ids,
        Err(response) => return response,
    };
    let cursor = match resume_cursor(query.last_event_id.as_deref(), &headers) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let wait = match query.timeout {
        None => state.config.default_poll_timeout,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs.min(MAX_POLL_TIMEOUT_SECS)),
            Err(_) => return bad_request("param \"timeout\" invalid"),
        },
    };

    let session = DeliverySession::attach(
        state.storage.clone(),
        state.registry.clone(),
        &recipients,
        cursor,
        state.delivered.clone(),
    );
    let (batch, _end) = session.run_single_shot(wait).await;
    let entries: Vec<serde_json::Value> = batch.iter().map(|item| item.poll_entry()).collect();
    (StatusCode::OK, Json(entries)).into_response()
}

async fn healthcheck(State(state): State<BridgeState>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "subscribers": state.registry.subscriber_count(),
        "delivered": state.delivered.load(Ordering::Relaxed),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn bridge_stats(State(state): State<BridgeState>) -> Response {
    let stats = state.storage.stats(state.clock.now());
    let body = serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "subscribers": state.registry.subscriber_count(),
        "recipients": stats.recipients,
        "total_queued": stats.total_queued,
        "total_queued_bytes": stats.total_queued_bytes,
        "total_stored": stats.total_stored,
        "total_evicted": stats.total_evicted,
        "total_expired": stats.total_expired,
        "total_delivered": state.delivered.load(Ordering::Relaxed),
        "queues": stats.queues,
        "config": {
            "max_ttl_secs": state.config.max_ttl.as_secs(),
            "max_messages": state.config.max_messages,
            "max_queue_bytes": state.config.max_queue_bytes,
            "max_payload_bytes": state.config.max_payload_bytes,
        }
    });
    (StatusCode::OK, Json(body)).into_response()
}

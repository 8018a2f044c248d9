//! Auxiliary HTTP surface (C8): status/activity inspection and an SSE feed
//! over the event bus, separate from the MCP protocol endpoint itself.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;

use crate::catalogue::ToolInventory;
use crate::config::ConfigStore;
use crate::dataflow::DataFlowEngine;
use crate::events::EventBus;
use crate::store::{Store, BUCKET_TOOL_CALLS};
use crate::supervisor::Supervisor;
use crate::tenant::SessionId;

const REQUEST_ID_MAX_LEN: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub catalogue: Arc<ToolInventory>,
    pub supervisor: Arc<Supervisor>,
    pub events: EventBus,
    pub store: Arc<Store>,
    pub dataflow: Arc<DataFlowEngine>,
    pub api_key: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(healthz))
        .route("/health", get(healthz))
        .route("/readyz", get(readyz))
        .route("/ready", get(readyz))
        .route("/events", get(events_stream))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/servers", get(list_servers_handler))
        .route("/api/v1/servers/:name/tools", get(server_tools_handler))
        .route("/api/v1/activity", get(activity_handler))
        .route("/api/v1/activity/summary", get(activity_summary_handler))
        .route("/api/v1/hooks/evaluate", post(hooks_evaluate_handler))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<std::collections::HashMap<String, String>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let path = request.uri().path();
    if matches!(path, "/healthz" | "/livez" | "/health" | "/readyz" | "/ready") {
        return next.run(request).await;
    }

    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get("apikey").map(String::as_str));

    match provided {
        Some(key) if key == expected => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "invalid or missing API key").into_response(),
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let live = state.supervisor.live_names().await;
    let desired = state.config.snapshot().servers.len();
    let ready = !live.is_empty() || desired == 0;
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "ready": ready, "live_servers": live.len(), "desired_servers": desired })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.snapshot();
    let live = state.supervisor.live_names().await;
    let counts = state.catalogue.index_counts();
    Json(json!({
        "desired_servers": config.servers.len(),
        "live_servers": live,
        "tools": counts.tools,
        "subscribers": state.events.subscriber_count(),
    }))
}

async fn list_servers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.snapshot();
    let live = state.supervisor.live_names().await;
    let servers: Vec<Value> = config
        .servers
        .iter()
        .map(|d| {
            json!({
                "name": d.name,
                "protocol": d.protocol,
                "enabled": d.enabled,
                "quarantined": d.quarantined,
                "class": d.class,
                "connected": live.contains(&d.name),
            })
        })
        .collect();
    Json(json!({ "servers": servers }))
}

async fn server_tools_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let tools: Vec<Value> = state
        .catalogue
        .list_tools_qualified()
        .into_iter()
        .filter(|(qualified, _)| qualified.server_key == name)
        .map(|(qualified, tool)| {
            json!({
                "name": qualified.to_string(),
                "description": tool.description,
            })
        })
        .collect();
    Json(json!({ "server": name, "tools": tools }))
}

#[derive(Deserialize)]
struct ActivityQuery {
    period: Option<String>,
}

fn recent_activity(store: &Store, limit: usize) -> crate::error::McpResult<Vec<Value>> {
    let mut records: Vec<Value> =
        store.range_json(BUCKET_TOOL_CALLS, &Store::be_key(0), &Store::be_key(u64::MAX))?;
    if records.len() > limit {
        records = records.split_off(records.len() - limit);
    }
    records.reverse();
    Ok(records)
}

async fn activity_handler(State(state): State<AppState>) -> impl IntoResponse {
    match recent_activity(&state.store, 100) {
        Ok(records) => Json(json!({ "activity": records })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn activity_summary_handler(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> impl IntoResponse {
    let period = query.period.unwrap_or_else(|| "1h".to_string());
    match recent_activity(&state.store, 1000) {
        Ok(records) => {
            let total = records.len();
            let errors = records
                .iter()
                .filter(|r| r.get("error").map(|e| !e.is_null()).unwrap_or(false))
                .count();
            Json(json!({ "period": period, "total_calls": total, "errors": errors })).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Hook-mode ingestion (§4.6): a `PostToolUse` event records origins the
/// same way an in-process tool call would; a `PreToolUse` event evaluates
/// the pending call against those recorded origins pre-dispatch.
async fn hooks_evaluate_handler(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let Some(session_id) = payload.get("session_id").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    let session = SessionId::new(session_id);
    let server = payload.get("server").and_then(Value::as_str).unwrap_or_default();
    let server_class = payload.get("server_class").and_then(Value::as_str);

    match payload.get("event").and_then(Value::as_str) {
        Some("PostToolUse") => {
            let tool_name = payload.get("tool_name").and_then(Value::as_str).unwrap_or_default();
            let empty = Value::Null;
            let response = payload.get("response").unwrap_or(&empty);
            state.dataflow.record_origin(&session, server, server_class, tool_name, response);
            Json(json!({ "decision": "allow" })).into_response()
        }
        Some("PreToolUse") => {
            let empty = Value::Null;
            let args = payload.get("args").unwrap_or(&empty);
            let (decision, message) = state.dataflow.evaluate(&session, server, server_class, args);
            let decision_str = match decision {
                crate::dataflow::FlowDecision::Allow => "allow",
                crate::dataflow::FlowDecision::Warn => "warn",
                crate::dataflow::FlowDecision::Deny => "deny",
            };
            Json(json!({ "decision": decision_str, "reason": message })).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "unknown or missing event type").into_response(),
    }
}

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Some(Ok(Event::default().data(data)))
            }
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Validates (or mints) a request ID per the echo/validation rule: must
/// match `[A-Za-z0-9._-]{1,256}`, else a fresh UUIDv4 replaces it.
pub fn normalize_request_id(candidate: Option<&str>) -> String {
    let valid = candidate
        .filter(|s| !s.is_empty() && s.len() <= REQUEST_ID_MAX_LEN)
        .filter(|s| s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')));
    match valid {
        Some(s) => s.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    }
}

// HTTP API
// Axum routes over the watchdog engine, alerts, sessions, and config

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use vigil_core::{
    analyze_error_message, recovery_steps, validate_tool_pairs, ScanScheduler, WatchdogError,
};
use vigil_types::{
    HealthSummary, MonitoredUnit, SessionHealthAction, SessionHealthRecord, SessionStatus,
    ToolCallRef, ToolResultRef, UnitHealth, WatchdogAlert, WatchdogConfig, WatchdogEvent,
};

use crate::AppState;

#[derive(Debug, Deserialize)]
struct HeartbeatInput {
    unit_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsQuery {
    unit_id: Option<String>,
    acknowledged: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SessionHealthInput {
    session_key: String,
    action: SessionHealthAction,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolPairsInput {
    #[serde(default)]
    tool_calls: Vec<ToolCallRef>,
    #[serde(default)]
    tool_results: Vec<ToolResultRef>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeErrorInput {
    error_message: String,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

fn error_response(err: WatchdogError) -> ApiError {
    let (status, code) = match &err {
        WatchdogError::UnknownUnit(_) => (StatusCode::NOT_FOUND, "unknown_unit"),
        WatchdogError::UnknownAlert(_) => (StatusCode::NOT_FOUND, "unknown_alert"),
        WatchdogError::UnknownSession(_) => (StatusCode::NOT_FOUND, "unknown_session"),
        WatchdogError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        WatchdogError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
        WatchdogError::Io(_) | WatchdogError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_failure")
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed against the state directory");
    }
    (
        status,
        Json(ErrorEnvelope {
            error: err.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Bind the API and run it together with the scan scheduler and the
/// event indexer until shutdown.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let indexer = tokio::spawn(crate::run_event_indexer(state.clone()));
    let scheduler = ScanScheduler::spawn(state.engine.clone(), state.config.clone());
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "vigil api listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    indexer.abort();
    scheduler.shutdown().await;
    result?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/units", post(register_unit).get(list_units))
        .route("/units/{unit_id}", delete(evict_unit))
        .route("/heartbeat", post(post_heartbeat))
        .route("/health", get(health_summary))
        .route("/health/{unit_id}", get(unit_health))
        .route("/scan", post(scan_now))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{alert_id}/ack", post(ack_alert))
        .route(
            "/session-health",
            post(apply_session_health).get(list_session_health),
        )
        .route(
            "/session-health/{session_key}",
            get(get_session_health).delete(delete_session_health),
        )
        .route("/validate/tool-pairs", post(validate_pairs))
        .route("/validate/error", post(analyze_error))
        .route("/recovery/steps", get(recovery_plan))
        .route("/events", get(events_tail))
        .route("/events/stream", get(events_stream))
        .route("/config", get(get_config).patch(patch_config))
        .layer(cors)
        .with_state(state)
}

async fn register_unit(
    State(state): State<AppState>,
    Json(input): Json<MonitoredUnit>,
) -> Result<Json<MonitoredUnit>, ApiError> {
    let unit = state
        .engine
        .register(input, Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(unit))
}

async fn list_units(State(state): State<AppState>) -> Json<Vec<MonitoredUnit>> {
    Json(state.engine.list_units().await)
}

async fn evict_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .evict(&unit_id, Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": true })))
}

async fn post_heartbeat(
    State(state): State<AppState>,
    Json(input): Json<HeartbeatInput>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .heartbeat(&input.unit_id, Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "accepted": true })))
}

async fn health_summary(State(state): State<AppState>) -> Json<HealthSummary> {
    Json(state.engine.summary().await)
}

async fn unit_health(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> Result<Json<UnitHealth>, ApiError> {
    let health = state
        .engine
        .unit_health(&unit_id, Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(health))
}

async fn scan_now(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.engine.scan(Utc::now()).await;
    Json(json!({
        "scanned": outcome.scanned,
        "transitions": outcome.transitions,
    }))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<WatchdogAlert>> {
    Json(
        state
            .alerts
            .list(query.unit_id.as_deref(), query.acknowledged)
            .await,
    )
}

async fn ack_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<WatchdogAlert>, ApiError> {
    let alert = state
        .alerts
        .acknowledge(&alert_id)
        .await
        .map_err(error_response)?;
    let event = WatchdogEvent::AlertAcknowledged {
        alert_id: alert.id.clone(),
        timestamp: Utc::now(),
    };
    state.audit.notify(&event).await;
    state.event_bus.publish(event);
    Ok(Json(alert))
}

async fn apply_session_health(
    State(state): State<AppState>,
    Json(input): Json<SessionHealthInput>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .recovery
        .apply(
            &input.session_key,
            input.action,
            input.error.as_deref(),
            Utc::now(),
        )
        .await
        .map_err(error_response)?;
    let auto_recovery_triggered = record.status == SessionStatus::Corrupted;
    Ok(Json(json!({
        "record": record,
        "auto_recovery_triggered": auto_recovery_triggered,
    })))
}

async fn list_session_health(State(state): State<AppState>) -> Json<Vec<SessionHealthRecord>> {
    Json(state.recovery.list().await)
}

async fn get_session_health(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> Json<SessionHealthRecord> {
    Json(state.recovery.get_or_unknown(&session_key, Utc::now()).await)
}

async fn delete_session_health(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state
        .recovery
        .delete(&session_key)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "ok": removed })))
}

async fn validate_pairs(Json(input): Json<ToolPairsInput>) -> Json<Value> {
    let verdict = validate_tool_pairs(&input.tool_calls, &input.tool_results);
    Json(json!(verdict))
}

async fn analyze_error(Json(input): Json<AnalyzeErrorInput>) -> Json<Value> {
    let analysis = analyze_error_message(&input.error_message);
    Json(json!(analysis))
}

async fn recovery_plan() -> Json<Value> {
    Json(json!(recovery_steps()))
}

async fn events_tail(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Value>> {
    Json(state.recent_events(query.limit.unwrap_or(100)).await)
}

fn sse_stream(state: AppState) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let connected = tokio_stream::once(Ok(Event::default().data(
        json!({
            "type": "stream_connected",
            "timestamp": Utc::now(),
        })
        .to_string(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    connected.chain(live)
}

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.config.effective_value().await)
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<Json<WatchdogConfig>, ApiError> {
    let updated = state.config.patch(patch).await.map_err(error_response)?;
    Ok(Json(updated))
}

// ============================================================================
// Tests
// ============================================================================

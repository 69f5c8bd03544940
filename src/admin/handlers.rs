use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::admin::AdminError;
use crate::config::metadata::{self, CATALOG};
use crate::config::validation::{validate_update, ConfigUpdate};
use crate::http::server::AppState;
use crate::observability::log_stream::{LogEntry, LogFilter, LogLevel, StreamEvent};
use crate::observability::stats::{now_unix, ErrorsReport, StatsReport, TimeRange};

const DEFAULT_STATS_LIMIT: usize = 100;
const DEFAULT_ERRORS_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorsQuery {
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub path_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogStreamQuery {
    pub level_filter: Option<String>,
    pub path_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub message: String,
    pub level: Option<String>,
    pub path: Option<String>,
}

pub async fn admin_health() -> Json<Value> {
    Json(json!({ "status": "healthy", "authenticated": true }))
}

/// Current configuration: catalog entries plus flat fields. The API key is redacted.
fn config_view(state: &AppState) -> Value {
    let snapshot = state.config.snapshot();
    let settings = &snapshot.settings;
    let headers = state.config.custom_headers();

    let entries: Vec<Value> = CATALOG
        .iter()
        .map(|meta| {
            let value = if meta.key == "dashboard_api_key" {
                json!("")
            } else {
                metadata::current_value(meta.key, settings, &headers)
            };
            json!({ "key": meta.key, "value": value, "metadata": meta })
        })
        .collect();

    json!({
        "entries": entries,
        "api_key_configured": !settings.dashboard_api_key.is_empty(),
        "version": snapshot.version,
        "restart_pending": state.config.restart_pending(),
        "target_base_url": settings.target_base_url,
        "preserve_host": settings.preserve_host,
        "system_prompt_replacement": settings.system_prompt_replacement,
        "system_prompt_block_insert_if_not_exist": settings.system_prompt_block_insert_if_not_exist,
        "debug_mode": settings.debug_mode,
        "port": settings.port,
        "dashboard_enabled": settings.dashboard_enabled,
        "dashboard_api_key": "",
        "custom_headers": headers.as_ref(),
    })
}

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(config_view(&state))
}

/// Cheap check that a session key is still valid.
pub async fn head_config() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn get_config_metadata() -> Json<Value> {
    Json(json!({ "metadata": CATALOG }))
}

pub async fn update_config(
    State(state): State<AppState>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(update) = payload.map_err(|e| AdminError::BadRequest(e.body_text()))?;
    let validated = validate_update(update).map_err(AdminError::Validation)?;
    let new_target = validated.target_base_url.clone();

    let outcome = state.config.apply_update(validated).await?;

    if let Some(target) = new_target {
        state.router.set_default(&target);
    }
    if outcome.restart_required {
        state.restart.schedule();
    }

    let view = config_view(&state);
    let mut body = json!({
        "success": true,
        "updated_fields": outcome.updated_fields,
        "version": outcome.version,
        "restart_scheduled": outcome.restart_required,
        "entries": view["entries"],
    });
    if outcome.restart_required {
        body["restart_after_ms"] = json!(state.restart.delay().as_millis() as u64);
        body["message"] = json!(format!(
            "Configuration updated. The service will restart in {} ms.",
            state.restart.delay().as_millis()
        ));
    } else {
        body["message"] = json!("Configuration updated.");
    }
    Ok(Json(body))
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsReport> {
    let range = TimeRange {
        start: query.start_time,
        end: query.end_time,
    };
    Json(
        state
            .telemetry
            .stats_report(range, query.limit.unwrap_or(DEFAULT_STATS_LIMIT)),
    )
}

pub async fn get_errors(
    State(state): State<AppState>,
    Query(query): Query<ErrorsQuery>,
) -> Json<ErrorsReport> {
    let range = TimeRange {
        start: query.start_time,
        end: query.end_time,
    };
    Json(state.telemetry.errors_report(
        range,
        query.limit.unwrap_or(DEFAULT_ERRORS_LIMIT),
        query.offset.unwrap_or(0),
        query.path_filter.as_deref().filter(|p| !p.is_empty()),
    ))
}

/// Server-sent log stream: a connection event, the filtered backlog, then live entries.
pub async fn stream_logs(
    State(state): State<AppState>,
    Query(query): Query<LogStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = LogFilter::new(query.level_filter.as_deref(), query.path_filter.as_deref());
    let subscription = state.logs.subscribe(filter);
    tracing::debug!(subscriber = subscription.id(), "Log stream opened");

    let connected = stream::once(async {
        Ok::<_, Infallible>(json_event(&json!({
            "type": "connection",
            "message": "Connected to log stream",
            "timestamp": now_unix(),
        })))
    });

    let live = stream::unfold(subscription, |mut subscription| async move {
        let event = match subscription.next_event().await? {
            StreamEvent::Entry(entry) => entry_event(&entry),
            StreamEvent::Heartbeat => json_event(&json!({ "type": "heartbeat", "timestamp": now_unix() })),
        };
        Some((Ok(event), subscription))
    });

    // Open streams would otherwise hold graceful shutdown forever.
    let shutdown = Arc::clone(&state.shutdown);
    let until_shutdown = async move { shutdown.wait().await };

    Sse::new(connected.chain(live).take_until(until_shutdown))
}

fn entry_event(entry: &LogEntry) -> Event {
    Event::default()
        .json_data(entry)
        .unwrap_or_else(|_| Event::default().comment("unserializable log entry"))
}

fn json_event(value: &Value) -> Event {
    Event::default().data(value.to_string())
}

pub async fn broadcast_log(
    State(state): State<AppState>,
    payload: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(request) = payload.map_err(|e| AdminError::BadRequest(e.body_text()))?;
    if request.message.trim().is_empty() {
        return Err(AdminError::BadRequest("message must not be empty".to_string()));
    }
    let level = request
        .level
        .as_deref()
        .and_then(LogLevel::parse)
        .unwrap_or(LogLevel::Info);

    state
        .logs
        .log(level, request.message, request.path.as_deref().unwrap_or(""), "");
    Ok(Json(json!({ "success": true })))
}

//! Route handlers. Errors become a JSON `{"error": ...}` body; internal
//! failures are logged and reported with a generic message.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::config::NotifyChannelConfig;
use crate::metrics;
use crate::modem::{ModemError, StatusSnapshot};
use crate::storage::{
    Conversation, MessageStats, MessageStore, ScheduledTask, TaskInput, TextMessage,
};
use crate::validation::ValidationError;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    /// Modem not connected.
    Unavailable(String),
    /// Every notification channel failed.
    BadGateway(String),
    Internal(anyhow::Error),
}

impl From<ModemError> for ApiError {
    fn from(e: ModemError) -> Self {
        match e {
            ModemError::InvalidInput(v) => ApiError::BadRequest(v.to_string()),
            ModemError::NotConnected => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(v) = e.downcast_ref::<ValidationError>() {
            return ApiError::BadRequest(v.to_string());
        }
        match e.downcast::<ModemError>() {
            Ok(modem) => modem.into(),
            Err(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m),
            ApiError::Internal(e) => {
                error!("API request failed: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": state.modem.connection().connected,
    }))
}

pub async fn metrics() -> Json<metrics::Snapshot> {
    Json(metrics::snapshot())
}

// --- serial -----------------------------------------------------------------

pub async fn serial_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.modem.status())
}

#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    pub to: String,
    pub content: String,
}

pub async fn send_sms(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendSmsRequest>,
) -> ApiResult<Json<Value>> {
    let id = state.modem.send_sms(&req.to, &req.content).await?;
    Ok(Json(json!({ "id": id })))
}

pub async fn reset_stack(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.modem.reset_stack().await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn reboot_mcu(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.modem.reboot_mcu().await?;
    Ok(Json(json!({ "ok": true })))
}

// --- messages ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Vec<TextMessage>>> {
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.storage.list_messages(limit).await?))
}

pub async fn clear_messages(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let deleted = state.storage.clear_messages().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TextMessage>> {
    state
        .storage
        .get_message(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.storage.delete_message(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn message_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<MessageStats>> {
    Ok(Json(state.storage.message_stats().await?))
}

pub async fn conversations(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Conversation>>> {
    Ok(Json(state.storage.conversations().await?))
}

pub async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> ApiResult<Json<Vec<TextMessage>>> {
    Ok(Json(state.storage.conversation_messages(&peer).await?))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.storage.delete_conversation(&peer).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

// --- tasks ------------------------------------------------------------------

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ScheduledTask>>> {
    Ok(Json(state.storage.list_tasks().await?))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(input): Json<TaskInput>,
) -> ApiResult<(StatusCode, Json<ScheduledTask>)> {
    let task = state.storage.create_task(&input).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledTask>> {
    state
        .storage
        .get_task(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<TaskInput>,
) -> ApiResult<Json<ScheduledTask>> {
    state
        .storage
        .update_task(&id, &input)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.storage.delete_task(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = state.tasks.run_task(&id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "task_id": run.task_id, "message_id": run.message_id })))
}

// --- notify -----------------------------------------------------------------

pub async fn notify_test(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    match state.notifier.send_test().await {
        Ok(channels) => Ok(Json(json!({ "channels": channels }))),
        Err(e) => Err(ApiError::BadGateway(format!("{:#}", e))),
    }
}

/// Test only the channels of one `type`. Unknown types are a 400, a type
/// with no enabled channel a 404.
pub async fn notify_test_channel(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    if !NotifyChannelConfig::KINDS.contains(&kind.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "unknown channel type '{}'",
            kind
        )));
    }
    if state.notifier.enabled_count_of(&kind) == 0 {
        return Err(ApiError::NotFound);
    }
    match state.notifier.send_test_to(&kind).await {
        Ok(channels) => Ok(Json(json!({ "type": kind, "channels": channels }))),
        Err(e) => Err(ApiError::BadGateway(format!("{:#}", e))),
    }
}

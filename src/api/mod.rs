//! # API Module - Local HTTP Control Surface
//!
//! A small axum server for sending SMS, reading message history, managing
//! scheduled tasks and poking the modem. Every route except
//! `GET /api/health` requires `Authorization: Bearer <api_token>`.
//!
//! The server is only started when `http.api_token` is set; an open
//! SMS-sending endpoint is never exposed by default.

pub mod auth;
pub mod routes;

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use axum::routing::{get, post, put};
use axum::Router;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::modem::ModemService;
use crate::notify::NotifyDispatcher;
use crate::scheduler::TaskScheduler;
use crate::storage::Storage;

/// Shared state handed to every handler.
pub struct AppState {
    pub api_token: String,
    pub modem: Arc<ModemService>,
    pub storage: Arc<Storage>,
    pub notifier: Arc<NotifyDispatcher>,
    /// Used for on-demand task runs only; the daily loop has its own instance.
    pub tasks: Arc<TaskScheduler>,
}

pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/metrics", get(routes::metrics))
        // Serial link
        .route("/api/serial/status", get(routes::serial_status))
        .route("/api/serial/sms", post(routes::send_sms))
        .route("/api/serial/reset", post(routes::reset_stack))
        .route("/api/serial/reboot", post(routes::reboot_mcu))
        // Messages
        .route(
            "/api/messages",
            get(routes::list_messages).delete(routes::clear_messages),
        )
        .route("/api/messages/stats", get(routes::message_stats))
        .route("/api/messages/conversations", get(routes::conversations))
        .route(
            "/api/messages/conversations/{peer}",
            get(routes::conversation_messages).delete(routes::delete_conversation),
        )
        .route(
            "/api/messages/{id}",
            get(routes::get_message).delete(routes::delete_message),
        )
        // Tasks
        .route("/api/tasks", get(routes::list_tasks).post(routes::create_task))
        .route(
            "/api/tasks/{id}",
            get(routes::get_task)
                .put(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/api/tasks/{id}/run", post(routes::run_task))
        .route("/api/notify/test", post(routes::notify_test))
        .route("/api/notify/{kind}/test", post(routes::notify_test_channel))
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ))
        .with_state(state)
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn serve(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP API on {}", bind))?;
    info!("HTTP API listening on {}", bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP API server failed")?;
    info!("HTTP API stopped");
    Ok(())
}

//! # smsbridge - UART Cellular Modem Gateway
//!
//! smsbridge sits between a cellular modem MCU on a serial port and the rest
//! of the world. It keeps the serial link alive, turns device frames into
//! stored SMS and call records, pushes alerts to chat webhooks, and exposes a
//! small authenticated HTTP API for sending SMS and browsing history.
//!
//! ## Features
//!
//! - **Self-healing serial link**: port auto-detection by handshake, exponential
//!   backoff with jitter, periodic status refresh.
//! - **Framed JSON protocol**: `CMD_START:{..}CMD_END` out,
//!   `SMS_START:{..}SMS_END` in, tolerant of line noise.
//! - **File-backed storage**: one JSON file per record, atomic locked writes.
//! - **Notifications**: DingTalk, WeCom, Feishu, custom webhooks, Telegram,
//!   and SMTP email.
//! - **Scheduled sends**: recurring SMS tasks checked daily.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsbridge::config::Config;
//! use smsbridge::modem::{ModemService, ModemSettings};
//! use smsbridge::notify::NotifyDispatcher;
//! use smsbridge::storage::Storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let storage = Arc::new(Storage::new(&config.storage.data_dir).await?);
//!     let notifier = Arc::new(NotifyDispatcher::from_config(&config.notify));
//!     let modem = ModemService::new(ModemSettings::from_config(&config), storage, notifier);
//!     println!("{:?}", modem.status());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`modem`] - serial link manager: framing, discovery, supervisor, routing
//! - [`storage`] - message and task persistence
//! - [`notify`] - outbound alert channels
//! - [`scheduler`] - recurring SMS tasks and send confirmation sweep
//! - [`api`] - HTTP API
//! - [`config`] - configuration management and validation
//! - [`validation`] - input validation and path safety
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │ HTTP API │──▶│ ModemService │──▶│  Storage  │
//! └──────────┘   └──────────────┘   └───────────┘
//!                   │        ▲            ▲
//!            commands│        │frames      │ tasks
//!                   ▼        │      ┌───────────┐
//!               ┌──────────────┐    │ Scheduler │
//!               │  Supervisor  │    └───────────┘
//!               │ (serial port)│──▶ Notify
//!               └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod logutil;
pub mod metrics;
pub mod modem;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod validation;

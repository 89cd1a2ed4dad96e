//! # Notify Module - Alert Fan-out
//!
//! Incoming SMS and calls are pushed to every enabled `[[notify]]` channel:
//! DingTalk, WeCom and Feishu robots, an arbitrary webhook, Telegram, and
//! SMTP email. Channels are independent; one failing does not stop the rest.
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::NotifyChannelConfig;
use crate::storage::now_millis;

#[cfg(feature = "email")]
pub mod email;
pub mod telegram;
pub mod webhook;

/// Per-request timeout for every HTTP channel.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sms,
    Call,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::Sms => "sms",
            EventKind::Call => "call",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub kind: EventKind,
    pub from: String,
    /// Empty for calls.
    pub content: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl NotifyEvent {
    /// Human-readable text used as the message body on every channel.
    pub fn format_message(&self) -> String {
        let when = Local
            .timestamp_millis_opt(self.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        match self.kind {
            EventKind::Sms => format!(
                "[SMS] From: {}\nTime: {}\n\n{}",
                self.from, when, self.content
            ),
            EventKind::Call => format!("[Call] Incoming call from {}\nTime: {}", self.from, when),
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            EventKind::Sms => format!("SMS from {}", self.from),
            EventKind::Call => format!("Call from {}", self.from),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotifyEvent) -> Result<()>;
}

/// Delivers to all enabled configured channels.
pub struct NotifyDispatcher {
    client: reqwest::Client,
    channels: Vec<NotifyChannelConfig>,
}

impl NotifyDispatcher {
    pub fn from_config(channels: &[NotifyChannelConfig]) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .user_agent(concat!("smsbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            channels: channels.to_vec(),
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled(None).len()
    }

    /// Enabled channels of one `type`.
    pub fn enabled_count_of(&self, kind: &str) -> usize {
        self.enabled(Some(kind)).len()
    }

    fn enabled(&self, kind: Option<&str>) -> Vec<&NotifyChannelConfig> {
        self.channels
            .iter()
            .filter(|c| c.enabled() && kind.map_or(true, |k| c.kind() == k))
            .collect()
    }

    /// Send `message` everywhere. Fails only if every enabled channel failed.
    pub async fn broadcast(&self, message: &str, event: &NotifyEvent) -> Result<()> {
        self.deliver_all(&self.enabled(None), message, event).await
    }

    async fn deliver_all(
        &self,
        targets: &[&NotifyChannelConfig],
        message: &str,
        event: &NotifyEvent,
    ) -> Result<()> {
        if targets.is_empty() {
            debug!("No notification channels enabled");
            return Ok(());
        }

        let mut failures = 0usize;
        for channel in targets {
            match self.deliver(channel, message, event).await {
                Ok(()) => debug!("{} notification delivered", channel.kind()),
                Err(e) => {
                    failures += 1;
                    warn!("{} notification failed: {:#}", channel.kind(), e);
                }
            }
        }
        if failures == targets.len() {
            bail!("all {} notification channels failed", failures);
        }
        Ok(())
    }

    fn test_event() -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Sms,
            from: "smsbridge".to_string(),
            content: "This is a test notification.".to_string(),
            timestamp: now_millis(),
        }
    }

    /// Push a canned test message through every enabled channel.
    pub async fn send_test(&self) -> Result<usize> {
        let event = Self::test_event();
        self.broadcast(&event.format_message(), &event).await?;
        info!("Test notification sent to {} channel(s)", self.enabled_count());
        Ok(self.enabled_count())
    }

    /// Like [`send_test`](Self::send_test), limited to channels of one `type`.
    pub async fn send_test_to(&self, kind: &str) -> Result<usize> {
        let targets = self.enabled(Some(kind));
        let event = Self::test_event();
        self.deliver_all(&targets, &event.format_message(), &event).await?;
        info!("Test notification sent to {} {} channel(s)", targets.len(), kind);
        Ok(targets.len())
    }

    async fn deliver(
        &self,
        channel: &NotifyChannelConfig,
        message: &str,
        event: &NotifyEvent,
    ) -> Result<()> {
        match channel {
            NotifyChannelConfig::DingTalk(cfg) => webhook::send_dingtalk(&self.client, cfg, message).await,
            NotifyChannelConfig::WeCom(cfg) => webhook::send_wecom(&self.client, cfg, message).await,
            NotifyChannelConfig::Feishu(cfg) => webhook::send_feishu(&self.client, cfg, message).await,
            NotifyChannelConfig::Webhook(cfg) => {
                webhook::send_custom(&self.client, cfg, message, event).await
            }
            NotifyChannelConfig::Telegram(cfg) => telegram::send(&self.client, cfg, message).await,
            #[cfg(feature = "email")]
            NotifyChannelConfig::Email(cfg) => email::send(cfg, &event.subject(), message).await,
            #[cfg(not(feature = "email"))]
            NotifyChannelConfig::Email(_) => {
                bail!("email channel requires the 'email' build feature")
            }
        }
    }
}

#[async_trait]
impl Notifier for NotifyDispatcher {
    async fn notify(&self, event: &NotifyEvent) -> Result<()> {
        self.broadcast(&event.format_message(), event).await
    }
}

//! # Configuration Management Module
//!
//! TOML configuration for the gateway. Every section has defaults, so a
//! config file only needs the values that differ.
//!
//! ## Configuration Structure
//!
//! - [`SerialConfig`] - modem port selection and polling
//! - [`ReconnectConfig`] - backoff between connection attempts
//! - [`HttpConfig`] - JSON API listener and bearer token
//! - [`StorageConfig`] - data directory and content limits
//! - [`LoggingConfig`] - log level and optional log file
//! - [`SchedulerConfig`] - daily check for recurring send tasks
//! - [`NotifyChannelConfig`] - one `[[notify]]` entry per alert channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial port: {:?}", config.serial.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [serial]
//! port = ""               # empty = auto-detect
//! refresh_interval_secs = 30
//!
//! [http]
//! bind = "0.0.0.0:8080"
//! api_token = "change-me"
//!
//! [[notify]]
//! type = "dingtalk"
//! access_token = "..."
//! sign_secret = "SEC..."
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: Vec<NotifyChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path such as `/dev/ttyUSB0`. Empty enables auto-detection.
    pub port: String,
    /// How often `get_status` is sent while connected.
    pub refresh_interval_secs: u64,
    /// How long a status snapshot stays valid without a refresh.
    pub status_ttl_secs: u64,
    /// Read timeout while probing candidate ports.
    pub handshake_timeout_ms: u64,
    /// Pause between the handshake write and the handshake read.
    pub handshake_settle_ms: u64,
    /// Outgoing SMS still `sending` after this long are marked failed.
    pub send_confirm_timeout_secs: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            refresh_interval_secs: 30,
            status_ttl_secs: 300,
            handshake_timeout_ms: 1000,
            handshake_settle_ms: 500,
            send_confirm_timeout_secs: 600,
        }
    }
}

impl SerialConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    pub fn send_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.send_confirm_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 5,
            max_delay_secs: 60,
            factor: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    /// Bearer token required on every route except `/api/health`. The API is
    /// not started while this is empty.
    pub api_token: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Upper bound for outgoing SMS content, in bytes.
    pub max_message_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            max_message_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("smsbridge.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Local hour (0-23) at or after which the daily task check runs.
    pub check_hour: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_hour: 8,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One `[[notify]]` entry, selected by its `type` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifyChannelConfig {
    DingTalk(DingTalkConfig),
    WeCom(WeComConfig),
    Feishu(FeishuConfig),
    Webhook(WebhookConfig),
    Telegram(TelegramConfig),
    Email(EmailConfig),
}

impl NotifyChannelConfig {
    /// Every `type` value a `[[notify]]` entry may carry.
    pub const KINDS: [&'static str; 6] = ["dingtalk", "wecom", "feishu", "webhook", "telegram", "email"];

    pub fn enabled(&self) -> bool {
        match self {
            NotifyChannelConfig::DingTalk(c) => c.enabled,
            NotifyChannelConfig::WeCom(c) => c.enabled,
            NotifyChannelConfig::Feishu(c) => c.enabled,
            NotifyChannelConfig::Webhook(c) => c.enabled,
            NotifyChannelConfig::Telegram(c) => c.enabled,
            NotifyChannelConfig::Email(c) => c.enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotifyChannelConfig::DingTalk(_) => "dingtalk",
            NotifyChannelConfig::WeCom(_) => "wecom",
            NotifyChannelConfig::Feishu(_) => "feishu",
            NotifyChannelConfig::Webhook(_) => "webhook",
            NotifyChannelConfig::Telegram(_) => "telegram",
            NotifyChannelConfig::Email(_) => "email",
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = |field: &str| anyhow!("[[notify]] {}: {} is required", self.kind(), field);
        match self {
            NotifyChannelConfig::DingTalk(c) if c.access_token.is_empty() => Err(missing("access_token")),
            NotifyChannelConfig::WeCom(c) if c.key.is_empty() => Err(missing("key")),
            NotifyChannelConfig::Feishu(c) if c.token.is_empty() => Err(missing("token")),
            NotifyChannelConfig::Webhook(c) if c.url.is_empty() => Err(missing("url")),
            NotifyChannelConfig::Webhook(c)
                if c.body_template == BodyTemplate::Custom && c.custom_body.is_none() =>
            {
                Err(missing("custom_body"))
            }
            NotifyChannelConfig::Telegram(c) if c.bot_token.is_empty() || c.chat_id.is_empty() => {
                Err(missing("bot_token and chat_id"))
            }
            NotifyChannelConfig::Email(c) if c.smtp_host.is_empty() || c.to.is_empty() => {
                Err(missing("smtp_host and to"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DingTalkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub access_token: String,
    /// Robot "sign" secret (`SEC...`); requests are signed when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeComConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyTemplate {
    /// `{"message": ..., "from": ..., ...}`
    #[default]
    Json,
    /// `application/x-www-form-urlencoded` with the same fields
    Form,
    /// `custom_body` with `{{tag}}` substitution
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_template: BodyTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_body: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    /// Override for self-hosted Bot API servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.refresh_interval_secs == 0 {
            bail!("serial.refresh_interval_secs must be positive");
        }
        if self.serial.status_ttl_secs == 0 {
            bail!("serial.status_ttl_secs must be positive");
        }
        if self.serial.send_confirm_timeout_secs == 0 {
            bail!("serial.send_confirm_timeout_secs must be positive");
        }
        if self.reconnect.min_delay_secs == 0 {
            bail!("reconnect.min_delay_secs must be positive");
        }
        if self.reconnect.min_delay_secs > self.reconnect.max_delay_secs {
            bail!("reconnect.min_delay_secs must not exceed reconnect.max_delay_secs");
        }
        if !(self.reconnect.factor >= 1.0 && self.reconnect.factor.is_finite()) {
            bail!("reconnect.factor must be >= 1.0");
        }
        if self.scheduler.check_hour >= 24 {
            bail!("scheduler.check_hour must be in 0..24");
        }
        if self.storage.max_message_size == 0 {
            bail!("storage.max_message_size must be positive");
        }
        if self.http.enabled {
            self.http
                .bind
                .parse::<SocketAddr>()
                .map_err(|e| anyhow!("http.bind '{}' is not a socket address: {}", self.http.bind, e))?;
        }
        for channel in self.notify.iter().filter(|c| c.enabled()) {
            channel.validate()?;
        }
        Ok(())
    }
}

//! # Modem Module - Serial Link Manager
//!
//! Everything that touches the UART modem lives here:
//!
//! - [`frame`]: `CMD_START:`/`SMS_START:` line framing
//! - [`port`]: port enumeration, auto-detect handshake, opening
//! - [`supervisor`]: connect / read / refresh / back off / reconnect
//! - [`router`]: typed handling of decoded device messages
//! - [`status`] and [`operators`]: cached device status
//! - [`sender`] and [`link`]: outbound commands over the shared write half
//!
//! [`ModemService`] wires these together and is what the rest of the
//! application holds on to.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsbridge::config::Config;
//! use smsbridge::modem::{ModemService, ModemSettings, SerialConnector};
//! use smsbridge::notify::NotifyDispatcher;
//! use smsbridge::storage::Storage;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let storage = Arc::new(Storage::new(&config.storage.data_dir).await?);
//!     let notifier = Arc::new(NotifyDispatcher::from_config(&config.notify));
//!     let modem = ModemService::new(ModemSettings::from_config(&config), storage, notifier);
//!
//!     let connector = SerialConnector::new(config.serial.handshake_timeout(), config.serial.handshake_settle());
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(modem.supervisor(connector).run(shutdown.clone()));
//!
//!     let id = modem.send_sms("10086", "balance").await?;
//!     println!("queued {}", id);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod frame;
pub mod link;
pub mod operators;
pub mod port;
pub mod router;
pub mod sender;
pub mod status;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ReconnectConfig};
use crate::notify::Notifier;
use crate::storage::MessageStore;
use crate::validation::ValidationError;

pub use backoff::Backoff;
pub use frame::{Command, DeviceMessage, FrameError};
pub use link::{ConnectionState, SerialLink};
pub use port::{auto_detect, Connector};
#[cfg(feature = "serial")]
pub use port::SerialConnector;
pub use router::{MessageType, Router};
pub use sender::{CommandSender, SmsSender};
pub use status::{MobileInfo, StatusCache, StatusSnapshot};
pub use supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("serial port not connected")]
    NotConnected,

    #[error(transparent)]
    Encode(#[from] FrameError),

    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("serial read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("serial port closed by device")]
    Closed,

    #[error("invalid request: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("failed to list serial ports: {0}")]
    ListPorts(String),

    #[error("no serial ports found")]
    NoPorts,

    #[error("no modem answered the handshake on any port")]
    NoDeviceDetected,

    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },
}

/// Link tuning, usually taken from `[serial]` and `[reconnect]`.
#[derive(Debug, Clone)]
pub struct ModemSettings {
    /// Empty means auto-detect.
    pub port: String,
    pub refresh_interval: Duration,
    pub status_ttl: Duration,
    pub max_content_bytes: usize,
    pub reconnect: ReconnectConfig,
}

impl ModemSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.serial.port.clone(),
            refresh_interval: Duration::from_secs(config.serial.refresh_interval_secs),
            status_ttl: Duration::from_secs(config.serial.status_ttl_secs),
            max_content_bytes: config.storage.max_message_size,
            reconnect: config.reconnect.clone(),
        }
    }
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ModemService {
    link: Arc<SerialLink>,
    status: Arc<StatusCache>,
    router: Arc<Router>,
    sender: Arc<CommandSender>,
    settings: ModemSettings,
}

impl ModemService {
    pub fn new(
        settings: ModemSettings,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let link = Arc::new(SerialLink::new());
        let status = Arc::new(StatusCache::new());
        let router = Arc::new(Router::new(
            Arc::clone(&status),
            Arc::clone(&store),
            notifier,
            settings.status_ttl,
        ));
        let sender = Arc::new(CommandSender::new(
            Arc::clone(&link),
            store,
            settings.max_content_bytes,
        ));
        if !settings.port.is_empty() {
            link.set_port_name(&settings.port);
        }
        Self {
            link,
            status,
            router,
            sender,
            settings,
        }
    }

    /// A supervisor bound to this service's link, cache and router. Spawn
    /// exactly one per service.
    pub fn supervisor<C: Connector>(&self, connector: C) -> Supervisor<C> {
        Supervisor::new(
            connector,
            Arc::clone(&self.link),
            Arc::clone(&self.status),
            Arc::clone(&self.router),
            Arc::clone(&self.sender),
            self.settings.port.clone(),
            self.settings.refresh_interval,
            Backoff::from_config(&self.settings.reconnect),
        )
    }

    /// Latest cached device status with the live port name and connected
    /// flag overlaid. A default snapshot is returned when nothing is cached.
    pub fn status(&self) -> StatusSnapshot {
        let conn = self.link.connection();
        let mut snapshot = self.status.get().unwrap_or_default();
        snapshot.port_name = conn.port_name;
        snapshot.connected = conn.connected;
        snapshot
    }

    pub fn connection(&self) -> ConnectionState {
        self.link.connection()
    }

    pub fn sender(&self) -> Arc<CommandSender> {
        Arc::clone(&self.sender)
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub async fn send_sms(&self, to: &str, content: &str) -> Result<String, ModemError> {
        self.sender.send_sms(to, content).await
    }

    pub async fn reset_stack(&self) -> Result<(), ModemError> {
        self.sender.reset_stack().await
    }

    pub async fn reboot_mcu(&self) -> Result<(), ModemError> {
        self.sender.reboot_mcu().await
    }
}

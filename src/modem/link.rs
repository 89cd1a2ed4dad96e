//! Shared view of the current serial connection: who is connected, and the
//! write half that every command goes through.
use log::{debug, trace};
use serde::Serialize;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::frame::{self, Command};
use super::ModemError;
use crate::logutil::escape_log;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A device that stops draining its UART must not hold the writer forever.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub port_name: String,
    pub connected: bool,
}

/// Only the supervisor calls [`attach`](SerialLink::attach) and
/// [`detach`](SerialLink::detach); everyone else reads state or writes commands.
pub struct SerialLink {
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<BoxedWriter>>,
    write_timeout: Duration,
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }
}

impl SerialLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            state: RwLock::default(),
            writer: Mutex::new(None),
            write_timeout,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).connected
    }

    pub(crate) fn set_port_name(&self, port: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.port_name = port.to_string();
    }

    pub(crate) async fn attach(&self, port: &str, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.port_name = port.to_string();
        state.connected = true;
    }

    /// Drop the write half and publish `disconnected`. The port name is kept
    /// so status reads still show which port was last in use.
    pub(crate) async fn detach(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.connected = false;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Encode and write one command. Never waits for a connection to appear,
    /// and gives up with a `TimedOut` write error after the write timeout.
    pub async fn write_command(&self, cmd: &Command) -> Result<(), ModemError> {
        let bytes = frame::encode(cmd)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ModemError::NotConnected)?;
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(ModemError::Write)?,
            Err(_) => {
                return Err(ModemError::Write(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "serial write timed out",
                )))
            }
        }
        drop(guard);

        debug!("Sent {} command", cmd.action());
        trace!("TX {}", escape_log(&String::from_utf8_lossy(&bytes)));
        Ok(())
    }
}

//! Serial port enumeration, modem probing and opening.
//!
//! The supervisor talks to hardware only through [`Connector`], so tests can
//! substitute in-memory streams for real UARTs.
use async_trait::async_trait;
use log::{debug, info};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use super::frame::{self, Command};
use super::ModemError;

pub const BAUD_RATE: u32 = 115_200;
/// Handshake replies are small; one read of this size is plenty.
pub const HANDSHAKE_BUFFER_BYTES: usize = 4096;

#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Port names in enumeration order. Empty is reported as [`ModemError::NoPorts`].
    async fn list_ports(&self) -> Result<Vec<String>, ModemError>;

    /// Open `port` briefly, ask for status, and report whether a framed reply
    /// came back. The port is closed again before this returns.
    async fn handshake(&self, port: &str) -> bool;

    /// Open `port` at 115200 8N1 for exclusive use by the supervisor.
    async fn open(&self, port: &str) -> Result<Self::Stream, ModemError>;
}

/// First candidate, in order, that answers the handshake with a valid frame.
pub async fn auto_detect<C>(connector: &C, candidates: &[String]) -> Result<String, ModemError>
where
    C: Connector + ?Sized,
{
    for port in candidates {
        debug!("Probing {} for modem", port);
        if connector.handshake(port).await {
            info!("Auto-detected modem on {}", port);
            return Ok(port.clone());
        }
    }
    Err(ModemError::NoDeviceDetected)
}

/// Blocking handshake exchange on an already-open port: write `get_status`, give
/// the firmware `settle` to answer, then do a single read.
pub fn handshake_port<P>(port: &mut P, settle: Duration) -> std::io::Result<bool>
where
    P: Read + Write + ?Sized,
{
    let cmd = frame::encode(&Command::GetStatus)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    port.write_all(&cmd)?;
    port.flush()?;
    std::thread::sleep(settle);

    let mut buf = vec![0u8; HANDSHAKE_BUFFER_BYTES];
    let n = match port.read(&mut buf) {
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => 0,
        Err(e) => return Err(e),
    };
    Ok(frame::contains_frame(&String::from_utf8_lossy(&buf[..n])))
}

#[cfg(feature = "serial")]
pub use self::serial_impl::SerialConnector;

#[cfg(feature = "serial")]
mod serial_impl {
    use super::*;
    use log::warn;
    use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

    /// Real UARTs: `serialport` for enumeration and the blocking handshake,
    /// `tokio-serial` for the long-lived async stream.
    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        handshake_timeout: Duration,
        handshake_settle: Duration,
    }

    impl SerialConnector {
        pub fn new(handshake_timeout: Duration, handshake_settle: Duration) -> Self {
            Self {
                handshake_timeout,
                handshake_settle,
            }
        }
    }

    #[async_trait]
    impl Connector for SerialConnector {
        type Stream = SerialStream;

        async fn list_ports(&self) -> Result<Vec<String>, ModemError> {
            let ports = tokio::task::spawn_blocking(serialport::available_ports)
                .await
                .map_err(|e| ModemError::ListPorts(e.to_string()))?
                .map_err(|e| ModemError::ListPorts(e.to_string()))?;
            let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            if names.is_empty() {
                return Err(ModemError::NoPorts);
            }
            Ok(names)
        }

        async fn handshake(&self, port: &str) -> bool {
            let name = port.to_string();
            let timeout = self.handshake_timeout;
            let settle = self.handshake_settle;
            let result = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
                let mut handle = serialport::new(&name, BAUD_RATE)
                    .data_bits(serialport::DataBits::Eight)
                    .parity(serialport::Parity::None)
                    .stop_bits(serialport::StopBits::One)
                    .timeout(timeout)
                    .open()
                    .map_err(std::io::Error::from)?;
                handshake_port(&mut *handle, settle)
            })
            .await;

            match result {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    debug!("Handshake of {} failed: {}", port, e);
                    false
                }
                Err(e) => {
                    warn!("Handshake task for {} aborted: {}", port, e);
                    false
                }
            }
        }

        async fn open(&self, port: &str) -> Result<SerialStream, ModemError> {
            tokio_serial::new(port, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .open_native_async()
                .map_err(|e| ModemError::Open {
                    port: port.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

//! Connection supervisor: find a port, open it, run the reader and refresh
//! loops until the link drops, back off, repeat.
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::frame::{self, FrameError, FrameSplitter, SplitItem};
use super::link::SerialLink;
use super::port::{auto_detect, Connector};
use super::router::Router;
use super::sender::CommandSender;
use super::status::StatusCache;
use super::ModemError;
use crate::logutil::escape_log;
use crate::metrics;

const READ_CHUNK_BYTES: usize = 1024;

pub struct Supervisor<C: Connector> {
    connector: C,
    link: Arc<SerialLink>,
    status: Arc<StatusCache>,
    router: Arc<Router>,
    sender: Arc<CommandSender>,
    configured_port: String,
    refresh_interval: Duration,
    backoff: Backoff,
}

impl<C: Connector> Supervisor<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connector: C,
        link: Arc<SerialLink>,
        status: Arc<StatusCache>,
        router: Arc<Router>,
        sender: Arc<CommandSender>,
        configured_port: String,
        refresh_interval: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            connector,
            link,
            status,
            router,
            sender,
            configured_port,
            refresh_interval,
            backoff,
        }
    }

    /// Replace the reconnect policy taken from config.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Drive the link until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Serial supervisor started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once(&shutdown).await {
                Ok(port) => info!("Serial connection on {} closed", port),
                Err(e) => warn!("Serial connection attempt failed: {}", e),
            }
            if shutdown.is_cancelled() {
                break;
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.link.detach().await;
        self.status.delete();
        info!("Serial supervisor stopped");
    }

    /// One full connection lifetime. `Ok` carries the port that was in use
    /// once the connection ended; `Err` means no connection was made.
    async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<String, ModemError> {
        let ports = self.connector.list_ports().await?;
        debug!("Available serial ports: {:?}", ports);

        let port = if !self.configured_port.is_empty() {
            info!("Using configured serial port {}", self.configured_port);
            self.configured_port.clone()
        } else {
            info!("Auto-detecting modem port...");
            auto_detect(&self.connector, &ports).await?
        };

        let stream = self.connector.open(&port).await?;
        self.backoff.reset();
        let (rd, wr) = tokio::io::split(stream);
        self.link.attach(&port, Box::new(wr)).await;
        metrics::inc_connections();
        info!("Serial port {} connected", port);

        let conn = shutdown.child_token();
        let reader = tokio::spawn(read_loop(rd, Arc::clone(&self.router), conn.clone()));
        let refresher = tokio::spawn(refresh_loop(
            Arc::clone(&self.sender),
            self.refresh_interval,
            conn.clone(),
        ));

        let (read_result, refresh_result) = tokio::join!(reader, refresher);
        match read_result {
            Ok(Ok(())) => debug!("Serial reader stopped"),
            Ok(Err(e)) => warn!("Serial reader stopped: {}", e),
            Err(e) => log_join_error("reader", e),
        }
        if let Err(e) = refresh_result {
            log_join_error("status refresh", e);
        }

        self.link.detach().await;
        self.status.delete();
        metrics::inc_disconnections();
        Ok(port)
    }
}

fn log_join_error(task: &str, e: JoinError) {
    if e.is_panic() {
        error!("Serial {} task panicked; treating as disconnect", task);
    } else {
        warn!("Serial {} task cancelled: {}", task, e);
    }
}

/// Read until EOF, error or cancellation. Exiting for any reason, panics
/// included, cancels `conn` so the sibling refresh loop stops too.
async fn read_loop<R>(mut reader: R, router: Arc<Router>, conn: CancellationToken) -> Result<(), ModemError>
where
    R: AsyncRead + Unpin,
{
    let _guard = conn.clone().drop_guard();
    let mut splitter = FrameSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = tokio::select! {
            _ = conn.cancelled() => return Ok(()),
            r = reader.read(&mut buf) => r.map_err(ModemError::Read)?,
        };
        if n == 0 {
            warn!("Serial read hit EOF; device probably disconnected");
            return Err(ModemError::Closed);
        }

        splitter.push(&buf[..n]);
        while let Some(item) = splitter.next_line() {
            match item {
                SplitItem::Line(line) => process_line(&router, &line).await,
                SplitItem::Overflow(dropped) => {
                    metrics::inc_frames_rejected();
                    warn!("Discarded {} bytes without a line break", dropped);
                }
            }
        }
    }
}

async fn process_line(router: &Router, line: &str) {
    if line.is_empty() {
        return;
    }
    trace!("RX {}", escape_log(line));
    match frame::decode(line) {
        Ok(msg) => {
            metrics::inc_frames_decoded();
            router.route(&msg).await;
        }
        Err(FrameError::NotFramed) => {}
        Err(FrameError::MissingType) => {
            metrics::inc_frames_rejected();
            warn!("Device frame without type: {}", escape_log(line));
        }
        Err(e) => {
            metrics::inc_frames_rejected();
            error!("Failed to parse device frame: {} ({})", e, escape_log(line));
        }
    }
}

/// Ask for status right away, then on every tick. Send failures are logged
/// only; a dead port is the reader's to notice.
async fn refresh_loop(sender: Arc<CommandSender>, every: Duration, conn: CancellationToken) {
    let _guard = conn.clone().drop_guard();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A stalled write must not keep the loop from seeing cancellation.
        tokio::select! {
            _ = conn.cancelled() => break,
            r = sender.request_status() => {
                if let Err(e) = r {
                    warn!("Status refresh request failed: {}", e);
                }
            }
        }
    }
    debug!("Status refresh loop stopped");
}

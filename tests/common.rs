//! Test utilities & fixtures.
//! An in-memory modem: a scripted `Connector` whose ports are `tokio::io::duplex`
//! pairs, plus a notifier that records what it was asked to send.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use smsbridge::modem::{Backoff, Connector, ModemError, ModemService, ModemSettings};
use smsbridge::notify::{NotifyEvent, Notifier};
use smsbridge::storage::{MessageStore, Storage};

pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// The modem's side of an opened port.
pub struct DeviceEnd {
    pub port: String,
    io: BufReader<DuplexStream>,
}

impl DeviceEnd {
    /// Next command line written by the gateway, parsed from its envelope.
    pub async fn read_command(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(WAIT, self.io.read_line(&mut line))
            .await
            .expect("timed out waiting for a command")
            .expect("read failed");
        assert!(n > 0, "gateway closed the port");
        let line = line.trim_end();
        let body = line
            .strip_prefix("CMD_START:")
            .and_then(|l| l.strip_suffix(":CMD_END"))
            .unwrap_or_else(|| panic!("unframed command line: {line}"));
        serde_json::from_str(body).expect("command JSON")
    }

    /// Skip commands until one with `action` arrives.
    pub async fn expect_action(&mut self, action: &str) -> Value {
        loop {
            let cmd = self.read_command().await;
            if cmd["action"] == action {
                return cmd;
            }
        }
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.io.get_mut().write_all(text.as_bytes()).await.unwrap();
    }

    pub async fn send_frame(&mut self, json: &str) {
        self.send_raw(&format!("SMS_START:{json}:SMS_END\n")).await;
    }
}

pub struct MockConnector {
    ports: Vec<String>,
    responsive: Vec<String>,
    pub opens: Arc<AtomicUsize>,
    pub handshakes: Arc<Mutex<Vec<String>>>,
    devices: mpsc::UnboundedSender<DeviceEnd>,
}

impl MockConnector {
    pub fn new(ports: &[&str], responsive: &[&str]) -> (Self, mpsc::UnboundedReceiver<DeviceEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            ports: ports.iter().map(|s| s.to_string()).collect(),
            responsive: responsive.iter().map(|s| s.to_string()).collect(),
            opens: Arc::new(AtomicUsize::new(0)),
            handshakes: Arc::new(Mutex::new(Vec::new())),
            devices: tx,
        };
        (connector, rx)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn list_ports(&self) -> Result<Vec<String>, ModemError> {
        if self.ports.is_empty() {
            return Err(ModemError::NoPorts);
        }
        Ok(self.ports.clone())
    }

    async fn handshake(&self, port: &str) -> bool {
        self.handshakes.lock().unwrap().push(port.to_string());
        self.responsive.iter().any(|p| p == port)
    }

    async fn open(&self, port: &str) -> Result<DuplexStream, ModemError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (host, device) = tokio::io::duplex(64 * 1024);
        let _ = self.devices.send(DeviceEnd {
            port: port.to_string(),
            io: BufReader::new(device),
        });
        Ok(host)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub notifier: Arc<RecordingNotifier>,
    pub modem: Arc<ModemService>,
    pub devices: mpsc::UnboundedReceiver<DeviceEnd>,
    pub opens: Arc<AtomicUsize>,
    pub handshakes: Arc<Mutex<Vec<String>>>,
    pub shutdown: CancellationToken,
    pub supervisor: JoinHandle<()>,
}

impl Harness {
    /// Start a supervisor over a mock connector. `configured` empty means auto-detect.
    pub async fn start(ports: &[&str], responsive: &[&str], configured: &str, backoff: Backoff) -> Self {
        Self::start_with_store(ports, responsive, configured, backoff, |s| s as Arc<dyn MessageStore>).await
    }

    /// Like [`start`](Self::start), with the modem's store built from the
    /// harness storage by `store`.
    pub async fn start_with_store<F>(
        ports: &[&str],
        responsive: &[&str],
        configured: &str,
        backoff: Backoff,
        store: F,
    ) -> Self
    where
        F: FnOnce(Arc<Storage>) -> Arc<dyn MessageStore>,
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path().to_str().unwrap()).await.unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = ModemSettings {
            port: configured.to_string(),
            refresh_interval: Duration::from_secs(3600),
            status_ttl: Duration::from_secs(300),
            ..ModemSettings::default()
        };
        let modem = Arc::new(ModemService::new(
            settings,
            store(storage.clone()),
            notifier.clone(),
        ));

        let (connector, devices) = MockConnector::new(ports, responsive);
        let opens = connector.opens.clone();
        let handshakes = connector.handshakes.clone();
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(
            modem
                .supervisor(connector)
                .with_backoff(backoff)
                .run(shutdown.clone()),
        );

        Self {
            dir,
            storage,
            notifier,
            modem,
            devices,
            opens,
            handshakes,
            shutdown,
            supervisor,
        }
    }

    pub async fn next_device(&mut self) -> DeviceEnd {
        tokio::time::timeout(WAIT, self.devices.recv())
            .await
            .expect("timed out waiting for the port to be opened")
            .expect("connector dropped")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(WAIT, self.supervisor).await;
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(50), Duration::from_millis(200), 2.0, false)
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

//! End-to-end behavior of the serial link manager against an in-memory modem.
mod common;

use async_trait::async_trait;
use common::{fast_backoff, wait_until, Harness};
use smsbridge::modem::Backoff;
use smsbridge::notify::EventKind;
use smsbridge::storage::{Direction, MessageStatus, MessageStore, RecordKind, Storage, TextMessage};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn requests_status_as_soon_as_connected() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    assert_eq!(dev.port, "/dev/ttyUSB0");
    let cmd = dev.read_command().await;
    assert_eq!(cmd["action"], "get_status");

    assert!(wait_until(|| h.modem.connection().connected).await);
    assert_eq!(h.modem.connection().port_name, "/dev/ttyUSB0");
    h.stop().await;
}

#[tokio::test]
async fn incoming_sms_is_stored_and_notified() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"incoming_sms","from":"10086","content":"hi","timestamp":1700000000}"#)
        .await;

    let mut stored = Vec::new();
    for _ in 0..300 {
        stored = h.storage.list_messages(10).await.unwrap();
        if !stored.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.len(), 1);
    let msg = &stored[0];
    assert_eq!(msg.direction, Direction::Incoming);
    assert_eq!(msg.kind, RecordKind::Sms);
    assert_eq!(msg.from, "10086");
    assert_eq!(msg.content, "hi");
    assert_eq!(msg.timestamp, 1_700_000_000_000);
    assert_eq!(msg.status, MessageStatus::Received);

    let notifier = h.notifier.clone();
    assert!(wait_until(|| !notifier.events().is_empty()).await);
    let event = &h.notifier.events()[0];
    assert_eq!(event.kind, EventKind::Sms);
    assert_eq!(event.from, "10086");
    assert_eq!(event.content, "hi");
    assert_eq!(event.timestamp, 1_700_000_000_000);
    h.stop().await;
}

#[tokio::test]
async fn incoming_call_is_stored_without_content() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"incoming_call","from":"+8613800138000"}"#).await;

    let notifier = h.notifier.clone();
    assert!(wait_until(|| !notifier.events().is_empty()).await);
    let event = &h.notifier.events()[0];
    assert_eq!(event.kind, EventKind::Call);
    assert_eq!(event.from, "+8613800138000");
    assert!(event.content.is_empty());

    let stored = h.storage.list_messages(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, RecordKind::Call);
    h.stop().await;
}

#[tokio::test]
async fn send_sms_persists_then_writes_command() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;
    assert!(wait_until(|| h.modem.connection().connected).await);

    let id = h.modem.send_sms("10086", "hello").await.unwrap();

    let record = h.storage.get_message(&id).await.unwrap().expect("record saved");
    assert_eq!(record.status, MessageStatus::Sending);
    assert_eq!(record.direction, Direction::Outgoing);
    assert_eq!(record.to, "10086");

    let cmd = dev.expect_action("send_sms").await;
    assert_eq!(cmd["to"], "10086");
    assert_eq!(cmd["content"], "hello");
    assert_eq!(cmd["request_id"], id.as_str());
    h.stop().await;
}

#[tokio::test]
async fn send_result_updates_record_status() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;
    assert!(wait_until(|| h.modem.connection().connected).await);

    let ok_id = h.modem.send_sms("10086", "hello").await.unwrap();
    let bad_id = h.modem.send_sms("10010", "hello").await.unwrap();
    dev.send_frame(&format!(
        r#"{{"type":"sms_send_result","success":true,"request_id":"{ok_id}"}}"#
    ))
    .await;
    dev.send_frame(&format!(
        r#"{{"type":"sms_send_result","success":false,"request_id":"{bad_id}","error":"no network"}}"#
    ))
    .await;

    let mut statuses = (MessageStatus::Sending, MessageStatus::Sending);
    for _ in 0..300 {
        let ok = h.storage.get_message(&ok_id).await.unwrap().unwrap().status;
        let bad = h.storage.get_message(&bad_id).await.unwrap().unwrap().status;
        statuses = (ok, bad);
        if ok != MessageStatus::Sending && bad != MessageStatus::Sending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(statuses, (MessageStatus::Sent, MessageStatus::Failed));
    h.stop().await;
}

#[tokio::test]
async fn send_while_disconnected_fails_and_marks_record() {
    let h = Harness::start(&[], &[], "", fast_backoff()).await;
    let err = h.modem.send_sms("10086", "hello").await.unwrap_err();
    assert!(matches!(err, smsbridge::modem::ModemError::NotConnected));

    let stored = h.storage.list_messages(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Failed);
    h.stop().await;
}

#[tokio::test]
async fn invalid_destination_is_rejected_before_storage() {
    let h = Harness::start(&[], &[], "", fast_backoff()).await;
    let err = h.modem.send_sms("not-a-number", "hello").await.unwrap_err();
    assert!(matches!(err, smsbridge::modem::ModemError::InvalidInput(_)));
    assert!(h.storage.list_messages(10).await.unwrap().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn eof_clears_state_and_reconnects_after_backoff() {
    let delay = Duration::from_millis(300);
    let backoff = Backoff::new(delay, Duration::from_secs(2), 2.0, false);
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", backoff).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"status_response","mobile":{"imsi":"460001234567890","sim_ready":true}}"#)
        .await;
    assert!(wait_until(|| h.modem.status().mobile.sim_ready).await);

    let dropped_at = Instant::now();
    drop(dev);

    assert!(
        wait_until(|| {
            let s = h.modem.status();
            !s.connected && !s.mobile.sim_ready
        })
        .await,
        "disconnect must clear the status cache"
    );
    let status = h.modem.status();
    assert!(status.mobile.imsi.is_empty());
    assert_eq!(status.port_name, "/dev/ttyUSB0");

    let dev = h.next_device().await;
    assert!(dropped_at.elapsed() >= delay, "reconnected before the backoff delay");
    assert_eq!(dev.port, "/dev/ttyUSB0");
    assert_eq!(h.opens.load(Ordering::SeqCst), 2);
    h.stop().await;
}

#[tokio::test]
async fn status_response_resolves_operator() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"status_response","version":"1.2","mobile":{"imsi":"460001234567890"}}"#)
        .await;
    assert!(wait_until(|| h.modem.status().mobile.operator == "China Mobile").await);
    assert_eq!(h.modem.status().version, "1.2");
    assert!(h.modem.status().connected);

    dev.send_frame(r#"{"type":"status_response","mobile":{"imsi":"999991234567890"}}"#)
        .await;
    assert!(wait_until(|| h.modem.status().mobile.operator == "99999").await);
    h.stop().await;
}

#[tokio::test]
async fn noise_and_bad_frames_do_not_break_the_link() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_raw("boot: modem firmware v3\r\n").await;
    dev.send_raw("SMS_START:{not json}:SMS_END\n").await;
    dev.send_raw("SMS_START:{\"from\":\"10086\"}:SMS_END\n").await;
    dev.send_raw("SMS_START:{\"type\":\"mystery\"}:SMS_END\n").await;
    dev.send_frame(r#"{"type":"incoming_sms","from":"10086","content":"still here"}"#)
        .await;

    let notifier = h.notifier.clone();
    assert!(wait_until(|| !notifier.events().is_empty()).await);
    assert_eq!(h.notifier.events()[0].content, "still here");
    assert!(h.modem.connection().connected);
    assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    h.stop().await;
}

#[tokio::test]
async fn auto_detect_picks_first_responsive_port() {
    let mut h = Harness::start(
        &["/dev/ttyS0", "/dev/ttyUSB0", "/dev/ttyUSB1"],
        &["/dev/ttyUSB0", "/dev/ttyUSB1"],
        "",
        fast_backoff(),
    )
    .await;
    let dev = h.next_device().await;
    assert_eq!(dev.port, "/dev/ttyUSB0");
    assert_eq!(
        *h.handshakes.lock().unwrap(),
        vec!["/dev/ttyS0".to_string(), "/dev/ttyUSB0".to_string()]
    );
    h.stop().await;
}

#[tokio::test]
async fn configured_port_skips_probing() {
    let mut h = Harness::start(&["/dev/ttyS0", "/dev/ttyACM0"], &[], "/dev/ttyACM0", fast_backoff()).await;
    let dev = h.next_device().await;
    assert_eq!(dev.port, "/dev/ttyACM0");
    assert!(h.handshakes.lock().unwrap().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn keeps_retrying_without_ports() {
    let h = Harness::start(&[], &[], "", fast_backoff()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.opens.load(Ordering::SeqCst), 0);
    assert!(!h.modem.connection().connected);
    assert!(!h.supervisor.is_finished());
    h.stop().await;
}

#[tokio::test]
async fn shutdown_detaches_the_port() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;
    assert!(wait_until(|| h.modem.connection().connected).await);

    let modem = h.modem.clone();
    h.stop().await;
    assert!(!modem.connection().connected);
    assert!(matches!(
        modem.send_sms("10086", "late").await,
        Err(smsbridge::modem::ModemError::NotConnected)
    ));
}

#[tokio::test]
async fn mistyped_incoming_fields_still_store_and_notify() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"incoming_sms","from":"10010","content":"float ts","timestamp":1700000000.5}"#)
        .await;
    dev.send_frame(r#"{"type":"incoming_sms","from":10086,"content":"numeric from","timestamp":1700000001}"#)
        .await;
    dev.send_frame(r#"{"type":"incoming_sms","from":"10000","content":"string ts","timestamp":"1700000002"}"#)
        .await;
    dev.send_frame(r#"{"type":"incoming_sms","from":"95588","content":"control","timestamp":1700000003}"#)
        .await;

    let notifier = h.notifier.clone();
    assert!(wait_until(|| notifier.events().len() == 4).await, "every SMS must be notified");

    let mut stored = Vec::new();
    for _ in 0..300 {
        stored = h.storage.list_messages(10).await.unwrap();
        if stored.len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.len(), 4, "every SMS must be stored");
    let find = |content: &str| stored.iter().find(|m| m.content == content).unwrap().clone();
    assert_eq!(find("float ts").timestamp, 1_700_000_000_000);
    assert_eq!(find("numeric from").from, "10086");
    assert_eq!(find("string ts").timestamp, 1_700_000_002_000);
    assert_eq!(find("control").from, "95588");
    h.stop().await;
}

#[tokio::test]
async fn send_result_for_unknown_request_is_ignored() {
    let mut h = Harness::start(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", fast_backoff()).await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    let stranger = uuid::Uuid::new_v4();
    dev.send_frame(&format!(
        r#"{{"type":"sms_send_result","success":true,"request_id":"{stranger}"}}"#
    ))
    .await;
    dev.send_frame(r#"{"type":"sms_send_result","success":false,"request_id":"../../etc/passwd"}"#)
        .await;
    dev.send_frame(r#"{"type":"incoming_sms","from":"10086","content":"after"}"#)
        .await;

    let notifier = h.notifier.clone();
    assert!(wait_until(|| !notifier.events().is_empty()).await);
    let stored = h.storage.list_messages(10).await.unwrap();
    assert_eq!(stored.len(), 1, "no record may be created for an unknown request");
    assert_eq!(stored[0].content, "after");
    assert!(h.storage.get_message(&stranger.to_string()).await.unwrap().is_none());
    assert!(h.modem.connection().connected);
    assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    h.stop().await;
}

/// Delegates to the harness storage but panics on one particular body.
struct PanickingStore {
    inner: Arc<Storage>,
}

#[async_trait]
impl MessageStore for PanickingStore {
    async fn save_message(&self, msg: &TextMessage) -> anyhow::Result<()> {
        if msg.content == "boom" {
            panic!("store exploded");
        }
        self.inner.save_message(msg).await
    }

    async fn get_message(&self, id: &str) -> anyhow::Result<Option<TextMessage>> {
        self.inner.get_message(id).await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> anyhow::Result<bool> {
        self.inner.update_message_status(id, status).await
    }
}

#[tokio::test]
async fn panic_in_reader_is_handled_as_disconnect() {
    let delay = Duration::from_millis(300);
    let backoff = Backoff::new(delay, Duration::from_secs(2), 2.0, false);
    let mut h = Harness::start_with_store(&["/dev/ttyUSB0"], &[], "/dev/ttyUSB0", backoff, |inner| {
        Arc::new(PanickingStore { inner }) as Arc<dyn MessageStore>
    })
    .await;
    let mut dev = h.next_device().await;
    dev.expect_action("get_status").await;

    dev.send_frame(r#"{"type":"status_response","mobile":{"imsi":"460001234567890","sim_ready":true}}"#)
        .await;
    assert!(wait_until(|| h.modem.status().mobile.sim_ready).await);

    let panicked_at = Instant::now();
    dev.send_frame(r#"{"type":"incoming_sms","from":"10086","content":"boom"}"#)
        .await;

    assert!(
        wait_until(|| {
            let s = h.modem.status();
            !s.connected && !s.mobile.sim_ready
        })
        .await,
        "a panicking handler must drop the link and clear the status cache"
    );

    let mut dev = h.next_device().await;
    assert!(panicked_at.elapsed() >= delay, "reconnected before the backoff delay");
    assert_eq!(h.opens.load(Ordering::SeqCst), 2);
    assert!(!h.supervisor.is_finished());

    // The new connection works normally.
    dev.expect_action("get_status").await;
    dev.send_frame(r#"{"type":"incoming_sms","from":"10086","content":"fine"}"#)
        .await;
    let notifier = h.notifier.clone();
    assert!(wait_until(|| notifier.events().iter().any(|e| e.content == "fine")).await);
    h.stop().await;
}

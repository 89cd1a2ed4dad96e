//! Dispatch of decoded device frames to typed handlers.
//!
//! The router owns no connection state. Everything it touches (status
//! cache, message store, notifier) is injected, so it can be driven directly
//! in tests with hand-built [`DeviceMessage`]s.
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::frame::DeviceMessage;
use super::operators::resolve_operator;
use super::status::{StatusCache, StatusSnapshot};
use crate::logutil::{escape_log, mask_phone};
use crate::metrics;
use crate::notify::{EventKind, NotifyEvent, Notifier};
use crate::storage::{now_millis, MessageStatus, MessageStore, RecordKind, TextMessage};

/// Every downstream `type` the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    StatusResponse,
    SystemReady,
    Heartbeat,
    CellularControlResponse,
    PhoneNumberResponse,
    CommandResponse,
    SimEvent,
    Warning,
    Error,
    IncomingSms,
    IncomingCall,
    SmsSendResult,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        let t = match s {
            "status_response" => MessageType::StatusResponse,
            "system_ready" => MessageType::SystemReady,
            "heartbeat" => MessageType::Heartbeat,
            "cellular_control_response" => MessageType::CellularControlResponse,
            "phone_number_response" => MessageType::PhoneNumberResponse,
            "command_response" => MessageType::CommandResponse,
            "sim_event" => MessageType::SimEvent,
            "warning" => MessageType::Warning,
            "error" => MessageType::Error,
            "incoming_sms" => MessageType::IncomingSms,
            "incoming_call" => MessageType::IncomingCall,
            "sms_send_result" => MessageType::SmsSendResult,
            _ => return None,
        };
        Some(t)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendResultPayload {
    success: bool,
    request_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HeartbeatPayload {
    timestamp: Option<i64>,
    memory_usage: Option<f64>,
    buffer_size: Option<i64>,
}

/// Device timestamps arrive in seconds on most firmware builds and in
/// milliseconds on some; anything below 10^12 is taken as seconds.
pub fn normalize_timestamp(ts: Option<i64>) -> i64 {
    match ts {
        Some(t) if t > 0 && t < 1_000_000_000_000 => t * 1000,
        Some(t) if t > 0 => t,
        _ => now_millis(),
    }
}

pub struct Router {
    status: Arc<StatusCache>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
    status_ttl: Duration,
}

impl Router {
    pub fn new(
        status: Arc<StatusCache>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        status_ttl: Duration,
    ) -> Self {
        Self {
            status,
            store,
            notifier,
            status_ttl,
        }
    }

    pub async fn route(&self, msg: &DeviceMessage) {
        let Some(kind) = MessageType::parse(&msg.msg_type) else {
            metrics::inc_unknown_types();
            debug!("Ignoring unknown device message type '{}'", escape_log(&msg.msg_type));
            return;
        };

        match kind {
            MessageType::StatusResponse => self.on_status_response(msg),
            MessageType::SystemReady => {
                if let Some(text) = str_field(msg, "message") {
                    info!("Device system ready: {}", escape_log(text));
                } else {
                    info!("Device system ready");
                }
            }
            MessageType::Heartbeat => {
                if let Some(hb) = parse_payload::<HeartbeatPayload>(msg) {
                    debug!(
                        "Device heartbeat: timestamp={} memory_usage={} buffer_size={}",
                        hb.timestamp.unwrap_or_default(),
                        hb.memory_usage.unwrap_or_default(),
                        hb.buffer_size.unwrap_or_default()
                    );
                }
            }
            MessageType::CellularControlResponse => {
                debug!("Cellular control response: {}", escape_log(&msg.json));
            }
            MessageType::PhoneNumberResponse => {
                debug!("Phone number response: {}", escape_log(&msg.json));
            }
            MessageType::CommandResponse => {
                if let Some(action) = str_field(msg, "action") {
                    let result = msg.fields.get("result").cloned().unwrap_or(Value::Null);
                    info!(
                        "Command response: action={} result={}",
                        escape_log(action),
                        escape_log(&result.to_string())
                    );
                }
            }
            MessageType::SimEvent => {
                info!("SIM event: status={}", escape_log(str_field(msg, "status").unwrap_or("")));
            }
            MessageType::Warning => {
                if let Some(text) = str_field(msg, "msg") {
                    warn!("Device warning: {}", escape_log(text));
                }
            }
            MessageType::Error => {
                if let Some(text) = str_field(msg, "msg") {
                    error!("Device error: {}", escape_log(text));
                }
            }
            MessageType::IncomingSms => self.on_incoming(RecordKind::Sms, msg).await,
            MessageType::IncomingCall => self.on_incoming(RecordKind::Call, msg).await,
            MessageType::SmsSendResult => self.on_send_result(msg).await,
        }
    }

    fn on_status_response(&self, msg: &DeviceMessage) {
        let Some(mut snapshot) = parse_payload::<StatusSnapshot>(msg) else {
            return;
        };
        if let Some(operator) = resolve_operator(&snapshot.mobile.imsi) {
            snapshot.mobile.operator = operator;
        }
        self.status.set(snapshot, self.status_ttl);
        debug!("Device status cache updated");
    }

    async fn on_incoming(&self, kind: RecordKind, msg: &DeviceMessage) {
        // Field by field, so one mistyped value never loses the record.
        let from = lenient_string(msg.fields.get("from"));
        let timestamp = normalize_timestamp(lenient_i64(msg.fields.get("timestamp")));
        // Calls carry no body.
        let content = match kind {
            RecordKind::Sms => lenient_string(msg.fields.get("content")),
            RecordKind::Call => String::new(),
        };

        let record = TextMessage::incoming(kind, &from, &content, timestamp);
        match kind {
            RecordKind::Sms => {
                metrics::inc_sms_received();
                info!("Incoming SMS from {}", escape_log(&mask_phone(&record.from)));
                debug!(
                    "SMS {} from {}: {}",
                    record.id,
                    escape_log(&record.from),
                    escape_log(&record.content)
                );
            }
            RecordKind::Call => {
                metrics::inc_calls_received();
                info!("Incoming call from {}", escape_log(&mask_phone(&record.from)));
            }
        }
        if let Err(e) = self.store.save_message(&record).await {
            error!("Failed to persist incoming {:?} {}: {:#}", kind, record.id, e);
        }

        let event = NotifyEvent {
            kind: match kind {
                RecordKind::Sms => EventKind::Sms,
                RecordKind::Call => EventKind::Call,
            },
            from: record.from,
            content: record.content,
            timestamp,
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                warn!(
                    "Notification for {} from {} failed: {:#}",
                    event.kind,
                    escape_log(&mask_phone(&event.from)),
                    e
                );
            }
        });
    }

    async fn on_send_result(&self, msg: &DeviceMessage) {
        let Some(result) = parse_payload::<SendResultPayload>(msg) else {
            return;
        };
        let Some(request_id) = result.request_id.filter(|id| !id.is_empty()) else {
            warn!("sms_send_result without request_id ignored");
            return;
        };
        let status = if result.success {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };

        match self.store.update_message_status(&request_id, status).await {
            Ok(true) => {
                if result.success {
                    metrics::inc_sms_confirmed();
                    info!("SMS {} confirmed sent", escape_log(&request_id));
                } else {
                    metrics::inc_sms_failed();
                    warn!(
                        "SMS {} failed on device: {}",
                        escape_log(&request_id),
                        escape_log(result.error.as_deref().unwrap_or("unknown error"))
                    );
                }
                if let Err(e) = self.store.update_task_run_status(&request_id, status).await {
                    warn!("Failed to update task run status for {}: {:#}", escape_log(&request_id), e);
                }
            }
            Ok(false) => {
                info!("sms_send_result for untracked request_id {} ignored", escape_log(&request_id));
            }
            Err(e) => {
                warn!(
                    "Failed to update status for request_id {}: {:#}",
                    escape_log(&request_id),
                    e
                );
            }
        }
    }
}

fn parse_payload<T: DeserializeOwned>(msg: &DeviceMessage) -> Option<T> {
    match serde_json::from_str::<T>(&msg.json) {
        Ok(v) => Some(v),
        Err(e) => {
            error!(
                "Bad {} payload ({}): {}",
                escape_log(&msg.msg_type),
                e,
                escape_log(&msg.json)
            );
            None
        }
    }
}

/// Strings as-is, numbers and booleans in their JSON spelling, null or
/// absent as empty.
fn lenient_string(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Any JSON number (fractions truncated) or a numeric string.
fn lenient_i64(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn str_field<'a>(msg: &'a DeviceMessage, key: &str) -> Option<&'a str> {
    msg.fields.get(key).and_then(Value::as_str)
}

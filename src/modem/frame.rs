//! Marker-delimited JSON framing used on the modem UART.
//!
//! Both directions carry one JSON object per line, wrapped in text markers:
//!
//!   gateway -> device: `CMD_START:{"action":...}:CMD_END\r\n`
//!   device -> gateway: `SMS_START:{"type":...}:SMS_END\r\n`
//!
//! The firmware prints free-text diagnostics on the same stream, so anything
//! that is not wrapped in the downstream markers is reported as
//! [`FrameError::NotFramed`] and dropped by the caller without noise.
use serde::Serialize;
use serde_json::{Map, Value};

pub const CMD_START: &str = "CMD_START:";
pub const CMD_END: &str = ":CMD_END";
pub const FRAME_START: &str = "SMS_START:";
pub const FRAME_END: &str = ":SMS_END";

/// Upper bound for a single line; the firmware applies the same kind of cap on its side.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line is not a framed device message")]
    NotFramed,

    #[error("malformed frame payload: {0}")]
    Malformed(String),

    #[error("frame payload has no type field")]
    MissingType,

    #[error("failed to serialize command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Commands understood by the modem firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    SendSms {
        to: String,
        content: String,
        request_id: String,
    },
    GetStatus,
    ResetStack,
    RebootMcu,
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::SendSms { .. } => "send_sms",
            Command::GetStatus => "get_status",
            Command::ResetStack => "reset_stack",
            Command::RebootMcu => "reboot_mcu",
        }
    }
}

/// One decoded downstream frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    pub msg_type: String,
    /// Raw JSON payload exactly as it appeared between the markers.
    pub json: String,
    pub fields: Map<String, Value>,
}

/// Wrap a command in the upstream envelope, terminated with CRLF.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_string(cmd)?;
    let mut out = Vec::with_capacity(CMD_START.len() + json.len() + CMD_END.len() + 2);
    out.extend_from_slice(CMD_START.as_bytes());
    out.extend_from_slice(json.as_bytes());
    out.extend_from_slice(CMD_END.as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Decode a single line (already split on `\n`) into a [`DeviceMessage`].
pub fn decode(line: &str) -> Result<DeviceMessage, FrameError> {
    let start = line.find(FRAME_START).ok_or(FrameError::NotFramed)?;
    let body_start = start + FRAME_START.len();
    let end = line[body_start..]
        .rfind(FRAME_END)
        .map(|rel| body_start + rel)
        .ok_or(FrameError::NotFramed)?;

    let json = line[body_start..end].trim();
    if json.is_empty() {
        return Err(FrameError::Malformed("empty payload".to_string()));
    }

    let value: Value =
        serde_json::from_str(json).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let fields = match value {
        Value::Object(map) => map,
        other => {
            return Err(FrameError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let msg_type = match fields.get("type") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        _ => return Err(FrameError::MissingType),
    };

    Ok(DeviceMessage {
        msg_type,
        json: json.to_string(),
        fields,
    })
}

/// True if `text` holds at least one downstream frame. Used to validate handshake replies.
pub fn contains_frame(text: &str) -> bool {
    match text.find(FRAME_START) {
        Some(start) => text[start + FRAME_START.len()..].contains(FRAME_END),
        None => false,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Output of [`FrameSplitter::next_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitItem {
    Line(String),
    /// A run of bytes longer than [`MAX_LINE_BYTES`] without a newline was discarded.
    Overflow(usize),
}

/// Incremental newline splitter that tolerates fragmented reads.
///
/// Feed it whatever the serial read returned; complete lines come out with
/// trailing whitespace (including `\r`) removed. Invalid UTF-8 is replaced
/// rather than rejected so one corrupted byte cannot poison the stream.
pub struct FrameSplitter {
    buf: Vec<u8>,
    overflowed: Option<usize>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            overflowed: None,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_BYTES && !self.buf.contains(&b'\n') {
            let dropped = self.buf.len();
            self.buf.clear();
            self.overflowed = Some(self.overflowed.unwrap_or(0) + dropped);
        }
    }

    pub fn next_line(&mut self) -> Option<SplitItem> {
        if let Some(dropped) = self.overflowed.take() {
            return Some(SplitItem::Overflow(dropped));
        }
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        Some(SplitItem::Line(line))
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

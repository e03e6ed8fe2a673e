//! Device-facing JSON envelope
//!
//! Every text frame exchanged with a device is one JSON object of the shape
//! `{"type": ..., "message_id": ..., "data": ...}`. Outbound envelopes are built
//! with [`Envelope`]; inbound frames are parsed into [`InboundMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use scriptlink_core::prelude::*;

/// Greeting sent to clients older than the versioned-ack threshold
pub const LEGACY_GREETING: &str = "连接成功";

/// Fresh message id: `<unix-millis>_<random>`
pub fn message_id() -> String {
    format!(
        "{}_{}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<f64>()
    )
}

/// Outbound envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    pub data: Value,

    /// Content hash of the associated binary frame (`bytes_command` only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl Envelope {
    /// Generic envelope with a fresh message id
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            message_id: Some(message_id()),
            data,
            md5: None,
            version: None,
            debug: None,
        }
    }

    /// Reply to a device hello
    ///
    /// Clients at or above `min_versioned_client` get `"ok"` plus the host
    /// version; older clients get the legacy greeting.
    pub fn hello_ack(
        app_version_code: u64,
        min_versioned_client: u64,
        host_version: &str,
        debug: bool,
    ) -> Self {
        let mut env = Self::new("hello", Value::Null);
        env.debug = Some(debug);
        if app_version_code >= min_versioned_client {
            env.data = Value::from("ok");
            env.version = Some(host_version.to_string());
        } else {
            env.data = Value::from(LEGACY_GREETING);
        }
        env
    }

    /// Liveness reply echoing the ping payload
    pub fn pong(data: Value) -> Self {
        Self {
            kind: "pong".to_string(),
            message_id: None,
            data,
            md5: None,
            version: None,
            debug: None,
        }
    }

    /// Graceful close notice
    pub fn close() -> Self {
        let mut env = Self::new("close", Value::from("close"));
        env.debug = Some(false);
        env
    }

    /// `command` envelope; `data.command` is set to `command`
    pub fn command(command: &str, mut data: Map<String, Value>) -> Self {
        data.insert("command".to_string(), Value::from(command));
        Self::new("command", Value::Object(data))
    }

    /// `bytes_command` envelope correlating with a binary frame by `content_hash`
    pub fn bytes_command(command: &str, content_hash: &str, mut extra: Map<String, Value>) -> Self {
        extra.insert("command".to_string(), Value::from(command));
        let mut env = Self::new("bytes_command", Value::Object(extra));
        env.md5 = Some(content_hash.to_string());
        env
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a device hello
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HelloData {
    pub device_name: String,

    #[serde(default)]
    pub app_version_code: u64,

    /// Any other fields the device sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a device log line
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogData {
    pub log: String,
}

/// Parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Hello(HelloData),
    Ping(Value),
    Log(LogData),
    /// Any other type, preserved for the dispatcher
    Other {
        kind: String,
        message_id: Option<Value>,
        data: Value,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Hello(_) => "hello",
            InboundMessage::Ping(_) => "ping",
            InboundMessage::Log(_) => "log",
            InboundMessage::Other { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message_id: Option<Value>,
    #[serde(default)]
    data: Value,
}

/// Parse one inbound text frame
///
/// Returns [`Error::MalformedMessage`] for invalid JSON, a missing `type`, or
/// a known type whose payload has the wrong shape.
pub fn parse_inbound(text: &str) -> Result<InboundMessage> {
    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| Error::malformed(format!("invalid envelope: {e}")))?;

    match raw.kind.as_str() {
        "hello" => serde_json::from_value(raw.data)
            .map(InboundMessage::Hello)
            .map_err(|e| Error::malformed(format!("invalid hello: {e}"))),
        "ping" => Ok(InboundMessage::Ping(raw.data)),
        "log" => serde_json::from_value(raw.data)
            .map(InboundMessage::Log)
            .map_err(|e| Error::malformed(format!("invalid log: {e}"))),
        _ => Ok(InboundMessage::Other {
            kind: raw.kind,
            message_id: raw.message_id,
            data: raw.data,
        }),
    }
}

//! The wire message model: a tagged envelope with short JSON keys.
//!
//! Everything that crosses the link is a [`Message`]. The payload is an
//! opaque string whose interpretation depends on [`MessageKind`]; for
//! encrypted kinds it carries the base64 ciphertext blob.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BridgeError, BridgeResult};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message kinds supported by the protocol. A closed set — unknown kinds
/// fail JSON parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "COMMAND")]
    Command,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "PAIR_REQ")]
    PairReq,
    #[serde(rename = "PAIR_ACK")]
    PairAck,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Command => "COMMAND",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ack => "ACK",
            Self::PairReq => "PAIR_REQ",
            Self::PairAck => "PAIR_ACK",
        }
    }

    /// Pairing messages bootstrap the key and are never encrypted or signed.
    pub fn is_pairing(&self) -> bool {
        matches!(self, Self::PairReq | Self::PairAck)
    }

    /// Kinds whose payload is encrypted once a session key exists.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Text | Self::Command)
    }
}

/// Protocol message envelope.
///
/// The `timestamp` doubles as the message ID: ACKs echo it back as their
/// payload, and the transport correlates waiters by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version
    #[serde(rename = "v")]
    pub version: u8,

    /// Message kind
    #[serde(rename = "t")]
    pub kind: MessageKind,

    /// Payload content (ciphertext for encrypted kinds)
    #[serde(rename = "p")]
    pub payload: String,

    /// Milliseconds since epoch; also the message ID
    #[serde(rename = "ts")]
    pub timestamp: u64,

    /// First 8 hex chars of the SHA-256 checksum; empty on unsigned drafts
    #[serde(rename = "cs", default)]
    pub checksum: String,
}

/// Millisecond stamps double as message IDs, so two messages minted within
/// the same millisecond must still differ.
fn unique_timestamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = Utc::now().timestamp_millis() as u64;
    LAST.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(now.max(last + 1))
    })
    .unwrap_or(now)
}

impl Message {
    /// Create a new message stamped with the current time.
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            payload: payload.into(),
            timestamp: unique_timestamp(),
            checksum: String::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, content)
    }

    pub fn command(code: CommandCode) -> Self {
        Self::new(MessageKind::Command, code.as_str())
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, "")
    }

    /// ACK for a message, echoing its timestamp as the payload.
    pub fn ack(original_timestamp: u64) -> Self {
        Self::new(MessageKind::Ack, original_timestamp.to_string())
    }

    pub fn pair_req(payload: &PairRequestPayload) -> BridgeResult<Self> {
        Ok(Self::new(MessageKind::PairReq, serde_json::to_string(payload)?))
    }

    pub fn pair_ack(payload: &PairAckPayload) -> BridgeResult<Self> {
        Ok(Self::new(MessageKind::PairAck, serde_json::to_string(payload)?))
    }

    /// For ACK messages, the timestamp of the message being acknowledged.
    pub fn acked_timestamp(&self) -> BridgeResult<u64> {
        self.payload
            .trim()
            .parse()
            .map_err(|_| BridgeError::protocol(format!("ACK payload is not a timestamp: {:?}", self.payload)))
    }

    /// Serialize to JSON with a trailing newline delimiter.
    pub fn to_json(&self) -> BridgeResult<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{json}\n"))
    }

    /// Parse from JSON. Unknown fields are tolerated; unknown kinds are not.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json.trim())?)
    }
}

/// Pairing request payload (JSON inside `p`, never encrypted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestPayload {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl PairRequestPayload {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into(), device_name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Pairing acknowledgment payload (JSON inside `p`, never encrypted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAckPayload {
    #[serde(default)]
    pub device_id: String,
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairStatus {
    #[serde(rename = "OK", alias = "ok")]
    Ok,
    #[serde(rename = "ERROR", alias = "error")]
    Error,
}

impl PairAckPayload {
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Editing commands the peer can inject. A closed set; unknown codes are
/// discarded at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Enter,
    SelectAll,
    Copy,
    Paste,
    Cut,
    Cancel,
}

impl CommandCode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ENTER" => Some(Self::Enter),
            "SELECT_ALL" => Some(Self::SelectAll),
            "COPY" => Some(Self::Copy),
            "PASTE" => Some(Self::Paste),
            "CUT" => Some(Self::Cut),
            "CANCEL" => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "ENTER",
            Self::SelectAll => "SELECT_ALL",
            Self::Copy => "COPY",
            Self::Paste => "PASTE",
            Self::Cut => "CUT",
            Self::Cancel => "CANCEL",
        }
    }
}

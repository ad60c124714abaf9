//! Framing: JSON hub records terminated by 0x1E (SignalR JSON protocol v1).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ClientMessage;

/// Record separator ending every frame.
pub const RECORD_SEPARATOR: u8 = 0x1e;
pub const HUB_PROTOCOL: &str = "json";
pub const HUB_PROTOCOL_VERSION: u32 = 1;
const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MiB

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// One hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// Non-blocking invocation (no invocation id; no completion expected).
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Streaming and cancel types; the client never uses them.
    Other(u8),
}

impl HubFrame {
    /// Invocation frame for a client message.
    pub fn invocation(msg: &ClientMessage) -> Result<Self, serde_json::Error> {
        Ok(HubFrame::Invocation {
            target: msg.target().to_string(),
            arguments: msg.arguments()?,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

/// Encode a frame: JSON record + record separator.
pub fn encode_frame(frame: &HubFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let raw = match frame {
        HubFrame::Invocation { target, arguments } => RawFrame {
            kind: TYPE_INVOCATION,
            target: Some(target.clone()),
            arguments: Some(arguments.clone()),
            ..Default::default()
        },
        HubFrame::Completion {
            invocation_id,
            error,
        } => RawFrame {
            kind: TYPE_COMPLETION,
            invocation_id: Some(invocation_id.clone()),
            error: error.clone(),
            ..Default::default()
        },
        HubFrame::Ping => RawFrame {
            kind: TYPE_PING,
            ..Default::default()
        },
        HubFrame::Close {
            error,
            allow_reconnect,
        } => RawFrame {
            kind: TYPE_CLOSE,
            error: error.clone(),
            allow_reconnect: Some(*allow_reconnect),
            ..Default::default()
        },
        HubFrame::Other(kind) => RawFrame {
            kind: *kind,
            ..Default::default()
        },
    };
    let mut out = serde_json::to_vec(&raw)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.push(RECORD_SEPARATOR);
    Ok(out)
}

/// Encode a client message as an invocation frame.
pub fn encode_message(msg: &ClientMessage) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(&HubFrame::invocation(msg)?)
}

/// Error encoding a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until a record separator arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(HubFrame, usize), FrameDecodeError> {
    let record = next_record(bytes)?;
    let raw: RawFrame = serde_json::from_slice(record)?;
    let frame = match raw.kind {
        TYPE_INVOCATION => HubFrame::Invocation {
            target: raw.target.ok_or(FrameDecodeError::Malformed("invocation without target"))?,
            arguments: raw.arguments.unwrap_or_default(),
        },
        TYPE_COMPLETION => HubFrame::Completion {
            invocation_id: raw
                .invocation_id
                .ok_or(FrameDecodeError::Malformed("completion without invocation id"))?,
            error: raw.error,
        },
        TYPE_PING => HubFrame::Ping,
        TYPE_CLOSE => HubFrame::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect.unwrap_or(false),
        },
        other => HubFrame::Other(other),
    };
    Ok((frame, record.len() + 1))
}

fn next_record(bytes: &[u8]) -> Result<&[u8], FrameDecodeError> {
    match bytes.iter().position(|&b| b == RECORD_SEPARATOR) {
        Some(end) if end > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge),
        Some(end) => Ok(&bytes[..end]),
        None if bytes.len() > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge),
        None => Err(FrameDecodeError::NeedMore),
    }
}

/// Error decoding a frame (need more bytes, too large, malformed or JSON failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// First record a client sends after the transport opens.
pub fn handshake_request() -> Vec<u8> {
    let mut out = serde_json::to_vec(&HandshakeRequest {
        protocol: HUB_PROTOCOL,
        version: HUB_PROTOCOL_VERSION,
    })
    .unwrap_or_default();
    out.push(RECORD_SEPARATOR);
    out
}

/// Decode the handshake response. Returns bytes consumed; any bytes after it are ordinary frames.
pub fn decode_handshake_response(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let record = next_record(bytes)?;
    let resp: HandshakeResponse = serde_json::from_slice(record)?;
    match resp.error {
        Some(error) => Err(FrameDecodeError::HandshakeRejected(error)),
        None => Ok(record.len() + 1),
    }
}

//! Hub protocol: peer and call payloads, typed client and server messages.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque identifier correlating every message of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        CallId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user known to the hub. `connection_id` is the identity key; a reconnecting peer gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "userName")]
    pub display_name: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    /// Missing or null on the wire means online.
    #[serde(
        rename = "connected",
        default = "online",
        deserialize_with = "online_unless_false"
    )]
    pub is_online: bool,
}

fn online() -> bool {
    true
}

fn online_unless_false<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(d)?.unwrap_or(true))
}

impl PeerIdentity {
    pub fn new(display_name: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            connection_id: connection_id.into(),
            is_online: true,
        }
    }
}

/// Call record as relayed by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDescriptor {
    pub call_id: CallId,
    pub from: PeerIdentity,
    pub to: PeerIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP payload in `RTCSessionDescriptionInit` shape: `{ "type": "offer", "sdp": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Client → hub invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreateUser(String),
    GetAllUsers,
    CallUser(String),
    AcceptCall(CallId),
    DeclineCall(CallId),
    /// Explicit hang-up notification relayed to the other party as `EndedCall`.
    EndCall(CallId),
    SendOffer {
        offer: SessionDescription,
        call_id: CallId,
    },
    SendAnswer {
        answer: SessionDescription,
        call_id: CallId,
    },
    SendIceCandidate {
        candidate: IceCandidate,
        call_id: CallId,
    },
}

impl ClientMessage {
    /// Hub method name.
    pub fn target(&self) -> &'static str {
        match self {
            ClientMessage::CreateUser(_) => "CreateUser",
            ClientMessage::GetAllUsers => "GetAllUsers",
            ClientMessage::CallUser(_) => "CallUser",
            ClientMessage::AcceptCall(_) => "AcceptCall",
            ClientMessage::DeclineCall(_) => "DeclineCall",
            ClientMessage::EndCall(_) => "EndCall",
            ClientMessage::SendOffer { .. } => "SendOffer",
            ClientMessage::SendAnswer { .. } => "SendAnswer",
            ClientMessage::SendIceCandidate { .. } => "SendIceCandidate",
        }
    }

    /// Positional invocation arguments.
    pub fn arguments(&self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(match self {
            ClientMessage::CreateUser(name) | ClientMessage::CallUser(name) => {
                vec![Value::String(name.clone())]
            }
            ClientMessage::GetAllUsers => vec![],
            ClientMessage::AcceptCall(id)
            | ClientMessage::DeclineCall(id)
            | ClientMessage::EndCall(id) => vec![serde_json::to_value(id)?],
            ClientMessage::SendOffer { offer, call_id } => {
                vec![serde_json::to_value(offer)?, serde_json::to_value(call_id)?]
            }
            ClientMessage::SendAnswer { answer, call_id } => {
                vec![serde_json::to_value(answer)?, serde_json::to_value(call_id)?]
            }
            ClientMessage::SendIceCandidate { candidate, call_id } => {
                vec![
                    serde_json::to_value(candidate)?,
                    serde_json::to_value(call_id)?,
                ]
            }
        })
    }
}

/// Every hub method the client handles.
pub const SERVER_TARGETS: &[&str] = &[
    "CreatedUser",
    "Users",
    "UserDisconnected",
    "CallingUser",
    "AcceptedCall",
    "DeclinedCall",
    "EndedCall",
    "ReceiveOffer",
    "ReceiveAnswer",
    "ReceiveIceCandidate",
];

/// Hub → client invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    CreatedUser(PeerIdentity),
    Users(Vec<PeerIdentity>),
    UserDisconnected(PeerIdentity),
    CallingUser(CallDescriptor),
    AcceptedCall(CallDescriptor),
    DeclinedCall(CallDescriptor),
    EndedCall(CallDescriptor),
    ReceiveOffer {
        offer: SessionDescription,
        call: CallDescriptor,
    },
    ReceiveAnswer {
        answer: SessionDescription,
        call: CallDescriptor,
    },
    ReceiveIceCandidate {
        candidate: IceCandidate,
        call: CallDescriptor,
    },
}

/// `{offer|answer|sdp, call}`; the description may be a full init object or a bare SDP string.
#[derive(Deserialize)]
struct DescriptionEnvelope {
    #[serde(alias = "offer", alias = "answer")]
    sdp: DescriptionPayload,
    call: CallDescriptor,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptionPayload {
    Init(SessionDescription),
    Raw(String),
}

impl DescriptionPayload {
    fn into_description(self, kind: SdpKind) -> SessionDescription {
        match self {
            DescriptionPayload::Init(desc) => desc,
            DescriptionPayload::Raw(sdp) => SessionDescription { kind, sdp },
        }
    }
}

#[derive(Deserialize)]
struct CandidateEnvelope {
    candidate: IceCandidate,
    call: CallDescriptor,
}

impl ServerMessage {
    /// Parse a hub invocation by method name (case-insensitive, as hub clients match handlers).
    pub fn from_invocation(target: &str, arguments: &[Value]) -> Result<Self, ProtocolError> {
        let canonical = SERVER_TARGETS
            .iter()
            .copied()
            .find(|t| t.eq_ignore_ascii_case(target))
            .ok_or_else(|| ProtocolError::UnknownTarget(target.to_string()))?;
        let arg = |target: &'static str| -> Result<Value, ProtocolError> {
            arguments
                .first()
                .cloned()
                .ok_or(ProtocolError::MissingArgument(target))
        };
        let parse = |target: &'static str, value: Value| {
            move |source: serde_json::Error| ProtocolError::InvalidPayload {
                target,
                source,
                value: value.to_string(),
            }
        };

        let msg = match canonical {
            "CreatedUser" => {
                let v = arg(canonical)?;
                ServerMessage::CreatedUser(
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?,
                )
            }
            "Users" => {
                let v = arg(canonical)?;
                let users: Vec<Option<PeerIdentity>> =
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?;
                ServerMessage::Users(users.into_iter().flatten().collect())
            }
            "UserDisconnected" => {
                let v = arg(canonical)?;
                ServerMessage::UserDisconnected(
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?,
                )
            }
            "CallingUser" | "AcceptedCall" | "DeclinedCall" | "EndedCall" => {
                let v = arg(canonical)?;
                let call: CallDescriptor =
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?;
                match canonical {
                    "CallingUser" => ServerMessage::CallingUser(call),
                    "AcceptedCall" => ServerMessage::AcceptedCall(call),
                    "DeclinedCall" => ServerMessage::DeclinedCall(call),
                    _ => ServerMessage::EndedCall(call),
                }
            }
            "ReceiveOffer" | "ReceiveAnswer" => {
                let v = arg(canonical)?;
                let env: DescriptionEnvelope =
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?;
                if canonical == "ReceiveOffer" {
                    ServerMessage::ReceiveOffer {
                        offer: env.sdp.into_description(SdpKind::Offer),
                        call: env.call,
                    }
                } else {
                    ServerMessage::ReceiveAnswer {
                        answer: env.sdp.into_description(SdpKind::Answer),
                        call: env.call,
                    }
                }
            }
            _ => {
                let v = arg(canonical)?;
                let env: CandidateEnvelope =
                    serde_json::from_value(v.clone()).map_err(parse(canonical, v))?;
                ServerMessage::ReceiveIceCandidate {
                    candidate: env.candidate,
                    call: env.call,
                }
            }
        };
        Ok(msg)
    }

    /// Call the message belongs to, if it is call-scoped.
    pub fn call(&self) -> Option<&CallDescriptor> {
        match self {
            ServerMessage::CallingUser(call)
            | ServerMessage::AcceptedCall(call)
            | ServerMessage::DeclinedCall(call)
            | ServerMessage::EndedCall(call)
            | ServerMessage::ReceiveOffer { call, .. }
            | ServerMessage::ReceiveAnswer { call, .. }
            | ServerMessage::ReceiveIceCandidate { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// Error turning a hub invocation into a [`ServerMessage`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown hub target: {0}")]
    UnknownTarget(String),
    #[error("{0}: missing argument")]
    MissingArgument(&'static str),
    #[error("{target}: invalid payload {value}: {source}")]
    InvalidPayload {
        target: &'static str,
        value: String,
        #[source]
        source: serde_json::Error,
    },
}

//! Hub voice-call signaling core.
//! Host-driven: no I/O; host passes events and receives commands.

pub mod adapter;
pub mod engine;
pub mod protocol;
pub mod roster;
pub mod session;
pub mod wire;

#[cfg(test)]
mod sim;

pub use adapter::{
    ChannelError, ChannelEvent, MediaBackend, MediaError, MediaEvent, MediaEventKind,
    MediaEventSink, NegotiationError, PeerConnectionState, PresenceChannel,
};
pub use engine::{
    CallEngine, CallEvent, Command, EngineConfig, IntentError, MediaCommand, MediaOp,
};
pub use protocol::{
    CallDescriptor, CallId, ClientMessage, IceCandidate, PeerIdentity, ProtocolError, SdpKind,
    ServerMessage, SessionDescription,
};
pub use roster::{Roster, RosterSnapshot};
pub use session::{CallError, CallRole, CallSession, CallState, EndReason, SessionKey};
pub use wire::{
    decode_frame, decode_handshake_response, encode_frame, encode_message, handshake_request,
    FrameDecodeError, FrameEncodeError, HubFrame,
};

//! Contracts for the presence channel and media stack the host plugs in.

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use crate::session::SessionKey;
use crate::wire::FrameEncodeError;

/// What the presence channel reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport up (first connect or after a reconnect).
    Connected,
    Reconnecting,
    /// Gave up; no further events until the host reconnects.
    Disconnected,
    Message(ServerMessage),
}

/// Peer-connection state as the media stack reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Result of a media command or an asynchronous peer-connection callback.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub session: SessionKey,
    pub kind: MediaEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEventKind {
    Acquired,
    AcquireFailed(MediaError),
    /// Our offer or answer, ready to send.
    LocalDescription(SessionDescription),
    RemoteAnswerApplied,
    NegotiationFailed(NegotiationError),
    LocalIceCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    RemoteTrack,
}

impl MediaEvent {
    pub fn new(session: SessionKey, kind: MediaEventKind) -> Self {
        Self { session, kind }
    }
}

/// Where media callbacks are posted. Must not block.
pub type MediaEventSink = Arc<dyn Fn(MediaEvent) + Send + Sync>;

/// Outbound side of the presence channel. Inbound events arrive as [`ChannelEvent`]s.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError>;

    /// Stop the connection; registered handlers are dropped.
    async fn close(&self);
}

/// Local capture plus one peer connection per session.
///
/// `acquire` creates both; `release` tears both down. Calls for a key that was
/// never acquired, or was already released, must be harmless.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire(&self, session: SessionKey, sink: MediaEventSink) -> Result<(), MediaError>;

    async fn create_offer(&self, session: SessionKey) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote offer; returns our answer.
    async fn accept_offer(
        &self,
        session: SessionKey,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn apply_answer(
        &self,
        session: SessionKey,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(
        &self,
        session: SessionKey,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError>;

    async fn attach_remote_stream(&self, session: SessionKey, volume: f32) -> Result<(), MediaError>;

    async fn set_muted(&self, session: SessionKey, muted: bool) -> Result<(), MediaError>;

    async fn set_volume(&self, session: SessionKey, volume: f32) -> Result<(), MediaError>;

    async fn release(&self, session: SessionKey);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no capture device")]
    NoDevice,
    #[error("media backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("description rejected: {0}")]
    Rejected(String),
    #[error("ICE connection failed")]
    IceFailed,
    #[error("negotiation timed out")]
    Timeout,
    #[error("peer connection: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

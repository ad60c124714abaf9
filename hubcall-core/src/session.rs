//! Call session model: state, role, end reasons.

use std::fmt;

use crate::adapter::{MediaError, NegotiationError};
use crate::protocol::{CallId, IceCandidate, PeerIdentity};

/// Epoch of one session. Media commands and callbacks carry it; a mismatch means stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    pub const fn new(raw: u64) -> Self {
        SessionKey(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        SessionKey(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Call state as reported to the UI. `Ending`, `Declined` and `Failed` are
/// transient: they are reported on the way back to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Dialing,
    Ringing,
    Negotiating,
    Active,
    Ending,
    Declined,
    Failed,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Ending | CallState::Declined | CallState::Failed
        )
    }

    /// States in which inbound SDP/ICE for the session is accepted.
    pub fn accepts_artifacts(self) -> bool {
        matches!(self, CallState::Negotiating | CallState::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Ending => "ending",
            CallState::Declined => "declined",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Local media handle lifecycle for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    None,
    Acquiring,
    Ready,
}

/// Where the SDP exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Idle,
    /// Caller: accepted, waiting for the callee's offer.
    AwaitingOffer,
    CreatingOffer,
    AwaitingAnswer,
    ApplyingAnswer,
    AnsweringOffer,
    Complete,
}

/// The single live call. `call_id` is unknown to the caller until the hub answers.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub key: SessionKey,
    pub call_id: Option<CallId>,
    pub role: CallRole,
    pub peer: PeerIdentity,
    pub state: CallState,
    pub media: MediaState,
    pub negotiation: Negotiation,
    pub remote_attached: bool,
    pub local_description_sent: bool,
    /// Local ICE candidates gathered before our offer/answer went out.
    pub pending_local_candidates: Vec<IceCandidate>,
    /// Tick at which `state` was entered (timeouts).
    pub entered_tick: u64,
}

impl CallSession {
    pub fn new(key: SessionKey, role: CallRole, peer: PeerIdentity, state: CallState, tick: u64) -> Self {
        Self {
            key,
            call_id: None,
            role,
            peer,
            state,
            media: MediaState::None,
            negotiation: Negotiation::Idle,
            remote_attached: false,
            local_description_sent: false,
            pending_local_candidates: Vec::new(),
            entered_tick: tick,
        }
    }

    pub fn matches_call(&self, id: &CallId) -> bool {
        self.call_id.as_ref() == Some(id)
    }
}

/// Why a session returned to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    /// We declined (user or busy auto-decline).
    Declined,
    RemoteDeclined,
    /// Ring timeout on either side.
    Unanswered,
    PeerDisconnected,
    Failed(CallError),
}

impl EndReason {
    /// Transient state reported before `Idle`.
    pub fn terminal_state(&self) -> CallState {
        match self {
            EndReason::Declined | EndReason::RemoteDeclined => CallState::Declined,
            EndReason::Failed(_) => CallState::Failed,
            _ => CallState::Ending,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangUp => f.write_str("hung up"),
            EndReason::RemoteHangUp => f.write_str("peer hung up"),
            EndReason::Declined => f.write_str("declined"),
            EndReason::RemoteDeclined => f.write_str("peer declined"),
            EndReason::Unanswered => f.write_str("no answer"),
            EndReason::PeerDisconnected => f.write_str("peer disconnected"),
            EndReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Session-level failures. None are fatal; the engine returns to `Idle`.
/// The inner error is part of the message, not a separate source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(MediaError),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(NegotiationError),
    #[error("signaling channel disconnected")]
    ChannelDisconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_per_reason() {
        assert_eq!(EndReason::LocalHangUp.terminal_state(), CallState::Ending);
        assert_eq!(EndReason::RemoteDeclined.terminal_state(), CallState::Declined);
        assert_eq!(
            EndReason::Failed(CallError::ChannelDisconnected).terminal_state(),
            CallState::Failed
        );
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Active.is_terminal());
    }

    #[test]
    fn call_error_reports_inner_error_once() {
        use std::error::Error;

        let e = CallError::MediaAcquisitionFailed(MediaError::PermissionDenied);
        assert_eq!(e.to_string(), "media acquisition failed: microphone permission denied");
        assert!(e.source().is_none());
        let e = CallError::NegotiationFailed(NegotiationError::Timeout);
        assert!(e.source().is_none());
        assert_eq!(
            EndReason::Failed(e).to_string(),
            "failed: negotiation failed: negotiation timed out"
        );
    }

    #[test]
    fn session_matches_only_known_call_id() {
        let mut s = CallSession::new(
            SessionKey::new(1),
            CallRole::Caller,
            PeerIdentity::new("bob", "b1"),
            CallState::Dialing,
            0,
        );
        assert!(!s.matches_call(&CallId::new("42")));
        s.call_id = Some(CallId::new("42"));
        assert!(s.matches_call(&CallId::new("42")));
        assert!(!s.matches_call(&CallId::new("43")));
        assert_eq!(s.key.next().get(), 2);
    }
}

//! Host-driven call engine: the host passes channel, media, intent and tick events; the engine
//! returns commands. One non-idle session at a time.

use log::{debug, info, warn};

use crate::adapter::{
    ChannelEvent, MediaEvent, MediaEventKind, NegotiationError, PeerConnectionState,
};
use crate::protocol::{
    CallDescriptor, CallId, ClientMessage, IceCandidate, PeerIdentity, SdpKind, ServerMessage,
    SessionDescription,
};
use crate::roster::{Roster, RosterSnapshot};
use crate::session::{
    CallError, CallRole, CallSession, CallState, EndReason, MediaState, Negotiation, SessionKey,
};

/// Default ring timeout in ticks (host ticks once per second).
pub const DEFAULT_RING_TIMEOUT_TICKS: u64 = 45;

/// Default time allowed in `Negotiating` before the session is failed.
pub const DEFAULT_NEGOTIATION_TIMEOUT_TICKS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ring_timeout_ticks: u64,
    pub negotiation_timeout_ticks: u64,
    /// Send `EndCall` on local hang-up.
    pub notify_hang_up: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ticks: DEFAULT_RING_TIMEOUT_TICKS,
            negotiation_timeout_ticks: DEFAULT_NEGOTIATION_TIMEOUT_TICKS,
            notify_hang_up: true,
        }
    }
}

/// What the host must do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(ClientMessage),
    Media(MediaCommand),
    Report(CallEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub session: SessionKey,
    pub op: MediaOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaOp {
    Acquire,
    CreateOffer,
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddIceCandidate(IceCandidate),
    AttachRemoteStream { volume: f32 },
    SetMuted(bool),
    SetVolume(f32),
    Release,
}

/// Reports toward the UI controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall(CallDescriptor),
    CallEnded {
        call_id: Option<CallId>,
        reason: EndReason,
    },
    RosterChanged(RosterSnapshot),
    /// The hub confirmed our registration.
    Registered(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    #[error("display name must not be empty")]
    InvalidName,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("not registered")]
    NotRegistered,
    #[error("signaling channel unavailable")]
    ChannelUnavailable,
    #[error("busy ({0})")]
    Busy(CallState),
    #[error("no such peer online")]
    UnknownPeer,
    #[error("cannot call yourself")]
    SelfCall,
    #[error("no incoming call")]
    NoIncomingCall,
}

/// Main coordinator. Host passes events; engine returns commands.
pub struct CallEngine {
    config: EngineConfig,
    roster: Roster,
    session: Option<CallSession>,
    last_key: SessionKey,
    tick_count: u64,
    connected: bool,
    muted: bool,
    volume: f32,
}

impl CallEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            roster: Roster::new(),
            session: None,
            last_key: SessionKey::new(0),
            tick_count: 0,
            connected: false,
            muted: false,
            volume: 1.0,
        }
    }

    pub fn state(&self) -> CallState {
        self.session.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.roster.snapshot()
    }

    pub fn local_name(&self) -> Option<&str> {
        self.roster.local_name()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Playback volume, 0.0–1.0.
    pub fn volume(&self) -> f32 {
        self.volume
    }

    // ---- user intents ----

    /// Register a display name with the hub. Sent now if connected, else on connect.
    pub fn register(&mut self, name: &str) -> Result<Vec<Command>, IntentError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IntentError::InvalidName);
        }
        if self.roster.local_name().is_some() {
            return Err(IntentError::AlreadyRegistered);
        }
        let mut cmds = Vec::new();
        if self.roster.set_local_name(name) {
            cmds.push(Command::Report(CallEvent::RosterChanged(self.roster.snapshot())));
        }
        if self.connected {
            cmds.push(Command::Send(ClientMessage::CreateUser(name.to_string())));
            cmds.push(Command::Send(ClientMessage::GetAllUsers));
        }
        Ok(cmds)
    }

    /// Ask the hub for a fresh roster.
    pub fn refresh_roster(&self) -> Result<Vec<Command>, IntentError> {
        if !self.connected {
            return Err(IntentError::ChannelUnavailable);
        }
        Ok(vec![Command::Send(ClientMessage::GetAllUsers)])
    }

    /// Place a call. Media is acquired first; `CallUser` goes out once it is ready.
    pub fn dial(&mut self, name: &str) -> Result<Vec<Command>, IntentError> {
        let name = name.trim();
        let local = self.roster.local_name().ok_or(IntentError::NotRegistered)?;
        if !self.connected {
            return Err(IntentError::ChannelUnavailable);
        }
        if let Some(s) = &self.session {
            return Err(IntentError::Busy(s.state));
        }
        if local == name {
            return Err(IntentError::SelfCall);
        }
        let peer = self
            .roster
            .find_by_name(name)
            .cloned()
            .ok_or(IntentError::UnknownPeer)?;

        let key = self.next_key();
        let mut session =
            CallSession::new(key, CallRole::Caller, peer, CallState::Dialing, self.tick_count);
        session.media = MediaState::Acquiring;
        info!("{key}: dialing {}", session.peer.display_name);
        self.session = Some(session);
        Ok(vec![
            Command::Report(CallEvent::StateChanged(CallState::Dialing)),
            media(key, MediaOp::Acquire),
        ])
    }

    /// Accept the ringing call. `AcceptCall` goes out once media is ready.
    pub fn accept(&mut self) -> Result<Vec<Command>, IntentError> {
        let tick = self.tick_count;
        let session = match &mut self.session {
            Some(s) if s.state == CallState::Ringing => s,
            _ => return Err(IntentError::NoIncomingCall),
        };
        session.media = MediaState::Acquiring;
        let key = session.key;
        let mut cmds = Vec::new();
        transition(session, CallState::Negotiating, tick, &mut cmds);
        cmds.push(media(key, MediaOp::Acquire));
        Ok(cmds)
    }

    /// Refuse the ringing call. No-op when idle.
    pub fn decline(&mut self) -> Result<Vec<Command>, IntentError> {
        let mut cmds = Vec::new();
        let call_id = match &self.session {
            None => return Ok(cmds),
            Some(s) if s.state == CallState::Ringing => s.call_id.clone(),
            Some(_) => return Err(IntentError::NoIncomingCall),
        };
        if let Some(id) = call_id {
            cmds.push(Command::Send(ClientMessage::DeclineCall(id)));
        }
        self.finish(EndReason::Declined, &mut cmds);
        Ok(cmds)
    }

    /// End whatever call is in progress. No-op when idle; declines when ringing.
    pub fn hang_up(&mut self) -> Vec<Command> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        if session.state == CallState::Ringing {
            return self.decline().unwrap_or_default();
        }
        let mut cmds = Vec::new();
        if self.config.notify_hang_up && self.connected {
            // A dial cancelled before the hub assigned an id ends locally only.
            if let Some(id) = session.call_id.clone() {
                cmds.push(Command::Send(ClientMessage::EndCall(id)));
            }
        }
        self.finish(EndReason::LocalHangUp, &mut cmds);
        cmds
    }

    /// Mute preference; applied to the live handle and every later one.
    pub fn set_muted(&mut self, muted: bool) -> Vec<Command> {
        self.muted = muted;
        match &self.session {
            Some(s) if s.media != MediaState::None => {
                vec![media(s.key, MediaOp::SetMuted(muted))]
            }
            _ => Vec::new(),
        }
    }

    /// Playback volume in percent, clamped to 0–100.
    pub fn set_volume(&mut self, percent: u8) -> Vec<Command> {
        self.volume = f32::from(percent.min(100)) / 100.0;
        match &self.session {
            Some(s) if s.remote_attached => vec![media(s.key, MediaOp::SetVolume(self.volume))],
            _ => Vec::new(),
        }
    }

    // ---- channel ----

    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Vec<Command> {
        let mut cmds = Vec::new();
        match event {
            ChannelEvent::Connected => {
                info!("signaling channel connected");
                self.connected = true;
                if let Some(name) = self.roster.local_name() {
                    cmds.push(Command::Send(ClientMessage::CreateUser(name.to_string())));
                    cmds.push(Command::Send(ClientMessage::GetAllUsers));
                }
            }
            ChannelEvent::Reconnecting | ChannelEvent::Disconnected => {
                if self.connected {
                    warn!("signaling channel lost ({event:?})");
                }
                self.connected = false;
                if self.session.is_some() {
                    self.fail(CallError::ChannelDisconnected, &mut cmds);
                }
                if self.roster.clear() {
                    cmds.push(Command::Report(CallEvent::RosterChanged(self.roster.snapshot())));
                }
            }
            ChannelEvent::Message(msg) => return self.on_server_message(msg),
        }
        cmds
    }

    pub fn on_server_message(&mut self, msg: ServerMessage) -> Vec<Command> {
        let mut cmds = Vec::new();
        match msg {
            ServerMessage::CreatedUser(peer) => {
                if self.roster.local_name() == Some(peer.display_name.as_str()) {
                    info!("registered as {}", peer.display_name);
                    cmds.push(Command::Report(CallEvent::Registered(peer.display_name)));
                } else if self.roster.upsert(peer) {
                    self.push_roster(&mut cmds);
                }
            }
            ServerMessage::Users(peers) => {
                if self.roster.replace_all(peers) {
                    self.push_roster(&mut cmds);
                }
            }
            ServerMessage::UserDisconnected(peer) => {
                if self.roster.remove(&peer.connection_id).is_some() {
                    self.push_roster(&mut cmds);
                }
                if self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.peer.connection_id == peer.connection_id)
                {
                    info!("{} disconnected mid-call", peer.display_name);
                    self.finish(EndReason::PeerDisconnected, &mut cmds);
                }
            }
            ServerMessage::CallingUser(call) => self.on_calling_user(call, &mut cmds),
            ServerMessage::AcceptedCall(call) => self.on_accepted_call(call, &mut cmds),
            ServerMessage::DeclinedCall(call) => self.on_declined_call(call, &mut cmds),
            ServerMessage::EndedCall(call) => {
                if self.session.as_ref().is_some_and(|s| s.matches_call(&call.call_id)) {
                    self.finish(EndReason::RemoteHangUp, &mut cmds);
                } else {
                    stale("EndedCall", &call.call_id);
                }
            }
            ServerMessage::ReceiveOffer { offer, call } => {
                self.on_remote_description(offer, &call.call_id, &mut cmds)
            }
            ServerMessage::ReceiveAnswer { answer, call } => {
                self.on_remote_description(answer, &call.call_id, &mut cmds)
            }
            ServerMessage::ReceiveIceCandidate { candidate, call } => match &self.session {
                Some(s) if s.matches_call(&call.call_id) && s.state.accepts_artifacts() => {
                    cmds.push(media(s.key, MediaOp::AddIceCandidate(candidate)));
                }
                _ => stale("ReceiveIceCandidate", &call.call_id),
            },
        }
        cmds
    }

    fn on_calling_user(&mut self, call: CallDescriptor, cmds: &mut Vec<Command>) {
        if let Some(s) = &self.session {
            if !s.matches_call(&call.call_id) {
                warn!(
                    "busy ({}): auto-declining call {} from {}",
                    s.state, call.call_id, call.from.display_name
                );
                cmds.push(Command::Send(ClientMessage::DeclineCall(call.call_id)));
            }
            return;
        }
        let key = self.next_key();
        let mut session = CallSession::new(
            key,
            CallRole::Callee,
            call.from.clone(),
            CallState::Ringing,
            self.tick_count,
        );
        session.call_id = Some(call.call_id.clone());
        info!("{key}: incoming call {} from {}", call.call_id, call.from.display_name);
        self.session = Some(session);
        cmds.push(Command::Report(CallEvent::StateChanged(CallState::Ringing)));
        cmds.push(Command::Report(CallEvent::IncomingCall(call)));
    }

    /// Caller side: the callee accepted; the hub's call id becomes ours.
    fn on_accepted_call(&mut self, call: CallDescriptor, cmds: &mut Vec<Command>) {
        let tick = self.tick_count;
        match &mut self.session {
            Some(s) if awaiting_reply(s, &call) => {
                s.call_id = Some(call.call_id.clone());
                s.negotiation = Negotiation::AwaitingOffer;
                info!("{}: call {} accepted", s.key, call.call_id);
                transition(s, CallState::Negotiating, tick, cmds);
            }
            _ => stale("AcceptedCall", &call.call_id),
        }
    }

    fn on_declined_call(&mut self, call: CallDescriptor, cmds: &mut Vec<Command>) {
        let applies = match &mut self.session {
            Some(s) if awaiting_reply(s, &call) => {
                s.call_id = Some(call.call_id.clone());
                true
            }
            // Caller withdrew while we were ringing.
            Some(s) => s.state == CallState::Ringing && s.matches_call(&call.call_id),
            None => false,
        };
        if applies {
            self.finish(EndReason::RemoteDeclined, cmds);
        } else {
            stale("DeclinedCall", &call.call_id);
        }
    }

    /// Remote offer (caller side) or answer (callee side).
    fn on_remote_description(
        &mut self,
        desc: SessionDescription,
        call_id: &CallId,
        cmds: &mut Vec<Command>,
    ) {
        let s = match &mut self.session {
            Some(s) if s.matches_call(call_id) && s.state.accepts_artifacts() => s,
            _ => return stale("remote description", call_id),
        };
        let op = match (s.role, s.negotiation, desc.kind) {
            (CallRole::Caller, Negotiation::AwaitingOffer, SdpKind::Offer) => {
                s.negotiation = Negotiation::AnsweringOffer;
                MediaOp::AcceptOffer(desc)
            }
            (CallRole::Callee, Negotiation::AwaitingAnswer, SdpKind::Answer) => {
                s.negotiation = Negotiation::ApplyingAnswer;
                MediaOp::ApplyAnswer(desc)
            }
            (role, phase, kind) => {
                let detail = format!("unexpected {kind:?} for {role:?} in {phase:?}");
                return self.fail(
                    CallError::NegotiationFailed(NegotiationError::Rejected(detail)),
                    cmds,
                );
            }
        };
        cmds.push(media(s.key, op));
    }

    // ---- media ----

    pub fn on_media_event(&mut self, event: MediaEvent) -> Vec<Command> {
        let mut cmds = Vec::new();
        let tick = self.tick_count;
        let muted = self.muted;
        let volume = self.volume;
        let s = match &mut self.session {
            Some(s) if s.key == event.session => s,
            _ => {
                debug!("dropping media event for stale session {}", event.session);
                return cmds;
            }
        };
        let key = s.key;

        match event.kind {
            MediaEventKind::Acquired => {
                if s.media != MediaState::Acquiring {
                    return cmds;
                }
                s.media = MediaState::Ready;
                if muted {
                    cmds.push(media(key, MediaOp::SetMuted(true)));
                }
                match s.role {
                    CallRole::Caller => {
                        cmds.push(Command::Send(ClientMessage::CallUser(
                            s.peer.display_name.clone(),
                        )));
                    }
                    CallRole::Callee => {
                        if let Some(id) = s.call_id.clone() {
                            cmds.push(Command::Send(ClientMessage::AcceptCall(id)));
                        }
                        s.negotiation = Negotiation::CreatingOffer;
                        cmds.push(media(key, MediaOp::CreateOffer));
                    }
                }
            }
            MediaEventKind::AcquireFailed(err) => {
                warn!("{key}: media acquisition failed: {err}");
                self.fail(CallError::MediaAcquisitionFailed(err), &mut cmds);
            }
            MediaEventKind::LocalDescription(desc) => {
                let Some(call_id) = s.call_id.clone() else {
                    return cmds;
                };
                match (s.role, s.negotiation) {
                    (CallRole::Callee, Negotiation::CreatingOffer) => {
                        cmds.push(Command::Send(ClientMessage::SendOffer {
                            offer: desc,
                            call_id: call_id.clone(),
                        }));
                        s.negotiation = Negotiation::AwaitingAnswer;
                        flush_candidates(s, &call_id, &mut cmds);
                    }
                    (CallRole::Caller, Negotiation::AnsweringOffer) => {
                        cmds.push(Command::Send(ClientMessage::SendAnswer {
                            answer: desc,
                            call_id: call_id.clone(),
                        }));
                        s.negotiation = Negotiation::Complete;
                        flush_candidates(s, &call_id, &mut cmds);
                        transition(s, CallState::Active, tick, &mut cmds);
                    }
                    (role, phase) => debug!("{key}: ignoring local description ({role:?}, {phase:?})"),
                }
            }
            MediaEventKind::RemoteAnswerApplied => {
                if s.negotiation == Negotiation::ApplyingAnswer {
                    s.negotiation = Negotiation::Complete;
                    transition(s, CallState::Active, tick, &mut cmds);
                }
            }
            MediaEventKind::NegotiationFailed(err) => {
                warn!("{key}: negotiation failed: {err}");
                self.fail(CallError::NegotiationFailed(err), &mut cmds);
            }
            MediaEventKind::LocalIceCandidate(candidate) => match s.call_id.clone() {
                Some(call_id) if s.local_description_sent => {
                    cmds.push(Command::Send(ClientMessage::SendIceCandidate { candidate, call_id }));
                }
                _ => s.pending_local_candidates.push(candidate),
            },
            MediaEventKind::ConnectionState(state) => match state {
                PeerConnectionState::Connected if s.state == CallState::Negotiating => {
                    transition(s, CallState::Active, tick, &mut cmds);
                }
                PeerConnectionState::Failed => {
                    warn!("{key}: peer connection failed");
                    self.fail(CallError::NegotiationFailed(NegotiationError::IceFailed), &mut cmds);
                }
                other => debug!("{key}: peer connection {other:?}"),
            },
            MediaEventKind::RemoteTrack => {
                if !s.remote_attached {
                    s.remote_attached = true;
                    cmds.push(media(key, MediaOp::AttachRemoteStream { volume }));
                }
            }
        }
        cmds
    }

    // ---- time ----

    /// Periodic tick: ring and negotiation timeouts.
    pub fn tick(&mut self) -> Vec<Command> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut cmds = Vec::new();
        let Some(s) = &self.session else {
            return cmds;
        };
        let elapsed = self.tick_count.saturating_sub(s.entered_tick);
        match s.state {
            CallState::Ringing if elapsed >= self.config.ring_timeout_ticks => {
                info!("{}: incoming call unanswered", s.key);
                if let Some(id) = s.call_id.clone() {
                    cmds.push(Command::Send(ClientMessage::DeclineCall(id)));
                }
                self.finish(EndReason::Unanswered, &mut cmds);
            }
            CallState::Dialing if elapsed >= self.config.ring_timeout_ticks => {
                info!("{}: no answer from {}", s.key, s.peer.display_name);
                self.finish(EndReason::Unanswered, &mut cmds);
            }
            CallState::Negotiating if elapsed >= self.config.negotiation_timeout_ticks => {
                warn!("{}: negotiation stalled", s.key);
                self.fail(CallError::NegotiationFailed(NegotiationError::Timeout), &mut cmds);
            }
            _ => {}
        }
        cmds
    }

    // ---- internals ----

    fn next_key(&mut self) -> SessionKey {
        self.last_key = self.last_key.next();
        self.last_key
    }

    fn push_roster(&self, cmds: &mut Vec<Command>) {
        cmds.push(Command::Report(CallEvent::RosterChanged(self.roster.snapshot())));
    }

    /// Tell the other side (if reachable) and end the session as failed.
    fn fail(&mut self, err: CallError, cmds: &mut Vec<Command>) {
        let Some(s) = &self.session else {
            return;
        };
        if self.connected {
            if let Some(id) = s.call_id.clone() {
                if s.role == CallRole::Callee && s.negotiation == Negotiation::Idle {
                    // AcceptCall never went out.
                    cmds.push(Command::Send(ClientMessage::DeclineCall(id)));
                } else if self.config.notify_hang_up {
                    cmds.push(Command::Send(ClientMessage::EndCall(id)));
                }
            }
        }
        self.finish(EndReason::Failed(err), cmds);
    }

    /// Release media and report the terminal state, then `Idle`.
    fn finish(&mut self, reason: EndReason, cmds: &mut Vec<Command>) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.media != MediaState::None {
            cmds.push(media(session.key, MediaOp::Release));
        }
        match &session.call_id {
            Some(id) => info!("{}: call {id} ended: {reason}", session.key),
            None => info!("{}: call ended: {reason}", session.key),
        }
        cmds.push(Command::Report(CallEvent::StateChanged(reason.terminal_state())));
        cmds.push(Command::Report(CallEvent::StateChanged(CallState::Idle)));
        cmds.push(Command::Report(CallEvent::CallEnded {
            call_id: session.call_id,
            reason,
        }));
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn media(session: SessionKey, op: MediaOp) -> Command {
    Command::Media(MediaCommand { session, op })
}

fn transition(s: &mut CallSession, state: CallState, tick: u64, cmds: &mut Vec<Command>) {
    if s.state == state {
        return;
    }
    info!("{}: {} -> {}", s.key, s.state, state);
    s.state = state;
    s.entered_tick = tick;
    cmds.push(Command::Report(CallEvent::StateChanged(state)));
}

/// Our outbound call, still waiting on the hub to relay the callee's reply.
fn awaiting_reply(s: &CallSession, call: &CallDescriptor) -> bool {
    s.role == CallRole::Caller
        && s.state == CallState::Dialing
        && s.media == MediaState::Ready
        && s.call_id.as_ref().map_or(true, |id| *id == call.call_id)
        && names_peer(call, &s.peer)
}

fn names_peer(call: &CallDescriptor, peer: &PeerIdentity) -> bool {
    call.to.display_name == peer.display_name || call.from.display_name == peer.display_name
}

fn flush_candidates(s: &mut CallSession, call_id: &CallId, cmds: &mut Vec<Command>) {
    s.local_description_sent = true;
    for candidate in s.pending_local_candidates.drain(..) {
        cmds.push(Command::Send(ClientMessage::SendIceCandidate {
            candidate,
            call_id: call_id.clone(),
        }));
    }
}

fn stale(what: &str, call_id: &CallId) {
    debug!("dropping stale {what} for call {call_id}");
}

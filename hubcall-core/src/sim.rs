//! In-memory hub and media stack driving several engines through a single FIFO.

use std::collections::{HashMap, VecDeque};

use crate::adapter::{ChannelEvent, MediaEvent, MediaEventKind};
use crate::engine::{CallEngine, CallEvent, Command, MediaOp};
use crate::protocol::{
    CallDescriptor, CallId, ClientMessage, IceCandidate, PeerIdentity, ServerMessage,
    SessionDescription,
};
use crate::session::{CallState, EndReason, SessionKey};

enum Input {
    Channel(ChannelEvent),
    Media(MediaEvent),
}

struct Client {
    name: String,
    engine: CallEngine,
    online: bool,
    events: Vec<CallEvent>,
    acquired: Vec<SessionKey>,
    released: Vec<SessionKey>,
    remote_candidates: Vec<IceCandidate>,
}

#[derive(Default)]
struct Hub {
    users: Vec<(usize, PeerIdentity)>,
    calls: HashMap<CallId, CallDescriptor>,
}

struct Sim {
    hub: Hub,
    clients: Vec<Client>,
    queue: VecDeque<(usize, Input)>,
}

impl Sim {
    /// All clients connected and registered.
    fn new(names: &[&str]) -> Self {
        let mut sim = Sim {
            hub: Hub::default(),
            clients: Vec::new(),
            queue: VecDeque::new(),
        };
        for (i, name) in names.iter().enumerate() {
            sim.clients.push(Client {
                name: name.to_string(),
                engine: CallEngine::new(),
                online: true,
                events: Vec::new(),
                acquired: Vec::new(),
                released: Vec::new(),
                remote_candidates: Vec::new(),
            });
            sim.deliver(i, ChannelEvent::Connected);
            sim.intent(i, |e| e.register(name).unwrap());
            sim.run();
        }
        sim
    }

    fn engine(&self, i: usize) -> &CallEngine {
        &self.clients[i].engine
    }

    fn intent(&mut self, i: usize, f: impl FnOnce(&mut CallEngine) -> Vec<Command>) {
        let cmds = f(&mut self.clients[i].engine);
        self.execute(i, cmds);
    }

    fn deliver(&mut self, i: usize, event: ChannelEvent) {
        let cmds = self.clients[i].engine.on_channel_event(event);
        self.execute(i, cmds);
    }

    fn run(&mut self) {
        let mut steps = 0;
        while let Some((i, input)) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "simulation did not settle");
            let engine = &mut self.clients[i].engine;
            let cmds = match input {
                Input::Channel(ev) => engine.on_channel_event(ev),
                Input::Media(ev) => engine.on_media_event(ev),
            };
            self.execute(i, cmds);
        }
    }

    fn tick_all(&mut self, n: u64) {
        for _ in 0..n {
            for i in 0..self.clients.len() {
                let cmds = self.clients[i].engine.tick();
                self.execute(i, cmds);
            }
            self.run();
        }
    }

    fn execute(&mut self, i: usize, cmds: Vec<Command>) {
        for cmd in cmds {
            match cmd {
                Command::Send(msg) => {
                    if self.clients[i].online {
                        self.route(i, msg);
                    }
                }
                Command::Media(m) => self.media(i, m.session, m.op),
                Command::Report(ev) => self.clients[i].events.push(ev),
            }
        }
    }

    fn post(&mut self, to: usize, msg: ServerMessage) {
        if self.clients[to].online {
            self.queue
                .push_back((to, Input::Channel(ChannelEvent::Message(msg))));
        }
    }

    fn route(&mut self, from: usize, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateUser(name) => {
                let peer = PeerIdentity::new(name, format!("conn-{from}-{}", self.hub.users.len()));
                self.hub.users.retain(|(idx, _)| *idx != from);
                self.hub.users.push((from, peer.clone()));
                for to in 0..self.clients.len() {
                    self.post(to, ServerMessage::CreatedUser(peer.clone()));
                }
            }
            ClientMessage::GetAllUsers => {
                let users = self.hub.users.iter().map(|(_, p)| p.clone()).collect();
                self.post(from, ServerMessage::Users(users));
            }
            ClientMessage::CallUser(name) => {
                let caller = self.user(from);
                let Some((to, callee)) = self
                    .hub
                    .users
                    .iter()
                    .find(|(_, p)| p.display_name == name)
                    .cloned()
                else {
                    return;
                };
                let call = CallDescriptor {
                    call_id: CallId::new(uuid::Uuid::new_v4().to_string()),
                    from: caller,
                    to: callee,
                };
                self.hub.calls.insert(call.call_id.clone(), call.clone());
                self.post(to, ServerMessage::CallingUser(call));
            }
            ClientMessage::AcceptCall(id) => self.relay(from, &id, ServerMessage::AcceptedCall),
            ClientMessage::DeclineCall(id) => self.relay(from, &id, ServerMessage::DeclinedCall),
            ClientMessage::EndCall(id) => self.relay(from, &id, ServerMessage::EndedCall),
            ClientMessage::SendOffer { offer, call_id } => {
                self.relay(from, &call_id, |call| ServerMessage::ReceiveOffer { offer, call })
            }
            ClientMessage::SendAnswer { answer, call_id } => {
                self.relay(from, &call_id, |call| ServerMessage::ReceiveAnswer { answer, call })
            }
            ClientMessage::SendIceCandidate { candidate, call_id } => {
                self.relay(from, &call_id, |call| ServerMessage::ReceiveIceCandidate {
                    candidate,
                    call,
                })
            }
        }
    }

    fn user(&self, idx: usize) -> PeerIdentity {
        self.hub
            .users
            .iter()
            .find(|(i, _)| *i == idx)
            .map(|(_, p)| p.clone())
            .unwrap()
    }

    /// Deliver to the other party of the call.
    fn relay(&mut self, from: usize, id: &CallId, build: impl FnOnce(CallDescriptor) -> ServerMessage) {
        let Some(call) = self.hub.calls.get(id).cloned() else {
            return;
        };
        let sender = self.user(from);
        let other = if sender.connection_id == call.from.connection_id {
            &call.to
        } else {
            &call.from
        };
        let Some(to) = self
            .hub
            .users
            .iter()
            .find(|(_, p)| p.connection_id == other.connection_id)
            .map(|(i, _)| *i)
        else {
            return;
        };
        self.post(to, build(call));
    }

    fn media(&mut self, i: usize, session: SessionKey, op: MediaOp) {
        let mut emit = |kind| self.queue.push_back((i, Input::Media(MediaEvent::new(session, kind))));
        match op {
            MediaOp::Acquire => {
                emit(MediaEventKind::Acquired);
                emit(MediaEventKind::LocalIceCandidate(IceCandidate::new(format!(
                    "candidate:{i}-{session}"
                ))));
                self.clients[i].acquired.push(session);
            }
            MediaOp::CreateOffer => emit(MediaEventKind::LocalDescription(SessionDescription::offer(
                format!("v=0 offer {session}"),
            ))),
            MediaOp::AcceptOffer(_) => {
                emit(MediaEventKind::LocalDescription(SessionDescription::answer(
                    format!("v=0 answer {session}"),
                )));
                emit(MediaEventKind::RemoteTrack);
            }
            MediaOp::ApplyAnswer(_) => {
                emit(MediaEventKind::RemoteAnswerApplied);
                emit(MediaEventKind::RemoteTrack);
            }
            MediaOp::AddIceCandidate(c) => self.clients[i].remote_candidates.push(c),
            MediaOp::Release => self.clients[i].released.push(session),
            MediaOp::AttachRemoteStream { .. } | MediaOp::SetMuted(_) | MediaOp::SetVolume(_) => {}
        }
    }

    fn incoming_call(&self, i: usize) -> Option<CallDescriptor> {
        self.clients[i].events.iter().rev().find_map(|e| match e {
            CallEvent::IncomingCall(call) => Some(call.clone()),
            _ => None,
        })
    }

    fn last_end(&self, i: usize) -> Option<&EndReason> {
        self.clients[i].events.iter().rev().find_map(|e| match e {
            CallEvent::CallEnded { reason, .. } => Some(reason),
            _ => None,
        })
    }

    fn call_id(&self, i: usize) -> Option<CallId> {
        self.engine(i).session().and_then(|s| s.call_id.clone())
    }

    fn assert_media_balanced(&self, i: usize) {
        let c = &self.clients[i];
        if c.engine.session().is_none() {
            assert_eq!(c.acquired, c.released, "{}: every handle released", c.name);
        }
    }

    fn assert_self_never_listed(&self) {
        for c in &self.clients {
            for ev in &c.events {
                if let CallEvent::RosterChanged(snap) = ev {
                    assert!(snap.iter().all(|p| p.display_name != c.name));
                }
            }
        }
    }
}

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;

fn establish(sim: &mut Sim, from: usize, to: usize) {
    let name = sim.clients[to].name.clone();
    sim.intent(from, |e| e.dial(&name).unwrap());
    sim.run();
    assert_eq!(sim.engine(to).state(), CallState::Ringing);
    sim.intent(to, |e| e.accept().unwrap());
    sim.run();
}

#[test]
fn dial_accept_round_trip() {
    let mut sim = Sim::new(&["alice", "bob"]);
    assert_eq!(sim.engine(A).roster().len(), 1);

    sim.intent(A, |e| e.dial("bob").unwrap());
    sim.run();
    assert_eq!(sim.engine(A).state(), CallState::Dialing);
    assert_eq!(sim.engine(B).state(), CallState::Ringing);
    let incoming = sim.incoming_call(B).unwrap();
    assert_eq!(incoming.from.display_name, "alice");
    assert_eq!(sim.call_id(B), Some(incoming.call_id.clone()));

    sim.intent(B, |e| e.accept().unwrap());
    sim.run();
    assert_eq!(sim.engine(A).state(), CallState::Active);
    assert_eq!(sim.engine(B).state(), CallState::Active);
    assert_eq!(sim.call_id(A), Some(incoming.call_id.clone()));
    assert_eq!(sim.call_id(B), Some(incoming.call_id));
    // Candidates gathered early are delivered once descriptions are out.
    assert_eq!(sim.clients[A].remote_candidates.len(), 1);
    assert_eq!(sim.clients[B].remote_candidates.len(), 1);

    sim.intent(A, |e| e.hang_up());
    sim.run();
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    assert_eq!(sim.engine(B).state(), CallState::Idle);
    assert_eq!(sim.last_end(A), Some(&EndReason::LocalHangUp));
    assert_eq!(sim.last_end(B), Some(&EndReason::RemoteHangUp));
    sim.assert_media_balanced(A);
    sim.assert_media_balanced(B);
    sim.assert_self_never_listed();
}

#[test]
fn decline_reaches_caller() {
    let mut sim = Sim::new(&["alice", "bob"]);
    sim.intent(A, |e| e.dial("bob").unwrap());
    sim.run();
    sim.intent(B, |e| e.decline().unwrap());
    sim.run();
    assert_eq!(sim.last_end(A), Some(&EndReason::RemoteDeclined));
    assert_eq!(sim.last_end(B), Some(&EndReason::Declined));
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    sim.assert_media_balanced(A);
}

#[test]
fn busy_peer_auto_declines() {
    let mut sim = Sim::new(&["alice", "bob", "carol"]);
    establish(&mut sim, B, C);
    assert_eq!(sim.engine(B).state(), CallState::Active);

    sim.intent(A, |e| e.dial("bob").unwrap());
    sim.run();
    assert_eq!(sim.last_end(A), Some(&EndReason::RemoteDeclined));
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    assert_eq!(sim.engine(B).state(), CallState::Active);
    assert!(sim.incoming_call(B).is_none());
    sim.assert_media_balanced(A);
}

#[test]
fn channel_drop_fails_dial_and_drops_stray_accept() {
    let mut sim = Sim::new(&["alice", "bob"]);
    sim.intent(A, |e| e.dial("bob").unwrap());
    sim.run();
    let old = sim.incoming_call(B).unwrap();

    sim.clients[A].online = false;
    sim.deliver(A, ChannelEvent::Reconnecting);
    sim.run();
    assert!(matches!(sim.last_end(A), Some(EndReason::Failed(_))));
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    assert!(sim.engine(A).roster().is_empty());
    sim.assert_media_balanced(A);

    sim.clients[A].online = true;
    sim.deliver(A, ChannelEvent::Connected);
    sim.run();
    assert_eq!(sim.engine(A).roster().len(), 1);

    let events_before = sim.clients[A].events.len();
    sim.post(A, ServerMessage::AcceptedCall(old));
    sim.run();
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    assert_eq!(sim.clients[A].events.len(), events_before);
}

#[test]
fn candidates_for_previous_call_dropped() {
    let mut sim = Sim::new(&["alice", "bob"]);
    establish(&mut sim, A, B);
    let first = sim.call_id(A).unwrap();
    sim.intent(B, |e| e.hang_up());
    sim.run();

    establish(&mut sim, A, B);
    let second = sim.call_id(A).unwrap();
    assert_ne!(first, second);
    let before = sim.clients[A].remote_candidates.len();
    let call = |id: &CallId| CallDescriptor {
        call_id: id.clone(),
        from: sim.user(A),
        to: sim.user(B),
    };
    let (old_call, new_call) = (call(&first), call(&second));
    for n in 0..3 {
        sim.post(
            A,
            ServerMessage::ReceiveIceCandidate {
                candidate: IceCandidate::new(format!("candidate:stale-{n}")),
                call: old_call.clone(),
            },
        );
    }
    sim.post(
        A,
        ServerMessage::ReceiveIceCandidate {
            candidate: IceCandidate::new("candidate:fresh"),
            call: new_call,
        },
    );
    sim.run();
    let applied = &sim.clients[A].remote_candidates[before..];
    assert_eq!(applied, &[IceCandidate::new("candidate:fresh")]);
    assert_eq!(sim.engine(A).state(), CallState::Active);
}

#[test]
fn unanswered_call_times_out_on_both_sides() {
    let mut sim = Sim::new(&["alice", "bob"]);
    sim.intent(A, |e| e.dial("bob").unwrap());
    sim.run();
    sim.tick_all(crate::engine::DEFAULT_RING_TIMEOUT_TICKS);
    assert_eq!(sim.engine(A).state(), CallState::Idle);
    assert_eq!(sim.engine(B).state(), CallState::Idle);
    assert_eq!(sim.last_end(B), Some(&EndReason::Unanswered));
    sim.assert_media_balanced(A);
}

#[test]
fn peer_disconnect_ends_call() {
    let mut sim = Sim::new(&["alice", "bob"]);
    establish(&mut sim, A, B);
    let bob = sim.user(B);
    sim.post(A, ServerMessage::UserDisconnected(bob));
    sim.run();
    assert_eq!(sim.last_end(A), Some(&EndReason::PeerDisconnected));
    assert!(sim.engine(A).roster().is_empty());
    sim.assert_media_balanced(A);
}

//! Single-task event loop owning the call engine. Every engine input funnels through here,
//! so engine state is never touched concurrently.

use std::sync::Arc;
use std::time::Duration;

use hubcall_core::{
    CallEngine, CallEvent, CallId, CallState, ChannelEvent, Command, IntentError, MediaCommand,
    MediaEvent, PresenceChannel, RosterSnapshot,
};
use log::{debug, warn};
use tokio::sync::{mpsc, watch};

const TICK: Duration = Duration::from_secs(1);

/// User intents from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Register(String),
    RefreshRoster,
    Dial(String),
    Accept,
    Decline,
    HangUp,
    SetMuted(bool),
    /// Percent, 0–100.
    SetVolume(u8),
}

/// What the controller gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Event(CallEvent),
    Rejected(IntentError),
}

/// Snapshot for status display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub name: Option<String>,
    pub connected: bool,
    pub state: CallState,
    pub peer: Option<String>,
    pub call_id: Option<CallId>,
    pub muted: bool,
    pub volume: u8,
}

pub struct Driver<C: PresenceChannel> {
    engine: CallEngine,
    channel: Arc<C>,
    media: mpsc::UnboundedSender<MediaCommand>,
    output: mpsc::UnboundedSender<Output>,
    roster_tx: watch::Sender<RosterSnapshot>,
    status_tx: watch::Sender<Status>,
}

impl<C: PresenceChannel> Driver<C> {
    pub fn new(
        engine: CallEngine,
        channel: Arc<C>,
        media: mpsc::UnboundedSender<MediaCommand>,
        output: mpsc::UnboundedSender<Output>,
    ) -> Self {
        let (roster_tx, _) = watch::channel(engine.roster());
        let (status_tx, _) = watch::channel(Status::default());
        let mut driver = Self {
            engine,
            channel,
            media,
            output,
            roster_tx,
            status_tx,
        };
        driver.publish_status();
        driver
    }

    pub fn roster(&self) -> watch::Receiver<RosterSnapshot> {
        self.roster_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Run until shutdown, the intent stream closes, or the channel subscription ends.
    /// A call in progress is hung up on the way out.
    pub async fn run(
        mut self,
        channel_events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
        loop {
            let cmds = tokio::select! {
                _ = shutdown.changed() => break,
                ev = channel_events.recv() => match ev {
                    Some(ev) => self.engine.on_channel_event(ev),
                    None => break,
                },
                Some(ev) = media_events.recv() => self.engine.on_media_event(ev),
                intent = intents.recv() => match intent {
                    Some(intent) => match self.handle_intent(intent) {
                        Ok(cmds) => cmds,
                        Err(e) => {
                            let _ = self.output.send(Output::Rejected(e));
                            continue;
                        }
                    },
                    None => break,
                },
                _ = tick.tick() => self.engine.tick(),
            };
            self.execute(cmds).await;
        }
        let cmds = self.engine.hang_up();
        self.execute(cmds).await;
        debug!("driver stopped");
    }

    pub fn handle_intent(&mut self, intent: Intent) -> Result<Vec<Command>, IntentError> {
        let e = &mut self.engine;
        match intent {
            Intent::Register(name) => e.register(&name),
            Intent::RefreshRoster => e.refresh_roster(),
            Intent::Dial(name) => e.dial(&name),
            Intent::Accept => e.accept(),
            Intent::Decline => e.decline(),
            Intent::HangUp => Ok(e.hang_up()),
            Intent::SetMuted(muted) => Ok(e.set_muted(muted)),
            Intent::SetVolume(percent) => Ok(e.set_volume(percent)),
        }
    }

    async fn execute(&mut self, cmds: Vec<Command>) {
        for cmd in cmds {
            match cmd {
                Command::Send(msg) => {
                    if let Err(e) = self.channel.send(&msg).await {
                        warn!("send {}: {e}", msg.target());
                    }
                }
                Command::Media(m) => {
                    if self.media.send(m).is_err() {
                        warn!("media worker gone");
                    }
                }
                Command::Report(ev) => {
                    if let CallEvent::RosterChanged(snapshot) = &ev {
                        self.roster_tx.send_replace(Arc::clone(snapshot));
                    }
                    let _ = self.output.send(Output::Event(ev));
                }
            }
        }
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let session = self.engine.session();
        let next = Status {
            name: self.engine.local_name().map(str::to_string),
            connected: self.engine.is_connected(),
            state: self.engine.state(),
            peer: session.map(|s| s.peer.display_name.clone()),
            call_id: session.and_then(|s| s.call_id.clone()),
            muted: self.engine.is_muted(),
            volume: (self.engine.volume() * 100.0).round() as u8,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

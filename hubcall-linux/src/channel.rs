//! Presence channel: hub connection over WebSocket with the JSON hub protocol.
//! Negotiate, handshake, keepalive, automatic reconnect, named handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hubcall_core::protocol::SERVER_TARGETS;
use hubcall_core::wire::{self, FrameDecodeError, HubFrame};
use hubcall_core::{ChannelError, ChannelEvent, ClientMessage, PresenceChannel, ServerMessage};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const SERVER_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on negotiate, WebSocket open and handshake together.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Delays before each reconnect attempt; exhausted means disconnected.
const RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Named-event handler. Receives the invocation's positional arguments.
pub type Handler = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0}")]
    UnsupportedScheme(String),
    #[error("negotiate: {0}")]
    Http(#[from] reqwest::Error),
    #[error("negotiate rejected: {0}")]
    Negotiate(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake: {0}")]
    Handshake(#[from] FrameDecodeError),
    #[error("connect timed out")]
    Timeout,
    #[error("connection closed during handshake")]
    Closed,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Keyed by lowercased target.
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
    listeners: Vec<(HandlerId, mpsc::UnboundedSender<ChannelEvent>)>,
}

impl Registry {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

struct Shared {
    url: Url,
    http: reqwest::Client,
    registry: Mutex<Registry>,
    /// Frames to write; present while a transport is up.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn dispatch(&self, target: &str, arguments: &[Value]) {
        let handlers: Vec<Handler> = self
            .registry()
            .handlers
            .get(&target.to_ascii_lowercase())
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!("no handler for hub method {target}");
        }
        for h in handlers {
            h(arguments);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        self.registry()
            .listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn remove_handler(&self, target: &str, id: HandlerId) {
        let mut reg = self.registry();
        let key = target.to_ascii_lowercase();
        if let Some(hs) = reg.handlers.get_mut(&key) {
            hs.retain(|(h, _)| *h != id);
            if hs.is_empty() {
                reg.handlers.remove(&key);
            }
        }
    }
}

/// Connection to one hub. Handlers registered with [`on`](Self::on) live until
/// [`off`](Self::off), subscription drop, or [`stop`](Self::stop).
pub struct HubConnection {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubConnection {
    pub fn new(url: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(url)?;
        websocket_url(&url, None)?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                url,
                http: reqwest::Client::new(),
                registry: Mutex::new(Registry::default()),
                outbound: Mutex::new(None),
            }),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Subscribe, then start. The subscription sees the initial `Connected`.
    pub async fn connect(url: &str) -> Result<(Self, Subscription), ConnectError> {
        let conn = Self::new(url)?;
        let events = conn.events();
        conn.start().await?;
        Ok((conn, events))
    }

    /// First connect is awaited; reconnects afterwards run in the background.
    pub async fn start(&self) -> Result<(), ConnectError> {
        if self.lock_task().is_some() {
            return Ok(());
        }
        let link = establish(&self.shared).await?;
        info!("connected to hub {}", self.shared.url);
        go_live(&self.shared, &link);
        let shared = Arc::clone(&self.shared);
        let stop_rx = self.stop_tx.subscribe();
        *self.lock_task() = Some(tokio::spawn(supervise(shared, link, stop_rx)));
        Ok(())
    }

    /// Close the transport and drop every handler and listener.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.lock_task().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut reg = self.shared.registry();
        reg.handlers.clear();
        reg.listeners.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound().is_some()
    }

    pub fn on(
        &self,
        target: &str,
        handler: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> HandlerId {
        let mut reg = self.shared.registry();
        let id = reg.allocate();
        reg.handlers
            .entry(target.to_ascii_lowercase())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove every handler for `target`.
    pub fn off(&self, target: &str) {
        self.shared
            .registry()
            .handlers
            .remove(&target.to_ascii_lowercase());
    }

    pub fn remove_handler(&self, target: &str, id: HandlerId) {
        self.shared.remove_handler(target, id);
    }

    /// Lifecycle events plus every known server message, typed.
    pub fn events(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = Vec::with_capacity(SERVER_TARGETS.len());
        for &target in SERVER_TARGETS {
            let tx = tx.clone();
            let id = self.on(target, move |args| {
                match ServerMessage::from_invocation(target, args) {
                    Ok(msg) => {
                        let _ = tx.send(ChannelEvent::Message(msg));
                    }
                    Err(e) => warn!("dropping {target}: {e}"),
                }
            });
            handlers.push((target, id));
        }
        let listener = {
            let mut reg = self.shared.registry();
            let id = reg.allocate();
            reg.listeners.push((id, tx));
            id
        };
        Subscription {
            shared: Arc::clone(&self.shared),
            handlers,
            listener,
            rx,
        }
    }

    /// Fire-and-forget invocation.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), ChannelError> {
        let frame = wire::encode_frame(&HubFrame::Invocation {
            target: target.to_string(),
            arguments,
        })?;
        self.write(frame)
    }

    fn write(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        let tx = self.shared.outbound().ok_or(ChannelError::NotConnected)?;
        tx.send(frame)
            .map_err(|_| ChannelError::Send("transport closed".into()))
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PresenceChannel for HubConnection {
    async fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
        debug!("-> {}", msg.target());
        self.write(wire::encode_message(msg)?)
    }

    async fn close(&self) {
        self.stop().await;
    }
}

/// Handlers and lifecycle listener registered by [`HubConnection::events`]; deregistered on drop.
pub struct Subscription {
    shared: Arc<Shared>,
    handlers: Vec<(&'static str, HandlerId)>,
    listener: HandlerId,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn receiver(&mut self) -> &mut mpsc::UnboundedReceiver<ChannelEvent> {
        &mut self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for (target, id) in &self.handlers {
            self.shared.remove_handler(target, *id);
        }
        let listener = self.listener;
        self.shared
            .registry()
            .listeners
            .retain(|(id, _)| *id != listener);
    }
}

// ---- transport ----

/// Open transport plus any frames that arrived with the handshake response.
struct Link {
    ws: WsStream,
    pending: Vec<u8>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Install the link's writer before announcing it, so sends made on `Connected` are queued.
fn go_live(shared: &Shared, link: &Link) {
    shared.set_outbound(Some(link.outbound_tx.clone()));
    shared.emit(ChannelEvent::Connected);
}

enum Ended {
    Stopped,
    Closed {
        error: Option<String>,
        allow_reconnect: bool,
    },
    Lost(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn negotiate_url(base: &Url) -> Url {
    let mut u = base.clone();
    let path = format!("{}/negotiate", u.path().trim_end_matches('/'));
    u.set_path(&path);
    u.query_pairs_mut().append_pair("negotiateVersion", "1");
    u
}

fn websocket_url(base: &Url, token: Option<&str>) -> Result<Url, ConnectError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    };
    let mut u = base.clone();
    u.set_scheme(scheme)
        .map_err(|_| ConnectError::UnsupportedScheme(base.scheme().to_string()))?;
    if let Some(token) = token {
        u.query_pairs_mut().append_pair("id", token);
    }
    Ok(u)
}

async fn negotiate(shared: &Shared) -> Result<Option<String>, ConnectError> {
    if matches!(shared.url.scheme(), "ws" | "wss") {
        return Ok(None);
    }
    let resp: NegotiateResponse = shared
        .http
        .post(negotiate_url(&shared.url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if let Some(error) = resp.error {
        return Err(ConnectError::Negotiate(error));
    }
    if let Some(redirect) = resp.url {
        return Err(ConnectError::Negotiate(format!("redirect to {redirect} not supported")));
    }
    Ok(resp.connection_token.or(resp.connection_id))
}

async fn establish(shared: &Shared) -> Result<Link, ConnectError> {
    tokio::time::timeout(CONNECT_TIMEOUT, open_link(shared))
        .await
        .map_err(|_| ConnectError::Timeout)?
}

async fn open_link(shared: &Shared) -> Result<Link, ConnectError> {
    let token = negotiate(shared).await?;
    let url = websocket_url(&shared.url, token.as_deref())?;
    debug!("opening {url}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    ws.send(Message::Text(
        String::from_utf8_lossy(&wire::handshake_request()).into_owned(),
    ))
    .await?;

    let mut buf = Vec::new();
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(t))) => buf.extend_from_slice(t.as_bytes()),
            Some(Ok(Message::Binary(b))) => buf.extend_from_slice(&b),
            Some(Ok(Message::Close(_))) | None => return Err(ConnectError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
        match wire::decode_handshake_response(&buf) {
            Ok(n) => {
                buf.drain(..n);
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                return Ok(Link {
                    ws,
                    pending: buf,
                    outbound_tx,
                    outbound_rx,
                });
            }
            Err(FrameDecodeError::NeedMore) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Runs until stopped, closed without reconnect, or the reconnect schedule is exhausted.
async fn supervise(shared: Arc<Shared>, mut link: Link, mut stop: watch::Receiver<bool>) {
    loop {
        match pump(&shared, link, &mut stop).await {
            Ended::Stopped => {
                shared.set_outbound(None);
                shared.emit(ChannelEvent::Disconnected);
                return;
            }
            Ended::Closed {
                error,
                allow_reconnect: false,
            } => {
                shared.set_outbound(None);
                info!("hub closed the connection: {}", error.as_deref().unwrap_or("no reason"));
                shared.emit(ChannelEvent::Disconnected);
                return;
            }
            Ended::Closed { error, .. } => {
                warn!("hub closed the connection, reconnecting: {}", error.as_deref().unwrap_or("no reason"));
            }
            Ended::Lost(reason) => warn!("hub connection lost: {reason}"),
        }
        shared.set_outbound(None);
        shared.emit(ChannelEvent::Reconnecting);
        match reconnect(&shared, &mut stop).await {
            Some(next) => {
                info!("reconnected to hub");
                go_live(&shared, &next);
                link = next;
            }
            None => {
                shared.emit(ChannelEvent::Disconnected);
                return;
            }
        }
    }
}

async fn reconnect(shared: &Shared, stop: &mut watch::Receiver<bool>) -> Option<Link> {
    for (attempt, delay) in RECONNECT_DELAYS.iter().enumerate() {
        tokio::select! {
            _ = tokio::time::sleep(*delay) => {}
            _ = stop.changed() => return None,
        }
        let result = tokio::select! {
            r = establish(shared) => r,
            _ = stop.changed() => return None,
        };
        match result {
            Ok(link) => return Some(link),
            Err(e) => warn!("reconnect attempt {} failed: {e}", attempt + 1),
        }
    }
    None
}

/// Drive one transport: write queued frames, read and dispatch, keep alive.
async fn pump(shared: &Shared, link: Link, stop: &mut watch::Receiver<bool>) -> Ended {
    let Link {
        ws,
        pending,
        outbound_rx: mut rx,
        ..
    } = link;
    let (mut sink, mut stream) = ws.split();

    let mut buf = pending;
    if let Some(ended) = dispatch_frames(shared, &mut buf) {
        return ended;
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    let mut last_seen = Instant::now();
    let ping = match wire::encode_frame(&HubFrame::Ping) {
        Ok(f) => String::from_utf8_lossy(&f).into_owned(),
        Err(e) => return Ended::Lost(e.to_string()),
    };

    loop {
        tokio::select! {
            _ = stop.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ended::Stopped;
            }
            Some(frame) = rx.recv() => {
                let text = String::from_utf8_lossy(&frame).into_owned();
                if let Err(e) = sink.send(Message::Text(text)).await {
                    return Ended::Lost(e.to_string());
                }
            }
            _ = keepalive.tick() => {
                if last_seen.elapsed() >= SERVER_TIMEOUT {
                    return Ended::Lost("server timeout".into());
                }
                if let Err(e) = sink.send(Message::Text(ping.clone())).await {
                    return Ended::Lost(e.to_string());
                }
            }
            msg = stream.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(t))) => buf.extend_from_slice(t.as_bytes()),
                    Some(Ok(Message::Binary(b))) => buf.extend_from_slice(&b),
                    Some(Ok(Message::Close(_))) | None => return Ended::Lost("closed by server".into()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                }
                if let Some(ended) = dispatch_frames(shared, &mut buf) {
                    return ended;
                }
            }
        }
    }
}

fn dispatch_frames(shared: &Shared, buf: &mut Vec<u8>) -> Option<Ended> {
    let frames = match drain_frames(buf) {
        Ok(frames) => frames,
        Err(e) => return Some(Ended::Lost(e.to_string())),
    };
    for frame in frames {
        match frame {
            HubFrame::Invocation { target, arguments } => {
                debug!("<- {target}");
                shared.dispatch(&target, &arguments);
            }
            HubFrame::Close {
                error,
                allow_reconnect,
            } => {
                return Some(Ended::Closed {
                    error,
                    allow_reconnect,
                })
            }
            HubFrame::Ping => {}
            other => debug!("ignoring hub frame {other:?}"),
        }
    }
    None
}

/// Split complete records off the front of `buf`. Malformed records are skipped.
fn drain_frames(buf: &mut Vec<u8>) -> Result<Vec<HubFrame>, FrameDecodeError> {
    let mut frames = Vec::new();
    loop {
        match wire::decode_frame(buf) {
            Ok((frame, n)) => {
                buf.drain(..n);
                frames.push(frame);
            }
            Err(FrameDecodeError::NeedMore) => return Ok(frames),
            Err(FrameDecodeError::TooLarge) => return Err(FrameDecodeError::TooLarge),
            Err(e) => {
                warn!("skipping malformed hub frame: {e}");
                match buf.iter().position(|&b| b == wire::RECORD_SEPARATOR) {
                    Some(end) => {
                        buf.drain(..=end);
                    }
                    None => return Ok(frames),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubcall_core::CallId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call_json() -> Value {
        json!({
            "callId": "c-9",
            "from": { "userName": "alice", "connectionId": "a1" },
            "to": { "userName": "bob", "connectionId": "b1" }
        })
    }

    #[test]
    fn url_mapping() {
        let base = Url::parse("https://calls.example.org/hub").unwrap();
        assert_eq!(
            negotiate_url(&base).as_str(),
            "https://calls.example.org/hub/negotiate?negotiateVersion=1"
        );
        assert_eq!(
            websocket_url(&base, Some("tok")).unwrap().as_str(),
            "wss://calls.example.org/hub?id=tok"
        );
        let plain = Url::parse("http://localhost:5000/hub/").unwrap();
        assert_eq!(
            negotiate_url(&plain).as_str(),
            "http://localhost:5000/hub/negotiate?negotiateVersion=1"
        );
        assert!(websocket_url(&plain, None).unwrap().as_str().starts_with("ws://"));
        assert!(matches!(
            HubConnection::new("ftp://example.org/hub"),
            Err(ConnectError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn drain_keeps_partial_and_skips_garbage() {
        let mut buf = b"{\"type\":6}\x1e{oops}\x1e{\"type\":1,\"target\":\"Users\",\"arguments\":[[]]}\x1e{\"type\":".to_vec();
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], HubFrame::Ping);
        assert_eq!(buf, b"{\"type\":");
    }

    #[tokio::test]
    async fn subscription_receives_typed_messages() {
        let conn = HubConnection::new("http://localhost:5000/hub").unwrap();
        let mut events = conn.events();
        conn.shared.dispatch("callinguser", &[call_json()]);
        conn.shared.emit(ChannelEvent::Reconnecting);
        match events.recv().await {
            Some(ChannelEvent::Message(ServerMessage::CallingUser(call))) => {
                assert_eq!(call.call_id, CallId::new("c-9"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.recv().await, Some(ChannelEvent::Reconnecting));
    }

    #[tokio::test]
    async fn dropping_subscription_deregisters() {
        let conn = HubConnection::new("http://localhost:5000/hub").unwrap();
        let events = conn.events();
        assert_eq!(conn.shared.registry().handlers.len(), SERVER_TARGETS.len());
        drop(events);
        assert!(conn.shared.registry().handlers.is_empty());
        assert!(conn.shared.registry().listeners.is_empty());
    }

    #[test]
    fn on_and_off() {
        let conn = HubConnection::new("http://localhost:5000/hub").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = conn.on("EndedCall", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        conn.on("endedcall", move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        });
        conn.shared.dispatch("EndedCall", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        conn.remove_handler("ENDEDCALL", id);
        conn.shared.dispatch("EndedCall", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 21);

        conn.off("EndedCall");
        conn.shared.dispatch("EndedCall", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }

    #[tokio::test]
    async fn send_without_transport_fails() {
        let conn = HubConnection::new("http://localhost:5000/hub").unwrap();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(&ClientMessage::GetAllUsers).await,
            Err(ChannelError::NotConnected)
        ));
    }

    // ---- loopback hub ----

    const HANDSHAKE_OK: &str = "{}\u{1e}";

    async fn listener() -> (tokio::net::TcpListener, String) {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/hub", l.local_addr().unwrap());
        (l, url)
    }

    /// Accept one client, check its handshake and answer with `reply`.
    async fn accept(l: &tokio::net::TcpListener, reply: &str) -> WebSocketStream<TcpStream> {
        let (tcp, _) = l.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(t))) => assert!(t.contains("\"protocol\":\"json\""), "{t}"),
            other => panic!("expected handshake, got {other:?}"),
        }
        ws.send(Message::Text(reply.to_string())).await.unwrap();
        ws
    }

    /// Text messages the client sends until it goes away.
    async fn drain(mut ws: WebSocketStream<TcpStream>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(t) = msg {
                seen.push(t);
            }
        }
        seen
    }

    #[tokio::test]
    async fn send_on_connected_reaches_hub() {
        let (l, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut ws = accept(&l, HANDSHAKE_OK).await;
            match ws.next().await {
                Some(Ok(Message::Text(t))) => t,
                other => panic!("unexpected {other:?}"),
            }
        });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        // Nothing has polled the connection task yet; the send must still be accepted.
        conn.send(&ClientMessage::CreateUser("alice".into()))
            .await
            .unwrap();
        let text = hub.await.unwrap();
        assert!(text.contains("\"target\":\"CreateUser\""), "{text}");
        assert!(text.contains("\"alice\""));
        conn.stop().await;
    }

    #[tokio::test]
    async fn frames_with_handshake_response_are_dispatched() {
        let (l, url) = listener().await;
        let reply = concat!(
            "{}\u{1e}",
            r#"{"type":1,"target":"Users","arguments":[[{"userName":"bob","connectionId":"b1"}]]}"#,
            "\u{1e}"
        );
        let hub = tokio::spawn(async move { drain(accept(&l, reply).await).await });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        match events.recv().await {
            Some(ChannelEvent::Message(ServerMessage::Users(users))) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].display_name, "bob");
                assert_eq!(users[0].connection_id, "b1");
            }
            other => panic!("unexpected {other:?}"),
        }
        conn.stop().await;
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected));
        hub.await.unwrap();
    }

    #[tokio::test]
    async fn close_without_reconnect_disconnects() {
        let (l, url) = listener().await;
        let reply = "{}\u{1e}{\"type\":7,\"error\":\"server shutting down\"}\u{1e}";
        let hub = tokio::spawn(async move { drain(accept(&l, reply).await).await });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(&ClientMessage::GetAllUsers).await,
            Err(ChannelError::NotConnected)
        ));
        conn.stop().await;
        hub.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transport_reconnects() {
        let (l, url) = listener().await;
        let hub = tokio::spawn(async move {
            drop(accept(&l, HANDSHAKE_OK).await);
            let mut ws = accept(&l, HANDSHAKE_OK).await;
            match ws.next().await {
                Some(Ok(Message::Text(t))) => t,
                other => panic!("unexpected {other:?}"),
            }
        });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(events.recv().await, Some(ChannelEvent::Reconnecting));
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        conn.send(&ClientMessage::GetAllUsers).await.unwrap();
        let text = hub.await.unwrap();
        assert!(text.contains("\"target\":\"GetAllUsers\""), "{text}");
        conn.stop().await;
    }

    #[tokio::test]
    async fn reconnect_schedule_exhausted_disconnects() {
        let (l, url) = listener().await;
        let hub = tokio::spawn(async move {
            // Hang up and stop listening; every reconnect attempt is refused.
            drop(accept(&l, HANDSHAKE_OK).await);
        });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        hub.await.unwrap();
        tokio::time::pause();
        assert_eq!(events.recv().await, Some(ChannelEvent::Reconnecting));
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected));
        assert!(!conn.is_connected());
        conn.stop().await;
    }

    #[tokio::test]
    async fn silent_hub_is_pinged_then_timed_out() {
        let (l, url) = listener().await;
        let hub = tokio::spawn(async move { drain(accept(&l, HANDSHAKE_OK).await).await });
        let (conn, mut events) = HubConnection::connect(&url).await.unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        tokio::time::pause();
        assert_eq!(events.recv().await, Some(ChannelEvent::Reconnecting));
        conn.stop().await;

        let ping = String::from_utf8(wire::encode_frame(&HubFrame::Ping).unwrap()).unwrap();
        let seen = hub.await.unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|t| *t == ping), "{seen:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_hub_times_out() {
        // Accepts TCP through the backlog but never answers the upgrade.
        let (_l, url) = listener().await;
        match HubConnection::connect(&url).await {
            Err(e) => assert!(matches!(e, ConnectError::Timeout), "{e}"),
            Ok(_) => panic!("connected to a silent hub"),
        }
    }

    #[tokio::test]
    async fn stop_drops_handlers() {
        let conn = HubConnection::new("http://localhost:5000/hub").unwrap();
        conn.on("Users", |_| {});
        let _events = conn.events();
        conn.stop().await;
        assert!(conn.shared.registry().handlers.is_empty());
    }
}

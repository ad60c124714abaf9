//! WebRTC media backend: one peer connection and one Opus send track per session.
//!
//! The send track carries Opus silence frames every 20 ms (skipped while muted). The remote
//! track is drained and metered at the configured volume; there is no audio device output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hubcall_core::{
    IceCandidate, MediaBackend, MediaError, MediaEvent, MediaEventKind, MediaEventSink,
    NegotiationError, PeerConnectionState, SessionDescription, SessionKey,
};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const FRAME: Duration = Duration::from_millis(20);
/// Opus TOC for a 20 ms silent frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

pub struct WebRtcBackend {
    api: API,
    ice_servers: Vec<String>,
    audio_enabled: bool,
    peers: Mutex<HashMap<SessionKey, Peer>>,
}

struct Peer {
    pc: Arc<RTCPeerConnection>,
    muted: Arc<AtomicBool>,
    /// f32 bits.
    volume: Arc<AtomicU32>,
    remote: Arc<Mutex<Option<Arc<TrackRemote>>>>,
    received: Arc<AtomicU64>,
    pump: JoinHandle<()>,
    playback: Option<JoinHandle<()>>,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<String>, audio_enabled: bool) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            audio_enabled,
            peers: Mutex::new(HashMap::new()),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    fn pc(&self, session: SessionKey) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        self.with_peer(session, |p| Arc::clone(&p.pc))
            .ok_or_else(|| NegotiationError::Backend(format!("{session}: no peer connection")))
    }

    fn with_peer<T>(&self, session: SessionKey, f: impl FnOnce(&mut Peer) -> T) -> Option<T> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get_mut(&session).map(f)
    }

    /// Bytes received on the remote track so far.
    pub fn received_bytes(&self, session: SessionKey) -> Option<u64> {
        self.with_peer(session, |p| p.received.load(Ordering::Relaxed))
    }
}

fn backend_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Backend(e.to_string())
}

fn rejected(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Rejected(e.to_string())
}

fn map_state(s: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match s {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn local_candidate(c: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = c.to_json().ok()?;
    Some(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

fn spawn_silence_pump(track: Arc<TrackLocalStaticSample>, muted: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME);
        loop {
            ticker.tick().await;
            if muted.load(Ordering::Relaxed) {
                continue;
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: FRAME,
                ..Default::default()
            };
            // Fails until the transport is up; keep pacing.
            let _ = track.write_sample(&sample).await;
        }
    })
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire(&self, session: SessionKey, sink: MediaEventSink) -> Result<(), MediaError> {
        if !self.audio_enabled {
            return Err(MediaError::NoDevice);
        }
        if self.with_peer(session, |_| ()).is_some() {
            return Ok(());
        }
        let backend = |e: webrtc::Error| MediaError::Backend(e.to_string());
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(backend)?,
        );

        let state_sink = Arc::clone(&sink);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("{session}: peer connection {s}");
            if let Some(state) = map_state(s) {
                state_sink(MediaEvent::new(session, MediaEventKind::ConnectionState(state)));
            }
            Box::pin(async {})
        }));

        let ice_sink = Arc::clone(&sink);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate.as_ref().and_then(local_candidate) {
                ice_sink(MediaEvent::new(session, MediaEventKind::LocalIceCandidate(c)));
            }
            Box::pin(async {})
        }));

        let remote = Arc::new(Mutex::new(None));
        let remote_slot = Arc::clone(&remote);
        let track_sink = Arc::clone(&sink);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            info!("{session}: remote track {}", track.codec().capability.mime_type);
            *remote_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(track);
            track_sink(MediaEvent::new(session, MediaEventKind::RemoteTrack));
            Box::pin(async {})
        }));

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            format!("hubcall-{}", session.get()),
        ));
        if let Err(e) = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            let _ = pc.close().await;
            return Err(backend(e));
        }

        let muted = Arc::new(AtomicBool::new(false));
        let pump = spawn_silence_pump(track, Arc::clone(&muted));
        let peer = Peer {
            pc,
            muted,
            volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            remote,
            received: Arc::new(AtomicU64::new(0)),
            pump,
            playback: None,
        };
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session, peer);
        debug!("{session}: media acquired");
        Ok(())
    }

    async fn create_offer(&self, session: SessionKey) -> Result<SessionDescription, NegotiationError> {
        let pc = self.pc(session)?;
        let offer = pc.create_offer(None).await.map_err(backend_err)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(backend_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        session: SessionKey,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let pc = self.pc(session)?;
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(rejected)?;
        pc.set_remote_description(remote).await.map_err(rejected)?;
        let answer = pc.create_answer(None).await.map_err(backend_err)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(backend_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(
        &self,
        session: SessionKey,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let pc = self.pc(session)?;
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(rejected)?;
        pc.set_remote_description(remote).await.map_err(rejected)
    }

    async fn add_ice_candidate(
        &self,
        session: SessionKey,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let pc = self.pc(session)?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        pc.add_ice_candidate(init).await.map_err(backend_err)
    }

    async fn attach_remote_stream(&self, session: SessionKey, volume: f32) -> Result<(), MediaError> {
        let attached = self.with_peer(session, |p| {
            p.volume.store(volume.to_bits(), Ordering::Relaxed);
            if p.playback.is_some() {
                return Ok(());
            }
            let track = p
                .remote
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| MediaError::Backend("no remote track".into()))?;
            let volume = Arc::clone(&p.volume);
            let received = Arc::clone(&p.received);
            p.playback = Some(tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    if f32::from_bits(volume.load(Ordering::Relaxed)) > 0.0 {
                        received.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                    }
                }
            }));
            Ok(())
        });
        attached.unwrap_or(Ok(()))
    }

    async fn set_muted(&self, session: SessionKey, muted: bool) -> Result<(), MediaError> {
        self.with_peer(session, |p| p.muted.store(muted, Ordering::Relaxed));
        Ok(())
    }

    async fn set_volume(&self, session: SessionKey, volume: f32) -> Result<(), MediaError> {
        self.with_peer(session, |p| p.volume.store(volume.to_bits(), Ordering::Relaxed));
        Ok(())
    }

    async fn release(&self, session: SessionKey) {
        let peer = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session);
        let Some(peer) = peer else {
            return;
        };
        peer.pump.abort();
        if let Some(playback) = peer.playback {
            playback.abort();
        }
        if let Err(e) = peer.pc.close().await {
            warn!("{session}: close peer connection: {e}");
        }
        debug!(
            "{session}: media released ({} bytes received)",
            peer.received.load(Ordering::Relaxed)
        );
    }
}

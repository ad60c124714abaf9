//! Media worker: executes engine media commands strictly in order against a backend.

use std::sync::Arc;

use hubcall_core::{
    MediaBackend, MediaCommand, MediaEvent, MediaEventKind, MediaEventSink, MediaOp,
};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn the worker. Results and peer-connection callbacks come back on `events`.
pub fn spawn_media_worker(
    backend: Arc<dyn MediaBackend>,
    events: mpsc::UnboundedSender<MediaEvent>,
) -> (mpsc::UnboundedSender<MediaCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MediaCommand>();
    let sink: MediaEventSink = Arc::new(move |ev: MediaEvent| {
        let _ = events.send(ev);
    });
    let task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            execute(backend.as_ref(), &sink, cmd).await;
        }
        debug!("media worker stopped");
    });
    (tx, task)
}

pub async fn execute(backend: &dyn MediaBackend, sink: &MediaEventSink, cmd: MediaCommand) {
    let MediaCommand { session, op } = cmd;
    let post = |kind| sink(MediaEvent::new(session, kind));
    match op {
        MediaOp::Acquire => match backend.acquire(session, Arc::clone(sink)).await {
            Ok(()) => post(MediaEventKind::Acquired),
            Err(e) => post(MediaEventKind::AcquireFailed(e)),
        },
        MediaOp::CreateOffer => match backend.create_offer(session).await {
            Ok(offer) => post(MediaEventKind::LocalDescription(offer)),
            Err(e) => post(MediaEventKind::NegotiationFailed(e)),
        },
        MediaOp::AcceptOffer(offer) => match backend.accept_offer(session, offer).await {
            Ok(answer) => post(MediaEventKind::LocalDescription(answer)),
            Err(e) => post(MediaEventKind::NegotiationFailed(e)),
        },
        MediaOp::ApplyAnswer(answer) => match backend.apply_answer(session, answer).await {
            Ok(()) => post(MediaEventKind::RemoteAnswerApplied),
            Err(e) => post(MediaEventKind::NegotiationFailed(e)),
        },
        // A bad remote candidate is not fatal; others may still connect.
        MediaOp::AddIceCandidate(c) => {
            if let Err(e) = backend.add_ice_candidate(session, c).await {
                warn!("{session}: remote candidate rejected: {e}");
            }
        }
        MediaOp::AttachRemoteStream { volume } => {
            if let Err(e) = backend.attach_remote_stream(session, volume).await {
                warn!("{session}: attach remote stream: {e}");
            }
        }
        MediaOp::SetMuted(muted) => {
            if let Err(e) = backend.set_muted(session, muted).await {
                warn!("{session}: set muted: {e}");
            }
        }
        MediaOp::SetVolume(volume) => {
            if let Err(e) = backend.set_volume(session, volume).await {
                warn!("{session}: set volume: {e}");
            }
        }
        MediaOp::Release => backend.release(session).await,
    }
}

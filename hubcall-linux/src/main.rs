// Hubcall Linux: hub signaling channel, WebRTC media and a terminal controller.

mod channel;
mod config;
mod console;
mod driver;
mod media;
mod rtc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use hubcall_core::CallEngine;
use log::{info, warn};
use tokio::sync::{mpsc, watch};

use crate::channel::HubConnection;
use crate::driver::{Driver, Intent};
use crate::rtc::WebRtcBackend;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    server: Option<String>,
    name: Option<String>,
    version: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().with_context(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" | "-c" => out.config = Some(PathBuf::from(value("--config")?)),
            "--server" | "-s" => out.server = Some(value("--server")?),
            "--name" | "-n" => out.name = Some(value("--name")?),
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("hubcall-linux {}", VERSION);
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(server) = args.server {
        cfg.server_url = server;
    }
    if let Some(name) = args.name {
        cfg.username = Some(name);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // Stdin reads sit on a blocking thread; don't wait for them.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let connection = Arc::new(HubConnection::new(&cfg.server_url)?);
    let mut events = connection.events();
    connection
        .start()
        .await
        .with_context(|| format!("connect to {}", cfg.server_url))?;

    let backend = WebRtcBackend::new(cfg.ice_servers.clone(), cfg.audio_enabled)
        .context("initialise WebRTC")?;
    let (media_ev_tx, media_ev_rx) = mpsc::unbounded_channel();
    let (media_tx, media_task) = media::spawn_media_worker(Arc::new(backend), media_ev_tx);

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = Driver::new(
        CallEngine::with_config(cfg.engine_config()),
        Arc::clone(&connection),
        media_tx,
        out_tx,
    );
    let roster = driver.roster();
    let status = driver.status();
    if let Some(name) = &cfg.username {
        let _ = intent_tx.send(Intent::Register(name.clone()));
    }
    let driver_task = tokio::spawn(async move {
        driver
            .run(events.receiver(), media_ev_rx, intent_rx, shutdown_rx)
            .await
    });
    let console = tokio::spawn(console::run_console(intent_tx, out_rx, roster, status));

    tokio::select! {
        r = shutdown_signal() => r?,
        r = console => {
            if let Ok(Err(e)) = r {
                warn!("console: {e}");
            }
        }
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = driver_task.await;
    let _ = media_task.await;
    connection.stop().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

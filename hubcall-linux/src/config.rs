//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use hubcall_core::EngineConfig;

/// Client configuration. File: ~/.config/hubcall/config.toml or /etc/hubcall/config.toml.
/// Env overrides: HUBCALL_SERVER_URL, HUBCALL_USERNAME, HUBCALL_RING_TIMEOUT,
/// HUBCALL_NEGOTIATION_TIMEOUT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hub endpoint (http/https; negotiated and upgraded to WebSocket).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Register with this name on startup.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Seconds an unanswered call rings (default 45).
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,
    /// Seconds allowed for the offer/answer exchange (default 30).
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub notify_hang_up: bool,
    /// When false, microphone acquisition fails with "no device".
    #[serde(default = "default_true")]
    pub audio_enabled: bool,
}

fn default_server_url() -> String {
    "http://localhost:5000/hub".to_string()
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_ring_timeout() -> u64 {
    hubcall_core::engine::DEFAULT_RING_TIMEOUT_TICKS
}
fn default_negotiation_timeout() -> u64 {
    hubcall_core::engine::DEFAULT_NEGOTIATION_TIMEOUT_TICKS
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            username: None,
            ice_servers: default_ice_servers(),
            ring_timeout_secs: default_ring_timeout(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            notify_hang_up: true,
            audio_enabled: true,
        }
    }
}

impl Config {
    /// Engine settings; the driver ticks once per second.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ring_timeout_ticks: self.ring_timeout_secs,
            negotiation_timeout_ticks: self.negotiation_timeout_secs,
            notify_hang_up: self.notify_hang_up,
        }
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("HUBCALL_SERVER_URL") {
            self.server_url = s;
        }
        if let Some(s) = lookup("HUBCALL_USERNAME") {
            if !s.trim().is_empty() {
                self.username = Some(s);
            }
        }
        if let Some(s) = lookup("HUBCALL_RING_TIMEOUT") {
            if let Ok(secs) = s.parse::<u64>() {
                self.ring_timeout_secs = secs;
            }
        }
        if let Some(s) = lookup("HUBCALL_NEGOTIATION_TIMEOUT") {
            if let Ok(secs) = s.parse::<u64>() {
                self.negotiation_timeout_secs = secs;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (explicit or first that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hubcall/config.toml"));
    }
    out.push(PathBuf::from("/etc/hubcall/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

//! Load config from file, environment and command line.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use blockcast_core::{DistributorConfig, ReceiverConfig, DEFAULT_GROUP, DEFAULT_PORT};
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/blockcast/config.toml or /etc/blockcast/config.toml.
/// Env overrides: BLOCKCAST_GROUP, BLOCKCAST_PORT, BLOCKCAST_STAGING_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multicast group (default 228.5.6.7).
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    /// UDP port (default 9000).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    /// Deliver our own datagrams back to us (default true).
    #[serde(default = "default_multicast_loop")]
    pub multicast_loop: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Blocks queued at once during the initial broadcast.
    #[serde(default = "default_broadcast_window")]
    pub broadcast_window: usize,
    /// Quiet time before the distributor probes participants.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_max_missed_probes")]
    pub max_missed_probes: u32,
    /// Staging directory for partial files; the OS temp dir when unset.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub exit_when_synced: bool,
}

fn default_group() -> Ipv4Addr {
    DEFAULT_GROUP
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_multicast_ttl() -> u32 {
    1
}
fn default_multicast_loop() -> bool {
    true
}
fn default_queue_capacity() -> usize {
    DistributorConfig::default().queue_capacity
}
fn default_broadcast_window() -> usize {
    DistributorConfig::default().broadcast_window
}
fn default_probe_interval_ms() -> u64 {
    2000
}
fn default_max_missed_probes() -> u32 {
    DistributorConfig::default().max_missed_probes
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            multicast_ttl: default_multicast_ttl(),
            multicast_loop: default_multicast_loop(),
            queue_capacity: default_queue_capacity(),
            broadcast_window: default_broadcast_window(),
            probe_interval_ms: default_probe_interval_ms(),
            max_missed_probes: default_max_missed_probes(),
            staging_dir: None,
            exit_when_synced: false,
        }
    }
}

impl Config {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            queue_capacity: self.queue_capacity,
            broadcast_window: self.broadcast_window,
            max_missed_probes: self.max_missed_probes,
        }
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            queue_capacity: self.queue_capacity,
            staging_dir: self
                .staging_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            exit_when_synced: self.exit_when_synced,
        }
    }

    /// Apply environment overrides; `var` looks a variable up by name.
    /// Unparsable values are reported and skipped.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("BLOCKCAST_GROUP") {
            match s.parse::<Ipv4Addr>() {
                Ok(g) => self.group = g,
                Err(_) => warn!(value = %s, "ignoring invalid BLOCKCAST_GROUP"),
            }
        }
        if let Some(s) = var("BLOCKCAST_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.port = p,
                Err(_) => warn!(value = %s, "ignoring invalid BLOCKCAST_PORT"),
            }
        }
        if let Some(s) = var("BLOCKCAST_STAGING_DIR") {
            if !s.is_empty() {
                self.staging_dir = Some(PathBuf::from(s));
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicitly named file must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/blockcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/blockcast/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("{:#}, using defaults", e);
            None
        }
    }
}

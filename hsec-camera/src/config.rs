//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

/// Daemon configuration. File: ~/.config/hsec/camera.toml or /etc/hsec/camera.toml.
/// Env overrides: HSEC_PAIRING_CODE, HSEC_DISCOVERY_PORT, HSEC_MAC, HSEC_SESSION_PATH,
/// HSEC_FRAMES_DIR, HSEC_BROADCAST.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device MAC (`AA:BB:CC:DD:EE:FF`). Read from the first non-loopback interface when unset.
    #[serde(default)]
    pub mac: Option<String>,
    /// Session record file (default /var/lib/hsec/session.bin).
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,
    /// Directory of JPEG frames replayed in order. A synthetic test pattern when unset.
    #[serde(default)]
    pub frames_dir: Option<PathBuf>,
    /// Capture rate cap (default 10). Zero disables the cap.
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    /// Control loop period (default 5 ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Heartbeat destination. Derived from the local address (/24) when unset.
    #[serde(default)]
    pub broadcast: Option<Ipv4Addr>,
    /// Protocol and transport tuning, the `[device]` table.
    #[serde(default)]
    pub device: hsec_core::Config,
}

fn default_session_path() -> PathBuf {
    PathBuf::from("/var/lib/hsec/session.bin")
}
fn default_max_fps() -> u32 {
    10
}
fn default_tick_ms() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mac: None,
            session_path: default_session_path(),
            frames_dir: None,
            max_fps: default_max_fps(),
            tick_ms: default_tick_ms(),
            broadcast: None,
            device: hsec_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `HSEC_*` overrides. Values that do not parse are ignored with a warning.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HSEC_PAIRING_CODE") {
        c.device.pairing_code = s;
    }
    if let Some(s) = var("HSEC_DISCOVERY_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.device.discovery_port = p,
            Err(_) => warn!(value = %s, "ignoring invalid HSEC_DISCOVERY_PORT"),
        }
    }
    if let Some(s) = var("HSEC_MAC") {
        c.mac = Some(s);
    }
    if let Some(s) = var("HSEC_SESSION_PATH") {
        c.session_path = PathBuf::from(s);
    }
    if let Some(s) = var("HSEC_FRAMES_DIR") {
        c.frames_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = var("HSEC_BROADCAST") {
        match s.parse::<Ipv4Addr>() {
            Ok(a) => c.broadcast = Some(a),
            Err(_) => warn!(value = %s, "ignoring invalid HSEC_BROADCAST"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hsec/camera.toml"));
    }
    out.push(PathBuf::from("/etc/hsec/camera.toml"));
    out
}

/// First existing config file wins; a broken one falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "using default config");
            None
        }
    }
}

pub fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

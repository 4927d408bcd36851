//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rollcall_core::EngineConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/rollcall/config.toml or /etc/rollcall/config.toml.
/// Env overrides: ROLLCALL_LISTEN_PORT, ROLLCALL_MAX_CONNECTIONS, ROLLCALL_RECORDS_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the collector listens on (default 0.0.0.0).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Link emulation TCP port (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// JSON-lines file for accepted records. Records are only logged if unset.
    #[serde(default)]
    pub records_path: Option<PathBuf>,
    /// Engine tick period (default 250).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Per-frame write bound (default 5000).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Attendee connect bound (default 6000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    47800
}
fn default_tick_interval_ms() -> u64 {
    250
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    6000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            records_path: None,
            tick_interval_ms: default_tick_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: `explicit` file if given (must exist), else the first config file found, else
/// defaults; then env vars on top.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => parse_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Env overrides. Values that do not parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("ROLLCALL_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(n) = var("ROLLCALL_MAX_CONNECTIONS").and_then(|s| s.parse::<usize>().ok()) {
        if n > 0 {
            c.engine.max_connections = n;
        }
    }
    if let Some(path) = var("ROLLCALL_RECORDS_PATH").filter(|s| !s.is_empty()) {
        c.records_path = Some(PathBuf::from(path));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/rollcall/config.toml"));
    }
    out.push(PathBuf::from("/etc/rollcall/config.toml"));
    out
}

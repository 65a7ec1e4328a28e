//! Load config from file and environment; CLI flags are applied by the caller.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use loft_core::TransferConfig;
use serde::Deserialize;

/// Node configuration. File: ~/.config/loft/config.toml or /etc/loft/config.toml.
/// Env overrides: LOFT_CONTROL_PORT, LOFT_STREAM_PORT, LOFT_DATA_DIR, LOFT_PREFER_STREAM.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Control connection port (default 47300). 0 picks a free port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Dedicated stream listener port (default 47301). 0 picks a free port.
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Run a stream listener at all.
    #[serde(default = "default_true")]
    pub streams: bool,
    /// Ask senders for the stream strategy when fetching.
    #[serde(default = "default_true")]
    pub prefer_stream: bool,
    /// Snapshots are served from and installed into this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_control_port() -> u16 {
    47300
}
fn default_stream_port() -> u16 {
    47301
}
fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("loft-data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            control_port: default_control_port(),
            stream_port: default_stream_port(),
            streams: true,
            prefer_stream: true,
            data_dir: default_data_dir(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Merge default, then the config file (explicit path or the first default path that exists),
/// then env vars. A file that exists but does not parse is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

/// Overrides that do not parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LOFT_CONTROL_PORT").and_then(|s| s.parse().ok()) {
        c.control_port = p;
    }
    if let Some(p) = var("LOFT_STREAM_PORT").and_then(|s| s.parse().ok()) {
        c.stream_port = p;
    }
    if let Some(dir) = var("LOFT_DATA_DIR").filter(|s| !s.is_empty()) {
        c.data_dir = PathBuf::from(dir);
    }
    if let Some(b) = var("LOFT_PREFER_STREAM").and_then(|s| parse_bool(&s)) {
        c.prefer_stream = b;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/loft/config.toml"));
    }
    out.push(PathBuf::from("/etc/loft/config.toml"));
    out
}

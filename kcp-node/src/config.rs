//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use kcp_core::{ChannelConfig, ConfigError, Mode};
use serde::Deserialize;

/// Node configuration. File: ~/.config/kcp-node/config.toml or /etc/kcp-node/config.toml.
/// Env overrides: KCP_NODE_PORT, KCP_NODE_WORKERS, KCP_NODE_MODE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for `server` (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// UDP port (default 4000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Worker tasks; 0 means one per core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub channel: ChannelConfig,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    4000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            workers: 0,
            channel: ChannelConfig::default(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not valid")]
    Env { var: &'static str, value: String },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Load config: defaults, then the config file (explicit path, or the first default
/// path that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, LoadError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.channel.validate()?;
    Ok(c)
}

/// Apply `KCP_NODE_*` overrides read through `lookup`.
pub fn apply_env(
    c: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), LoadError> {
    if let Some(s) = lookup("KCP_NODE_PORT") {
        c.port = s.parse().map_err(|_| LoadError::Env {
            var: "KCP_NODE_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("KCP_NODE_WORKERS") {
        c.workers = s.parse().map_err(|_| LoadError::Env {
            var: "KCP_NODE_WORKERS",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("KCP_NODE_MODE") {
        c.channel.mode = s.parse::<Mode>().map_err(|_| LoadError::Env {
            var: "KCP_NODE_MODE",
            value: s.clone(),
        })?;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/kcp-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/kcp-node/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, LoadError> {
    let s = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

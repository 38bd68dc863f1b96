use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Error;
use crate::broadcast::BroadcastConfig;
use crate::serial::SerialConfig;
use crate::sim::SimConfig;

pub const CONFIG_ENV: &str = "TELEMETRY_RELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./telemetry-relay.toml";

/// Where samples come from.
#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Simulator,
    /// Only `POST /telemetry`.
    Http,
    Serial,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceKind,
    pub server: ServerConfig,
    pub broadcast: BroadcastConfig,
    pub simulator: SimConfig,
    pub serial: SerialConfig,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Loads the first config found: an explicit `path`, then
    /// `$TELEMETRY_RELAY_CONFIG`, then `./telemetry-relay.toml`. Falls back
    /// to defaults when none exist. An explicit path that cannot be read is
    /// an error.
    pub fn discover(path: Option<PathBuf>) -> Result<Self, Error> {
        if let Some(path) = path {
            info!(?path, "loading config");
            return Self::read(path);
        }
        let candidates = std::env::var(CONFIG_ENV)
            .ok()
            .into_iter()
            .chain([DEFAULT_CONFIG_PATH.to_string()]);
        for path in candidates {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            info!(%path, "loading config");
            return Self::from_toml(&contents);
        }
        debug!("no config file found, using defaults");
        Ok(Config::default())
    }
}

//! Load sim config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use peerlink_core::{PeerId, MAX_MESSAGE_SIZE};
use serde::Deserialize;

/// Scenario configuration. File: ~/.config/peerlink/sim.toml or /etc/peerlink/sim.toml.
/// Env overrides: PEERLINK_SESSION_ID, PEERLINK_CLIENTS, PEERLINK_MAX_TICKS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session every peer joins (default "lobby").
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Number of client transports (default 2).
    #[serde(default = "default_clients")]
    pub clients: usize,
    /// Payload sizes each client sends and expects echoed back.
    #[serde(default = "default_message_sizes")]
    pub message_sizes: Vec<usize>,
    /// Poll budget per phase before the run is declared stuck.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,
    /// Fixed identity for the hosting peer, as 32 hex characters. Random when unset.
    #[serde(default)]
    pub server_peer: Option<PeerId>,
}

fn default_session_id() -> String {
    "lobby".to_owned()
}
fn default_clients() -> usize {
    2
}
fn default_message_sizes() -> Vec<usize> {
    vec![64, 1170, 3000, 120_000]
}
fn default_max_ticks() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            clients: default_clients(),
            message_sizes: default_message_sizes(),
            max_ticks: default_max_ticks(),
            server_peer: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.clients == 0 {
            bail!("clients must be at least 1");
        }
        if self.max_ticks == 0 {
            bail!("max_ticks must be at least 1");
        }
        if let Some(size) = self.message_sizes.iter().find(|&&s| s > MAX_MESSAGE_SIZE) {
            bail!("message size {size} exceeds the {MAX_MESSAGE_SIZE}-byte limit");
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PEERLINK_SESSION_ID") {
            self.session_id = s;
        }
        if let Some(n) = var("PEERLINK_CLIENTS").and_then(|s| s.parse().ok()) {
            self.clients = n;
        }
        if let Some(n) = var("PEERLINK_MAX_TICKS").and_then(|s| s.parse().ok()) {
            self.max_ticks = n;
        }
    }
}

/// Load config: defaults, then the config file (`explicit` or the first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c: Config =
        toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/sim.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/sim.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn partial_file() {
        let c: Config = toml::from_str("clients = 5\nmessage_sizes = [1, 2000]").unwrap();
        assert_eq!(c.clients, 5);
        assert_eq!(c.message_sizes, vec![1, 2000]);
        assert_eq!(c.session_id, "lobby");
    }

    #[test]
    fn server_peer_parses_from_hex() {
        let c: Config =
            toml::from_str("server_peer = \"0123456789abcdef0123456789abcdef\"").unwrap();
        assert_eq!(
            c.server_peer.map(|id| id.to_string()).as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert!(toml::from_str::<Config>("server_peer = \"xyz\"").is_err());
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(|key| match key {
            "PEERLINK_SESSION_ID" => Some("arena7".to_owned()),
            "PEERLINK_CLIENTS" => Some("4".to_owned()),
            "PEERLINK_MAX_TICKS" => Some("not a number".to_owned()),
            _ => None,
        });
        assert_eq!(c.session_id, "arena7");
        assert_eq!(c.clients, 4);
        assert_eq!(c.max_ticks, default_max_ticks());
    }

    #[test]
    fn validate_limits() {
        assert!(Config::default().validate().is_ok());
        let c = Config {
            clients: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        let c = Config {
            message_sizes: vec![MAX_MESSAGE_SIZE + 1],
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn explicit_path_must_exist() {
        assert!(load(Some(Path::new("/nonexistent/peerlink/sim.toml"))).is_err());
    }
}

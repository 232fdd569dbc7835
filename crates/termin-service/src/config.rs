//! Service configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termin_core::{TerminError, TerminResult};
use tracing::info;

/// Settings the broker itself needs, independent of any transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Maximum number of live (non-terminal) sessions.
    pub max_sessions: usize,
    /// Output retained per session for late-join replay.
    pub scrollback_bytes: usize,
    /// Events queued per attached client before it is dropped as slow.
    pub client_queue_capacity: usize,
    /// Upper bound on a single input write.
    pub input_timeout: Duration,
    /// How long to keep reading after exit while the stream stays open.
    pub drain_grace: Duration,
    /// Write per-session JSONL recordings here when set.
    pub recording_dir: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let s = ServiceSection::default();
        Self {
            max_sessions: s.max_sessions,
            scrollback_bytes: s.scrollback_bytes,
            client_queue_capacity: s.client_queue_capacity,
            input_timeout: Duration::from_millis(s.input_timeout_ms),
            drain_grace: Duration::from_millis(s.drain_grace_ms),
            recording_dir: None,
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub service: ServiceSection,
}

/// `[service]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
    #[serde(default = "default_input_timeout_ms")]
    pub input_timeout_ms: u64,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    #[serde(default = "default_reap_grace_secs")]
    pub reap_grace_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    #[serde(default)]
    pub recording_dir: Option<String>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            scrollback_bytes: default_scrollback_bytes(),
            client_queue_capacity: default_client_queue_capacity(),
            input_timeout_ms: default_input_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            reap_grace_secs: default_reap_grace_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            recording_dir: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_max_sessions() -> usize {
    64
}
fn default_scrollback_bytes() -> usize {
    256 * 1024
}
fn default_client_queue_capacity() -> usize {
    256
}
fn default_input_timeout_ms() -> u64 {
    2000
}
fn default_drain_grace_ms() -> u64 {
    500
}
fn default_reap_grace_secs() -> u64 {
    300
}
fn default_gc_interval_secs() -> u64 {
    30
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub scrollback_bytes: Option<usize>,
    pub reap_grace_secs: Option<u64>,
    pub recording_dir: Option<String>,
}

/// Resolved service configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: IpAddr,
    pub port: u16,
    pub reap_grace: Duration,
    pub gc_interval: Duration,
    pub broker: BrokerConfig,
}

impl ServiceConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file yields the defaults.
    pub fn load(config_path: Option<&Path>, cli: &Overrides) -> TerminResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content).map_err(|e| {
                        TerminError::InvalidArgument(format!("config parse error: {e}"))
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config.service, cli)
    }

    fn resolve(file: ServiceSection, cli: &Overrides) -> TerminResult<Self> {
        let listen_str = cli.listen.clone().unwrap_or(file.listen);
        let listen: IpAddr = listen_str.parse().map_err(|e| {
            TerminError::InvalidArgument(format!("invalid listen address {listen_str:?}: {e}"))
        })?;

        let client_queue_capacity = file.client_queue_capacity;
        if client_queue_capacity < 2 {
            return Err(TerminError::InvalidArgument(
                "client_queue_capacity must be at least 2".into(),
            ));
        }

        let recording_dir = cli
            .recording_dir
            .clone()
            .or(file.recording_dir)
            .map(|d| expand_tilde_str(&d));

        Ok(Self {
            listen,
            port: cli.port.unwrap_or(file.port),
            reap_grace: Duration::from_secs(cli.reap_grace_secs.unwrap_or(file.reap_grace_secs)),
            gc_interval: Duration::from_secs(file.gc_interval_secs.max(1)),
            broker: BrokerConfig {
                max_sessions: cli.max_sessions.unwrap_or(file.max_sessions),
                scrollback_bytes: cli.scrollback_bytes.unwrap_or(file.scrollback_bytes),
                client_queue_capacity,
                input_timeout: Duration::from_millis(file.input_timeout_ms),
                drain_grace: Duration::from_millis(file.drain_grace_ms),
                recording_dir,
            },
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServiceConfig::load(Some(&dir.path().join("nope.toml")), &Overrides::default())
            .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:7681".parse().unwrap());
        assert_eq!(cfg.reap_grace, Duration::from_secs(300));
        assert_eq!(cfg.gc_interval, Duration::from_secs(30));
        assert_eq!(cfg.broker, BrokerConfig::default());
        assert_eq!(cfg.broker.scrollback_bytes, 262_144);
        assert_eq!(cfg.broker.input_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn file_values_then_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[service]
port = 9000
max_sessions = 8
drain_grace_ms = 100
recording_dir = "/var/tmp/rec"
"#,
        )
        .unwrap();

        let cfg = ServiceConfig::load(Some(&path), &Overrides::default()).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.broker.max_sessions, 8);
        assert_eq!(cfg.broker.drain_grace, Duration::from_millis(100));
        assert_eq!(cfg.broker.recording_dir, Some(PathBuf::from("/var/tmp/rec")));
        assert_eq!(cfg.broker.client_queue_capacity, 256);

        let cli = Overrides {
            port: Some(9100),
            max_sessions: Some(2),
            listen: Some("0.0.0.0".into()),
            ..Default::default()
        };
        let cfg = ServiceConfig::load(Some(&path), &cli).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:9100".parse().unwrap());
        assert_eq!(cfg.broker.max_sessions, 2);
    }

    #[test]
    fn bad_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[service]\nport = \"high\"\n").unwrap();
        let err = ServiceConfig::load(Some(&path), &Overrides::default()).unwrap_err();
        assert!(matches!(err, TerminError::InvalidArgument(_)));

        let cli = Overrides {
            listen: Some("localhost:80".into()),
            ..Default::default()
        };
        assert!(ServiceConfig::load(None, &cli).is_err());
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x/config.toml")), home.join("x/config.toml"));
        }
        assert_eq!(expand_tilde(Path::new("/etc/t.toml")), PathBuf::from("/etc/t.toml"));
    }
}

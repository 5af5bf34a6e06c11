//! TOML-backed settings for the daemon and the client.
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Command line flags are applied on top by the binaries.

use crate::protocol::{timeouts, CHUNK_SIZE, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub shared_dir: PathBuf,
    pub max_connections: usize, // 0 = unlimited
    pub recv_timeout_secs: u64,
    pub accept_poll_ms: u64,
    pub log_file: Option<PathBuf>,
    pub metrics_csv: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            shared_dir: PathBuf::from("./shared"),
            max_connections: 0,
            recv_timeout_secs: timeouts::SESSION_RECV_SECS,
            accept_poll_ms: timeouts::ACCEPT_POLL_MS,
            log_file: None,
            metrics_csv: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_secs: u64, // 0 = block forever
    pub chunk_size: usize,
    pub history_limit: usize, // 0 = unbounded
    pub progress_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: timeouts::CONNECT_MS,
            io_timeout_secs: timeouts::CLIENT_IO_SECS,
            chunk_size: CHUNK_SIZE,
            history_limit: 0,
            progress_interval_ms: timeouts::PROGRESS_TICK_MS,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.io_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg = toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ferryd.toml");
        std::fs::write(&path, "port = 9100\nmax_connections = 4\n").unwrap();
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.recv_timeout_secs, 5);
        assert_eq!(cfg.shared_dir, PathBuf::from("./shared"));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9100");
    }

    #[test]
    fn zero_disables_client_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(&path, "io_timeout_secs = 0\nhistory_limit = 10\n").unwrap();
        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.io_timeout(), None);
        assert_eq!(cfg.history_limit, 10);
        assert_eq!(cfg.chunk_size(), CHUNK_SIZE);
    }

    #[test]
    fn bad_toml_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "port = \"nope\"").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
        assert!(ServerConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}

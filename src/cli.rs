//! Shared CLI helpers and Clap definitions for `ferry` and `ferryd`

use crate::config::{ClientConfig, ServerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Daemon options; every flag overrides the matching config file value
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Ferry daemon - serve one directory over the ferry protocol")]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind host
    #[arg(long)]
    pub bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory to share
    #[arg(short = 'd', long = "dir")]
    pub shared_dir: Option<PathBuf>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Session receive timeout in seconds
    #[arg(long = "timeout")]
    pub recv_timeout_secs: Option<u64>,

    /// Append session events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Append a metrics row to this CSV on every interval and on exit
    #[arg(long = "metrics-csv")]
    pub metrics_csv: Option<PathBuf>,

    /// Seconds between periodic metrics rows (0 = only on exit)
    #[arg(long, default_value_t = 0)]
    pub metrics_interval: u64,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long)]
    pub debug: bool,
}

impl DaemonOpts {
    pub fn apply(&self, cfg: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = &self.shared_dir {
            cfg.shared_dir = dir.clone();
        }
        if let Some(n) = self.max_connections {
            cfg.max_connections = n;
        }
        if let Some(secs) = self.recv_timeout_secs {
            cfg.recv_timeout_secs = secs;
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file.clone();
        }
        if self.metrics_csv.is_some() {
            cfg.metrics_csv = self.metrics_csv.clone();
        }
    }
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Ferry client - list, fetch and upload files on a ferry daemon")]
pub struct ClientOpts {
    /// Server address (ferry://host[:port] or host[:port])
    pub remote: String,

    #[command(subcommand)]
    pub command: ClientCommand,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Connect timeout in milliseconds
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,

    /// Blocking I/O timeout in seconds (0 = none)
    #[arg(long = "timeout", global = true)]
    pub io_timeout_secs: Option<u64>,

    /// Append a metrics row to this CSV after the command
    #[arg(long = "metrics-csv", global = true)]
    pub metrics_csv: Option<PathBuf>,

    /// Append the request history to this JSON-lines file
    #[arg(long = "history-out", global = true)]
    pub history_out: Option<PathBuf>,

    /// Print client metrics after the command
    #[arg(long, global = true)]
    pub stats: bool,

    /// Hide the transfer spinner
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List files in the shared directory
    List,
    /// Download files
    Get {
        /// Remote filenames
        #[arg(required = true)]
        names: Vec<String>,
        /// Local directory to write into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Upload files
    Put {
        /// Local files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Measure round-trip time
    Ping {
        #[arg(short, long, default_value_t = 4)]
        count: u32,
    },
}

impl ClientOpts {
    pub fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(ms) = self.connect_timeout_ms {
            cfg.connect_timeout_ms = ms;
        }
        if let Some(secs) = self.io_timeout_secs {
            cfg.io_timeout_secs = secs;
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the flags.
pub fn init_tracing(verbose: bool, debug: bool) {
    let default = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

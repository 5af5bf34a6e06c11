//! Error taxonomy shared by the transport, codec, client and daemon.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("short frame: expected {expected} bytes, received {received}")]
    ShortFrame { expected: usize, received: usize },

    #[error("timed out after {received} of {expected} bytes")]
    TimedOut { expected: usize, received: usize },

    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    CleanDisconnect,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("filesystem error at {path:?}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown command byte {0:#04x}")]
    ProtocolViolation(u8),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("path is not a directory: {0:?}")]
    NotADirectory(PathBuf),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,
}

impl FerryError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FerryError::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Outcomes the protocol treats as normal rather than faults.
    pub fn is_expected(&self) -> bool {
        matches!(self, FerryError::CleanDisconnect | FerryError::FileNotFound(_))
    }

    /// Faults that leave the byte stream unframed; the connection cannot be reused.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            FerryError::ShortFrame { .. }
                | FerryError::TimedOut { .. }
                | FerryError::Io(_)
                | FerryError::CleanDisconnect
        )
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;

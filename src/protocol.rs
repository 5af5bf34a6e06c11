//! Shared protocol constants for the Ferry fixed-frame transport
//!
//! Wire layout per request:
//! command (1) | filename (256, NUL padded)? | size (8, native endian)? | payload?
//!
//! Multi-byte integers use host byte order. Client and server builds must
//! agree on endianness; the format is not cross-endian safe.

/// Width of the filename field on the wire.
pub const FILENAME_FIELD_LEN: usize = 256;

/// Longest logical filename that fits in the field (one byte stays NUL).
pub const MAX_FILENAME_LEN: usize = FILENAME_FIELD_LEN - 1;

/// Width of the file size prefix that precedes every payload.
pub const SIZE_FIELD_LEN: usize = 8;

/// Width of the file count that opens a LIST response.
pub const COUNT_FIELD_LEN: usize = 4;

/// Streaming buffer for file bodies (64KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default TCP port for the daemon.
pub const DEFAULT_PORT: u16 = 9000;

/// Command byte values (keep numeric stable for wire compat)
pub mod command {
    pub const LIST: u8 = 1;
    pub const GET: u8 = 2;
    pub const PUT: u8 = 3;
    // Round-trip probe; the server echoes it back unchanged
    pub const PING: u8 = 4;
}

/// Decoded command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    List,
    Get,
    Put,
    Ping,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            command::LIST => Some(Command::List),
            command::GET => Some(Command::Get),
            command::PUT => Some(Command::Put),
            command::PING => Some(Command::Ping),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::List => command::LIST,
            Command::Get => command::GET,
            Command::Put => command::PUT,
            Command::Ping => command::PING,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::List => "LIST",
            Command::Get => "GET",
            Command::Put => "PUT",
            Command::Ping => "PING",
        }
    }
}

// Centralized timeout constants shared by client and daemon
pub mod timeouts {
    // Receive timeout applied to every accepted session socket (s)
    pub const SESSION_RECV_SECS: u64 = 5;

    // Client-side blocking I/O timeout (s); 0 disables
    pub const CLIENT_IO_SECS: u64 = 30;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Accept loop poll interval while idle (ms)
    pub const ACCEPT_POLL_MS: u64 = 50;

    // Back-off while the connection limit is reached (ms)
    pub const CAPACITY_WAIT_MS: u64 = 100;

    // In-flight metrics/progress update cadence (ms)
    pub const PROGRESS_TICK_MS: u64 = 100;
}

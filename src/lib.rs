//! Ferry - point-to-point file transfer over a fixed-frame TCP protocol
//!
//! A daemon shares one directory; clients LIST, GET and PUT flat files in it.
//! Both sides keep concurrent-safe metrics.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod history;
pub mod logger;
pub mod metrics;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod session;
pub mod transport;
pub mod url;

pub use client::Client;
pub use error::{FerryError, Result};
pub use server::Server;

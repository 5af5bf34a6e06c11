//! Blocking TCP transport: connect/bind/accept and byte-exact send/receive loops.
//!
//! Every loop retries on `Interrupted` and ends in one of three ways: the full
//! length moved, the peer closed cleanly before any byte of this call, or a
//! hard fault. A read that hits the socket timeout hands back the partial
//! count instead of failing so the caller decides whether that is fatal.

use crate::error::{FerryError, Result};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Outcome of a receive that did not hit a hard fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The whole buffer was filled.
    Complete,
    /// Peer closed before sending any byte for this call.
    Closed,
    /// The read timeout fired; carries how many bytes did arrive.
    TimedOut(usize),
}

// Socket tuning: disable Nagle, frames are written in one piece anyway
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_reset(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

/// Fill `buf` from `reader`.
pub fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Received> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) if got == 0 => return Ok(Received::Closed),
            Ok(0) => {
                return Err(FerryError::ShortFrame {
                    expected: buf.len(),
                    received: got,
                })
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(e.kind()) => return Ok(Received::TimedOut(got)),
            // A reset before any data is the peer going away, same as EOF
            Err(e) if is_reset(e.kind()) && got == 0 => return Ok(Received::Closed),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Received::Complete)
}

/// Write all of `buf` to `writer`, returning the byte count.
pub fn write_fully<W: Write>(writer: &mut W, buf: &[u8]) -> Result<usize> {
    let mut sent = 0;
    while sent < buf.len() {
        match writer.write(&buf[sent..]) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(e.kind()) => {
                return Err(FerryError::TimedOut {
                    expected: buf.len(),
                    received: sent,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(sent)
}

/// One side of an established connection. Owned by whoever created it.
///
/// Once the connection is marked disconnected (explicit close, clean peer
/// close, or a hard fault) every further read or write fails with
/// `NotConnected` without touching the socket.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: String,
}

impl Connection {
    pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|source| FerryError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_err = None;
        for sa in resolved {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&sa, t),
                None => TcpStream::connect(sa),
            };
            match attempt {
                Ok(stream) => {
                    tune_socket(&stream);
                    debug!(peer = %sa, "connected");
                    return Ok(Self::from_stream(stream, sa.to_string()));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(FerryError::Connect {
            addr,
            source: last_err
                .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved")),
        })
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(FerryError::NotConnected)?;
        stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(FerryError::NotConnected)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// A second handle on the socket that can shut it down from another thread.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let stream = self.stream.as_ref().ok_or(FerryError::NotConnected)?;
        Ok(ShutdownHandle {
            stream: stream.try_clone()?,
        })
    }

    pub fn send_all(&mut self, buf: &[u8]) -> Result<usize> {
        let outcome = {
            let stream = self.stream.as_mut().ok_or(FerryError::NotConnected)?;
            write_fully(stream, buf)
        };
        if outcome.is_err() {
            // A partial write leaves the peer mid-frame
            self.close();
        }
        outcome
    }

    /// Fill `buf`, reporting a clean close or a timeout with partial data
    /// instead of failing.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<Received> {
        let outcome = {
            let stream = self.stream.as_mut().ok_or(FerryError::NotConnected)?;
            read_fully(stream, buf)
        };
        match outcome {
            Ok(Received::Closed) | Err(_) => self.close(),
            _ => {}
        }
        outcome
    }

    /// Strict form of `recv_into`: anything short of the full length is an error.
    pub fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.recv_exact_into(&mut buf)?;
        Ok(buf)
    }

    /// `recv_exact` into a caller-owned buffer. A timeout that cut a frame
    /// in half closes the connection.
    pub fn recv_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.recv_into(buf)? {
            Received::Complete => Ok(()),
            Received::Closed => Err(FerryError::CleanDisconnect),
            Received::TimedOut(received) => {
                if received > 0 {
                    self.close();
                }
                Err(FerryError::TimedOut {
                    expected: buf.len(),
                    received,
                })
            }
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cross-thread handle used to unblock a worker stuck in a read.
#[derive(Debug)]
pub struct ShutdownHandle {
    stream: TcpStream,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Non-blocking listening socket. Accepted connections are switched back to
/// blocking mode with the configured receive timeout.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    recv_timeout: Option<Duration>,
}

impl Listener {
    pub fn bind(addr: &str, recv_timeout: Option<Duration>) -> Result<Self> {
        let inner = TcpListener::bind(addr).map_err(|source| FerryError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            recv_timeout: recv_timeout.filter(|t| !t.is_zero()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout.filter(|t| !t.is_zero());
    }

    /// `Ok(None)` when no connection is pending.
    pub fn accept(&self) -> Result<Option<(Connection, String)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(self.recv_timeout)?;
                tune_socket(&stream);
                let peer = addr.to_string();
                Ok(Some((Connection::from_stream(stream, peer.clone()), peer)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(None)
            }
            Err(e) => Err(FerryError::Accept(e)),
        }
    }
}

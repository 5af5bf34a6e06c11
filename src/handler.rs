//! Server side of the protocol: decode one request, act on the shared
//! directory, stream the answer.

use crate::error::{FerryError, Result};
use crate::logger::EventLog;
use crate::metrics::ServerMetrics;
use crate::protocol::{Command, CHUNK_SIZE, FILENAME_FIELD_LEN, SIZE_FIELD_LEN};
use crate::protocol_core::{
    build_list_response, decode_filename, decode_size, encode_size, resolve_in_share,
};
use crate::session::SharedDir;
use crate::transport::{Connection, Received};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the session loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Result of a request whose framing completed. `ok == false` marks a
/// request the server refused or could not satisfy on disk.
struct Served {
    name: String,
    bytes: u64,
    ok: bool,
}

impl Served {
    fn done(name: impl Into<String>, bytes: u64) -> Self {
        Self {
            name: name.into(),
            bytes,
            ok: true,
        }
    }

    fn refused(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: 0,
            ok: false,
        }
    }
}

/// Regular files directly inside `dir`, in directory order.
pub fn list_shared_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // follows symlinks, like a stat on the joined path
        let is_file = fs::metadata(entry.path())
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_file {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Per-session request processor.
pub struct RequestHandler {
    shared_dir: Arc<SharedDir>,
    metrics: Arc<ServerMetrics>,
    journal: Arc<dyn EventLog>,
    session_bytes: Arc<AtomicU64>,
    buf: Vec<u8>,
}

impl RequestHandler {
    pub fn new(
        shared_dir: Arc<SharedDir>,
        metrics: Arc<ServerMetrics>,
        journal: Arc<dyn EventLog>,
        session_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            shared_dir,
            metrics,
            journal,
            session_bytes,
            buf: vec![0u8; CHUNK_SIZE],
        }
    }

    /// Read one command byte and serve it.
    ///
    /// A receive timeout before the command byte is not an error: the
    /// session loop gets control back to check for a stop request.
    pub fn process_one_request(&mut self, conn: &mut Connection) -> Flow {
        let peer = conn.peer().to_string();
        let mut cmd = [0u8; 1];
        match conn.recv_into(&mut cmd) {
            Ok(Received::Complete) => {}
            Ok(Received::TimedOut(_)) => return Flow::Continue,
            Ok(Received::Closed) => {
                debug!(peer = %peer, "client disconnected");
                return Flow::Disconnect;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed reading command");
                self.journal.error("command", &peer, &e.to_string());
                return Flow::Disconnect;
            }
        }

        let Some(command) = Command::from_byte(cmd[0]) else {
            let err = FerryError::ProtocolViolation(cmd[0]);
            warn!(peer = %peer, "{}, closing session", err);
            self.journal.error("command", &peer, &err.to_string());
            self.metrics.record_request(false, 0, std::time::Duration::ZERO);
            return Flow::Disconnect;
        };

        let started = Instant::now();
        let outcome = match command {
            Command::List => self.handle_list(conn),
            Command::Get => self.handle_get(conn),
            Command::Put => self.handle_put(conn),
            Command::Ping => self.handle_ping(conn),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(served) => {
                self.metrics.record_request(served.ok, served.bytes, elapsed);
                self.journal
                    .request(&peer, command.name(), &served.name, served.bytes, served.ok);
                Flow::Continue
            }
            Err(e) => {
                self.metrics.record_request(false, 0, elapsed);
                if e.is_expected() {
                    debug!(peer = %peer, op = command.name(), "client left mid-request");
                } else {
                    warn!(peer = %peer, op = command.name(), error = %e, "request failed");
                    self.journal.error(command.name(), &peer, &e.to_string());
                }
                Flow::Disconnect
            }
        }
    }

    fn sent(&self, n: u64) {
        self.metrics.add_bytes_sent(n);
        self.session_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn received(&self, n: u64) {
        self.metrics.add_bytes_received(n);
        self.session_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn handle_ping(&mut self, conn: &mut Connection) -> Result<Served> {
        let n = conn.send_all(&[Command::Ping.as_byte()])?;
        self.sent(n as u64);
        Ok(Served::done("", 0))
    }

    fn handle_list(&mut self, conn: &mut Connection) -> Result<Served> {
        let root = self.shared_dir.load();
        let names = match list_shared_files(&root) {
            Ok(names) => names,
            Err(e) => {
                // still answer, with an empty listing
                warn!(dir = %root.display(), error = %e, "cannot list shared directory");
                Vec::new()
            }
        };
        let frame = build_list_response(&names);
        let n = conn.send_all(&frame)?;
        self.sent(n as u64);
        debug!(peer = %conn.peer(), files = names.len(), "LIST");
        Ok(Served::done("", 0))
    }

    fn handle_get(&mut self, conn: &mut Connection) -> Result<Served> {
        let name = decode_filename(&conn.recv_exact(FILENAME_FIELD_LEN)?);
        let root = self.shared_dir.load();

        let opened = resolve_in_share(&root, &name).ok().and_then(|path| {
            let file = File::open(&path).ok()?;
            let meta = file.metadata().ok()?;
            meta.is_file().then(|| (path, file, meta.len()))
        });
        let Some((path, file, size)) = opened else {
            debug!(peer = %conn.peer(), file = %name, "GET not found");
            let n = conn.send_all(&encode_size(0))?;
            self.sent(n as u64);
            return Ok(Served::done(name, 0));
        };

        let n = conn.send_all(&encode_size(size))?;
        self.sent(n as u64);

        // Only the announced length goes out, even if the file grows meanwhile
        let mut reader = file.take(size);
        let mut remaining = size;
        while remaining > 0 {
            let got = match reader.read(&mut self.buf) {
                Ok(0) => {
                    // The peer expects more bytes than we can produce
                    conn.close();
                    return Err(FerryError::fs(&path, io::Error::from(ErrorKind::UnexpectedEof)));
                }
                Ok(got) => got,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    conn.close();
                    return Err(FerryError::fs(&path, e));
                }
            };
            conn.send_all(&self.buf[..got])?;
            self.sent(got as u64);
            remaining -= got as u64;
        }

        if size > 0 {
            self.metrics.file_downloaded();
        }
        info!(peer = %conn.peer(), file = %name, bytes = size, "GET");
        Ok(Served::done(name, size))
    }

    fn handle_put(&mut self, conn: &mut Connection) -> Result<Served> {
        let name = decode_filename(&conn.recv_exact(FILENAME_FIELD_LEN)?);
        let size = decode_size(&conn.recv_exact(SIZE_FIELD_LEN)?)?;
        let root = self.shared_dir.load();

        let path = match resolve_in_share(&root, &name) {
            Ok(path) => path,
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "refusing upload");
                self.drain(conn, size)?;
                return Ok(Served::refused(name));
            }
        };
        let mut file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create upload target");
                self.drain(conn, size)?;
                return Ok(Served::refused(name));
            }
        };

        let mut remaining = size;
        let mut write_err = None;
        while remaining > 0 {
            let want = remaining.min(self.buf.len() as u64) as usize;
            if let Err(e) = conn.recv_exact_into(&mut self.buf[..want]) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
            self.received(want as u64);
            remaining -= want as u64;
            // Keep consuming after a disk error so the stream stays framed
            if write_err.is_none() {
                if let Err(e) = file.write_all(&self.buf[..want]) {
                    write_err = Some(e);
                }
            }
        }
        if write_err.is_none() {
            write_err = file.flush().err();
        }
        drop(file);

        if let Some(e) = write_err {
            warn!(path = %path.display(), error = %e, "upload write failed");
            let _ = fs::remove_file(&path);
            return Ok(Served::refused(name));
        }

        self.metrics.file_uploaded();
        info!(peer = %conn.peer(), file = %name, bytes = size, "PUT");
        Ok(Served::done(name, size))
    }

    /// Consume and discard an announced payload.
    fn drain(&mut self, conn: &mut Connection, mut remaining: u64) -> Result<()> {
        while remaining > 0 {
            let want = remaining.min(self.buf.len() as u64) as usize;
            conn.recv_exact_into(&mut self.buf[..want])?;
            self.received(want as u64);
            remaining -= want as u64;
        }
        Ok(())
    }
}

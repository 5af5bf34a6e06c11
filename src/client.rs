//! Client protocol driver.
//!
//! One blocking call in flight at a time. Every call, successful or not,
//! lands in the request history; failures come back as `Err` and never
//! panic. A transport fault closes the connection because the byte stream
//! can no longer be trusted to be on a frame boundary.

use crate::config::ClientConfig;
use crate::error::{FerryError, Result};
use crate::history::{HistoryLog, Operation, RequestRecord};
use crate::metrics::{ClientMetrics, ClientSnapshot};
use crate::protocol::{Command, COUNT_FIELD_LEN, FILENAME_FIELD_LEN, SIZE_FIELD_LEN};
use crate::protocol_core::{
    base_filename, build_get_request, build_list_request, build_ping_request, build_put_header,
    decode_count, decode_filename, decode_size, resolve_in_share, validate_filename,
    wire_filename,
};
use crate::transport::Connection;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot handed to the progress callback while a body streams.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub operation: Operation,
    pub filename: String,
    pub transferred: u64,
    pub total: u64,
    pub elapsed: Duration,
}

pub type ProgressCallback = Box<dyn FnMut(&TransferProgress) + Send>;

// Fires at most once per interval
struct Ticker {
    started: Instant,
    last: Instant,
    every: Duration,
}

impl Ticker {
    fn new(every: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            every,
        }
    }

    fn due(&mut self) -> bool {
        if self.last.elapsed() >= self.every {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn report(
    metrics: &ClientMetrics,
    progress: &mut Option<ProgressCallback>,
    operation: Operation,
    filename: &str,
    transferred: u64,
    total: u64,
    elapsed: Duration,
) {
    metrics.update_live_throughput(transferred, elapsed);
    if let Some(cb) = progress.as_mut() {
        cb(&TransferProgress {
            operation,
            filename: filename.to_string(),
            transferred,
            total,
            elapsed,
        });
    }
}

pub struct Client {
    conn: Option<Connection>,
    config: ClientConfig,
    metrics: Arc<ClientMetrics>,
    progress: Option<ProgressCallback>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let metrics = Arc::new(ClientMetrics::new(config.history_limit));
        Self {
            conn: None,
            config,
            metrics,
            progress: None,
        }
    }

    /// Open a connection, replacing any existing one. The handshake time
    /// seeds the RTT average.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.disconnect();
        let started = Instant::now();
        let conn = Connection::connect(host, port, self.config.connect_timeout())?;
        let rtt = self.metrics.record_rtt(started.elapsed());
        let io_timeout = self.config.io_timeout();
        conn.set_read_timeout(io_timeout)?;
        conn.set_write_timeout(io_timeout)?;
        info!(peer = %conn.peer(), rtt_ms = rtt, "connected");
        self.conn = Some(conn);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            info!(peer = %conn.peer(), "disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_connected)
    }

    pub fn set_progress(&mut self, callback: Option<ProgressCallback>) {
        self.progress = callback;
    }

    fn live(conn: &mut Option<Connection>) -> Result<&mut Connection> {
        conn.as_mut()
            .filter(|c| c.is_connected())
            .ok_or(FerryError::NotConnected)
    }

    fn track<T>(
        &mut self,
        operation: Operation,
        filename: &str,
        run: impl FnOnce(&mut Self, &mut u64) -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let mut bytes = 0;
        let outcome = run(self, &mut bytes);
        let elapsed = started.elapsed();
        self.metrics.record_request(RequestRecord::new(
            operation, filename, elapsed, bytes, &outcome,
        ));
        if let Err(e) = &outcome {
            if e.is_transport_fault() {
                if let Some(conn) = self.conn.as_mut() {
                    conn.close();
                }
            }
            if e.is_expected() {
                debug!(op = operation.name(), file = filename, "{}", e);
            } else {
                warn!(op = operation.name(), file = filename, error = %e, "request failed");
            }
        }
        outcome
    }

    /// Filenames in the shared directory, in the order the server sent them.
    pub fn list(&mut self) -> Result<Vec<String>> {
        self.track(Operation::List, "", |c, bytes| {
            let conn = Self::live(&mut c.conn)?;
            let n = conn.send_all(&build_list_request())?;
            c.metrics.add_bytes_sent(n as u64);

            let count = decode_count(&conn.recv_exact(COUNT_FIELD_LEN)?)?;
            let mut received = COUNT_FIELD_LEN as u64;
            let mut names = Vec::with_capacity(count.min(1024) as usize);
            let mut field = [0u8; FILENAME_FIELD_LEN];
            for _ in 0..count {
                conn.recv_exact_into(&mut field)?;
                received += FILENAME_FIELD_LEN as u64;
                names.push(decode_filename(&field));
            }
            c.metrics.add_bytes_received(received);
            *bytes = received;
            Ok(names)
        })
    }

    /// Download `name` into `target_dir`, overwriting a file of the same
    /// name. Returns the payload size.
    pub fn get(&mut self, name: &str, target_dir: impl AsRef<Path>) -> Result<u64> {
        let name = wire_filename(name);
        let target_dir = target_dir.as_ref();
        self.track(Operation::Get, &name, |c, bytes| {
            let local = resolve_in_share(target_dir, &name)?;
            let conn = Self::live(&mut c.conn)?;
            let n = conn.send_all(&build_get_request(&name))?;
            c.metrics.add_bytes_sent(n as u64);

            let size = decode_size(&conn.recv_exact(SIZE_FIELD_LEN)?)?;
            c.metrics.add_bytes_received(SIZE_FIELD_LEN as u64);
            if size == 0 {
                return Err(FerryError::FileNotFound(name.clone()));
            }

            let mut buf = vec![0u8; c.config.chunk_size()];
            let mut local_err = None;
            let mut file = match File::create(&local) {
                Ok(f) => Some(f),
                Err(e) => {
                    local_err = Some(FerryError::fs(&local, e));
                    None
                }
            };
            let created = file.is_some();
            let mut ticker = Ticker::new(c.config.progress_interval());
            let mut remaining = size;
            let mut done = 0u64;

            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                if let Err(e) = conn.recv_exact_into(&mut buf[..want]) {
                    drop(file.take());
                    if created {
                        let _ = fs::remove_file(&local);
                    }
                    return Err(e);
                }
                remaining -= want as u64;
                done += want as u64;
                *bytes = done;
                c.metrics.add_bytes_received(want as u64);
                // Keep consuming after a local failure so the stream stays framed
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(&buf[..want]) {
                        local_err = Some(FerryError::fs(&local, e));
                        file = None;
                    }
                }
                if ticker.due() {
                    let elapsed = ticker.elapsed();
                    report(&c.metrics, &mut c.progress, Operation::Get, &name, done, size, elapsed);
                }
            }

            if let Some(mut f) = file.take() {
                if let Err(e) = f.flush() {
                    local_err = Some(FerryError::fs(&local, e));
                }
            }
            if let Some(e) = local_err {
                if created {
                    let _ = fs::remove_file(&local);
                }
                return Err(e);
            }

            let elapsed = ticker.elapsed();
            report(&c.metrics, &mut c.progress, Operation::Get, &name, done, size, elapsed);
            c.metrics.finish_transfer(elapsed);
            c.metrics.file_downloaded();
            info!(file = %name, bytes = size, "downloaded");
            Ok(size)
        })
    }

    /// Upload a local file under its base name. Returns the payload size.
    pub fn put(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let name = base_filename(path)
            .map(|n| wire_filename(&n))
            .unwrap_or_default();
        self.track(Operation::Put, &name, |c, bytes| {
            let mut file = File::open(path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => FerryError::FileNotFound(path.display().to_string()),
                _ => FerryError::fs(path, e),
            })?;
            let meta = file.metadata().map_err(|e| FerryError::fs(path, e))?;
            if !meta.is_file() {
                return Err(FerryError::FileNotFound(path.display().to_string()));
            }
            let name = wire_filename(&base_filename(path)?);
            // The daemon drains and discards uploads it would refuse
            validate_filename(&name)?;
            let size = meta.len();

            let conn = Self::live(&mut c.conn)?;
            let n = conn.send_all(&build_put_header(&name, size))?;
            c.metrics.add_bytes_sent(n as u64);

            let mut buf = vec![0u8; c.config.chunk_size()];
            let mut ticker = Ticker::new(c.config.progress_interval());
            let mut remaining = size;
            let mut done = 0u64;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let got = match file.read(&mut buf[..want]) {
                    Ok(0) => {
                        // Source shrank: the announced size can't be honoured
                        conn.close();
                        return Err(FerryError::fs(path, io::Error::from(ErrorKind::UnexpectedEof)));
                    }
                    Ok(got) => got,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        conn.close();
                        return Err(FerryError::fs(path, e));
                    }
                };
                conn.send_all(&buf[..got])?;
                remaining -= got as u64;
                done += got as u64;
                *bytes = done;
                c.metrics.add_bytes_sent(got as u64);
                if ticker.due() {
                    let elapsed = ticker.elapsed();
                    report(&c.metrics, &mut c.progress, Operation::Put, &name, done, size, elapsed);
                }
            }

            let elapsed = ticker.elapsed();
            report(&c.metrics, &mut c.progress, Operation::Put, &name, done, size, elapsed);
            c.metrics.finish_transfer(elapsed);
            c.metrics.file_uploaded();
            info!(file = %name, bytes = size, "uploaded");
            Ok(size)
        })
    }

    /// Round trip of a single echoed byte.
    pub fn ping(&mut self) -> Result<Duration> {
        self.track(Operation::Ping, "", |c, _bytes| {
            let conn = Self::live(&mut c.conn)?;
            let started = Instant::now();
            let n = conn.send_all(&build_ping_request())?;
            c.metrics.add_bytes_sent(n as u64);
            let echo = conn.recv_exact(1)?;
            c.metrics.add_bytes_received(1);
            if echo[0] != Command::Ping.as_byte() {
                conn.close();
                return Err(FerryError::ProtocolViolation(echo[0]));
            }
            Ok(started.elapsed())
        })
    }

    pub fn metrics(&self) -> ClientSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<RequestRecord> {
        self.metrics.history(limit)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn export_metrics(&self, path: impl AsRef<Path>) -> Result<()> {
        self.metrics.export_csv(path.as_ref())
    }

    /// Append the in-memory history to a JSON-lines file.
    pub fn export_history(&self, path: impl AsRef<Path>) -> Result<()> {
        HistoryLog::new(path).append(&self.metrics.history(None))
    }
}

use crate::error::{FerryError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Journal of daemon activity, independent of the tracing output.
pub trait EventLog: Send + Sync {
    fn session_opened(&self, _id: &Uuid, _peer: &str) {}
    fn session_closed(&self, _id: &Uuid, _peer: &str, _bytes: u64, _elapsed: Duration) {}
    fn request(&self, _peer: &str, _op: &str, _name: &str, _bytes: u64, _ok: bool) {}
    fn error(&self, _context: &str, _peer: &str, _msg: &str) {}
}

pub struct NoopLog;
impl EventLog for NoopLog {}

pub struct TextLog {
    file: Mutex<File>,
}

impl TextLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FerryError::fs(parent, e))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FerryError::fs(path, e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl EventLog for TextLog {
    fn session_opened(&self, id: &Uuid, peer: &str) {
        self.line(&format!("OPEN id={id} peer={peer}"));
    }
    fn session_closed(&self, id: &Uuid, peer: &str, bytes: u64, elapsed: Duration) {
        self.line(&format!(
            "CLOSE id={} peer={} bytes={} seconds={:.3}",
            id,
            peer,
            bytes,
            elapsed.as_secs_f64()
        ));
    }
    fn request(&self, peer: &str, op: &str, name: &str, bytes: u64, ok: bool) {
        let status = if ok { "ok" } else { "fail" };
        self.line(&format!(
            "{op} peer={peer} name={name:?} bytes={bytes} status={status}"
        ));
    }
    fn error(&self, context: &str, peer: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} peer={peer} msg={msg}"));
    }
}

//! Session registry: one worker thread per accepted connection.
//!
//! The registry lock only guards list manipulation. Stopping a session
//! means raising its cancel token and shutting its socket down; joining
//! the worker always happens after the lock is released.

use crate::error::{FerryError, Result};
use crate::handler::{Flow, RequestHandler};
use crate::logger::EventLog;
use crate::metrics::ServerMetrics;
use crate::transport::{Connection, ShutdownHandle};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// The directory every session serves from. Replaced wholesale so a reader
/// sees either the old path or the new one.
#[derive(Debug)]
pub struct SharedDir {
    current: RwLock<Arc<PathBuf>>,
}

impl SharedDir {
    pub fn new(path: PathBuf) -> Self {
        Self {
            current: RwLock::new(Arc::new(path)),
        }
    }

    pub fn load(&self) -> Arc<PathBuf> {
        Arc::clone(&self.current.read())
    }

    pub fn store(&self, path: PathBuf) {
        *self.current.write() = Arc::new(path);
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: String,
    pub started_at: DateTime<Local>,
    pub bytes_transferred: u64,
    pub state: SessionState,
}

// State the worker and the manager both touch
#[derive(Debug)]
struct SessionShared {
    active: AtomicBool,
    cancel: AtomicBool,
    state: Mutex<SessionState>,
    bytes: Arc<AtomicU64>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

struct Session {
    id: Uuid,
    peer: String,
    started_at: DateTime<Local>,
    shared: Arc<SessionShared>,
    shutdown: ShutdownHandle,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer.clone(),
            started_at: self.started_at,
            bytes_transferred: self.shared.bytes.load(Ordering::Relaxed),
            state: *self.shared.state.lock(),
        }
    }

    fn request_stop(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, SessionState::Created | SessionState::Running) {
                *state = SessionState::Stopping;
            }
        }
        self.shutdown.shutdown();
    }

    fn reap(mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(session = %self.id, peer = %self.peer, "session worker panicked");
            }
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<Vec<Session>>,
    shared_dir: Arc<SharedDir>,
    metrics: Arc<ServerMetrics>,
    journal: Arc<dyn EventLog>,
}

impl SessionManager {
    pub fn new(shared_dir: PathBuf, metrics: Arc<ServerMetrics>, journal: Arc<dyn EventLog>) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            shared_dir: Arc::new(SharedDir::new(shared_dir)),
            metrics,
            journal,
        }
    }

    /// Register a freshly accepted connection and start its worker.
    pub fn spawn(&self, conn: Connection) -> Result<Uuid> {
        let shutdown = match conn.shutdown_handle() {
            Ok(h) => h,
            Err(e) => {
                self.metrics.connection_failed();
                return Err(e);
            }
        };
        let id = Uuid::new_v4();
        let peer = conn.peer().to_string();
        let shared = Arc::new(SessionShared {
            active: AtomicBool::new(true),
            cancel: AtomicBool::new(false),
            state: Mutex::new(SessionState::Created),
            bytes: Arc::new(AtomicU64::new(0)),
        });
        let handler = RequestHandler::new(
            Arc::clone(&self.shared_dir),
            Arc::clone(&self.metrics),
            Arc::clone(&self.journal),
            Arc::clone(&shared.bytes),
        );

        self.metrics.connection_opened();
        self.journal.session_opened(&id, &peer);

        let worker = {
            let shared = Arc::clone(&shared);
            let metrics = Arc::clone(&self.metrics);
            let journal = Arc::clone(&self.journal);
            thread::Builder::new()
                .name(format!("ferry-session-{}", &id.simple().to_string()[..8]))
                .spawn(move || run_session(id, conn, handler, shared, metrics, journal))
        };
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                self.metrics.connection_closed();
                self.metrics.connection_failed();
                shared.active.store(false, Ordering::SeqCst);
                shared.set_state(SessionState::Stopped);
                return Err(FerryError::Io(e));
            }
        };

        info!(session = %id, peer = %peer, "session started");
        self.sessions.lock().push(Session {
            id,
            peer,
            started_at: Local::now(),
            shared,
            shutdown,
            worker: Some(worker),
        });
        Ok(id)
    }

    /// Remove sessions whose worker has finished and join them.
    pub fn cleanup_finished(&self) -> usize {
        let finished: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            let (done, live): (Vec<_>, Vec<_>) = sessions
                .drain(..)
                .partition(|s| !s.shared.active.load(Ordering::SeqCst));
            *sessions = live;
            done
        };
        let n = finished.len();
        for session in finished {
            debug!(session = %session.id, "reaping session");
            session.reap();
        }
        n
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.shared.active.load(Ordering::SeqCst))
            .count()
    }

    pub fn active_client_addresses(&self) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.shared.active.load(Ordering::SeqCst))
            .map(|s| s.peer.clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().iter().map(Session::info).collect()
    }

    pub fn shared_directory(&self) -> Arc<PathBuf> {
        self.shared_dir.load()
    }

    /// Point every session at a new directory. Requests already streaming
    /// keep the path they resolved.
    pub fn change_shared_directory(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(FerryError::NotADirectory(path.to_path_buf()));
        }
        self.shared_dir.store(path.to_path_buf());
        info!(dir = %path.display(), "shared directory changed");
        Ok(())
    }

    /// Cancel every session and wait for all workers to exit.
    pub fn stop_all(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            for s in sessions.iter() {
                s.request_stop();
            }
            sessions.drain(..).collect()
        };
        if !drained.is_empty() {
            info!(sessions = drained.len(), "stopping sessions");
        }
        for session in drained {
            session.reap();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn run_session(
    id: Uuid,
    mut conn: Connection,
    mut handler: RequestHandler,
    shared: Arc<SessionShared>,
    metrics: Arc<ServerMetrics>,
    journal: Arc<dyn EventLog>,
) {
    let started = Instant::now();
    let peer = conn.peer().to_string();
    {
        let mut state = shared.state.lock();
        if *state == SessionState::Created {
            *state = SessionState::Running;
        }
    }

    while !shared.cancel.load(Ordering::SeqCst) {
        if handler.process_one_request(&mut conn) == Flow::Disconnect {
            break;
        }
    }

    shared.set_state(SessionState::Stopping);
    conn.close();
    metrics.connection_closed();
    let bytes = shared.bytes.load(Ordering::Relaxed);
    journal.session_closed(&id, &peer, bytes, started.elapsed());
    info!(session = %id, peer = %peer, bytes, "session ended");
    shared.set_state(SessionState::Stopped);
    shared.active.store(false, Ordering::SeqCst);
}

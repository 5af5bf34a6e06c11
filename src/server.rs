//! Daemon front: owns the listening socket and the session registry.
//!
//! `run` is a blocking accept loop; the caller supplies the thread. `stop`
//! may be called from any other thread (a signal handler, a test) and
//! returns once every session worker has been joined.

use crate::config::ServerConfig;
use crate::error::{FerryError, Result};
use crate::logger::{EventLog, NoopLog};
use crate::metrics::{ServerMetrics, ServerSnapshot};
use crate::protocol::timeouts;
use crate::session::{SessionInfo, SessionManager};
use crate::transport::Listener;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Server {
    bind_host: String,
    // Also the accept gate: run() accepts and registers under this lock
    listener: Mutex<Option<Listener>>,
    running: AtomicBool,
    sessions: SessionManager,
    metrics: Arc<ServerMetrics>,
    max_connections: AtomicUsize,
    recv_timeout_secs: AtomicU64,
    accept_poll: Duration,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_event_log(config, Arc::new(NoopLog))
    }

    pub fn with_event_log(config: &ServerConfig, journal: Arc<dyn EventLog>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        Self {
            bind_host: config.bind.clone(),
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
            sessions: SessionManager::new(config.shared_dir.clone(), Arc::clone(&metrics), journal),
            metrics,
            max_connections: AtomicUsize::new(config.max_connections),
            recv_timeout_secs: AtomicU64::new(config.recv_timeout_secs),
            accept_poll: config.accept_poll(),
        }
    }

    fn recv_timeout(&self) -> Option<Duration> {
        let secs = self.recv_timeout_secs.load(Ordering::Relaxed);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Bind the listening socket and point sessions at `shared_dir`,
    /// creating it when missing. Port 0 picks an ephemeral port.
    pub fn start(&self, port: u16, shared_dir: impl AsRef<Path>) -> Result<()> {
        let mut slot = self.listener.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(FerryError::AlreadyRunning);
        }
        let dir = shared_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| FerryError::fs(dir, e))?;
        self.sessions.change_shared_directory(dir)?;

        let addr = format!("{}:{}", self.bind_host, port);
        let listener = Listener::bind(&addr, self.recv_timeout())?;
        let local = listener.local_addr()?;
        *slot = Some(listener);
        self.running.store(true, Ordering::SeqCst);
        info!(addr = %local, dir = %dir.display(), "ferryd listening");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accept connections until `stop` is called.
    pub fn run(&self) -> Result<()> {
        if !self.is_running() {
            return Err(FerryError::NotRunning);
        }
        while self.running.load(Ordering::SeqCst) {
            // Free capacity before deciding whether to accept
            let reaped = self.sessions.cleanup_finished();
            if reaped > 0 {
                debug!(reaped, "cleaned up finished sessions");
            }

            let limit = self.max_connections.load(Ordering::Relaxed);
            if limit > 0 && self.sessions.active_session_count() >= limit {
                thread::sleep(Duration::from_millis(timeouts::CAPACITY_WAIT_MS));
                continue;
            }

            let idle = {
                let slot = self.listener.lock();
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(listener) = slot.as_ref() else {
                    break;
                };
                match listener.accept() {
                    Ok(Some((conn, peer))) => {
                        info!(peer = %peer, "accepted connection");
                        if let Err(e) = self.sessions.spawn(conn) {
                            warn!(peer = %peer, error = %e, "failed to start session");
                        }
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        self.metrics.connection_failed();
                        warn!(error = %e, "accept failed");
                        true
                    }
                }
            };
            if idle {
                thread::sleep(self.accept_poll);
            }
        }
        debug!("accept loop exited");
        Ok(())
    }

    /// Close the listener and stop every session. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        // Waits out an in-flight accept, so no session registers after this
        let listener = self.listener.lock().take();
        drop(listener);
        self.sessions.stop_all();
        if was_running {
            info!("ferryd stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn set_shared_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        self.sessions.change_shared_directory(path.as_ref())
    }

    pub fn shared_directory(&self) -> PathBuf {
        self.sessions.shared_directory().to_path_buf()
    }

    /// 0 removes the limit.
    pub fn set_max_connections(&self, n: usize) {
        self.max_connections.store(n, Ordering::Relaxed);
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Receive timeout for sessions accepted from now on. 0 disables it.
    pub fn set_timeout(&self, secs: u64) {
        self.recv_timeout_secs.store(secs, Ordering::Relaxed);
        let timeout = self.recv_timeout();
        if let Some(listener) = self.listener.lock().as_mut() {
            listener.set_recv_timeout(timeout);
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.active_session_count()
    }

    pub fn active_clients(&self) -> Vec<String> {
        self.sessions.active_client_addresses()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.sessions()
    }

    pub fn metrics(&self) -> ServerSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn export_metrics(&self, path: impl AsRef<Path>) -> Result<()> {
        self.metrics.export_csv(path.as_ref())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1".into(),
            accept_poll_ms: 10,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn start_twice_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let server = Server::new(&config());
        assert!(!server.is_running());
        assert!(matches!(server.run(), Err(FerryError::NotRunning)));

        server.start(0, tmp.path().join("share")).unwrap();
        assert!(server.is_running());
        assert!(tmp.path().join("share").is_dir());
        assert!(server.local_addr().is_some());
        assert!(matches!(
            server.start(0, tmp.path()),
            Err(FerryError::AlreadyRunning)
        ));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn stop_ends_run_loop() {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(Server::new(&config()));
        server.start(0, tmp.path()).unwrap();
        let runner = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        thread::sleep(Duration::from_millis(50));
        server.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn settings_round_trip() {
        let tmp = TempDir::new().unwrap();
        let server = Server::new(&config());
        server.set_max_connections(3);
        assert_eq!(server.max_connections(), 3);
        server.set_timeout(1);
        server.set_shared_directory(tmp.path()).unwrap();
        assert_eq!(server.shared_directory(), tmp.path());
        assert!(server
            .set_shared_directory(tmp.path().join("missing"))
            .is_err());
    }
}

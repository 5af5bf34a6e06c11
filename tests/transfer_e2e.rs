use anyhow::Result;
use ferry::config::{ClientConfig, ServerConfig};
use ferry::history::Operation;
use ferry::client::TransferProgress;
use ferry::{Client, FerryError, Server};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

fn write_file(path: &Path, size: usize) -> Result<Vec<u8>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut data = Vec::with_capacity(size);
    let mut val: u8 = 0;
    for _ in 0..size {
        data.push(val);
        val = val.wrapping_add(7);
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(&data)?;
    Ok(data)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// A running daemon on an ephemeral loopback port.
struct Harness {
    server: Arc<Server>,
    runner: Option<JoinHandle<ferry::Result<()>>>,
    port: u16,
    share: TempDir,
}

impl Harness {
    fn start() -> Self {
        Self::with_limit(0)
    }

    fn with_limit(max_connections: usize) -> Self {
        let share = TempDir::new().unwrap();
        let config = ServerConfig {
            bind: "127.0.0.1".into(),
            max_connections,
            recv_timeout_secs: 1,
            accept_poll_ms: 10,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(&config));
        server.start(0, share.path()).unwrap();
        let port = server.local_addr().unwrap().port();
        let runner = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        Self {
            server,
            runner: Some(runner),
            port,
            share,
        }
    }

    fn client(&self) -> Client {
        let mut client = Client::new(ClientConfig {
            io_timeout_secs: 20,
            ..ClientConfig::default()
        });
        client.connect("127.0.0.1", self.port).unwrap();
        client
    }

    fn stop(&mut self) {
        self.server.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.stop();
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

#[test]
fn upload_then_download_is_byte_identical() -> Result<()> {
    let h = Harness::start();
    let local = TempDir::new()?;
    let out = TempDir::new()?;
    let mut client = h.client();

    // 1 byte, and one that crosses the 64KiB streaming buffer
    for (name, size) in [("one.bin", 1usize), ("big.bin", 70_000)] {
        let data = write_file(&local.path().join(name), size)?;
        assert_eq!(client.put(local.path().join(name))?, size as u64);
        assert_eq!(client.get(name, out.path())?, size as u64);
        assert_eq!(std::fs::read(out.path().join(name))?, data);
        assert_eq!(std::fs::read(h.share.path().join(name))?, data);
    }
    Ok(())
}

#[test]
fn empty_upload_creates_file_but_download_reports_not_found() -> Result<()> {
    let h = Harness::start();
    let local = TempDir::new()?;
    let out = TempDir::new()?;
    let mut client = h.client();

    write_file(&local.path().join("empty.txt"), 0)?;
    assert_eq!(client.put(local.path().join("empty.txt"))?, 0);
    assert!(wait_until(|| h.share.path().join("empty.txt").exists()));

    // Zero size on the wire means "not found"
    let err = client.get("empty.txt", out.path()).unwrap_err();
    assert!(matches!(err, FerryError::FileNotFound(_)));
    assert!(client.is_connected());
    Ok(())
}

#[test]
fn list_twice_returns_same_set() -> Result<()> {
    let h = Harness::start();
    for name in ["a.txt", "b.txt", "c.txt"] {
        write_file(&h.share.path().join(name), 5)?;
    }
    std::fs::create_dir(h.share.path().join("subdir"))?;

    let mut client = h.client();
    let first: HashSet<String> = client.list()?.into_iter().collect();
    let second: HashSet<String> = client.list()?.into_iter().collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert!(!first.contains("subdir"));
    Ok(())
}

#[test]
fn missing_file_leaves_connection_usable() -> Result<()> {
    let h = Harness::start();
    write_file(&h.share.path().join("present.txt"), 3)?;
    let out = TempDir::new()?;
    let mut client = h.client();

    let err = client.get("absent.txt", out.path()).unwrap_err();
    assert!(matches!(err, FerryError::FileNotFound(ref n) if n == "absent.txt"));
    assert!(err.is_expected());
    assert!(client.is_connected());
    assert!(!out.path().join("absent.txt").exists());

    assert_eq!(client.list()?, vec!["present.txt".to_string()]);
    let history = client.history(None);
    assert!(!history[0].success);
    assert!(history[1].success);
    Ok(())
}

#[test]
fn upload_of_name_the_daemon_would_refuse_fails_locally() -> Result<()> {
    let h = Harness::start();
    let local = TempDir::new()?;
    let mut client = h.client();
    let path = local.path().join("report\\2024.txt");
    write_file(&path, 5)?;

    let err = client.put(&path).unwrap_err();
    assert!(matches!(err, FerryError::InvalidFilename(_)));
    assert!(client.is_connected());
    let snap = client.metrics();
    assert_eq!(snap.total_bytes_sent, 0);
    assert_eq!(snap.failed_requests, 1);

    assert!(client.list()?.is_empty());
    Ok(())
}

#[test]
fn progress_updates_while_streaming() -> Result<()> {
    let h = Harness::start();
    let local = TempDir::new()?;
    let out = TempDir::new()?;
    let size = 200_000usize;
    write_file(&local.path().join("stream.bin"), size)?;

    // Zero interval ticks on every chunk
    let mut client = Client::new(ClientConfig {
        io_timeout_secs: 20,
        progress_interval_ms: 0,
        ..ClientConfig::default()
    });
    client.connect("127.0.0.1", h.port)?;
    let seen: Arc<Mutex<Vec<(Operation, u64, u64)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    client.set_progress(Some(Box::new(move |p: &TransferProgress| {
        sink.lock().push((p.operation, p.transferred, p.total));
    })));

    client.put(local.path().join("stream.bin"))?;
    client.get("stream.bin", out.path())?;

    let seen = seen.lock();
    for op in [Operation::Put, Operation::Get] {
        let ticks: Vec<_> = seen.iter().filter(|t| t.0 == op).collect();
        assert!(ticks.iter().any(|t| t.1 < t.2), "{op:?} had no in-flight update");
        let last = ticks.last().unwrap();
        assert_eq!(last.1, size as u64);
        assert_eq!(last.2, size as u64);
        assert!(ticks.windows(2).all(|w| w[0].1 <= w[1].1));
    }
    assert!(client.metrics().throughput_kbps > 0.0);
    Ok(())
}

#[test]
fn filename_boundary_255_exact_and_longer_truncates() -> Result<()> {
    let h = Harness::start();
    let local = TempDir::new()?;
    let out = TempDir::new()?;
    let mut client = h.client();

    let exact = "n".repeat(255);
    let data = write_file(&local.path().join(&exact), 10)?;
    client.put(local.path().join(&exact))?;
    assert_eq!(client.list()?, vec![exact.clone()]);
    assert_eq!(std::fs::read(h.share.path().join(&exact))?, data);

    // 300 bytes: the server sees the first 255
    let long = format!("{}{}", exact, "z".repeat(45));
    assert_eq!(client.get(&long, out.path())?, 10);
    assert_eq!(std::fs::read(out.path().join(&exact))?, data);
    assert_eq!(client.history(Some(1))[0].filename, exact);
    Ok(())
}

#[test]
fn concurrent_sessions_are_independent() -> Result<()> {
    let h = Harness::start();
    const N: usize = 4;
    let mut clients: Vec<Client> = (0..N).map(|_| h.client()).collect();
    assert!(wait_until(|| h.server.active_session_count() == N));
    assert_eq!(h.server.active_clients().len(), N);

    let workers: Vec<_> = clients
        .drain(..)
        .enumerate()
        .map(|(i, mut client)| {
            thread::spawn(move || -> Result<Client> {
                let local = TempDir::new()?;
                let out = TempDir::new()?;
                let name = format!("client-{i}.bin");
                let data = write_file(&local.path().join(&name), 20_000 + i * 1000)?;
                client.put(local.path().join(&name))?;
                assert!(client.list()?.contains(&name));
                client.get(&name, out.path())?;
                assert_eq!(std::fs::read(out.path().join(&name))?, data);
                Ok(client)
            })
        })
        .collect();

    let mut finished = Vec::new();
    for w in workers {
        finished.push(w.join().unwrap()?);
    }
    assert_eq!(h.server.active_session_count(), N);

    for mut client in finished {
        client.disconnect();
    }
    assert!(wait_until(|| h.server.active_session_count() == 0));
    assert!(wait_until(|| h.server.metrics().active_connections == 0));
    assert_eq!(h.server.metrics().files_uploaded, N as u64);
    Ok(())
}

#[test]
fn metrics_stay_monotonic_until_reset() -> Result<()> {
    let h = Harness::start();
    write_file(&h.share.path().join("a.txt"), 12)?;
    let local = TempDir::new()?;
    write_file(&local.path().join("up.bin"), 4096)?;
    let out = TempDir::new()?;
    let mut client = h.client();

    let mut last = client.metrics();
    for step in 0..6 {
        let _ = match step % 3 {
            0 => client.list().map(|_| ()),
            1 => client.get(if step == 1 { "a.txt" } else { "nope" }, out.path()).map(|_| ()),
            _ => client.put(local.path().join("up.bin")).map(|_| ()),
        };
        let now = client.metrics();
        assert!(now.total_requests >= now.failed_requests);
        assert!(now.total_bytes_sent >= last.total_bytes_sent);
        assert!(now.total_bytes_received >= last.total_bytes_received);
        assert_eq!(now.total_requests, last.total_requests + 1);
        last = now;
    }
    assert_eq!(last.failed_requests, 1);
    assert!(last.rtt_ms > 0.0);

    // The server finishes its bookkeeping after the last byte leaves
    assert!(wait_until(|| {
        let server = h.server.metrics();
        server.files_downloaded == 1 && server.files_uploaded == 2
    }));
    let server = h.server.metrics();
    assert!(server.total_requests >= server.failed_requests);

    client.reset_metrics();
    let zeroed = client.metrics();
    assert_eq!(zeroed.total_requests, 0);
    assert_eq!(zeroed.total_bytes_sent, 0);
    assert_eq!(zeroed.rtt_ms, 0.0);
    assert!(client.history(None).is_empty());

    h.server.reset_metrics();
    let server = h.server.metrics();
    assert_eq!(server.total_requests, 0);
    assert_eq!(server.active_connections, 1);
    Ok(())
}

#[test]
fn two_file_share_scenario() -> Result<()> {
    let h = Harness::start();
    let a = write_file(&h.share.path().join("a.txt"), 12)?;
    write_file(&h.share.path().join("b.bin"), 70_000)?;
    let work = TempDir::new()?;
    let out = work.path().join("out");
    std::fs::create_dir(&out)?;

    let mut client = h.client();
    let listed: HashSet<String> = client.list()?.into_iter().collect();
    let expected: HashSet<String> = ["a.txt", "b.bin"].iter().map(|s| s.to_string()).collect();
    assert_eq!(listed, expected);

    assert_eq!(client.get("a.txt", &out)?, 12);
    assert_eq!(std::fs::read(out.join("a.txt"))?, a);

    assert_eq!(client.put(out.join("a.txt"))?, 12);
    let listed: HashSet<String> = client.list()?.into_iter().collect();
    assert_eq!(listed, expected);

    let snap = client.metrics();
    assert_eq!(snap.files_downloaded, 1);
    assert_eq!(snap.files_uploaded, 1);
    assert_eq!(client.metrics_handle().count_operations(Operation::List), 2);
    Ok(())
}

#[test]
fn ping_echoes_and_feeds_rtt() -> Result<()> {
    let h = Harness::start();
    let mut client = h.client();
    let rtt = client.ping()?;
    assert!(rtt < Duration::from_secs(5));
    assert!(client.metrics().rtt_ms > 0.0);
    assert!(client.is_connected());
    Ok(())
}

#[test]
fn shared_directory_change_reaches_live_sessions() -> Result<()> {
    let h = Harness::start();
    write_file(&h.share.path().join("old.txt"), 1)?;
    let other = TempDir::new()?;
    write_file(&other.path().join("new.txt"), 1)?;

    let mut client = h.client();
    assert_eq!(client.list()?, vec!["old.txt".to_string()]);

    h.server.set_shared_directory(other.path())?;
    assert_eq!(client.list()?, vec!["new.txt".to_string()]);

    let missing = other.path().join("not-there");
    assert!(matches!(
        h.server.set_shared_directory(&missing),
        Err(FerryError::NotADirectory(_))
    ));
    assert_eq!(h.server.shared_directory(), other.path());
    Ok(())
}

#[test]
fn connection_limit_queues_instead_of_rejecting() -> Result<()> {
    let h = Harness::with_limit(1);
    write_file(&h.share.path().join("a.txt"), 2)?;

    let mut first = h.client();
    assert!(wait_until(|| h.server.active_session_count() == 1));

    // TCP connect succeeds through the backlog; no session is spawned yet
    let mut second = h.client();
    let waiting = thread::spawn(move || {
        let names = second.list();
        (second, names)
    });
    thread::sleep(Duration::from_millis(300));
    assert_eq!(h.server.active_session_count(), 1);
    assert!(!waiting.is_finished());

    assert_eq!(first.list()?, vec!["a.txt".to_string()]);
    first.disconnect();

    let (_second, names) = waiting.join().unwrap();
    assert_eq!(names?, vec!["a.txt".to_string()]);
    assert_eq!(h.server.max_connections(), 1);
    Ok(())
}

#[test]
fn stop_ends_every_session() -> Result<()> {
    let mut h = Harness::start();
    let mut a = h.client();
    let _b = h.client();
    assert!(wait_until(|| h.server.active_session_count() == 2));

    h.stop();
    assert!(!h.server.is_running());
    assert_eq!(h.server.active_session_count(), 0);
    assert!(h.server.sessions().is_empty());

    assert!(a.list().is_err());
    assert!(!a.is_connected());
    Ok(())
}

#[test]
fn metrics_csv_appends_rows() -> Result<()> {
    let h = Harness::start();
    let tmp = TempDir::new()?;
    let mut client = h.client();
    client.list()?;

    let client_csv = tmp.path().join("client.csv");
    client.export_metrics(&client_csv)?;
    client.export_metrics(&client_csv)?;
    let text = std::fs::read_to_string(&client_csv)?;
    assert_eq!(text.lines().count(), 3);
    assert!(text.starts_with("Timestamp,"));

    let server_csv = tmp.path().join("server.csv");
    h.server.export_metrics(&server_csv)?;
    assert_eq!(std::fs::read_to_string(&server_csv)?.lines().count(), 2);
    Ok(())
}

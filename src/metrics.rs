//! Client and server metrics aggregates.
//!
//! Counters are plain atomics so concurrent sessions never contend on them.
//! Derived rates (RTT, throughput, latency) are exponential moving averages
//! kept behind a short-lived lock because several fields move together.

use crate::error::{FerryError, Result};
use crate::history::{Operation, RequestRecord};
use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Weight kept by the client RTT average on each new sample (70/30).
pub const CLIENT_RTT_WEIGHT: f64 = 0.7;

/// Weight kept by the server throughput/latency averages (90/10).
pub const SERVER_RATE_WEIGHT: f64 = 0.9;

/// Exponential moving average with an explicit "unset" baseline.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    history_weight: f64,
    value: Option<f64>,
}

impl Ema {
    pub const fn new(history_weight: f64) -> Self {
        Self {
            history_weight,
            value: None,
        }
    }

    /// First sample becomes the baseline; later ones are blended.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => prev * self.history_weight + sample * (1.0 - self.history_weight),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Throughput in kilobits per second.
pub fn throughput_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / ms
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Append one row to a delimited file, writing the header only when the
/// file is new.
pub fn append_csv_row(path: &Path, header: &str, row: &str) -> Result<()> {
    let exists = path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FerryError::fs(path, e))?;
    let mut out = String::new();
    if !exists {
        out.push_str(header);
        out.push('\n');
    }
    out.push_str(row);
    out.push('\n');
    file.write_all(out.as_bytes())
        .map_err(|e| FerryError::fs(path, e))?;
    Ok(())
}

#[derive(Debug)]
struct ClientRates {
    rtt: Ema,
    throughput_kbps: f64,
    transfer_latency_ms: f64,
}

impl Default for ClientRates {
    fn default() -> Self {
        Self {
            rtt: Ema::new(CLIENT_RTT_WEIGHT),
            throughput_kbps: 0.0,
            transfer_latency_ms: 0.0,
        }
    }
}

/// Metrics for one client instance.
#[derive(Debug)]
pub struct ClientMetrics {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    files_uploaded: AtomicU64,
    files_downloaded: AtomicU64,
    total_transfer_time_us: AtomicU64,
    rates: Mutex<ClientRates>,
    history: Mutex<VecDeque<RequestRecord>>,
    // 0 = unbounded
    history_limit: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub rtt_ms: f64,
    pub throughput_kbps: f64,
    pub transfer_latency_ms: f64,
    pub loss_rate: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub total_transfer_time_ms: f64,
}

impl ClientSnapshot {
    pub const CSV_HEADER: &'static str = "Timestamp,RTT_ms,Throughput_kbps,Packet_Loss_Rate,Transfer_Latency_ms,Total_Requests,Failed_Requests,Bytes_Sent,Bytes_Received,Files_Uploaded,Files_Downloaded";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{:.3},{:.3},{:.3},{:.3},{},{},{},{},{},{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.rtt_ms,
            self.throughput_kbps,
            self.loss_rate,
            self.transfer_latency_ms,
            self.total_requests,
            self.failed_requests,
            self.total_bytes_sent,
            self.total_bytes_received,
            self.files_uploaded,
            self.files_downloaded,
        )
    }
}

impl fmt::Display for ClientSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Client Metrics ===")?;
        writeln!(f, "RTT:                 {:.3} ms", self.rtt_ms)?;
        writeln!(f, "Throughput:          {:.3} kbps", self.throughput_kbps)?;
        writeln!(
            f,
            "Packet Loss Rate:    {:.2} % ({}/{})",
            self.loss_rate, self.failed_requests, self.total_requests
        )?;
        writeln!(f, "Transfer Latency:    {:.3} ms", self.transfer_latency_ms)?;
        writeln!(f, "Bytes Sent:          {}", self.total_bytes_sent)?;
        writeln!(f, "Bytes Received:      {}", self.total_bytes_received)?;
        writeln!(f, "Files Uploaded:      {}", self.files_uploaded)?;
        write!(f, "Files Downloaded:    {}", self.files_downloaded)
    }
}

impl ClientMetrics {
    pub fn new(history_limit: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            files_uploaded: AtomicU64::new(0),
            files_downloaded: AtomicU64::new(0),
            total_transfer_time_us: AtomicU64::new(0),
            rates: Mutex::new(ClientRates::default()),
            history: Mutex::new(VecDeque::new()),
            history_limit: AtomicUsize::new(history_limit),
        }
    }

    /// Count a finished request, append it to the history and feed its
    /// duration into the RTT average.
    pub fn record_request(&self, record: RequestRecord) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        if !record.success {
            self.failed_requests.fetch_add(1, Ordering::SeqCst);
        }
        self.rates.lock().rtt.update(record.duration_ms);

        let limit = self.history_limit.load(Ordering::Relaxed);
        let mut history = self.history.lock();
        history.push_back(record);
        if limit > 0 {
            while history.len() > limit {
                history.pop_front();
            }
        }
    }

    /// Feed an RTT sample without counting a request (connect handshake).
    pub fn record_rtt(&self, elapsed: Duration) -> f64 {
        self.rates.lock().rtt.update(millis(elapsed))
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.total_bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.total_bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn file_uploaded(&self) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_downloaded(&self) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// In-flight figure for the transfer currently streaming.
    pub fn update_live_throughput(&self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        let mut rates = self.rates.lock();
        rates.throughput_kbps = throughput_kbps(bytes, elapsed);
        rates.transfer_latency_ms = millis(elapsed);
    }

    /// Close out a transfer: throughput becomes the aggregate over every
    /// completed transfer so far.
    pub fn finish_transfer(&self, elapsed: Duration) {
        let us = (elapsed.as_micros() as u64).max(1);
        let total_us = self.total_transfer_time_us.fetch_add(us, Ordering::Relaxed) + us;
        let total_bytes = self.total_bytes_sent.load(Ordering::Relaxed)
            + self.total_bytes_received.load(Ordering::Relaxed);
        let mut rates = self.rates.lock();
        rates.transfer_latency_ms = millis(elapsed);
        rates.throughput_kbps = throughput_kbps(total_bytes, Duration::from_micros(total_us));
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        // failed first so a concurrent request can never show failed > total
        let failed = self.failed_requests.load(Ordering::SeqCst);
        let total = self.total_requests.load(Ordering::SeqCst);
        let rates = self.rates.lock();
        ClientSnapshot {
            rtt_ms: rates.rtt.value(),
            throughput_kbps: rates.throughput_kbps,
            transfer_latency_ms: rates.transfer_latency_ms,
            loss_rate: if total > 0 {
                failed as f64 * 100.0 / total as f64
            } else {
                0.0
            },
            total_requests: total,
            failed_requests: failed,
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            total_transfer_time_ms: self.total_transfer_time_us.load(Ordering::Relaxed) as f64
                / 1000.0,
        }
    }

    /// Newest `limit` records (all when `None`), oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<RequestRecord> {
        let history = self.history.lock();
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn count_operations(&self, op: Operation) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|r| r.operation == op && r.success)
            .count()
    }

    pub fn set_history_limit(&self, limit: usize) {
        self.history_limit.store(limit, Ordering::Relaxed);
        if limit > 0 {
            let mut history = self.history.lock();
            while history.len() > limit {
                history.pop_front();
            }
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::SeqCst);
        self.failed_requests.store(0, Ordering::SeqCst);
        self.total_bytes_sent.store(0, Ordering::Relaxed);
        self.total_bytes_received.store(0, Ordering::Relaxed);
        self.files_uploaded.store(0, Ordering::Relaxed);
        self.files_downloaded.store(0, Ordering::Relaxed);
        self.total_transfer_time_us.store(0, Ordering::Relaxed);
        *self.rates.lock() = ClientRates::default();
        self.history.lock().clear();
    }

    pub fn export_csv(&self, path: &Path) -> Result<()> {
        append_csv_row(path, ClientSnapshot::CSV_HEADER, &self.snapshot().csv_row())
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Debug)]
struct ServerRates {
    throughput: Ema,
    peak_kbps: f64,
    latency: Ema,
    started: Instant,
}

impl Default for ServerRates {
    fn default() -> Self {
        Self {
            throughput: Ema::new(SERVER_RATE_WEIGHT),
            peak_kbps: 0.0,
            latency: Ema::new(SERVER_RATE_WEIGHT),
            started: Instant::now(),
        }
    }
}

/// Aggregate shared by every session of one server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_connections: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_bytes_received: AtomicU64,
    total_bytes_sent: AtomicU64,
    files_uploaded: AtomicU64,
    files_downloaded: AtomicU64,
    rates: Mutex<ServerRates>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub uptime_secs: f64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub avg_throughput_kbps: f64,
    pub peak_throughput_kbps: f64,
    pub avg_latency_ms: f64,
}

impl ServerSnapshot {
    pub const CSV_HEADER: &'static str = "Timestamp,Uptime_s,Total_Connections,Active_Connections,Failed_Connections,Total_Requests,Failed_Requests,Bytes_Received,Bytes_Sent,Files_Uploaded,Files_Downloaded,Avg_Throughput_kbps,Peak_Throughput_kbps,Avg_Latency_ms";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{:.0},{},{},{},{},{},{},{},{},{},{:.2},{:.2},{:.2}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.uptime_secs,
            self.total_connections,
            self.active_connections,
            self.failed_connections,
            self.total_requests,
            self.failed_requests,
            self.total_bytes_received,
            self.total_bytes_sent,
            self.files_uploaded,
            self.files_downloaded,
            self.avg_throughput_kbps,
            self.peak_throughput_kbps,
            self.avg_latency_ms,
        )
    }
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Server Metrics ===")?;
        writeln!(f, "Uptime:              {:.0} seconds", self.uptime_secs)?;
        writeln!(f, "Total Connections:   {}", self.total_connections)?;
        writeln!(f, "Active Connections:  {}", self.active_connections)?;
        writeln!(f, "Failed Connections:  {}", self.failed_connections)?;
        writeln!(
            f,
            "Requests:            {} ({} failed)",
            self.total_requests, self.failed_requests
        )?;
        writeln!(f, "Bytes Received:      {} bytes", self.total_bytes_received)?;
        writeln!(f, "Bytes Sent:          {} bytes", self.total_bytes_sent)?;
        writeln!(f, "Files Uploaded:      {}", self.files_uploaded)?;
        writeln!(f, "Files Downloaded:    {}", self.files_downloaded)?;
        writeln!(f, "Avg Throughput:      {:.2} kbps", self.avg_throughput_kbps)?;
        writeln!(f, "Peak Throughput:     {:.2} kbps", self.peak_throughput_kbps)?;
        write!(f, "Avg Latency:         {:.2} ms", self.avg_latency_ms)
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.total_bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.total_bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn file_uploaded(&self) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_downloaded(&self) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed request and fold its timing into the averages.
    pub fn record_request(&self, success: bool, bytes: u64, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::SeqCst);
        }
        let mut rates = self.rates.lock();
        rates.latency.update(millis(elapsed));
        if success && bytes > 0 && !elapsed.is_zero() {
            let sample = throughput_kbps(bytes, elapsed);
            rates.throughput.update(sample);
            if sample > rates.peak_kbps {
                rates.peak_kbps = sample;
            }
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let failed = self.failed_requests.load(Ordering::SeqCst);
        let total = self.total_requests.load(Ordering::SeqCst);
        let rates = self.rates.lock();
        ServerSnapshot {
            uptime_secs: rates.started.elapsed().as_secs_f64(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            total_requests: total,
            failed_requests: failed,
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            avg_throughput_kbps: rates.throughput.value(),
            peak_throughput_kbps: rates.peak_kbps,
            avg_latency_ms: rates.latency.value(),
        }
    }

    /// Zero every counter and rate. The active-connection gauge mirrors
    /// live sessions and is left alone.
    pub fn reset(&self) {
        self.total_connections.store(0, Ordering::Relaxed);
        self.failed_connections.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::SeqCst);
        self.failed_requests.store(0, Ordering::SeqCst);
        self.total_bytes_received.store(0, Ordering::Relaxed);
        self.total_bytes_sent.store(0, Ordering::Relaxed);
        self.files_uploaded.store(0, Ordering::Relaxed);
        self.files_downloaded.store(0, Ordering::Relaxed);
        *self.rates.lock() = ServerRates::default();
    }

    pub fn export_csv(&self, path: &Path) -> Result<()> {
        append_csv_row(path, ServerSnapshot::CSV_HEADER, &self.snapshot().csv_row())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn record(success: bool, ms: u64) -> RequestRecord {
        let outcome: Result<u64> = if success {
            Ok(0)
        } else {
            Err(FerryError::NotConnected)
        };
        RequestRecord::new(Operation::List, "", Duration::from_millis(ms), 0, &outcome)
    }

    #[test]
    fn ema_first_sample_is_baseline() {
        let mut ema = Ema::new(CLIENT_RTT_WEIGHT);
        assert_eq!(ema.value(), 0.0);
        assert_eq!(ema.update(10.0), 10.0);
        let blended = ema.update(20.0);
        assert!((blended - 13.0).abs() < 1e-9);
        ema.reset();
        assert_eq!(ema.update(50.0), 50.0);
    }

    #[test]
    fn server_weighting_is_slower() {
        let mut ema = Ema::new(SERVER_RATE_WEIGHT);
        ema.update(100.0);
        assert!((ema.update(200.0) - 110.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_is_kilobits_per_second() {
        // 1000 bytes in 1ms = 8000 bits/ms = 8000 kbit/s
        assert!((throughput_kbps(1000, Duration::from_millis(1)) - 8000.0).abs() < 1e-6);
        assert_eq!(throughput_kbps(1000, Duration::ZERO), 0.0);
    }

    #[test]
    fn client_history_is_bounded() {
        let metrics = ClientMetrics::new(2);
        for ms in [1, 2, 3] {
            metrics.record_request(record(true, ms));
        }
        let history = metrics.history(None);
        assert_eq!(history.len(), 2);
        assert!((history[0].duration_ms - 2.0).abs() < 1e-9);
        assert_eq!(metrics.history(Some(1)).len(), 1);
        assert_eq!(metrics.snapshot().total_requests, 3);
    }

    #[test]
    fn client_rtt_and_loss_rate() {
        let metrics = ClientMetrics::default();
        metrics.record_request(record(true, 10));
        metrics.record_request(record(false, 20));
        let snap = metrics.snapshot();
        assert!((snap.rtt_ms - 13.0).abs() < 1e-6);
        assert_eq!(snap.failed_requests, 1);
        assert!((snap.loss_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn client_reset_unsets_baselines() {
        let metrics = ClientMetrics::default();
        metrics.record_request(record(true, 10));
        metrics.add_bytes_sent(100);
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.total_bytes_sent, 0);
        assert_eq!(snap.rtt_ms, 0.0);
        assert!(metrics.history(None).is_empty());

        metrics.record_request(record(true, 40));
        assert!((metrics.snapshot().rtt_ms - 40.0).abs() < 1e-6);
    }

    #[test]
    fn finish_transfer_aggregates_throughput() {
        let metrics = ClientMetrics::default();
        metrics.add_bytes_received(1000);
        metrics.finish_transfer(Duration::from_millis(1));
        let snap = metrics.snapshot();
        assert!((snap.throughput_kbps - 8000.0).abs() < 1e-6);
        assert!((snap.transfer_latency_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn server_peak_only_rises() {
        let metrics = ServerMetrics::new();
        metrics.record_request(true, 1000, Duration::from_millis(1));
        let peak = metrics.snapshot().peak_throughput_kbps;
        metrics.record_request(true, 10, Duration::from_millis(1));
        let snap = metrics.snapshot();
        assert_eq!(snap.peak_throughput_kbps, peak);
        assert!(snap.avg_throughput_kbps < peak);
        assert!(snap.avg_throughput_kbps > 80.0);
    }

    #[test]
    fn server_counters_are_safe_across_threads() {
        let metrics = Arc::new(ServerMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.add_bytes_sent(1);
                        m.record_request(i % 2 == 0, 1, Duration::from_micros(10));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.total_bytes_sent, 8000);
        assert_eq!(snap.total_requests, 8000);
        assert_eq!(snap.failed_requests, 4000);
    }

    #[test]
    fn server_reset_keeps_active_gauge() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.add_bytes_received(10);
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_connections, 0);
        assert_eq!(snap.total_bytes_received, 0);

        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn csv_export_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.csv");
        let metrics = ServerMetrics::new();
        metrics.export_csv(&path).unwrap();
        metrics.export_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], ServerSnapshot::CSV_HEADER);
        assert!(!lines[1].starts_with("Timestamp"));

        let cpath = dir.path().join("client.csv");
        ClientMetrics::default().export_csv(&cpath).unwrap();
        let text = std::fs::read_to_string(&cpath).unwrap();
        assert!(text.starts_with(ClientSnapshot::CSV_HEADER));
    }
}

//! Cargo-style transfer status line
//!
//! One spinner at the bottom of the terminal, fed by the client's progress
//! callback. Finished transfers scroll above it.

use crate::client::{ProgressCallback, TransferProgress};
use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

pub struct TransferSpinner {
    spinner: ProgressBar,
    start_time: Instant,
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

/// Status text for one progress tick.
pub fn status_line(p: &TransferProgress) -> String {
    let secs = p.elapsed.as_secs_f64();
    let rate = if secs > 0.1 {
        format!(" @ {:.1} MB/s", mib(p.transferred) / secs)
    } else {
        String::new()
    };
    let pct = if p.total > 0 {
        p.transferred as f64 * 100.0 / p.total as f64
    } else {
        100.0
    };
    format!(
        "{} {} {:.1}/{:.1} MB ({:.0}%){}",
        p.operation.name().with(Color::Green).bold(),
        p.filename,
        mib(p.transferred),
        mib(p.total),
        pct,
        rate
    )
}

impl TransferSpinner {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    /// Callback for `Client::set_progress` that drives this spinner.
    pub fn callback(&self) -> ProgressCallback {
        let spinner = self.spinner.clone();
        Box::new(move |p: &TransferProgress| spinner.set_message(status_line(p)))
    }

    /// Print a line above the spinner
    pub fn println(&self, operation: &str, detail: &str) {
        self.spinner.suspend(|| {
            println!(
                "  {} {}",
                operation.with(Color::Green).bold(),
                detail.with(Color::Cyan)
            );
        });
    }

    pub fn finish_success(&self, files: u64, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 { mib(bytes) / elapsed } else { 0.0 };
        self.spinner.finish_with_message(format!(
            "{} {} files ({:.1} MB) in {:.1}s ({:.1} MB/s)",
            "Completed".with(Color::Green).bold(),
            files,
            mib(bytes),
            elapsed,
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner
            .finish_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

impl Default for TransferSpinner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Operation;

    #[test]
    fn status_line_reports_percentage() {
        let line = status_line(&TransferProgress {
            operation: Operation::Get,
            filename: "b.bin".into(),
            transferred: 524_288,
            total: 1_048_576,
            elapsed: Duration::from_secs(1),
        });
        assert!(line.contains("b.bin"));
        assert!(line.contains("0.5/1.0 MB (50%)"));
        assert!(line.contains("@ 0.5 MB/s"));
    }
}

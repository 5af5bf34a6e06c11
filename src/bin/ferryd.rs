//! `ferryd` - daemon serving a shared directory to ferry clients

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use ferry::cli::{init_tracing, DaemonOpts};
use ferry::config::ServerConfig;
use ferry::logger::{EventLog, NoopLog, TextLog};
use ferry::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose, opts.debug);

    let mut config = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    opts.apply(&mut config);

    let journal: Arc<dyn EventLog> = match &config.log_file {
        Some(path) => Arc::new(
            TextLog::new(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => Arc::new(NoopLog),
    };

    let server = Arc::new(Server::with_event_log(&config, journal));
    server
        .start(config.port, &config.shared_dir)
        .with_context(|| format!("Failed to start on {}", config.bind_addr()))?;

    let shared = std::fs::canonicalize(&config.shared_dir).unwrap_or_else(|_| config.shared_dir.clone());
    println!("Starting Ferry daemon:");
    println!("  Shared: {}", shared.display());
    match server.local_addr() {
        Some(addr) => println!("  Bind:   {addr}"),
        None => println!("  Bind:   {}", config.bind_addr()),
    }
    if config.max_connections > 0 {
        println!("  Limit:  {} sessions", config.max_connections);
    }
    if config.bind == "0.0.0.0" {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the share to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated. Use on trusted networks only");
    }

    {
        let server = Arc::clone(&server);
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down...");
            server.stop();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    if let (Some(path), true) = (config.metrics_csv.clone(), opts.metrics_interval > 0) {
        let server = Arc::clone(&server);
        let every = Duration::from_secs(opts.metrics_interval);
        thread::Builder::new()
            .name("ferryd-metrics".into())
            .spawn(move || {
                while server.is_running() {
                    thread::sleep(every);
                    if !server.is_running() {
                        break;
                    }
                    if let Err(e) = server.export_metrics(&path) {
                        warn!(error = %e, "metrics export failed");
                    }
                }
            })
            .context("Failed to start metrics thread")?;
    }

    server.run()?;
    server.stop();

    let snapshot = server.metrics();
    info!(
        requests = snapshot.total_requests,
        connections = snapshot.total_connections,
        "daemon exiting"
    );
    println!("{snapshot}");
    if let Some(path) = &config.metrics_csv {
        server
            .export_metrics(path)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }
    Ok(())
}

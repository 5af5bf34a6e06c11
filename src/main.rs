//! `ferry` - command line client for a ferry daemon

use anyhow::{Context, Result};
use clap::Parser;

use ferry::cli::{init_tracing, ClientCommand, ClientOpts};
use ferry::config::ClientConfig;
use ferry::progress::TransferSpinner;
use ferry::url::parse_remote;
use ferry::{Client, FerryError};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    init_tracing(opts.verbose, opts.debug);

    let mut config = match &opts.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    opts.apply(&mut config);

    let remote = parse_remote(&opts.remote)
        .with_context(|| format!("Invalid server address: {}", opts.remote))?;

    let mut client = Client::new(config);
    client
        .connect(&remote.host, remote.port)
        .with_context(|| format!("Cannot reach {}:{}", remote.host, remote.port))?;

    let outcome = run_command(&mut client, &opts);
    client.disconnect();

    if let Some(path) = &opts.metrics_csv {
        client
            .export_metrics(path)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }
    if let Some(path) = &opts.history_out {
        client
            .export_history(path)
            .with_context(|| format!("Failed to write history to {}", path.display()))?;
    }
    if opts.stats {
        println!("{}", client.metrics());
    }
    outcome
}

fn run_command(client: &mut Client, opts: &ClientOpts) -> Result<()> {
    match &opts.command {
        ClientCommand::List => {
            for name in client.list()? {
                println!("{name}");
            }
            Ok(())
        }
        ClientCommand::Get { names, out } => {
            std::fs::create_dir_all(out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            transfer(client, opts.no_progress, names, |c, name| c.get(name, out))
        }
        ClientCommand::Put { paths } => {
            transfer(client, opts.no_progress, paths, |c, path| c.put(path))
        }
        ClientCommand::Ping { count } => {
            for _ in 0..*count {
                let rtt = client.ping()?;
                println!("reply from {}: time={:.3} ms", opts.remote, rtt.as_secs_f64() * 1000.0);
            }
            Ok(())
        }
    }
}

/// Run one transfer per item, stopping at the first failure.
fn transfer<T: std::fmt::Debug>(
    client: &mut Client,
    quiet: bool,
    items: &[T],
    mut op: impl FnMut(&mut Client, &T) -> ferry::Result<u64>,
) -> Result<()> {
    let spinner = (!quiet).then(TransferSpinner::new);
    client.set_progress(spinner.as_ref().map(TransferSpinner::callback));

    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut failure = None;
    for item in items {
        match op(client, item) {
            Ok(n) => {
                files += 1;
                bytes += n;
                if let Some(s) = &spinner {
                    s.println("Done", &format!("{item:?} ({n} bytes)"));
                }
            }
            Err(e) => {
                failure = Some((format!("{item:?}"), e));
                break;
            }
        }
    }
    client.set_progress(None);

    match failure {
        None => {
            if let Some(s) = &spinner {
                s.finish_success(files, bytes);
            }
            Ok(())
        }
        Some((item, e)) => {
            if let Some(s) = &spinner {
                s.finish_error(&e.to_string());
            }
            let hint = match &e {
                FerryError::FileNotFound(_) => "not found",
                _ => "transfer failed",
            };
            Err(anyhow::Error::new(e).context(format!("{item}: {hint}")))
        }
    }
}

// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use rangedl::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Download a file over several connections, resuming earlier attempts.
#[derive(Parser, Debug)]
#[command(name = "rangedl", version, about)]
struct Args {
    /// URL to download
    url: String,

    /// Maximum number of concurrent connections
    #[arg(default_value_t = 1)]
    max_concurrent_connections: usize,

    /// Download limit in bytes per second (unlimited when omitted)
    max_download_limit: Option<u64>,

    /// Reset the budget every second instead of letting unused bytes accumulate
    #[arg(long)]
    hard: bool,

    /// Directory receiving the file and its progress sidecar
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(outcome) => {
            eprintln!(
                "Download succeeded: {} ({} bytes)",
                outcome.destination.display(),
                outcome.total_size
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Download failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<DownloadOutcome> {
    let options = DownloadOptions {
        url: args.url,
        output_dir: args.output_dir,
        workers: args.max_concurrent_connections,
        max_bytes_per_second: args.max_download_limit,
        policy: if args.hard { LimiterPolicy::Hard } else { LimiterPolicy::Soft },
        ..DownloadOptions::default()
    };
    options.validate()?;

    let mut banner = String::from("Downloading");
    if options.workers > 1 {
        banner.push_str(&format!(" using {} connections", options.workers));
    }
    if let Some(limit) = options.max_bytes_per_second {
        banner.push_str(&format!(" limited to {limit} Bps"));
    }
    eprintln!("{banner}...");

    let downloader = Arc::new(Downloader::new(options)?);

    let interrupt = {
        let token = downloader.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; progress is kept for the next run.");
                token.cancel();
            }
        })
    };

    let reporter = {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match downloader.progress() {
                    Some(fraction) => eprintln!("Downloaded {:.1}%", fraction * 100.0),
                    None => eprintln!("Downloaded {} bytes", downloader.downloaded_bytes()),
                }
            }
        })
    };

    let result = downloader.run().await;
    reporter.abort();
    interrupt.abort();

    result.context("download did not complete")
}

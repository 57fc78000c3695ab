//! rangeget command-line downloader.
//!
//! ```text
//! rangeget <URL> [FILE] [-d DIR] [-c N] [-H "Key: Value"]...
//! ```
//!
//! Defaults come from `~/.rangeget/config.ini`; flags override them.
//! Ctrl+C stops the download and keeps its manifest, so running the same
//! command again resumes it.

mod args;
mod error;
mod progress;

use std::process::ExitCode;

use clap::Parser;
use console::style;
use indicatif::HumanBytes;
use rangeget::logging::{self, LogConfig};
use rangeget::{ConfigFile, DownloadOutcome};

use args::Args;
use error::CliError;
use progress::{summary_line, ProgressDisplay};

/// Conventional exit status for a SIGINT-terminated process.
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(DownloadOutcome::Completed(summary)) => {
            println!("{}", summary_line(&summary));
            ExitCode::SUCCESS
        }
        Ok(DownloadOutcome::Interrupted { path, completed }) => {
            println!();
            match path {
                Some(path) => println!(
                    "{} after {}. Run the same command again to resume {}.",
                    style("Interrupted").yellow().bold(),
                    HumanBytes(completed),
                    path.display()
                ),
                None => println!("{}", style("Interrupted").yellow().bold()),
            }
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<DownloadOutcome, CliError> {
    let config_file = match &args.config {
        Some(path) => ConfigFile::load_from(path)?,
        None => ConfigFile::load().unwrap_or_default(),
    };

    let _log_guard =
        logging::init(LogConfig::from(config_file.logging.clone()).with_stderr(args.verbose))?;

    let config = args.to_config(&config_file)?;
    tracing::info!(url = %config.url, connections = config.connections, "Starting download");

    let (download, events) = rangeget::download(config)?;

    let handle = download.dispose_handle();
    ctrlc::set_handler(move || handle.dispose())
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let display = ProgressDisplay::new(args.quiet);
    let (outcome, ()) = runtime.block_on(async { tokio::join!(download.run(), display.consume(events)) });
    Ok(outcome?)
}

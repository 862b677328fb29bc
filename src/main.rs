use std::sync::Arc;

use anyhow::{Context, Result};
use bunnyrs::cli::{Args, normalize_args};
use bunnyrs::client::{self, ClientExit};
use bunnyrs::config::{ConfigError, EXIT_FAILURE, Mode};
use bunnyrs::exec::SystemShell;
use bunnyrs::server;
use bunnyrs::style;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = match Args::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", style::red(&e.to_string()));
            e.downcast_ref::<ConfigError>()
                .map(ConfigError::exit_code)
                .unwrap_or(EXIT_FAILURE)
        }
    };

    // The stdin reader of the client sits on a blocking thread that would keep
    // the runtime alive, so leave explicitly.
    std::process::exit(code);
}

async fn run(args: Args) -> Result<()> {
    let mode = args.into_mode()?;
    init_logging(&mode)?;

    println!("\n{}\n", style::BANNER);

    // Both SIGINT and SIGTERM land here.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || signal_token.cancel()).context("Failed to set signal handler")?;

    match mode {
        Mode::Server(config) => {
            info!("Starting bunnyrs server");
            let executor = Arc::new(SystemShell::new());
            server::run_server(config, executor, shutdown).await?;
            Ok(())
        }
        Mode::Client(config) => {
            info!("Starting bunnyrs client");
            match client::run_client(config, shutdown).await {
                Ok(ClientExit::Disconnected) | Ok(ClientExit::Terminated) => Ok(()),
                Err(e) => {
                    error!("Client error: {}", e);
                    Err(e.into())
                }
            }
        }
    }
}

/// Servers log to the console and a file; the client logs to a file only so
/// the interactive terminal stays readable.
fn init_logging(mode: &Mode) -> Result<()> {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let bunnyrs_dir = format!("{home_dir}/.bunnyrs");
    std::fs::create_dir_all(&bunnyrs_dir)
        .with_context(|| format!("Failed to create {bunnyrs_dir}"))?;

    let (log_path, console_output) = match mode {
        Mode::Server(_) => (format!("{bunnyrs_dir}/bunnyrs-server.log"), true),
        Mode::Client(_) => (format!("{bunnyrs_dir}/bunnyrs.log"), false),
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {log_path}"))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if console_output {
        use tracing_subscriber::fmt::writer::MakeWriterExt;
        let writer = std::io::stdout.and(log_file);

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }
    Ok(())
}

//! Site Restore Tool
//!
//! Restores a site backup (database dump plus file tree) onto an installation
//! reached over FTP, SFTP or the local filesystem, one resumable step at a time.

// siterestore/src/main.rs
mod config;
mod errors;
mod restore;
mod state;
mod transport;
mod utils;

use anyhow::{Context, Result};
use config::AppConfig;
use restore::RestoreOrchestrator;
use restore::db::{MySqlConnector, SqlConnector};
use restore::download::{BackupSource, StorageDownloader};
use restore::orchestrator::RestoreOptions;
use state::{FileStatusStore, RestoreStatus};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use transport::ConfiguredConnector;
use utils::memory::SystemMemory;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    utils::logger::init();
    match run_app().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Splits `--config <path>` off the arguments.
fn parse_args(mut args: Vec<String>) -> Result<(PathBuf, Vec<String>)> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args
            .get(pos + 1)
            .cloned()
            .context("--config requires a path")?;
        config_path = PathBuf::from(path);
        args.drain(pos..=pos + 1);
    }
    Ok((config_path, args))
}

fn build_orchestrator(app_config: &AppConfig) -> Result<RestoreOrchestrator> {
    let store = FileStatusStore::new(&app_config.state_dir).with_context(|| {
        format!(
            "Failed to open state directory {}",
            app_config.state_dir.display()
        )
    })?;
    let database = app_config
        .database_url
        .as_ref()
        .map(|url| Box::new(MySqlConnector::new(url.clone())) as Box<dyn SqlConnector>);

    Ok(RestoreOrchestrator::new(
        RestoreOptions::from(app_config),
        Box::new(store),
        Box::new(ConfiguredConnector::new(app_config.connection.clone())),
        database,
        Box::new(StorageDownloader::new(app_config.spaces_config.clone())),
        Box::new(SystemMemory::new(app_config.memory_limit_bytes)),
    ))
}

async fn run_app() -> Result<()> {
    let (config_path, args) = parse_args(env::args().skip(1).collect())?;
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let mut args = args.into_iter();
    let choice = match args.next() {
        Some(choice) => choice.trim().to_string(),
        None => prompt_choice()?,
    };
    let mut orchestrator = build_orchestrator(&app_config)?;

    match choice.as_str() {
        "1" | "start" => {
            let source = match args.next() {
                Some(source) => source,
                None => prompt_line("Archive path or s3:// URI: ")?,
            };
            let source = BackupSource::parse(&source)?;
            let status = orchestrator
                .start_restore(&source, args.next())
                .await
                .context("Failed to start restore")?;
            report(&status);
            ensure_not_failed(&status)?;
        }
        "2" | "step" => match orchestrator.process_next_step().await? {
            Some(status) => {
                report(&status);
                ensure_not_failed(&status)?;
            }
            None => log::info!("No restore in progress."),
        },
        "3" | "run" => loop {
            let Some(status) = orchestrator.process_next_step().await? else {
                log::info!("No restore in progress.");
                break;
            };
            report(&status);
            if status.is_terminal() {
                ensure_not_failed(&status)?;
                break;
            }
        },
        "4" | "status" => match orchestrator.status()? {
            Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            None => match orchestrator.history()?.first() {
                Some(last) => log::info!("No restore in progress. Last: {} ({:?}) {}", last.restore_id, last.status, last.summary),
                None => log::info!("No restore in progress."),
            },
        },
        "5" | "cancel" => {
            if orchestrator.request_cancel()? {
                log::info!("Cancellation requested; the next step will clean up.");
            } else {
                log::info!("No restore in progress.");
            }
        }
        "cancel-now" => match orchestrator.cancel_restore()? {
            Some(status) => report(&status),
            None => log::info!("No restore in progress."),
        },
        "6" | "history" => {
            for entry in orchestrator.history()? {
                println!(
                    "{}  {:<9} {}  {}",
                    entry.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    format!("{:?}", entry.status).to_lowercase(),
                    entry.restore_id,
                    entry.summary
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid choice '{}'. Use start, step, run, status, cancel, cancel-now or history.",
                choice
            );
        }
    }
    Ok(())
}

fn report(status: &RestoreStatus) {
    log::info!("[{}] {:?}: {}", status.restore_id, status.phase, status.message);
}

fn ensure_not_failed(status: &RestoreStatus) -> Result<()> {
    if status.status == state::StatusKind::Error {
        anyhow::bail!("Restore {} failed: {}", status.restore_id, status.message);
    }
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Start a restore (or type 'start')");
    println!("2. Process the next step (or type 'step')");
    println!("3. Run until finished (or type 'run')");
    println!("4. Show status (or type 'status')");
    println!("5. Cancel the running restore (or type 'cancel')");
    println!("6. Show history (or type 'history')");
    prompt_line("Enter your choice: ")
}

fn prompt_line(prompt: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}", prompt);
    stdout().flush().context("Failed to flush stdout")?;
    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

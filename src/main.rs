//! Remote GPIO client
//!
//! Entry point for the `remote-gpio` binary. Connects to a GPIO bridge over
//! an access-protected WebSocket, sends button commands, and reports which
//! LED the bridge has selected.

mod cli;
mod config;
mod connection;
mod error;
mod logging;
mod protocol;
mod remote;
mod version;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, Commands, ConfigSubcommand};
use crate::config::{RemoteConfig, ReloadingRequestSource};
use crate::connection::{ConnectionEvent, ConnectionManager, ManagerOptions, WsConnector};
use crate::error::{Error, Result};
use crate::protocol::{Command, Led};
use crate::remote::{OneShot, RemoteController};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    let (config_path, action) = match cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand).or_else(|e| exit_with(&e));
        }
        Commands::Run { config } => (config, Action::Run),
        Commands::Send {
            command,
            led,
            config,
            wait_secs,
        } => (config, Action::Send { command, led, wait_secs }),
    };

    let config = RemoteConfig::load(config_path.as_deref()).or_else(|e| exit_with(&e))?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting remote-gpio"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("remote-gpio")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(async {
        match action {
            Action::Run => run_interactive(config, config_path).await,
            Action::Send { command, led, wait_secs } => {
                run_send(config, config_path, command, led, wait_secs).await
            }
        }
    });

    if let Err(e) = result {
        error!(error = %e.format_for_log(), "Command failed");
        return exit_with(&e);
    }

    Ok(())
}

enum Action {
    Run,
    Send {
        command: Command,
        led: Option<Led>,
        wait_secs: u64,
    },
}

/// Print a formatted error and exit with its category code
fn exit_with<T>(e: &Error) -> Result<T> {
    eprint!("{}", e.format_for_terminal());
    std::process::exit(e.exit_code());
}

/// Manager whose connect requests re-read the configuration every time
fn spawn_manager(
    config: &RemoteConfig,
    config_path: Option<String>,
) -> (ConnectionManager, tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>) {
    ConnectionManager::spawn(
        WsConnector,
        Arc::new(ReloadingRequestSource::new(config_path)),
        ManagerOptions::from(&config.connection),
    )
}

/// Interactive console session
async fn run_interactive(config: RemoteConfig, config_path: Option<String>) -> Result<()> {
    info!(
        endpoint = %config.endpoint_url()?,
        heartbeat_secs = config.connection.heartbeat_interval_secs,
        "Configuration loaded"
    );
    println!("{}", remote::HELP);

    let (manager, events) = spawn_manager(&config, config_path);
    let controller = RemoteController::new(manager, events, config.connection.heartbeat_interval());
    remote::run_console(controller).await
}

/// One-shot send
async fn run_send(
    config: RemoteConfig,
    config_path: Option<String>,
    command: Command,
    led: Option<Led>,
    wait_secs: u64,
) -> Result<()> {
    let request = OneShot {
        command,
        led,
        endpoint: config.endpoint_url()?.to_string(),
        connect_timeout: config.connection.connect_timeout(),
        reply_wait: std::time::Duration::from_secs(wait_secs),
    };

    let (manager, events) = spawn_manager(&config, config_path);
    if let Some(token) = remote::send_once(manager, events, request).await? {
        println!("{}", token);
    }

    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = RemoteConfig::load(config.as_deref())?;
            print!("{}", cfg.redacted().to_toml()?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            let cfg = RemoteConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
            println!("Endpoint: {}", cfg.endpoint_url()?);
        }
    }

    Ok(())
}

//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the remote GPIO client.

use clap::{Parser, Subcommand};

use crate::protocol::{Command, Led};

/// Remote GPIO client
///
/// Drives a GPIO bridge over an authenticated WebSocket: sends up/down/stop
/// and LED selection commands and shows which LED the bridge reports as
/// selected. Reconnects automatically when the connection drops.
#[derive(Parser, Debug)]
#[command(name = "remote-gpio")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive session: read commands from stdin, print selection updates
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "REMOTE_GPIO_CONFIG")]
        config: Option<String>,
    },

    /// Send a single command and exit
    Send {
        /// up, down, stop or select
        #[arg(value_parser = parse_command)]
        command: Command,

        /// LED for select: L1, L2, L3, L4 or ALL
        #[arg(value_parser = parse_led)]
        led: Option<Led>,

        /// Path to configuration file
        #[arg(short, long, env = "REMOTE_GPIO_CONFIG")]
        config: Option<String>,

        /// Seconds to wait for the remote to report the selection (0 = don't wait)
        #[arg(short, long, default_value = "0")]
        wait_secs: u64,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the resolved configuration (secret redacted)
    Show {
        /// Path to configuration file
        #[arg(short, long, env = "REMOTE_GPIO_CONFIG")]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, env = "REMOTE_GPIO_CONFIG")]
        config: Option<String>,
    },
}

fn parse_command(value: &str) -> Result<Command, String> {
    value.parse().map_err(|_| {
        let names: Vec<_> = Command::ALL.iter().map(|c| c.as_str()).collect();
        format!("expected one of: {}", names.join(", "))
    })
}

fn parse_led(value: &str) -> Result<Led, String> {
    value
        .parse()
        .map_err(|_| "expected one of: L1, L2, L3, L4, ALL".to_string())
}

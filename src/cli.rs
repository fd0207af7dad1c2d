use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use crate::{
    config::{Config, OUTGOING_PORTS},
    serial::discovery,
};

/// The command line interface for serial router.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file (.ron, or .json)
    pub config: Option<PathBuf>,

    /// Use this incoming port instead of the one in the configuration
    #[arg(long)]
    pub incoming: Option<String>,

    /// Seconds between status summaries in the log
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// List the serial ports on this machine, and which may be used as the incoming port.
    Ports,
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example configuration file in JSON.
    ConfigJson,
}

/// Run a command which does not start the router.
pub fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty()?);
        }
        Commands::Examples(Examples::ConfigJson) => {
            println!("{}", serde_json::to_string_pretty(&Config::example())?);
        }
        Commands::Ports => {
            let ports = discovery::discover_or_fallback();

            println!("Serial ports:");
            for port in &ports {
                println!("    {port}");
            }

            println!("Usable as incoming port:");
            for port in discovery::incoming_candidates(&ports, &OUTGOING_PORTS, &config.pairs) {
                println!("    {}", port.name);
            }
        }
    }

    Ok(())
}

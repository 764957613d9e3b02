//! Command-line utility for managing a running alluvium daemon.

use std::path::PathBuf;

use alluvium_control::{ControlClient, DEFAULT_CTL_PATH, protocol::reply};
use clap::{Parser, Subcommand};

/// Manage a running alluvium daemon.
#[derive(Parser, Debug)]
#[command(name = "alluviumctl")]
#[command(about = "Manage the alluvium daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the daemon's control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CTL_PATH)]
    ctl_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace the domain list of a set, creating it if needed
    Update {
        /// Kernel set name (at most 30 bytes, no `$`)
        set: String,
        /// Domains whose A records populate the set
        domains: Vec<String>,
    },
    /// Remove a set
    Drop {
        /// Kernel set name
        set: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::new(&cli.ctl_path);

    let answer = match cli.command {
        Commands::Update { set, domains } => client.update(&set, domains).await?,
        Commands::Drop { set } => client.drop_set(&set).await?,
    };

    print!("{answer}");
    anyhow::ensure!(answer == reply::OK, "the daemon rejected the request");
    Ok(())
}

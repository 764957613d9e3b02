use std::{path::PathBuf, sync::Arc};

use alluvium::Daemon;
use alluvium_dns::StubResolver;
use alluvium_ipset::IpsetCli;
use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;

/// Keeps kernel IP sets in sync with the DNS resolutions of named domains.
#[derive(Parser, Debug)]
#[command(name = "alluvium")]
#[command(about = "DNS-driven kernel IP set synchronisation daemon")]
#[command(version)]
struct Cli {
    /// Path of the control socket
    #[arg(default_value = alluvium_control::DEFAULT_CTL_PATH)]
    ctl_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    alluvium_common::logging::init();
    let cli = Cli::parse();

    let resolver =
        Arc::new(StubResolver::from_system_conf().context("cannot initialise the DNS subsystem")?);
    let backend = Arc::new(IpsetCli::new());

    // the daemon handles TERM/INT itself; the channel only has to stay open
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(8);

    Daemon::new(cli.ctl_path, resolver, backend)
        .run(shutdown_rx)
        .await?;

    Ok(())
}

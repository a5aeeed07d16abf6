//! multilink command-line entry point.

mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use multilink_coordinator::EngineConfig;

/// Split a file across several network links and send the chunks in
/// parallel, or receive and reassemble such a transfer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML engine configuration; defaults apply when the file is absent.
    #[arg(short, long, global = true, default_value = "multilink.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file over the given channels.
    Send {
        /// File to send.
        file: PathBuf,

        /// Receiver address reached over the wired link.
        #[arg(long)]
        wired: Option<SocketAddr>,

        /// Receiver address reached over the wireless link.
        #[arg(long)]
        wireless: Option<SocketAddr>,
    },
    /// Receive one transfer and reassemble it.
    Receive {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:8765")]
        listen: SocketAddr,

        /// Directory the file is written to.
        #[arg(short, long, default_value = "received_files")]
        out: PathBuf,
    },
    /// Write the effective configuration to the config path.
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), ?cli, "starting multilink");

    let config = EngineConfig::load(&cli.config)?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Send {
            file,
            wired,
            wireless,
        } => rt.block_on(commands::send(config, file, wired, wireless)),
        Command::Receive { listen, out } => rt.block_on(commands::receive(listen, out)),
        Command::InitConfig => {
            config.save(&cli.config)?;
            tracing::info!(path = %cli.config.display(), "configuration written");
            Ok(())
        }
    }
}

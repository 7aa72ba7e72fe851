//! ClipSync CLI - LAN clipboard sync.

mod commands;
mod ui;

use clap::{Parser, Subcommand};
use clipsync_core::protocol::constants::{DEFAULT_SERVICE_NAME, MULTICAST_PORT, SYNC_PORT};
use clipsync_core::{Config, IpVersion};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clipsync")]
#[command(about = "LAN clipboard sync over multicast and mDNS", long_about = None)]
struct Cli {
    /// Service name to advertise
    #[arg(short, long, default_value = DEFAULT_SERVICE_NAME)]
    name: String,

    /// Use the IPv6 multicast group
    #[arg(long)]
    ipv6: bool,

    /// Port of the push listener
    #[arg(short, long, default_value_t = SYNC_PORT)]
    port: u16,

    /// UDP port of the multicast group
    #[arg(long, default_value_t = MULTICAST_PORT)]
    multicast_port: u16,

    /// Do not join the multicast group
    #[arg(long)]
    no_multicast: bool,

    /// Do not advertise or browse over mDNS
    #[arg(long)]
    no_discovery: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            ip_version: if self.ipv6 { IpVersion::V6 } else { IpVersion::V4 },
            multicast_port: self.multicast_port,
            sync_port: self.port,
            service_name: self.name.clone(),
            discovery_enabled: !self.no_discovery,
            ..Config::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start syncing (default)
    Run,
    /// Broadcast text to the multicast group once
    Send {
        /// Text to broadcast
        text: String,
    },
    /// Show addresses, ports and the advertised identity
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("clipsync={}", level).parse()?)
                .add_directive("mdns_sd=warn".parse()?),
        )
        .init();

    let config = cli.config();

    match cli.command {
        None | Some(Commands::Run) => commands::run_sync(config, !cli.no_multicast).await?,
        Some(Commands::Send { text }) => commands::send_once(config, &text).await?,
        Some(Commands::Info) => commands::show_info(&config),
    }

    Ok(())
}

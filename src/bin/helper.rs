//! Privileged helper daemon
//!
//! Must run as root. Listens on a Unix socket for the orchestrator and
//! performs route, hosts-file and DNS-cache operations on its behalf.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vpn_bypass::config::DEFAULT_SOCKET_PATH;
use vpn_bypass::executor::Executor;
use vpn_bypass::platform;
use vpn_bypass::rpc::HELPER_VERSION;
use vpn_bypass::rpc::server::HelperServer;
use vpn_bypass::vpn::HostsManager;

#[derive(Parser)]
#[command(name = "vpn-bypass-helper")]
#[command(about = "Privileged route helper for vpn-bypass")]
#[command(version)]
struct Cli {
    /// Socket to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Additional uid allowed to connect (root is always allowed)
    #[arg(long = "allow-uid")]
    allow_uid: Vec<u32>,

    /// Hosts file to manage
    #[arg(long, default_value = "/etc/hosts")]
    hosts_file: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !nix::unistd::geteuid().is_root() {
        error!("vpn-bypass-helper must run as root");
        std::process::exit(1);
    }

    let executor = Executor::new(
        platform::get_routing_manager()?,
        HostsManager::with_path(&cli.hosts_file),
        platform::get_cache_flusher(),
    );

    let mut server = HelperServer::new(&cli.socket, executor);
    for uid in cli.allow_uid {
        info!("Allowing uid {}", uid);
        server = server.allow_uid(uid);
    }

    let listener = server.bind().await?;
    info!(
        "vpn-bypass-helper {} ready on {}",
        HELPER_VERSION,
        server.socket_path().display()
    );
    server.serve(listener, platform::shutdown_signal()).await;
    Ok(())
}

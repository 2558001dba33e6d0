use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vpn_bypass::config::{self, ConfigStore, DomainEntry, TomlConfigStore, normalize_entry};
use vpn_bypass::network::observer::NetworkObserver;
use vpn_bypass::platform;
use vpn_bypass::reconciler::{ReconcileError, Reconciler, ReconcilerOptions};
use vpn_bypass::rpc::{HelperClient, PrivilegedOps};
use vpn_bypass::state::RouteJournal;
use vpn_bypass::vpn::SystemResolver;

#[derive(Parser)]
#[command(name = "vpn-bypass")]
#[command(about = "Route selected domains and services around an active VPN")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./vpn-bypass.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the network and keep bypass routes applied
    Run,
    /// Show network state, helper version and recorded routes
    Status,
    /// Generate default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Remove recorded routes and the hosts block via the helper
    Clear,
    /// Manage bypassed domains, addresses and CIDRs
    Domains {
        #[command(subcommand)]
        action: DomainAction,
    },
    /// Manage built-in services
    Services {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum DomainAction {
    List,
    /// Add a hostname, IP address or CIDR
    Add { entry: String },
    /// Remove an entry by id
    Remove { id: String },
}

#[derive(Subcommand)]
enum ServiceAction {
    List,
    /// Enable or disable a service by id
    Toggle { id: String },
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

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Run => run(config_path).await?,
        Commands::Status => status(config_path).await?,
        Commands::Init { force } => {
            if config_path.exists() && !force {
                println!("Config already exists: {}", config_path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }
            config::save(
                &config_path,
                &config::Configuration::default(),
                &config::DaemonSettings::default(),
            )?;
            println!("Created default config: {}", config_path.display());
        }
        Commands::Clear => clear(config_path).await?,
        Commands::Domains { action } => domains(config_path, action)?,
        Commands::Services { action } => services(config_path, action)?,
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = TomlConfigStore::open(&config_path)?;
    let daemon = store.daemon().clone();
    info!("Using config {}", config_path.display());

    let client = Arc::new(HelperClient::new(&daemon.socket_path, daemon.rpc_timeout()));
    let options = ReconcilerOptions {
        log_capacity: daemon.log_capacity,
        journal: Some(RouteJournal::new(RouteJournal::default_path())),
        ..ReconcilerOptions::default()
    };
    let reconciler = Reconciler::spawn(
        client,
        Arc::new(SystemResolver::new(daemon.dns_timeout())),
        Arc::new(store),
        options,
    )?;

    match reconciler.check_helper_version().await {
        Ok(version) => info!("Helper version {}", version),
        Err(e @ ReconcileError::HelperVersionMismatch { .. }) => {
            error!("{}", e);
            return Err(e.into());
        }
        Err(e) => warn!("Helper not reachable yet: {}", e),
    }

    let inspector = Arc::from(platform::get_network_inspector()?);
    let observer = NetworkObserver::new(inspector, daemon.poll_interval(), daemon.debounce())
        .with_monitor(platform::change_monitor_command());
    let mut snapshots = observer.subscribe();
    observer.refresh().await;
    let initial = snapshots.borrow_and_update().clone();
    reconciler.update_network_status(initial).await;
    tokio::spawn(observer.run());

    let shutdown = platform::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Network observer stopped");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                reconciler.update_network_status(snapshot).await;
            }
        }
    }

    info!("Removing bypass routes before exit");
    reconciler.shutdown().await;
    if let Some(report) = reconciler.status().last_report {
        if report.failed > 0 {
            warn!("{} routes could not be removed; run `vpn-bypass clear` later", report.failed);
        }
    }
    Ok(())
}

async fn status(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = TomlConfigStore::open(&config_path)?;
    let daemon = store.daemon();

    let inspector = platform::get_network_inspector()?;
    let snapshot = tokio::task::spawn_blocking(move || inspector.snapshot()).await?;
    if snapshot.vpn_connected {
        println!(
            "VPN Status: Connected ({})",
            snapshot.vpn_interface.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("VPN Status: Not connected");
    }
    match snapshot.local_gateway {
        Some(gateway) => println!("  Local gateway: {}", gateway),
        None => println!("  Local gateway: unknown"),
    }

    let client = HelperClient::new(&daemon.socket_path, daemon.rpc_timeout());
    match client.version().await {
        Ok(version) => println!("Helper: {} ({})", version, client.socket_path().display()),
        Err(e) => println!("Helper: {}", e),
    }

    let journal = RouteJournal::new(RouteJournal::default_path());
    match journal.load() {
        Ok(Some(record)) => {
            println!("Routes: {}", record.routes.len());
            for route in &record.routes {
                println!(
                    "    {} via {} ({})",
                    route.target, route.gateway, route.label
                );
            }
            if record.hosts_written {
                println!("  Hosts block installed");
            }
        }
        Ok(None) => println!("Routes: none"),
        Err(e) => println!("Error reading state: {}", e),
    }
    Ok(())
}

async fn clear(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = TomlConfigStore::open(&config_path)?;
    let daemon = store.daemon();
    let client = HelperClient::new(&daemon.socket_path, daemon.rpc_timeout());
    let journal = RouteJournal::new(RouteJournal::default_path());

    let routes = match journal.load() {
        Ok(record) => record.map(|r| r.routes).unwrap_or_default(),
        Err(e) => {
            warn!("Ignoring unreadable journal: {}", e);
            Vec::new()
        }
    };

    let mut remaining = Vec::new();
    for route in routes {
        match client.remove_route(&route.target).await {
            Ok(()) => info!("Removed route {}", route.target),
            Err(e) if e.is_unreachable() => return Err(e.into()),
            Err(e) => {
                warn!("Failed to remove {}: {}", route.target, e);
                remaining.push(route);
            }
        }
    }

    client.update_hosts_file(&[]).await?;
    if !client.flush_dns_cache().await? {
        warn!("DNS cache flush failed");
    }

    journal.save(&remaining, false)?;
    if remaining.is_empty() {
        println!("Bypass routes cleared");
    } else {
        println!("{} routes could not be removed", remaining.len());
    }
    Ok(())
}

fn domains(config_path: PathBuf, action: DomainAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = TomlConfigStore::open(&config_path)?;
    let mut config = store.load()?;

    match action {
        DomainAction::List => {
            if config.domains.is_empty() {
                println!("No domains configured");
            }
            for entry in &config.domains {
                println!(
                    "{} {} {}",
                    entry.id,
                    if entry.enabled { "+" } else { "-" },
                    entry.domain
                );
            }
        }
        DomainAction::Add { entry } => {
            let Some(normalized) = normalize_entry(&entry) else {
                return Err(ReconcileError::InvalidEntry(entry).into());
            };
            if config.has_domain(&normalized) {
                return Err(ReconcileError::DuplicateDomain(normalized).into());
            }
            let entry = DomainEntry::new(normalized);
            println!("Added {} ({})", entry.domain, entry.id);
            config.domains.push(entry);
            store.save(&config)?;
        }
        DomainAction::Remove { id } => {
            let before = config.domains.len();
            config.domains.retain(|d| d.id != id);
            if config.domains.len() == before {
                return Err(ReconcileError::UnknownDomain(id).into());
            }
            store.save(&config)?;
            println!("Removed {}", id);
        }
    }
    Ok(())
}

fn services(config_path: PathBuf, action: ServiceAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = TomlConfigStore::open(&config_path)?;
    let mut config = store.load()?;

    match action {
        ServiceAction::List => {
            for service in &config.services {
                println!(
                    "{:<10} {} {} ({} domains, {} ranges)",
                    service.id,
                    if service.enabled { "+" } else { "-" },
                    service.name,
                    service.domains.len(),
                    service.ip_ranges.len()
                );
            }
        }
        ServiceAction::Toggle { id } => {
            let service = config
                .service_mut(&id)
                .ok_or_else(|| ReconcileError::UnknownService(id.clone()))?;
            service.enabled = !service.enabled;
            println!(
                "{} {}",
                service.name,
                if service.enabled { "enabled" } else { "disabled" }
            );
            store.save(&config)?;
        }
    }
    Ok(())
}

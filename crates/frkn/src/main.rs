//! FRKN: Hysteria2 VPN client for Linux
//!
//! Registers the device with the FRKN backend, fetches the server list and
//! runs a sing-box tunnel through the chosen server.

mod config;
mod vpn;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn::VpnManager;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// FRKN - Hysteria2 VPN client
#[derive(Parser, Debug)]
#[command(name = "frkn")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "FRKN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for credentials, engine configuration and cache
    #[arg(long, global = true, env = "FRKN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Registration backend base URL
    #[arg(long, global = true, env = "FRKN_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register this device and store the token
    Register {
        /// Register again even if credentials exist
        #[arg(long)]
        force: bool,
    },

    /// List available servers
    Servers,

    /// Print the engine configuration for a server
    Config {
        /// Server index from `frkn servers`
        #[arg(short, long, default_value = "0")]
        server: usize,
    },

    /// Bring the tunnel up and keep it until Ctrl-C
    Connect {
        /// Server index from `frkn servers`
        #[arg(short, long, default_value = "0")]
        server: usize,
    },

    /// Show effective settings, registration and network interfaces
    Status,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    setup_logging(&config.log_level);

    let vpn = VpnManager::new(&config).context("Failed to initialize")?;
    let outcome = run(&cli.command, &config, &vpn).await;
    vpn.shutdown().await;
    outcome
}

async fn run(command: &Commands, config: &AppConfig, vpn: &VpnManager) -> Result<()> {
    match command {
        Commands::Register { force } => {
            let credentials = if *force {
                vpn.register().await
            } else {
                vpn.ensure_registered().await
            }
            .context("Registration failed")?;
            println!("Device:        {}", credentials.device_id);
            println!("Referral code: {}", credentials.referral_code);
        }

        Commands::Servers => {
            let servers = vpn.servers().await.context("Failed to fetch servers")?;
            if servers.is_empty() {
                println!("No servers available");
            }
            for (index, server) in servers.iter().enumerate() {
                let obfs = server.obfuscation().map(|o| o.kind).unwrap_or("none");
                println!("[{}] {}  obfs={}", index, server, obfs);
            }
        }

        Commands::Config { server } => {
            let servers = vpn.servers().await.context("Failed to fetch servers")?;
            let descriptor = servers.get(*server).with_context(|| {
                format!(
                    "Server {} does not exist ({} available)",
                    server,
                    servers.len()
                )
            })?;
            let json = vpn.build_config(descriptor).to_json()?;
            println!("{}", json);
        }

        Commands::Connect { server } => {
            let descriptor = vpn.connect(*server).await?;
            info!("Tunnel up through {}, press Ctrl-C to disconnect", descriptor);

            let mut states = vpn.session().subscribe();
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    info!("Interrupted");
                }
                _ = states.wait_for(|s| !s.is_running()) => {
                    warn!(
                        "Tunnel went down: {}",
                        vpn.session().last_error().unwrap_or_else(|| "unknown reason".into())
                    );
                }
            }
            vpn.disconnect().await?;
        }

        Commands::Status => {
            print!("{}", config.to_toml());
            println!();
            match vpn.credentials()? {
                Some(credentials) => {
                    println!("Registered:  yes ({})", credentials.device_id);
                    println!("Referral:    {}", credentials.referral_code);
                }
                None => println!("Registered:  no"),
            }

            let report = vpn.network_report().await;
            let default = &report.default_interface;
            println!();
            if default.is_none() {
                println!("Default:     none");
            } else {
                let metered = if default.expensive { ", metered" } else { "" };
                println!("Default:     {} (index {}{})", default.name, default.index, metered);
            }
            for iface in &report.interfaces {
                println!(
                    "  {:<12} index={:<3} mtu={:<5} {}",
                    iface.name,
                    iface.index,
                    iface.mtu,
                    iface.addresses.join(" ")
                );
            }
        }
    }
    Ok(())
}

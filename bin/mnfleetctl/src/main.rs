//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "binary"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Control CLI for operators provisioning masternode fleets."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mnfleet_common::{init_tracing, AppConfig};
use mnfleet_core::{new_registry, FleetMetrics};
use mnfleet_wallet::generate_label;
use tracing::info;

mod fleet;
mod wallet;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Masternode fleet provisioning and wallet control utility",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        global = true,
        env = "MNFLEET_DIRECTORY",
        default_value = "data/servers.json",
        help = "Server directory file"
    )]
    directory: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create and fully set up instances, one pipeline per label")]
    Provision(fleet::ProvisionArgs),
    #[command(about = "Compare remote chain heights against the reference")]
    SyncCheck(fleet::SyncCheckArgs),
    #[command(about = "Run commands on many hosts concurrently")]
    Exec(fleet::ExecArgs),
    #[command(about = "Copy a file or directory to many hosts")]
    Send(fleet::SendArgs),
    #[command(subcommand, about = "Server directory maintenance")]
    Directory(fleet::DirectoryCommand),
    #[command(subcommand, about = "Reboot, reinstall or destroy single instances")]
    Instance(fleet::InstanceCommand),
    #[command(subcommand, about = "Wallet-side config and masternode actions")]
    Wallet(wallet::WalletCommand),
    #[command(about = "Print the label a naming scheme yields for an iterator")]
    Label(LabelArgs),
}

#[derive(Debug, Args)]
struct LabelArgs {
    /// Naming scheme with a run of `#` marking the iterator.
    scheme: String,
    iterator: u64,
}

/// Loaded configuration plus the shared state every command draws on.
pub struct Session {
    pub config: AppConfig,
    pub directory_path: PathBuf,
    pub metrics: Option<FleetMetrics>,
}

impl Session {
    fn dump_metrics(&self) -> Result<()> {
        let (Some(metrics), Some(path)) = (&self.metrics, &self.config.metrics.dump_path) else {
            return Ok(());
        };
        let rendered = metrics.render()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("unable to create {}", parent.display()))?;
        }
        fs::write(path, rendered)
            .with_context(|| format!("unable to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "metrics written");
        Ok(())
    }
}

fn load_config(explicit: Option<&Path>) -> Result<(AppConfig, PathBuf)> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("configs/mnfleet.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));
    let loaded = AppConfig::load_with_source(&candidates)?;
    Ok((loaded.config, loaded.source))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Label(args) = &cli.command {
        mnfleet_logging::init();
        let label = generate_label(&args.scheme, args.iterator)?;
        println!("{label}");
        return Ok(());
    }

    let (config, source) = load_config(cli.config.as_deref())?;
    init_tracing("mnfleetctl", &config.logging)?;
    info!(config_path = %source.display(), "configuration loaded");

    let metrics = if config.metrics.enabled {
        Some(FleetMetrics::new(new_registry())?)
    } else {
        None
    };
    let session = Session {
        config,
        directory_path: cli.directory,
        metrics,
    };

    let outcome = match cli.command {
        Commands::Provision(args) => fleet::provision(&session, args).await,
        Commands::SyncCheck(args) => fleet::sync_check(&session, args).await,
        Commands::Exec(args) => fleet::exec(&session, args).await,
        Commands::Send(args) => fleet::send(&session, args).await,
        Commands::Directory(cmd) => fleet::directory(&session, cmd).await,
        Commands::Instance(cmd) => fleet::instance(&session, cmd).await,
        Commands::Wallet(cmd) => wallet::run(&session, cmd).await,
        Commands::Label(_) => Ok(()),
    };
    session.dump_metrics()?;
    outcome
}

//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "binary"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Provisioning, dispatch and directory subcommands."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use mnfleet_common::{Ip, Label};
use mnfleet_core::chain::{parse_remote_height, within_tolerance};
use mnfleet_core::{
    cancellation, drive_fleet, ChainHeightSource, Collaborators, ControllerSettings, FleetDispatcher,
    HttpChainHeight, InstanceController, MemoryDirectory, OpenSshTransport, Pipeline,
    RemoteTransport, ServerDirectory, VultrProvider,
};
use tracing::{info, warn};

use crate::Session;

/// Host selection shared by the dispatch commands.
#[derive(Debug, Args)]
pub struct Targets {
    /// Instance labels, resolved to addresses through the server directory.
    #[arg(long = "label", value_name = "LABEL")]
    labels: Vec<Label>,

    /// Explicit host addresses.
    #[arg(long = "host", value_name = "IP")]
    hosts: Vec<Ip>,

    /// Every address in the server directory.
    #[arg(long, conflicts_with_all = ["labels", "hosts"])]
    all: bool,
}

impl Targets {
    fn resolve(&self, directory: &dyn ServerDirectory) -> Result<Vec<Ip>> {
        if self.all {
            let hosts = directory.all_addresses();
            if hosts.is_empty() {
                bail!("the server directory holds no addresses; run `directory refresh` first");
            }
            return Ok(hosts);
        }
        let mut hosts = self.hosts.clone();
        for label in &self.labels {
            let entry = directory
                .by_label(label)
                .with_context(|| format!("label {label} is not in the server directory"))?;
            let address = entry
                .address
                .with_context(|| format!("{label} has no address yet"))?;
            hosts.push(address);
        }
        if hosts.is_empty() {
            bail!("no target hosts; pass --label, --host or --all");
        }
        Ok(hosts)
    }
}

#[derive(Debug, Args)]
pub struct ProvisionArgs {
    /// Labels to provision; each runs as an independent pipeline.
    #[arg(long = "label", value_name = "LABEL", required = true, num_args = 1..)]
    labels: Vec<Label>,

    /// Install argument for one label, as LABEL=VALUE. Defaults to the
    /// directory's stored config line.
    #[arg(long = "host-arg", value_name = "LABEL=VALUE", value_parser = parse_host_arg)]
    host_args: Vec<(Label, String)>,
}

fn parse_host_arg(raw: &str) -> Result<(Label, String), String> {
    let (label, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=VALUE, got {raw:?}"))?;
    let label = label.parse::<Label>().map_err(|err| err.to_string())?;
    Ok((label, value.to_owned()))
}

#[derive(Debug, Args)]
pub struct SyncCheckArgs {
    #[command(flatten)]
    targets: Targets,

    /// Allowed lag in blocks; defaults to `sync.tolerance_blocks`.
    #[arg(long, value_name = "BLOCKS")]
    tolerance: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    targets: Targets,

    /// Command to run; repeat to chain several with `&&`.
    #[arg(long = "command", short = 'c', value_name = "CMD", required = true)]
    commands: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SendArgs {
    #[command(flatten)]
    targets: Targets,

    #[arg(long, value_name = "PATH")]
    local: PathBuf,

    #[arg(long, value_name = "PATH")]
    remote: PathBuf,

    /// Copy a directory tree.
    #[arg(long, short = 'r')]
    recursive: bool,
}

#[derive(Debug, Subcommand)]
pub enum DirectoryCommand {
    /// Rebuild the directory from the provider's machine list.
    Refresh,
    /// Print the directory as JSON.
    Show,
    /// Store the install argument for a label.
    #[command(name = "set-line")]
    SetLine {
        label: Label,
        line: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    Reboot { label: Label },
    /// Reinstall the operating system; the instance must be set up again.
    Reinstall { label: Label },
    /// Destroy the machine and drop it from the directory.
    Destroy { label: Label },
}

fn transport(session: &Session) -> Arc<dyn RemoteTransport> {
    Arc::new(OpenSshTransport::new(session.config.ssh.clone()))
}

/// The directory file is rewritten whenever a pipeline records a new machine.
fn load_directory(session: &Session) -> Result<Arc<MemoryDirectory>> {
    Ok(Arc::new(MemoryDirectory::open(&session.directory_path)?))
}

fn save_directory(session: &Session, directory: &MemoryDirectory) -> Result<()> {
    directory.save(&session.directory_path)
}

fn provider(session: &Session) -> Result<Arc<VultrProvider>> {
    let api_key = session.config.provider.resolve_api_key()?;
    let provider = VultrProvider::new(&session.config.provider, api_key)
        .context("unable to build provider client")?;
    Ok(Arc::new(provider))
}

fn collaborators(session: &Session, directory: Arc<MemoryDirectory>) -> Result<Collaborators> {
    let chain = HttpChainHeight::new(&session.config.sync).context("unable to build chain height client")?;
    Ok(Collaborators {
        provider: provider(session)?,
        transport: transport(session),
        chain: Arc::new(chain),
        directory: Some(directory),
        metrics: session.metrics.clone(),
    })
}

fn controller_for(
    label: &Label,
    directory: &MemoryDirectory,
    collaborators: Collaborators,
    settings: Arc<ControllerSettings>,
) -> InstanceController {
    match directory.by_label(label) {
        Some(entry) => InstanceController::from_entry(&entry, collaborators, settings),
        None => InstanceController::new(label.clone(), collaborators, settings),
    }
}

pub async fn provision(session: &Session, args: ProvisionArgs) -> Result<()> {
    let directory = load_directory(session)?;
    let collaborators = collaborators(session, directory.clone())?;
    let settings = Arc::new(ControllerSettings::from_config(&session.config));

    let (cancel, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling pending waits");
            cancel.cancel();
        }
    });

    let pipelines = args
        .labels
        .iter()
        .map(|label| {
            let host_arg = args
                .host_args
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, value)| value.clone());
            let controller = controller_for(label, &directory, collaborators.clone(), settings.clone())
                .with_cancel(signal.clone());
            Pipeline { controller, host_arg }
        })
        .collect();

    let report = drive_fleet(pipelines).await?;
    save_directory(session, &directory)?;

    for (label, outcome) in &report.outcomes {
        match outcome {
            Ok(instance) => println!(
                "{label}\tready\t{}",
                instance
                    .address
                    .as_ref()
                    .map(Ip::to_string)
                    .unwrap_or_default()
            ),
            Err(err) => println!("{label}\tfailed\t{err}"),
        }
    }
    let failed = report.failed().count();
    if failed > 0 {
        bail!("{failed} of {} pipeline(s) failed", report.outcomes.len());
    }
    Ok(())
}

pub async fn sync_check(session: &Session, args: SyncCheckArgs) -> Result<()> {
    let directory = load_directory(session)?;
    let hosts = args.targets.resolve(directory.as_ref())?;
    let tolerance = args.tolerance.unwrap_or(session.config.sync.tolerance_blocks);

    let chain = HttpChainHeight::new(&session.config.sync).context("unable to build chain height client")?;
    let reference = chain
        .reference_height()
        .await
        .context("unable to read reference chain height")?;
    let dispatcher = FleetDispatcher::for_hosts(transport(session), hosts)?.with_metrics(session.metrics.clone());
    let report = dispatcher
        .run_command(&[session.config.sync.remote_height_command.as_str()], None)
        .await?;

    let mut lagging = 0usize;
    for host in dispatcher.hosts() {
        let line = match (report.output(host), report.unreachable.get(host)) {
            (Some(output), _) => match parse_remote_height(output) {
                Ok(height) if within_tolerance(height, reference, tolerance) => {
                    format!("{host}\tsynced\t{height}/{reference}")
                }
                Ok(height) => {
                    lagging += 1;
                    format!("{host}\tbehind\t{height}/{reference}")
                }
                Err(err) => {
                    lagging += 1;
                    format!("{host}\terror\t{err}")
                }
            },
            (None, Some(reason)) => {
                lagging += 1;
                format!("{host}\tunreachable\t{reason}")
            }
            (None, None) => continue,
        };
        println!("{line}");
    }
    info!(reference, tolerance, lagging, "sync check finished");
    if lagging > 0 {
        bail!("{lagging} host(s) are not synced");
    }
    Ok(())
}

pub async fn exec(session: &Session, args: ExecArgs) -> Result<()> {
    let directory = load_directory(session)?;
    let hosts = args.targets.resolve(directory.as_ref())?;
    let dispatcher = FleetDispatcher::for_hosts(transport(session), hosts)?.with_metrics(session.metrics.clone());
    let report = dispatcher.run_command(&args.commands, None).await?;

    for (host, output) in &report.outputs {
        println!("== {host} (exit {})", output.exit_status);
        for line in &output.stdout {
            println!("{line}");
        }
        for line in &output.stderr {
            eprintln!("{host}: {line}");
        }
    }
    for (host, reason) in &report.unreachable {
        println!("== {host} unreachable: {reason}");
    }
    if !report.all_succeeded() {
        bail!(
            "{} host(s) failed, {} unreachable",
            report.failed().count(),
            report.unreachable.len()
        );
    }
    Ok(())
}

pub async fn send(session: &Session, args: SendArgs) -> Result<()> {
    let directory = load_directory(session)?;
    let hosts = args.targets.resolve(directory.as_ref())?;
    let dispatcher = FleetDispatcher::for_hosts(transport(session), hosts)?.with_metrics(session.metrics.clone());
    if let Err(err) = dispatcher
        .send_file(&args.local, &args.remote, args.recursive)
        .await
    {
        for failure in err.failures() {
            eprintln!("{failure}");
        }
        return Err(anyhow!(err));
    }
    println!("sent {} to {} host(s)", args.local.display(), dispatcher.hosts().len());
    Ok(())
}

pub async fn directory(session: &Session, command: DirectoryCommand) -> Result<()> {
    let directory = load_directory(session)?;
    match command {
        DirectoryCommand::Refresh => {
            let provider = provider(session)?;
            let count = directory.refresh(provider.as_ref()).await?;
            save_directory(session, &directory)?;
            println!("{count} server(s) recorded in {}", session.directory_path.display());
        }
        DirectoryCommand::Show => {
            match directory.refreshed_at() {
                Some(at) => eprintln!("last refreshed {}", at.to_rfc3339()),
                None => eprintln!("never refreshed from the provider"),
            }
            println!("{}", serde_json::to_string_pretty(&directory.entries())?);
        }
        DirectoryCommand::SetLine { label, line } => {
            if !directory.set_config_line(&label, line) {
                bail!("label {label} is not in the server directory");
            }
            save_directory(session, &directory)?;
        }
    }
    Ok(())
}

pub async fn instance(session: &Session, command: InstanceCommand) -> Result<()> {
    let directory = load_directory(session)?;
    let label = match &command {
        InstanceCommand::Reboot { label }
        | InstanceCommand::Reinstall { label }
        | InstanceCommand::Destroy { label } => label.clone(),
    };
    let entry = directory
        .by_label(&label)
        .with_context(|| format!("label {label} is not in the server directory"))?;
    let settings = Arc::new(ControllerSettings::from_config(&session.config));
    let mut controller =
        InstanceController::from_entry(&entry, collaborators(session, directory.clone())?, settings);

    match command {
        InstanceCommand::Reboot { .. } => controller.reboot().await?,
        InstanceCommand::Reinstall { .. } => controller.reinstall().await?,
        InstanceCommand::Destroy { .. } => {
            controller.destroy().await?;
            directory.remove(&entry.id);
            save_directory(session, &directory)?;
        }
    }
    println!("{label}\t{}", controller.state());
    Ok(())
}

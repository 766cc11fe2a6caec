//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Instance lifecycle controller and concurrent fleet pipelines."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Instance lifecycle.
//!
//! An [`InstanceController`] owns one fleet member and walks it through
//! `Unprovisioned -> Creating -> Built -> PreSetupDone -> SoftwareInstalled
//! -> Synced`. Any stage error moves it to `Failed`. [`drive_fleet`] runs one
//! independent pipeline per controller so a failing member never blocks the
//! others.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use mnfleet_common::{AppConfig, Hostname, InstanceId, Ip, Label, ProviderConfig, SetupConfig, SyncConfig, ValidationError};
use mnfleet_logging::{fleet_debug, fleet_error, fleet_info, fleet_warn, log_stage_event, LogContext, StageOutcome};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::error;

use crate::chain::{parse_remote_height, within_tolerance, ChainHeightSource};
use crate::directory::{DirectoryEntry, ServerDirectory};
use crate::dispatch::{shell_quote, DispatchReport, FleetDispatcher, HOST_ARG_PLACEHOLDER};
use crate::error::{InstanceError, PipelineError, StageError};
use crate::metrics::FleetMetrics;
use crate::poll::{poll_for, poll_until, CancelSignal, PollOutcome, PollPolicy};
use crate::provider::{CloudProvider, CreateRequest};
use crate::transport::{HostOutput, RemoteTransport};

/// Lifecycle position of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unprovisioned,
    Creating,
    Built,
    PreSetupDone,
    SoftwareInstalled,
    Synced,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unprovisioned => "unprovisioned",
            InstanceState::Creating => "creating",
            InstanceState::Built => "built",
            InstanceState::PreSetupDone => "pre_setup_done",
            InstanceState::SoftwareInstalled => "software_installed",
            InstanceState::Synced => "synced",
            InstanceState::Failed => "failed",
        }
    }

    /// Position along the setup order; `Failed` has none.
    fn progress(&self) -> Option<u8> {
        match self {
            InstanceState::Unprovisioned => Some(0),
            InstanceState::Creating => Some(1),
            InstanceState::Built => Some(2),
            InstanceState::PreSetupDone => Some(3),
            InstanceState::SoftwareInstalled => Some(4),
            InstanceState::Synced => Some(5),
            InstanceState::Failed => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Setup pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Create,
    WaitBuilt,
    PreSetup,
    Install,
    WaitSynced,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::WaitBuilt => "wait_built",
            Stage::PreSetup => "pre_setup",
            Stage::Install => "install",
            Stage::WaitSynced => "wait_synced",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub label: Label,
    pub hostname: Hostname,
    /// Set once the provider accepted the create call.
    pub id: Option<InstanceId>,
    /// Set once the provider reports the machine built.
    pub address: Option<Ip>,
}

impl Instance {
    pub fn new(label: Label) -> Self {
        Self {
            hostname: label.hostname(),
            label,
            id: None,
            address: None,
        }
    }
}

/// External services an instance controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn CloudProvider>,
    pub transport: Arc<dyn RemoteTransport>,
    pub chain: Arc<dyn ChainHeightSource>,
    pub directory: Option<Arc<dyn ServerDirectory>>,
    pub metrics: Option<FleetMetrics>,
}

/// Settings shared by every controller of a fleet run.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub provider: ProviderConfig,
    pub setup: SetupConfig,
    pub sync: SyncConfig,
    pub build_policy: PollPolicy,
    pub sync_policy: PollPolicy,
}

impl ControllerSettings {
    /// Fixed-interval, unbounded waits as configured.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            setup: config.setup.clone(),
            sync: config.sync.clone(),
            build_policy: PollPolicy::fixed(config.setup.build_poll_interval),
            sync_policy: PollPolicy::fixed(config.sync.poll_interval),
        }
    }
}

/// Drives one instance through its lifecycle.
pub struct InstanceController {
    instance: Instance,
    state: InstanceState,
    /// Last non-failed state, reported in [`StageError`].
    reached: InstanceState,
    collaborators: Collaborators,
    settings: Arc<ControllerSettings>,
    cancel: Option<CancelSignal>,
}

impl InstanceController {
    pub fn new(label: Label, collaborators: Collaborators, settings: Arc<ControllerSettings>) -> Self {
        Self {
            instance: Instance::new(label),
            state: InstanceState::Unprovisioned,
            reached: InstanceState::Unprovisioned,
            collaborators,
            settings,
            cancel: None,
        }
    }

    /// Controller for a machine that already exists, e.g. from the directory.
    pub fn from_entry(entry: &DirectoryEntry, collaborators: Collaborators, settings: Arc<ControllerSettings>) -> Self {
        let state = if entry.address.is_some() {
            InstanceState::Built
        } else {
            InstanceState::Creating
        };
        let mut controller = Self::new(entry.label.clone(), collaborators, settings);
        controller.instance.id = Some(entry.id.clone());
        controller.instance.address = entry.address.clone();
        controller.state = state;
        controller.reached = state;
        controller
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn into_instance(self) -> Instance {
        self.instance
    }

    pub fn label(&self) -> &Label {
        &self.instance.label
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    fn context(&self, stage: Option<Stage>) -> LogContext<'_> {
        let mut ctx = LogContext::new().with_label(self.instance.label.as_str());
        if let Some(address) = &self.instance.address {
            ctx = ctx.with_host(address.as_str());
        }
        if let Some(stage) = stage {
            ctx = ctx.with_stage(stage.as_str());
        }
        ctx
    }

    fn instance_id(&self) -> Result<InstanceId, InstanceError> {
        self.instance.id.clone().ok_or_else(|| InstanceError::NotReady {
            label: self.instance.label.clone(),
            missing: "provider id",
        })
    }

    fn address(&self) -> Result<Ip, InstanceError> {
        self.instance.address.clone().ok_or_else(|| InstanceError::NotReady {
            label: self.instance.label.clone(),
            missing: "address",
        })
    }

    /// A dispatcher scoped to this instance alone.
    fn dispatcher(&self) -> Result<FleetDispatcher, InstanceError> {
        Ok(
            FleetDispatcher::single(self.collaborators.transport.clone(), self.address()?)
                .with_metrics(self.collaborators.metrics.clone()),
        )
    }

    /// Record the outcome of `stage`, advancing to `next` on success.
    fn finish<T>(
        &mut self,
        stage: Stage,
        next: InstanceState,
        result: Result<T, InstanceError>,
    ) -> Result<T, InstanceError> {
        let success = result.is_ok();
        if let Some(metrics) = &self.collaborators.metrics {
            metrics.record_stage(stage.as_str(), success);
        }
        match result {
            Ok(value) => {
                self.state = next;
                self.reached = next;
                log_stage_event(
                    Some(&self.context(Some(stage))),
                    "stage.finished",
                    next.as_str(),
                    StageOutcome::Success,
                );
                Ok(value)
            }
            Err(err) => {
                self.state = InstanceState::Failed;
                log_stage_event(
                    Some(&self.context(Some(stage))),
                    "stage.finished",
                    &err.to_string(),
                    StageOutcome::Fault,
                );
                Err(err)
            }
        }
    }

    /// Record id and address in the directory and flush it, so a crashed run
    /// never forgets a machine it paid for.
    fn publish(&self) {
        let (Some(directory), Some(id)) = (&self.collaborators.directory, &self.instance.id) else {
            return;
        };
        let config_line = directory.by_id(id).and_then(|entry| entry.config_line);
        directory.upsert(DirectoryEntry {
            id: id.clone(),
            label: self.instance.label.clone(),
            address: self.instance.address.clone(),
            config_line,
        });
        if let Err(err) = directory.persist() {
            fleet_error!(
                context = self.context(None),
                "unable to persist directory after recording {}: {:#}",
                id,
                err
            );
        }
    }

    /// Whether every stage up to and including `state` already completed.
    fn has_reached(&self, state: InstanceState) -> bool {
        self.reached.progress() >= state.progress()
    }

    fn retrying(&self, stage: Stage, err: &InstanceError) {
        fleet_warn!(
            context = self.context(Some(stage)),
            "check failed, retrying: {}",
            err
        );
    }

    /// Ask the provider for a new machine. Refuses when an id is already
    /// recorded, since a second create would duplicate the machine.
    pub async fn create(&mut self) -> Result<InstanceId, InstanceError> {
        if let Some(id) = &self.instance.id {
            return Err(InstanceError::AlreadyCreated {
                label: self.instance.label.clone(),
                id: id.clone(),
            });
        }
        self.state = InstanceState::Creating;
        let request = CreateRequest::from_config(&self.settings.provider, &self.instance.label);
        let result = self
            .collaborators
            .provider
            .create(&request)
            .await
            .map_err(InstanceError::from);
        let id = self.finish(Stage::Create, InstanceState::Creating, result)?;
        self.instance.id = Some(id.clone());
        self.publish();
        Ok(id)
    }

    /// Poll the provider until the machine is built and has an address.
    pub async fn wait_until_built(&mut self) -> Result<Ip, InstanceError> {
        let result = self.poll_built().await;
        let address = self.finish(Stage::WaitBuilt, InstanceState::Built, result)?;
        self.instance.address = Some(address.clone());
        self.publish();
        Ok(address)
    }

    async fn poll_built(&self) -> Result<Ip, InstanceError> {
        let id = self.instance_id()?;
        let this = self;
        let (address, outcome) = poll_for(&self.settings.build_policy, self.cancel.as_ref(), || {
            let id = &id;
            async move {
                match this.collaborators.provider.status(id).await {
                    Ok(status) => Ok(if status.ready { status.main_ip } else { None }),
                    Err(err) => {
                        let err = InstanceError::from(err);
                        if !err.is_transient() {
                            return Err(err);
                        }
                        this.retrying(Stage::WaitBuilt, &err);
                        Ok(None)
                    }
                }
            }
        })
        .await
        .map_err(|err| InstanceError::from_poll("build", err))?;
        self.record_poll("built", &outcome);
        Ok(address)
    }

    fn record_poll(&self, wait: &str, outcome: &PollOutcome) {
        fleet_debug!(
            context = self.context(None),
            "{} after {} attempt(s) in {:?}",
            wait,
            outcome.attempts,
            outcome.elapsed
        );
        if let Some(metrics) = &self.collaborators.metrics {
            metrics.record_poll_attempts(wait, outcome.attempts);
        }
    }

    /// Push and run the pre-setup script.
    pub async fn pre_setup(&mut self) -> Result<(), InstanceError> {
        let setup = &self.settings.setup;
        let result = self
            .push_and_run(&setup.pre_setup_script, &setup.pre_setup_remote, None, "pre_setup")
            .await;
        self.finish(Stage::PreSetup, InstanceState::PreSetupDone, result)
    }

    /// Push and run the install script with this instance's host argument.
    ///
    /// The argument is either `host_arg` or the directory's config line for
    /// this label. It is substituted into this instance's own command, so
    /// concurrent installs never see each other's arguments.
    pub async fn install_software(&mut self, host_arg: Option<&str>) -> Result<(), InstanceError> {
        let result = match self.resolve_host_arg(host_arg) {
            Ok(arg) => {
                let setup = &self.settings.setup;
                self.push_and_run(&setup.install_script, &setup.install_remote, Some(arg), "install")
                    .await
            }
            Err(err) => Err(err),
        };
        self.finish(Stage::Install, InstanceState::SoftwareInstalled, result)
    }

    fn resolve_host_arg(&self, host_arg: Option<&str>) -> Result<String, InstanceError> {
        if let Some(arg) = host_arg {
            return Ok(arg.to_owned());
        }
        self.collaborators
            .directory
            .as_ref()
            .and_then(|directory| directory.by_label(&self.instance.label))
            .and_then(|entry| entry.config_line)
            .ok_or_else(|| InstanceError::MissingHostArg {
                label: self.instance.label.clone(),
            })
    }

    async fn push_and_run(
        &self,
        local: &Path,
        remote: &Path,
        host_arg: Option<String>,
        step: &'static str,
    ) -> Result<(), InstanceError> {
        let dispatcher = self.dispatcher()?;
        dispatcher.send_file(local, remote, false).await?;

        let script = shell_quote(&remote.display().to_string());
        let (invoke, args) = match host_arg {
            Some(arg) => (format!("{} {}", script, HOST_ARG_PLACEHOLDER), Some(vec![arg])),
            None => (script.clone(), None),
        };
        let commands = [format!("chmod +x {}", script), invoke];
        fleet_info!(context = self.context(None), "running {}", step);
        let report = dispatcher.run_command(&commands, args.as_deref()).await?;
        require_success(report, &self.address()?, step)?;
        Ok(())
    }

    /// Block height reported by the node itself.
    pub async fn remote_height(&self) -> Result<u64, InstanceError> {
        let dispatcher = self.dispatcher()?;
        let report = dispatcher
            .run_command(&[self.settings.sync.remote_height_command.as_str()], None)
            .await?;
        let output = require_success(report, &self.address()?, "remote_height")?;
        Ok(parse_remote_height(&output)?)
    }

    /// Single check: is the node within `tolerance` blocks of the reference?
    pub async fn is_synced(&self, tolerance: u64) -> Result<bool, InstanceError> {
        let reference = self.collaborators.chain.reference_height().await?;
        let remote = self.remote_height().await?;
        let synced = within_tolerance(remote, reference, tolerance);
        fleet_debug!(
            context = self.context(Some(Stage::WaitSynced)),
            "height {} vs reference {} (synced: {})",
            remote,
            reference,
            synced
        );
        Ok(synced)
    }

    /// Poll [`Self::is_synced`] with the configured tolerance until it holds.
    ///
    /// A node that cannot answer yet, or a reference endpoint that is briefly
    /// down, counts as not synced. Only configuration faults end the wait
    /// early, besides cancellation and the policy's own bounds.
    pub async fn wait_until_synced(&mut self) -> Result<PollOutcome, InstanceError> {
        let tolerance = self.settings.sync.tolerance_blocks;
        let this = &*self;
        let result = poll_until(&this.settings.sync_policy, this.cancel.as_ref(), move || async move {
            match this.is_synced(tolerance).await {
                Err(err) if err.is_transient() => {
                    this.retrying(Stage::WaitSynced, &err);
                    Ok(false)
                }
                other => other,
            }
        })
        .await
        .map_err(|err| InstanceError::from_poll("sync", err));
        if let Ok(outcome) = &result {
            self.record_poll("synced", outcome);
        }
        self.finish(Stage::WaitSynced, InstanceState::Synced, result)
    }

    /// Run every remaining stage in order, stopping at the first failure.
    ///
    /// Stages the controller already completed are skipped: creation once a
    /// provider id is recorded, and every later stage up to the last state
    /// reached. Calling this again after a failure resumes at the failed stage.
    pub async fn complete_setup(&mut self, host_arg: Option<&str>) -> Result<InstanceState, StageError> {
        fleet_info!(
            context = self.context(None),
            "setup pipeline starting from {}",
            self.reached
        );
        if self.instance.id.is_none() {
            let result = self.create().await;
            self.check(Stage::Create, result)?;
        }
        if !self.has_reached(InstanceState::Built) {
            let result = self.wait_until_built().await;
            self.check(Stage::WaitBuilt, result)?;
        }
        if !self.has_reached(InstanceState::PreSetupDone) {
            let result = self.pre_setup().await;
            self.check(Stage::PreSetup, result)?;
        }
        if !self.has_reached(InstanceState::SoftwareInstalled) {
            let result = self.install_software(host_arg).await;
            self.check(Stage::Install, result)?;
        }
        if !self.has_reached(InstanceState::Synced) {
            let result = self.wait_until_synced().await;
            self.check(Stage::WaitSynced, result)?;
        }
        self.state = self.reached;
        fleet_info!(context = self.context(None), "setup pipeline complete");
        Ok(self.state)
    }

    fn check<T>(&self, stage: Stage, result: Result<T, InstanceError>) -> Result<T, StageError> {
        result.map_err(|source| StageError {
            label: self.instance.label.clone(),
            stage,
            state: self.reached,
            source,
        })
    }

    pub async fn reboot(&self) -> Result<(), InstanceError> {
        let id = self.instance_id()?;
        self.collaborators.provider.reboot(&id).await?;
        fleet_info!(context = self.context(None), "reboot requested");
        Ok(())
    }

    /// Reinstall the operating system. The address is kept but the machine
    /// must be waited on again before setup.
    pub async fn reinstall(&mut self) -> Result<(), InstanceError> {
        let id = self.instance_id()?;
        self.collaborators.provider.reinstall(&id).await?;
        self.state = InstanceState::Creating;
        self.reached = InstanceState::Creating;
        fleet_info!(context = self.context(None), "reinstall requested");
        Ok(())
    }

    /// Destroy the machine and forget its id and address.
    pub async fn destroy(&mut self) -> Result<(), InstanceError> {
        let id = self.instance_id()?;
        self.collaborators.provider.destroy(&id).await?;
        fleet_info!(context = self.context(None), "machine destroyed");
        self.instance.id = None;
        self.instance.address = None;
        self.state = InstanceState::Unprovisioned;
        self.reached = InstanceState::Unprovisioned;
        Ok(())
    }
}

/// Extract `host`'s output, failing when it was unreachable or exited non-zero.
fn require_success(mut report: DispatchReport, host: &Ip, step: &'static str) -> Result<HostOutput, InstanceError> {
    if let Some(reason) = report.unreachable.swap_remove(host) {
        return Err(InstanceError::Unreachable {
            host: host.clone(),
            reason,
        });
    }
    let output = report
        .outputs
        .swap_remove(host)
        .ok_or_else(|| InstanceError::Unreachable {
            host: host.clone(),
            reason: "no result returned".to_owned(),
        })?;
    if !output.success() {
        return Err(InstanceError::RemoteExecution {
            host: host.clone(),
            step,
            exit_status: output.exit_status,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// One pipeline to run in [`drive_fleet`].
pub struct Pipeline {
    pub controller: InstanceController,
    pub host_arg: Option<String>,
}

/// Per-label outcome of a fleet run, in submission order.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: IndexMap<Label, Result<Instance, PipelineError>>,
}

impl FleetReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &Instance> {
        self.outcomes.values().filter_map(|r| r.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Label, &PipelineError)> {
        self.outcomes
            .iter()
            .filter_map(|(label, r)| r.as_ref().err().map(|e| (label, e)))
    }
}

/// Run every pipeline concurrently and wait for all of them.
pub async fn drive_fleet(pipelines: Vec<Pipeline>) -> Result<FleetReport, ValidationError> {
    let mut seen = indexmap::IndexSet::new();
    for pipeline in &pipelines {
        if !seen.insert(pipeline.controller.label().clone()) {
            return Err(ValidationError::Other(format!(
                "label {} appears in more than one pipeline",
                pipeline.controller.label()
            )));
        }
    }

    type Finished = (Instance, Result<InstanceState, StageError>);
    let handles: Vec<(Label, JoinHandle<Finished>)> = pipelines
        .into_iter()
        .map(|Pipeline { mut controller, host_arg }| {
            let label = controller.label().clone();
            let handle = tokio::spawn(async move {
                let result = controller.complete_setup(host_arg.as_deref()).await;
                (controller.into_instance(), result)
            });
            (label, handle)
        })
        .collect();

    let mut report = FleetReport::default();
    for (label, handle) in handles {
        let outcome = match handle.await {
            Ok((instance, Ok(_))) => Ok(instance),
            Ok((_, Err(err))) => Err(PipelineError::Stage(err)),
            Err(join_err) => {
                error!(label = %label, error = %join_err, "pipeline task join error");
                Err(PipelineError::Aborted {
                    label: label.clone(),
                    reason: join_err.to_string(),
                })
            }
        };
        report.outcomes.insert(label, outcome);
    }
    let failed = report.failed().count();
    fleet_info!(
        "fleet run finished: {} succeeded, {} failed",
        report.outcomes.len() - failed,
        failed
    );
    Ok(report)
}

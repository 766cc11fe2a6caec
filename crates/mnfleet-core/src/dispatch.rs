//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Concurrent command and file fan-out across a host set."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Fleet dispatch.
//!
//! A [`FleetDispatcher`] is built per call with the host set it targets, so
//! independent provisioning tasks never share mutable host state. Commands
//! are joined with `&&` into one shell line and run concurrently on every
//! host; per-host arguments replace the [`HOST_ARG_PLACEHOLDER`] token.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use indexmap::{IndexMap, IndexSet};
use mnfleet_common::Ip;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::FleetMetrics;
use crate::transport::{HostOutput, RemoteTransport, TransportError};

/// Token substituted with a shell-quoted per-host argument.
pub const HOST_ARG_PLACEHOLDER: &str = "{host_arg}";

/// Errors in the shape of a dispatch request. Host failures are reported in
/// [`DispatchReport`] instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch requires at least one host")]
    NoHosts,
    #[error("host {0} listed more than once")]
    DuplicateHost(Ip),
    #[error("dispatch requires at least one command")]
    NoCommands,
    #[error("{hosts} host(s) but {args} per-host argument(s)")]
    HostArgCountMismatch { hosts: usize, args: usize },
    #[error("per-host arguments given but no command contains {placeholder}")]
    MissingPlaceholder { placeholder: &'static str },
}

/// One host's failure during a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub host: Ip,
    pub message: String,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.message)
    }
}

/// A transfer that failed on at least one host. Every failure is kept; the
/// message names the first.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("file transfer failed on {first} ({} other host(s) failed)", .others.len())]
pub struct TransferError {
    pub first: HostFailure,
    pub others: Vec<HostFailure>,
}

impl TransferError {
    fn from_failures(mut failures: Vec<HostFailure>) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        let first = failures.remove(0);
        Some(Self {
            first,
            others: failures,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostFailure> {
        std::iter::once(&self.first).chain(self.others.iter())
    }
}

/// Outcome of [`FleetDispatcher::run_command`]: one entry per host, either
/// an output or the reason it could not be reached.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub outputs: IndexMap<Ip, HostOutput>,
    pub unreachable: IndexMap<Ip, String>,
}

impl DispatchReport {
    pub fn output(&self, host: &Ip) -> Option<&HostOutput> {
        self.outputs.get(host)
    }

    /// True when every host was reached and exited zero.
    pub fn all_succeeded(&self) -> bool {
        self.unreachable.is_empty() && self.outputs.values().all(HostOutput::success)
    }

    /// Hosts that were reached but exited non-zero.
    pub fn failed(&self) -> impl Iterator<Item = &HostOutput> {
        self.outputs.values().filter(|output| !output.success())
    }
}

/// Fans commands and files out to a fixed host set.
#[derive(Clone)]
pub struct FleetDispatcher {
    transport: Arc<dyn RemoteTransport>,
    hosts: Vec<Ip>,
    metrics: Option<FleetMetrics>,
}

impl FleetDispatcher {
    pub fn for_hosts(
        transport: Arc<dyn RemoteTransport>,
        hosts: impl IntoIterator<Item = Ip>,
    ) -> Result<Self, DispatchError> {
        let mut seen = IndexSet::new();
        for host in hosts {
            if !seen.insert(host.clone()) {
                return Err(DispatchError::DuplicateHost(host));
            }
        }
        if seen.is_empty() {
            return Err(DispatchError::NoHosts);
        }
        Ok(Self {
            transport,
            hosts: seen.into_iter().collect(),
            metrics: None,
        })
    }

    pub fn single(transport: Arc<dyn RemoteTransport>, host: Ip) -> Self {
        Self {
            transport,
            hosts: vec![host],
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<FleetMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn hosts(&self) -> &[Ip] {
        &self.hosts
    }

    /// Run `commands`, joined with `&&`, on every host concurrently.
    ///
    /// When `host_args` is given it must hold one entry per host (in host
    /// order); each host's command line has [`HOST_ARG_PLACEHOLDER`] replaced
    /// by its shell-quoted argument.
    pub async fn run_command<S: AsRef<str>>(
        &self,
        commands: &[S],
        host_args: Option<&[String]>,
    ) -> Result<DispatchReport, DispatchError> {
        let line = join_commands(commands)?;
        let lines: Vec<String> = match host_args {
            Some(args) => {
                if args.len() != self.hosts.len() {
                    return Err(DispatchError::HostArgCountMismatch {
                        hosts: self.hosts.len(),
                        args: args.len(),
                    });
                }
                if !line.contains(HOST_ARG_PLACEHOLDER) {
                    return Err(DispatchError::MissingPlaceholder {
                        placeholder: HOST_ARG_PLACEHOLDER,
                    });
                }
                args.iter()
                    .map(|arg| line.replace(HOST_ARG_PLACEHOLDER, &shell_quote(arg)))
                    .collect()
            }
            None => vec![line; self.hosts.len()],
        };

        debug!(hosts = self.hosts.len(), "dispatching command");
        let runs = self
            .hosts
            .iter()
            .zip(lines.iter())
            .map(|(host, line)| self.transport.run(host, line));
        let results = join_all(runs).await;

        let mut report = DispatchReport::default();
        for (host, result) in self.hosts.iter().zip(results) {
            match result {
                Ok(output) => {
                    if output.success() {
                        debug!(host = %host, "command succeeded");
                    } else {
                        warn!(host = %host, exit_status = output.exit_status, "command exited non-zero");
                    }
                    self.record("run_command", output.success());
                    report.outputs.insert(host.clone(), output);
                }
                Err(err) => {
                    warn!(host = %host, error = %err, "host unreachable");
                    self.record("run_command", false);
                    report.unreachable.insert(host.clone(), err.to_string());
                }
            }
        }
        info!(
            reached = report.outputs.len(),
            unreachable = report.unreachable.len(),
            "dispatch finished"
        );
        Ok(report)
    }

    /// Copy `local` to `remote` on every host. Succeeds only if every host
    /// succeeded.
    pub async fn send_file(
        &self,
        local: &Path,
        remote: &Path,
        recursive: bool,
    ) -> Result<(), TransferError> {
        let copies = self
            .hosts
            .iter()
            .map(|host| self.transport.transfer(host, local, remote, recursive));
        let results: Vec<Result<(), TransportError>> = join_all(copies).await;

        let mut failures = Vec::new();
        for (host, result) in self.hosts.iter().zip(results) {
            self.record("send_file", result.is_ok());
            if let Err(err) = result {
                warn!(host = %host, error = %err, "file transfer failed");
                failures.push(HostFailure {
                    host: host.clone(),
                    message: err.to_string(),
                });
            }
        }
        match TransferError::from_failures(failures) {
            Some(err) => Err(err),
            None => {
                info!(hosts = self.hosts.len(), local = %local.display(), remote = %remote.display(), "file sent");
                Ok(())
            }
        }
    }

    fn record(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(operation, success);
        }
    }
}

/// Join commands into a single `&&`-chained shell line.
pub fn join_commands<S: AsRef<str>>(commands: &[S]) -> Result<String, DispatchError> {
    let parts: Vec<&str> = commands
        .iter()
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty())
        .collect();
    if parts.is_empty() {
        return Err(DispatchError::NoCommands);
    }
    Ok(parts.join(" && "))
}

/// Quote `arg` for a POSIX shell. Plain tokens are left untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@,+".contains(&b));
    if plain {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Error kinds surfaced by the instance lifecycle."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use mnfleet_common::{InstanceId, Ip, Label, ValidationError};
use thiserror::Error;

use crate::chain::ChainError;
use crate::dispatch::{DispatchError, TransferError};
use crate::instance::{InstanceState, Stage};
use crate::poll::{PollError, WaitFailure};
use crate::provider::ProviderError;

/// Failure of a single lifecycle operation.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{step} exited with status {exit_status} on {host}: {}", .stderr.join(" | "))]
    RemoteExecution {
        host: Ip,
        step: &'static str,
        exit_status: i32,
        stderr: Vec<String>,
    },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("{host} unreachable: {reason}")]
    Unreachable { host: Ip, reason: String },
    #[error("{label} already exists as instance {id}; creating it again would duplicate the machine")]
    AlreadyCreated { label: Label, id: InstanceId },
    #[error("{label} has no {missing} yet")]
    NotReady { label: Label, missing: &'static str },
    #[error("no install argument for {label}: none given and the directory has no config line")]
    MissingHostArg { label: Label },
    #[error("waiting for {what} stopped: {failure}")]
    Wait {
        what: &'static str,
        failure: WaitFailure,
    },
}

impl InstanceError {
    pub(crate) fn from_poll<E: Into<InstanceError>>(what: &'static str, err: PollError<E>) -> Self {
        match err {
            PollError::Wait(failure) => InstanceError::Wait { what, failure },
            PollError::Predicate(err) => err.into(),
        }
    }

    /// Whether a readiness wait should retry after this failure instead of
    /// giving up. Remote commands that exit non-zero count: a node still
    /// loading its block index rejects RPC calls.
    pub fn is_transient(&self) -> bool {
        match self {
            InstanceError::Provider(err) => err.is_transient(),
            InstanceError::Chain(err) => err.is_transient(),
            InstanceError::RemoteExecution { .. } | InstanceError::Unreachable { .. } => true,
            _ => false,
        }
    }
}

/// A setup pipeline aborted at `stage`; `state` is the last state reached.
#[derive(Debug, Error)]
#[error("{label} failed during {stage} (reached {state}): {source}")]
pub struct StageError {
    pub label: Label,
    pub stage: Stage,
    pub state: InstanceState,
    #[source]
    pub source: InstanceError,
}

/// Failure of one pipeline within a fleet run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("pipeline for {label} aborted: {reason}")]
    Aborted { label: Label, reason: String },
}

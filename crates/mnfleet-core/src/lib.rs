//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Instance lifecycle orchestration and fleet dispatch."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Fleet provisioning runtime: instance controllers, the concurrent host
//! dispatcher, readiness polling, and the provider, transport, chain-height
//! and directory seams they are built on.

pub mod chain;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod metrics;
pub mod poll;
pub mod provider;
pub mod transport;

pub use chain::{ChainError, ChainHeightSource, HttpChainHeight};
pub use directory::{DirectoryEntry, MemoryDirectory, ServerDirectory};
pub use dispatch::{DispatchError, DispatchReport, FleetDispatcher, HostFailure, TransferError};
pub use error::{InstanceError, PipelineError, StageError};
pub use instance::{
    drive_fleet, Collaborators, ControllerSettings, FleetReport, Instance, InstanceController,
    InstanceState, Pipeline, Stage,
};
pub use metrics::{new_registry, FleetMetrics, SharedRegistry};
pub use poll::{cancellation, poll_for, poll_until, CancelHandle, CancelSignal, PollError, PollOutcome, PollPolicy, WaitFailure};
pub use provider::{CloudProvider, CreateRequest, ProviderError, ServerRecord, ServerStatus, VultrProvider};
pub use transport::{HostOutput, OpenSshTransport, RemoteTransport, TransportError};

//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Shared primitives and utilities for the fleet runtime."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Core shared primitives for the mnfleet workspace.
//! This crate exposes configuration loading, logging setup, and the validated
//! identifier types (addresses, labels, keys) consumed across the workspace.

pub mod config;
pub mod ids;
pub mod logging;

pub use config::{
    AppConfig, CoinConfig, LoggingConfig, MetricsConfig, ProviderConfig, SetupConfig, SshConfig,
    SyncConfig,
};
pub use ids::{
    Genkey, Hostname, InstanceId, Ip, Label, ReceivingAddress, TxHash, ValidationError,
};
pub use logging::{init_tracing, LogFormat};

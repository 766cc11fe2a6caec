//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Wallet operations and masternode.conf reconciliation."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Wallet-side tooling: label schemes, config line generation through the
//! coin's CLI, wallet unlock and masternode start, and completion of the
//! node config with collateral output indices.

pub mod cli;
pub mod error;
pub mod labels;
pub mod masternode_conf;
pub mod ops;

pub use cli::{ProcessWalletCli, WalletCli};
pub use error::WalletError;
pub use labels::generate_label;
pub use masternode_conf::{
    append_lines, reconcile_file, ConfigLine, LineEnding, LineState, MasternodeConf, MasternodeOutputs,
    MismatchReason, OutputRecord, ReconcileReport, ReconciliationMismatch, Resolution,
};
pub use ops::{
    generate_config_lines, reconcile_outputs, start_masternodes, unlock_wallet, write_config_lines,
    PassphraseSource,
};

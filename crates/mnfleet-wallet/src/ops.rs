//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Config line generation, wallet unlock, masternode start and output reconciliation."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::path::Path;
use std::time::Duration;

use mnfleet_common::{Label, ValidationError};
use tracing::{info, warn};

use crate::cli::WalletCli;
use crate::error::WalletError;
use crate::labels::generate_label;
use crate::masternode_conf::{append_lines, reconcile_file, MasternodeConf, ReconcileReport};

/// Build one masternode line per iterator in `start..=end`, asking the
/// wallet for a fresh genkey and receiving address for each label.
///
/// Every label is generated before the wallet is touched, so an overflowing
/// scheme fails without creating addresses.
pub async fn generate_config_lines(
    wallet: &dyn WalletCli,
    scheme: &str,
    start: u64,
    end: u64,
    port: u16,
) -> Result<Vec<String>, WalletError> {
    if start > end {
        return Err(ValidationError::Other(format!(
            "iterator range {start}..={end} is empty"
        ))
        .into());
    }
    let labels = (start..=end)
        .map(|iterator| generate_label(scheme, iterator))
        .collect::<Result<Vec<Label>, _>>()?;

    let mut lines = Vec::with_capacity(labels.len());
    for label in labels {
        let genkey = wallet.genkey().await?;
        let address = wallet.get_new_address(&label).await?;
        let line = format!("{label} :{port} {genkey} Address:{address}");
        info!(label = %label, "config line generated");
        lines.push(line);
    }
    Ok(lines)
}

/// Write generated lines to `path`: appended to an existing node config, or
/// replacing the file's contents.
pub fn write_config_lines(lines: &[String], path: &Path, append: bool) -> Result<(), WalletError> {
    if append {
        append_lines(path, lines)?;
    } else {
        let mut content = lines.join("\n");
        content.push('\n');
        MasternodeConf::parse(&content).save(path)?;
    }
    info!(path = %path.display(), lines = lines.len(), append, "config lines written");
    Ok(())
}

/// Supplies a passphrase for each unlock attempt (1-based).
pub trait PassphraseSource: Send {
    fn passphrase(&mut self, attempt: u32) -> Result<String, WalletError>;
}

impl<F> PassphraseSource for F
where
    F: FnMut(u32) -> Result<String, WalletError> + Send,
{
    fn passphrase(&mut self, attempt: u32) -> Result<String, WalletError> {
        self(attempt)
    }
}

/// Try to unlock the wallet up to `max_attempts` times, fetching a new
/// passphrase for each attempt. Returns the attempt that succeeded.
///
/// Only a rejected passphrase is retried; a wallet that cannot be launched
/// fails immediately.
pub async fn unlock_wallet(
    wallet: &dyn WalletCli,
    source: &mut dyn PassphraseSource,
    timeout: Duration,
    max_attempts: u32,
) -> Result<u32, WalletError> {
    if max_attempts == 0 {
        return Err(ValidationError::Other("max_attempts must be at least 1".to_owned()).into());
    }
    for attempt in 1..=max_attempts {
        let passphrase = source.passphrase(attempt)?;
        match wallet.wallet_passphrase(&passphrase, timeout).await {
            Ok(()) => {
                info!(attempt, timeout_secs = timeout.as_secs(), "wallet unlocked");
                return Ok(attempt);
            }
            Err(WalletError::CommandFailed { stderr, .. }) => {
                warn!(attempt, remaining = max_attempts - attempt, error = %stderr, "wallet unlock rejected");
            }
            Err(other) => return Err(other),
        }
    }
    Err(WalletError::UnlockExhausted {
        attempts: max_attempts,
    })
}

/// Start the named masternodes, or every missing one when `labels` is
/// empty. Stops at the first failure.
pub async fn start_masternodes(wallet: &dyn WalletCli, labels: &[Label]) -> Result<Vec<String>, WalletError> {
    if labels.is_empty() {
        let reply = wallet.start_missing().await?;
        info!("missing masternodes started");
        return Ok(vec![reply]);
    }
    let mut replies = Vec::with_capacity(labels.len());
    for label in labels {
        replies.push(wallet.start_alias(label).await?);
        info!(label = %label, "masternode started");
    }
    Ok(replies)
}

/// Fetch the wallet's collateral outputs and complete the node config at
/// `conf_path` with them.
pub async fn reconcile_outputs(wallet: &dyn WalletCli, conf_path: &Path) -> Result<ReconcileReport, WalletError> {
    let outputs = wallet.masternode_outputs().await?;
    reconcile_file(conf_path, &outputs)
}

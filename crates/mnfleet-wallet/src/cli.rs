//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Wallet command-line client seam and its process-backed implementation."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use mnfleet_common::{CoinConfig, Genkey, Label, ReceivingAddress};
use tokio::process::Command;
use tracing::debug;

use crate::error::WalletError;
use crate::masternode_conf::MasternodeOutputs;

/// Operations the fleet needs from a coin's wallet client.
#[async_trait]
pub trait WalletCli: Send + Sync {
    async fn get_new_address(&self, label: &Label) -> Result<ReceivingAddress, WalletError>;

    async fn genkey(&self) -> Result<Genkey, WalletError>;

    async fn masternode_outputs(&self) -> Result<MasternodeOutputs, WalletError>;

    async fn start_alias(&self, label: &Label) -> Result<String, WalletError>;

    async fn start_missing(&self) -> Result<String, WalletError>;

    /// Unlock the wallet for `timeout`. A rejected passphrase surfaces as
    /// [`WalletError::CommandFailed`].
    async fn wallet_passphrase(&self, passphrase: &str, timeout: Duration) -> Result<(), WalletError>;
}

/// [`WalletCli`] that shells out to the coin's `*-cli` binary.
#[derive(Debug, Clone)]
pub struct ProcessWalletCli {
    program: PathBuf,
    node_term: String,
}

impl ProcessWalletCli {
    pub fn new(program: impl Into<PathBuf>, node_term: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            node_term: node_term.into(),
        }
    }

    pub fn from_coin(coin_name: &str, coin: &CoinConfig) -> Self {
        Self::new(coin.wallet_cli(), coin.node_term(coin_name))
    }

    pub fn node_term(&self) -> &str {
        &self.node_term
    }

    /// Run the client and return trimmed stdout. `shown` is the command as
    /// it appears in logs and errors, so secrets can be left out of it.
    async fn invoke(&self, args: &[&str], shown: String) -> Result<String, WalletError> {
        debug!(program = %self.program.display(), command = %shown, "invoking wallet cli");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| WalletError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(WalletError::CommandFailed {
                command: shown,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn server_call(&self, args: &[&str]) -> Result<String, WalletError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("-server");
        full.extend_from_slice(args);
        let shown = full.join(" ");
        self.invoke(&full, shown).await
    }
}

#[async_trait]
impl WalletCli for ProcessWalletCli {
    async fn get_new_address(&self, label: &Label) -> Result<ReceivingAddress, WalletError> {
        let raw = self.server_call(&["getnewaddress", label.as_str()]).await?;
        Ok(raw.parse()?)
    }

    async fn genkey(&self) -> Result<Genkey, WalletError> {
        let raw = self.server_call(&[self.node_term.as_str(), "genkey"]).await?;
        Ok(raw.parse()?)
    }

    async fn masternode_outputs(&self) -> Result<MasternodeOutputs, WalletError> {
        let raw = self.server_call(&[self.node_term.as_str(), "outputs"]).await?;
        MasternodeOutputs::from_json(&raw).map_err(|err| WalletError::UnexpectedOutput {
            command: format!("{} outputs", self.node_term),
            message: err.to_string(),
        })
    }

    async fn start_alias(&self, label: &Label) -> Result<String, WalletError> {
        self.server_call(&[self.node_term.as_str(), "start-alias", label.as_str()])
            .await
    }

    async fn start_missing(&self) -> Result<String, WalletError> {
        self.server_call(&[self.node_term.as_str(), "start-missing"]).await
    }

    async fn wallet_passphrase(&self, passphrase: &str, timeout: Duration) -> Result<(), WalletError> {
        let seconds = timeout.as_secs().to_string();
        self.invoke(
            &["walletpassphrase", passphrase, &seconds],
            format!("walletpassphrase <redacted> {seconds}"),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a fake wallet client that echoes its arguments, or fails when
    /// asked to unlock.
    fn fake_cli(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("coin-cli");
        std::fs::write(
            &path,
            "#!/bin/sh\nif [ \"$1\" = walletpassphrase ]; then echo 'bad passphrase' >&2; exit 14; fi\necho \"$@\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // One test per script: concurrent fork/exec of a freshly written file
    // can fail with ETXTBSY.
    #[tokio::test]
    async fn process_cli_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_cli(dir.path());

        let cli = ProcessWalletCli::new(&program, "smartnode");
        let out = cli.start_alias(&"SN07".parse().unwrap()).await.unwrap();
        assert_eq!(out, "-server smartnode start-alias SN07");
        assert_eq!(cli.start_missing().await.unwrap(), "-server smartnode start-missing");

        let err = cli
            .wallet_passphrase("hunter2", Duration::from_secs(60))
            .await
            .unwrap_err();
        match err {
            WalletError::CommandFailed { command, status, stderr } => {
                assert_eq!(command, "walletpassphrase <redacted> 60");
                assert_eq!(status, 14);
                assert_eq!(stderr, "bad passphrase");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Echoed arguments are not a valid key.
        let err = cli.genkey().await.unwrap_err();
        assert!(matches!(err, WalletError::Validation(_)));
    }
}

//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Wallet and config file error kinds."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::path::PathBuf;

use mnfleet_common::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("failed to launch wallet cli {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wallet command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("wallet command `{command}` returned unexpected output: {message}")]
    UnexpectedOutput { command: String, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wallet unlock failed after {attempts} attempt(s)")]
    UnlockExhausted { attempts: u32 },
    #[error("could not read passphrase: {0}")]
    Passphrase(String),
}

impl WalletError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| WalletError::Io {
            action,
            path,
            source,
        }
    }
}

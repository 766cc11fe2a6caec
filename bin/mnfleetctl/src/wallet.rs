//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "binary"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Wallet subcommands: config lines, reconciliation, start and unlock."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use mnfleet_common::{CoinConfig, Label};
use mnfleet_wallet::{
    generate_config_lines, reconcile_outputs, start_masternodes, unlock_wallet, write_config_lines,
    ProcessWalletCli, WalletError,
};

use crate::Session;

const PASSPHRASE_ENV: &str = "MNFLEET_WALLET_PASSPHRASE";

#[derive(Debug, Subcommand)]
pub enum WalletCommand {
    /// Generate config lines (label, port, genkey, address) for a label range.
    Lines(LinesArgs),
    /// Append collateral output indices to the node config.
    Reconcile(CoinArg),
    /// Start the given masternodes, or every missing one.
    Start {
        #[command(flatten)]
        coin: CoinArg,
        labels: Vec<Label>,
    },
    /// Unlock the wallet, prompting on stdin.
    Unlock(UnlockArgs),
}

#[derive(Debug, Args)]
pub struct CoinArg {
    /// Coin section to use; optional when only one coin is configured.
    #[arg(long, env = "MNFLEET_COIN", value_name = "NAME")]
    coin: Option<String>,
}

#[derive(Debug, Args)]
pub struct LinesArgs {
    #[command(flatten)]
    coin: CoinArg,

    /// Label scheme, e.g. `GLT-MN###`.
    #[arg(long)]
    scheme: String,

    #[arg(long)]
    start: u64,

    /// Inclusive end of the iterator range.
    #[arg(long)]
    end: u64,

    /// Append to the coin's node config instead of writing `--output`.
    #[arg(long, conflicts_with = "output")]
    append: bool,

    #[arg(long, value_name = "FILE", default_value = "data/conf_lines.txt")]
    output: PathBuf,
}

#[derive(Debug, Args)]
pub struct UnlockArgs {
    #[command(flatten)]
    coin: CoinArg,

    /// Seconds the wallet stays unlocked.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
}

impl CoinArg {
    fn resolve<'a>(&self, session: &'a Session) -> Result<(String, &'a CoinConfig)> {
        match &self.coin {
            Some(name) => Ok((name.clone(), session.config.coin(name)?)),
            None => {
                let mut coins = session.config.coins.iter();
                match (coins.next(), coins.next()) {
                    (Some((name, coin)), None) => Ok((name.clone(), coin)),
                    (None, _) => bail!("no coins configured"),
                    _ => bail!("several coins configured; pass --coin"),
                }
            }
        }
    }

    fn wallet(&self, session: &Session) -> Result<(ProcessWalletCli, CoinConfig)> {
        let (name, coin) = self.resolve(session)?;
        Ok((ProcessWalletCli::from_coin(&name, coin), coin.clone()))
    }
}

fn prompt_passphrase(attempt: u32, max_attempts: u32) -> Result<String, WalletError> {
    eprint!("Enter passphrase ({attempt}/{max_attempts}): ");
    io::stderr()
        .flush()
        .map_err(|err| WalletError::Passphrase(err.to_string()))?;
    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| WalletError::Passphrase(err.to_string()))?;
    if read == 0 {
        return Err(WalletError::Passphrase("stdin closed".to_owned()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

pub async fn run(session: &Session, command: WalletCommand) -> Result<()> {
    match command {
        WalletCommand::Lines(args) => {
            let (wallet, coin) = args.coin.wallet(session)?;
            let lines = generate_config_lines(&wallet, &args.scheme, args.start, args.end, coin.node_port).await?;
            for line in &lines {
                println!("{line}");
            }
            let target = if args.append { coin.mn_conf() } else { args.output };
            write_config_lines(&lines, &target, args.append)?;
            println!("{} line(s) written to {}", lines.len(), target.display());
        }
        WalletCommand::Reconcile(coin) => {
            let (wallet, coin) = coin.wallet(session)?;
            let report = reconcile_outputs(&wallet, &coin.mn_conf()).await?;
            for resolution in &report.resolved {
                println!(
                    "line {}\t{}\t{}",
                    resolution.line_number,
                    resolution.label.as_deref().unwrap_or("-"),
                    resolution.output_index
                );
            }
            for mismatch in &report.mismatches {
                eprintln!("{mismatch}");
            }
            println!("{report}");
        }
        WalletCommand::Start { coin, labels } => {
            let (wallet, _) = coin.wallet(session)?;
            for reply in start_masternodes(&wallet, &labels).await? {
                println!("{reply}");
            }
        }
        WalletCommand::Unlock(args) => {
            let (wallet, _) = args.coin.wallet(session)?;
            let timeout = Duration::from_secs(args.timeout);
            match std::env::var(PASSPHRASE_ENV) {
                Ok(phrase) if !phrase.is_empty() => {
                    let mut source = move |_attempt: u32| -> Result<String, WalletError> { Ok(phrase.clone()) };
                    unlock_wallet(&wallet, &mut source, timeout, 1).await?;
                }
                _ => {
                    let max_attempts = args.max_attempts;
                    let mut source = move |attempt: u32| prompt_passphrase(attempt, max_attempts);
                    unlock_wallet(&wallet, &mut source, timeout, max_attempts).await?;
                }
            }
            println!("wallet unlocked for {}s", args.timeout);
        }
    }
    Ok(())
}

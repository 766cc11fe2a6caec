//! ---
//! mnf_section: "02-wallet"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "masternode.conf parsing and collateral output reconciliation."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Node config reconciliation.
//!
//! Each masternode line is `label address:port genkey [txhash [index]]`.
//! A line ending in a collateral hash is completed by appending the output
//! index the wallet reports for that hash. Whether a line is complete is
//! decided from its shape alone (a numeric token after a hash), so repeated
//! passes never append twice.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use mnfleet_common::TxHash;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::WalletError;

/// Resolution state of one config line, derived from its shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineState {
    /// Blank line or `#` comment.
    Passthrough,
    /// A masternode line without a collateral hash yet.
    Pending,
    /// Ends with a collateral hash; the output index is still missing.
    AwaitingOutput { tx_hash: TxHash },
    Resolved { tx_hash: TxHash, output_index: u32 },
}

/// One line of the node config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    text: String,
    state: LineState,
}

fn is_output_index(token: &str) -> bool {
    !token.is_empty() && token.len() <= 3 && token.bytes().all(|b| b.is_ascii_digit())
}

impl ConfigLine {
    pub fn parse(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            state: classify(text),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn state(&self) -> &LineState {
        &self.state
    }

    /// Masternode alias, the first field.
    pub fn label(&self) -> Option<&str> {
        match self.state {
            LineState::Passthrough => None,
            _ => self.text.split_whitespace().next(),
        }
    }

    fn resolve(&mut self, tx_hash: TxHash, output_index: u32) {
        self.text = format!("{} {}", self.text.trim_end(), output_index);
        self.state = LineState::Resolved {
            tx_hash,
            output_index,
        };
    }
}

fn classify(text: &str) -> LineState {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return LineState::Passthrough;
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    match tokens.as_slice() {
        [_, .., hash, index] if TxHash::is_hash_like(hash) && is_output_index(index) => {
            match (hash.parse(), index.parse()) {
                (Ok(tx_hash), Ok(output_index)) => LineState::Resolved {
                    tx_hash,
                    output_index,
                },
                _ => LineState::Pending,
            }
        }
        [_, .., hash] if TxHash::is_hash_like(hash) => match hash.parse() {
            Ok(tx_hash) => LineState::AwaitingOutput { tx_hash },
            Err(_) => LineState::Pending,
        },
        _ => LineState::Pending,
    }
}

/// Collateral output as reported by `masternode outputs`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub txhash: TxHash,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub txoutput: u32,
}

/// Wallet outputs keyed by an opaque wallet-chosen key. Fetched fresh for
/// every reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasternodeOutputs(IndexMap<String, OutputRecord>);

impl MasternodeOutputs {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "[]" {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn from_records(records: impl IntoIterator<Item = (String, OutputRecord)>) -> Self {
        Self(records.into_iter().collect())
    }

    /// First output whose hash equals `tx_hash`.
    pub fn find(&self, tx_hash: &TxHash) -> Option<&OutputRecord> {
        self.0.values().find(|record| &record.txhash == tx_hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a line stayed unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MismatchReason {
    #[error("no collateral hash on the line")]
    NoTransactionHash,
    #[error("wallet reports no output for {0}")]
    UnknownTransaction(TxHash),
}

/// A line left unresolved by a pass. Not fatal: the next pass retries it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number} ({}): {reason}", .label.as_deref().unwrap_or("?"))]
pub struct ReconciliationMismatch {
    pub line_number: usize,
    pub label: Option<String>,
    pub reason: MismatchReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub line_number: usize,
    pub label: Option<String>,
    pub tx_hash: TxHash,
    pub output_index: u32,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resolved: Vec<Resolution>,
    pub already_resolved: usize,
    pub mismatches: Vec<ReconciliationMismatch>,
    /// Hashes that resolved more than one line.
    pub shared_hashes: Vec<TxHash>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.resolved.is_empty()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} resolved, {} already resolved, {} unresolved",
            self.resolved.len(),
            self.already_resolved,
            self.mismatches.len()
        )
    }
}

/// Line terminator of a config file. Wallets on Windows write CRLF.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    /// Terminator of the first line break in `content`; LF when there is none.
    pub fn detect(content: &str) -> Self {
        match content.find('\n') {
            Some(at) if content[..at].ends_with('\r') => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// In-memory copy of a node config file, line order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasternodeConf {
    lines: Vec<ConfigLine>,
    line_ending: LineEnding,
    trailing_newline: bool,
}

impl MasternodeConf {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(ConfigLine::parse).collect(),
            line_ending: LineEnding::detect(content),
            trailing_newline: content.ends_with('\n'),
        }
    }

    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let content = fs::read_to_string(path).map_err(WalletError::io("read", path))?;
        Ok(Self::parse(&content))
    }

    pub fn lines(&self) -> &[ConfigLine] {
        &self.lines
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub fn render(&self) -> String {
        let newline = self.line_ending.as_str();
        let mut out = self
            .lines
            .iter()
            .map(ConfigLine::text)
            .collect::<Vec<_>>()
            .join(newline);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(newline);
        }
        out
    }

    /// Write the config through a sibling temporary file and rename it over
    /// `path`, keeping the original permissions.
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(WalletError::io("create temporary file in", dir))?;
        tmp.write_all(self.render().as_bytes())
            .map_err(WalletError::io("write", tmp.path()))?;
        tmp.as_file()
            .sync_all()
            .map_err(WalletError::io("sync", tmp.path()))?;
        if let Ok(metadata) = fs::metadata(path) {
            fs::set_permissions(tmp.path(), metadata.permissions())
                .map_err(WalletError::io("copy permissions to", tmp.path()))?;
        }
        tmp.persist(path)
            .map_err(|err| WalletError::io("replace", path)(err.error))?;
        Ok(())
    }

    /// Append the output index to every line whose collateral hash the
    /// wallet reports. Resolved and hash-less lines are left as they are.
    pub fn reconcile(&mut self, outputs: &MasternodeOutputs) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut hits: IndexMap<TxHash, usize> = IndexMap::new();

        for (index, line) in self.lines.iter_mut().enumerate() {
            let line_number = index + 1;
            let label = line.label().map(str::to_owned);
            match line.state.clone() {
                LineState::Passthrough => {}
                LineState::Resolved { .. } => report.already_resolved += 1,
                LineState::Pending => report.mismatches.push(ReconciliationMismatch {
                    line_number,
                    label,
                    reason: MismatchReason::NoTransactionHash,
                }),
                LineState::AwaitingOutput { tx_hash } => match outputs.find(&tx_hash) {
                    Some(record) => {
                        debug!(line = line_number, tx_hash = %tx_hash, output = record.txoutput, "line resolved");
                        line.resolve(tx_hash.clone(), record.txoutput);
                        *hits.entry(tx_hash.clone()).or_default() += 1;
                        report.resolved.push(Resolution {
                            line_number,
                            label,
                            tx_hash,
                            output_index: record.txoutput,
                        });
                    }
                    None => report.mismatches.push(ReconciliationMismatch {
                        line_number,
                        label,
                        reason: MismatchReason::UnknownTransaction(tx_hash),
                    }),
                },
            }
        }

        for (tx_hash, count) in hits {
            if count > 1 {
                warn!(tx_hash = %tx_hash, lines = count, "collateral hash shared by several config lines");
                report.shared_hashes.push(tx_hash);
            }
        }
        report
    }
}

/// Load `path`, reconcile it against `outputs`, and rewrite it only when a
/// line changed.
pub fn reconcile_file(path: &Path, outputs: &MasternodeOutputs) -> Result<ReconcileReport, WalletError> {
    let mut conf = MasternodeConf::load(path)?;
    let report = conf.reconcile(outputs);
    if report.changed() {
        conf.save(path)?;
    }
    for mismatch in &report.mismatches {
        debug!(path = %path.display(), "{}", mismatch);
    }
    info!(path = %path.display(), "{}", report);
    Ok(report)
}

/// Append lines to `path`, creating it when absent and starting on a fresh
/// line when the file lacks a trailing newline. The file's own line ending
/// is kept.
pub fn append_lines(path: &Path, lines: &[String]) -> Result<(), WalletError> {
    let (needs_newline, ending) = match fs::read(path) {
        Ok(existing) => (
            !existing.is_empty() && !existing.ends_with(b"\n"),
            LineEnding::detect(&String::from_utf8_lossy(&existing)),
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (false, LineEnding::Lf),
        Err(err) => return Err(WalletError::io("read", path)(err)),
    };
    let newline = ending.as_str();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(WalletError::io("open", path))?;
    let mut chunk = String::new();
    if needs_newline {
        chunk.push_str(newline);
    }
    for line in lines {
        chunk.push_str(line.trim_end());
        chunk.push_str(newline);
    }
    file.write_all(chunk.as_bytes())
        .map_err(WalletError::io("append to", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "b1b2b3b4b5b6b7b8b9b0b1b2b3b4b5b6b7b8b9b0b1b2b3b4b5b6b7b8b9b0b1b2";

    #[test]
    fn line_shapes() {
        assert_eq!(ConfigLine::parse("").state(), &LineState::Passthrough);
        assert_eq!(ConfigLine::parse("# alias ip:port key tx idx").state(), &LineState::Passthrough);
        assert_eq!(
            ConfigLine::parse("MN01 :9319 key Address:Gabc").state(),
            &LineState::Pending
        );
        assert_eq!(
            ConfigLine::parse(&format!("MN01 1.2.3.4:9319 key {HASH_A}")).state(),
            &LineState::AwaitingOutput {
                tx_hash: HASH_A.parse().unwrap()
            }
        );
        assert_eq!(
            ConfigLine::parse(&format!("MN01 1.2.3.4:9319 key {HASH_A} 1  ")).state(),
            &LineState::Resolved {
                tx_hash: HASH_A.parse().unwrap(),
                output_index: 1
            }
        );
        // A lone hash-like token is an alias, not a collateral hash.
        assert_eq!(ConfigLine::parse(HASH_A).state(), &LineState::Pending);
    }

    #[test]
    fn outputs_accept_numeric_or_string_index() {
        let raw = format!(
            r#"{{"k1": {{"txhash": "{HASH_A}", "txoutput": "1"}}, "k2": {{"txhash": "{HASH_B}", "txoutput": 0}}}}"#
        );
        let outputs = MasternodeOutputs::from_json(&raw).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.find(&HASH_A.parse().unwrap()).unwrap().txoutput, 1);
        assert_eq!(outputs.find(&HASH_B.parse().unwrap()).unwrap().txoutput, 0);
        assert!(MasternodeOutputs::from_json("[]").unwrap().is_empty());
        assert!(MasternodeOutputs::from_json(r#"{"k": {"txhash": "short", "txoutput": 1}}"#).is_err());
    }

    #[test]
    fn shared_hash_updates_every_line() {
        let content = format!("A 1.1.1.1:1 k {HASH_A}\nB 1.1.1.2:1 k {HASH_A}\n");
        let mut conf = MasternodeConf::parse(&content);
        let outputs = MasternodeOutputs::from_records([(
            "x".to_owned(),
            OutputRecord {
                txhash: HASH_A.parse().unwrap(),
                txoutput: 0,
            },
        )]);
        let report = conf.reconcile(&outputs);
        assert_eq!(report.resolved.len(), 2);
        assert_eq!(report.shared_hashes, vec![HASH_A.parse::<TxHash>().unwrap()]);
        assert!(conf.render().lines().all(|l| l.ends_with(" 0")));
    }

    #[test]
    fn render_preserves_layout() {
        for content in ["a\nb\n", "a\nb", "", "# only a comment\n\n", "a\r\n\r\nb\r\n", "a\r\nb"] {
            assert_eq!(MasternodeConf::parse(content).render(), content);
        }
    }

    #[test]
    fn crlf_file_keeps_its_line_endings() {
        let content = format!(
            "# Masternode config file\r\nA 1.1.1.1:1 k {HASH_A}\r\nB 1.1.1.2:1 k {HASH_B} 1\r\n"
        );
        let mut conf = MasternodeConf::parse(&content);
        assert_eq!(conf.line_ending(), LineEnding::CrLf);
        let outputs = MasternodeOutputs::from_records([(
            "x".to_owned(),
            OutputRecord {
                txhash: HASH_A.parse().unwrap(),
                txoutput: 0,
            },
        )]);
        let report = conf.reconcile(&outputs);
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(
            conf.render(),
            format!(
                "# Masternode config file\r\nA 1.1.1.1:1 k {HASH_A} 0\r\nB 1.1.1.2:1 k {HASH_B} 1\r\n"
            )
        );
    }

    #[test]
    fn append_follows_the_file_line_ending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masternode.conf");
        fs::write(&path, "# header\r\nA 1.1.1.1:1 k").unwrap();
        append_lines(&path, &["B :9319 key Address:Gb".to_owned()]).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# header\r\nA 1.1.1.1:1 k\r\nB :9319 key Address:Gb\r\n"
        );
    }
}

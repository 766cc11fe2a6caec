//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Reference block height lookup and sync tolerance checks."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use async_trait::async_trait;
use mnfleet_common::{Ip, SyncConfig};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::transport::HostOutput;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("reference height request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reference endpoint returned {status}")]
    Status { status: reqwest::StatusCode },
    #[error("reference response has no block height at {pointer}")]
    MissingHeight { pointer: String },
    #[error("{host} did not report a block height (first line: {line:?})")]
    RemoteHeight { host: Ip, line: Option<String> },
}

impl ChainError {
    /// Failures a sync wait retries: an unreachable or overloaded reference
    /// endpoint, or a node that cannot report its height yet. A response
    /// without a height at the configured pointer is a configuration fault.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Request(_) | ChainError::RemoteHeight { .. } => true,
            ChainError::Status { status } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ChainError::MissingHeight { .. } => false,
        }
    }
}

/// Source of the network's current block height.
#[async_trait]
pub trait ChainHeightSource: Send + Sync + 'static {
    async fn reference_height(&self) -> Result<u64, ChainError>;
}

/// Reads the reference height from a JSON endpoint such as a block explorer.
#[derive(Debug, Clone)]
pub struct HttpChainHeight {
    client: Client,
    url: Url,
    pointer: String,
}

impl HttpChainHeight {
    pub fn new(config: &SyncConfig) -> Result<Self, ChainError> {
        Ok(Self {
            client: Client::builder().build()?,
            url: config.reference_url.clone(),
            pointer: config.height_pointer.clone(),
        })
    }
}

#[async_trait]
impl ChainHeightSource for HttpChainHeight {
    async fn reference_height(&self) -> Result<u64, ChainError> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Status { status });
        }
        let body: Value = response.json().await?;
        let height = height_at(&body, &self.pointer)?;
        debug!(url = %self.url, height, "reference height fetched");
        Ok(height)
    }
}

/// Extract a block height at `pointer`, accepting numbers and numeric strings.
pub fn height_at(body: &Value, pointer: &str) -> Result<u64, ChainError> {
    let missing = || ChainError::MissingHeight {
        pointer: pointer.to_owned(),
    };
    match body.pointer(pointer).ok_or_else(missing)? {
        Value::Number(n) => n.as_u64().ok_or_else(missing),
        Value::String(s) => s.trim().parse().map_err(|_| missing()),
        _ => Err(missing()),
    }
}

/// Parse the block height a node printed as its first stdout line.
pub fn parse_remote_height(output: &HostOutput) -> Result<u64, ChainError> {
    let line = output.first_stdout_line();
    line.and_then(|l| l.parse().ok())
        .ok_or_else(|| ChainError::RemoteHeight {
            host: output.host.clone(),
            line: line.map(str::to_owned),
        })
}

/// A node is synced when it is no more than `tolerance` blocks behind.
pub fn within_tolerance(remote: u64, reference: u64, tolerance: u64) -> bool {
    remote.saturating_add(tolerance) >= reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tolerance_window() {
        assert!(within_tolerance(950, 1000, 100));
        assert!(within_tolerance(900, 1000, 100));
        assert!(!within_tolerance(899, 1000, 100));
        assert!(!within_tolerance(800, 1000, 100));
        assert!(within_tolerance(1200, 1000, 0));
        assert!(within_tolerance(u64::MAX, 1000, 100));
    }

    #[test]
    fn height_from_number_or_string() {
        let body = json!({"txoutsetinfo": {"height": 1000}});
        assert_eq!(height_at(&body, "/txoutsetinfo/height").unwrap(), 1000);
        let quoted = json!({"blocks": " 512 "});
        assert_eq!(height_at(&quoted, "/blocks").unwrap(), 512);
        assert!(matches!(
            height_at(&body, "/missing"),
            Err(ChainError::MissingHeight { .. })
        ));
        assert!(height_at(&json!({"h": -4}), "/h").is_err());
    }

    #[test]
    fn remote_height_uses_first_line() {
        let host: Ip = "10.0.0.9".parse().unwrap();
        let output = HostOutput {
            host: host.clone(),
            exit_status: 0,
            stdout: vec!["950".into(), "ignored".into()],
            stderr: Vec::new(),
        };
        assert_eq!(parse_remote_height(&output).unwrap(), 950);

        let garbage = HostOutput {
            stdout: vec!["error: loading block index".into()],
            ..output
        };
        match parse_remote_height(&garbage) {
            Err(ChainError::RemoteHeight { host: h, line }) => {
                assert_eq!(h, host);
                assert_eq!(line.as_deref(), Some("error: loading block index"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_pointer_is_not_retried() {
        let host: Ip = "10.0.0.9".parse().unwrap();
        assert!(ChainError::RemoteHeight { host, line: None }.is_transient());
        assert!(ChainError::Status {
            status: reqwest::StatusCode::BAD_GATEWAY
        }
        .is_transient());
        assert!(!ChainError::MissingHeight {
            pointer: "/blocks".into()
        }
        .is_transient());
    }
}

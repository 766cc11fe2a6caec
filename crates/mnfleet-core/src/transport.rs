//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Remote command execution and file transfer over SSH."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use mnfleet_common::{Ip, SshConfig};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// `ssh` reserves this exit status for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Result of one command on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutput {
    pub host: Ip,
    pub exit_status: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// First non-empty stdout line, trimmed.
    pub fn first_stdout_line(&self) -> Option<&str> {
        self.stdout
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
    }
}

/// Errors raised while reaching a single host.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to launch {program} for {host}: {source}")]
    Spawn {
        host: Ip,
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{host} unreachable after {attempts} attempt(s): {message}")]
    Unreachable {
        host: Ip,
        attempts: u32,
        message: String,
    },
    #[error("{host} did not finish within {after:?}")]
    Timeout { host: Ip, after: Duration },
    #[error(
        "copying {} to {host}:{} failed after {attempts} attempt(s): {message}",
        .local.display(),
        .remote.display()
    )]
    Transfer {
        host: Ip,
        local: PathBuf,
        remote: PathBuf,
        attempts: u32,
        message: String,
    },
}

impl TransportError {
    pub fn host(&self) -> &Ip {
        match self {
            TransportError::Spawn { host, .. }
            | TransportError::Unreachable { host, .. }
            | TransportError::Timeout { host, .. }
            | TransportError::Transfer { host, .. } => host,
        }
    }
}

/// Per-host remote execution seam. Fan-out over many hosts lives in
/// [`crate::dispatch::FleetDispatcher`].
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Run a shell command line on `host`. A non-zero exit status is a
    /// successful transport call; only failing to reach the host is an error.
    async fn run(&self, host: &Ip, command: &str) -> Result<HostOutput, TransportError>;

    /// Copy a local file or directory to `remote` on `host`.
    async fn transfer(
        &self,
        host: &Ip,
        local: &Path,
        remote: &Path,
        recursive: bool,
    ) -> Result<(), TransportError>;
}

/// [`RemoteTransport`] backed by the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    config: SshConfig,
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl OpenSshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }

    /// Override the client binaries, e.g. for a wrapper script.
    pub fn with_programs(mut self, ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_owned(),
            self.config.private_key().display().to_string(),
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=accept-new".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        let keepalive = self.config.tunnel_timeout.as_secs();
        if keepalive > 0 {
            args.push("-o".to_owned());
            args.push(format!("ServerAliveInterval={}", keepalive));
            args.push("-o".to_owned());
            args.push("ServerAliveCountMax=1".to_owned());
        }
        args
    }

    pub(crate) fn ssh_args(&self, host: &Ip, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push(format!("{}@{}", self.config.user, host));
        args.push("--".to_owned());
        args.push(command.to_owned());
        args
    }

    pub(crate) fn scp_args(&self, host: &Ip, local: &Path, remote: &Path, recursive: bool) -> Vec<String> {
        let mut args = self.common_options();
        if recursive {
            args.push("-r".to_owned());
        }
        args.push(local.display().to_string());
        args.push(format!("{}@{}:{}", self.config.user, host, remote.display()));
        args
    }

    async fn output_with_timeout(
        &self,
        host: &Ip,
        program: &'static str,
        mut command: Command,
    ) -> Result<std::process::Output, TransportError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let pending = command.output();
        let result = match self.config.command_timeout {
            Some(after) => tokio::time::timeout(after, pending)
                .await
                .map_err(|_| TransportError::Timeout {
                    host: host.clone(),
                    after,
                })?,
            None => pending.await,
        };
        result.map_err(|source| TransportError::Spawn {
            host: host.clone(),
            program,
            source,
        })
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn run(&self, host: &Ip, command: &str) -> Result<HostOutput, TransportError> {
        let attempts = self.config.num_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let mut cmd = Command::new(&self.ssh_program);
            cmd.args(self.ssh_args(host, command));
            debug!(host = %host, attempt, "running remote command");
            let output = self.output_with_timeout(host, "ssh", cmd).await?;
            let exit_status = output.status.code().unwrap_or(-1);
            if exit_status != SSH_CONNECTION_FAILURE {
                return Ok(HostOutput {
                    host: host.clone(),
                    exit_status,
                    stdout: split_lines(&output.stdout),
                    stderr: split_lines(&output.stderr),
                });
            }
            last_error = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(host = %host, attempt, error = %last_error, "ssh connection failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(TransportError::Unreachable {
            host: host.clone(),
            attempts,
            message: last_error,
        })
    }

    async fn transfer(
        &self,
        host: &Ip,
        local: &Path,
        remote: &Path,
        recursive: bool,
    ) -> Result<(), TransportError> {
        let attempts = self.config.num_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let mut cmd = Command::new(&self.scp_program);
            cmd.args(self.scp_args(host, local, remote, recursive));
            debug!(host = %host, local = %local.display(), remote = %remote.display(), attempt, "copying file");
            let output = self.output_with_timeout(host, "scp", cmd).await?;
            if output.status.success() {
                return Ok(());
            }
            last_error = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(host = %host, attempt, error = %last_error, "scp failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(TransportError::Transfer {
            host: host.clone(),
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
            attempts,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> OpenSshTransport {
        OpenSshTransport::new(SshConfig {
            private_key_path: PathBuf::from("/keys/fleet"),
            connect_timeout: Duration::from_secs(15),
            tunnel_timeout: Duration::from_secs(30),
            ..SshConfig::default()
        })
    }

    #[test]
    fn ssh_arguments_target_user_at_host() {
        let host: Ip = "10.0.0.5".parse().unwrap();
        let args = transport().ssh_args(&host, "uptime && df -h");
        assert_eq!(&args[..2], ["-i", "/keys/fleet"]);
        assert!(args.contains(&"ConnectTimeout=15".to_owned()));
        assert!(args.contains(&"ServerAliveInterval=30".to_owned()));
        let tail = &args[args.len() - 3..];
        assert_eq!(tail, ["root@10.0.0.5", "--", "uptime && df -h"]);
    }

    #[test]
    fn scp_arguments_place_remote_last() {
        let host: Ip = "10.0.0.5".parse().unwrap();
        let args = transport().scp_args(&host, Path::new("data/mn_setup.sh"), Path::new("/root/mn_setup.sh"), false);
        assert!(!args.contains(&"-r".to_owned()));
        assert_eq!(args.last().unwrap(), "root@10.0.0.5:/root/mn_setup.sh");
        assert_eq!(args[args.len() - 2], "data/mn_setup.sh");

        let recursive = transport().scp_args(&host, Path::new("data"), Path::new("/root/data"), true);
        assert!(recursive.contains(&"-r".to_owned()));
    }

    #[test]
    fn first_stdout_line_skips_blanks() {
        let output = HostOutput {
            host: "10.0.0.5".parse().unwrap(),
            exit_status: 0,
            stdout: vec!["".into(), "  1234 ".into(), "tail".into()],
            stderr: Vec::new(),
        };
        assert!(output.success());
        assert_eq!(output.first_stdout_line(), Some("1234"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let host: Ip = "127.0.0.1".parse().unwrap();
        let transport = transport().with_programs("/nonexistent/ssh-binary", "/nonexistent/scp-binary");
        let err = transport.run(&host, "true").await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { program: "ssh", .. }));
        assert_eq!(err.host(), &host);
    }
}

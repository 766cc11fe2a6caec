//! ---
//! mnf_section: "01-core-functionality"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Shared primitives and utilities for the fleet runtime."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_api_base() -> Url {
    Url::parse("https://api.vultr.com/v1/").expect("valid default provider url")
}

fn default_api_key_env() -> String {
    "VULTR_API_KEY".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ssh_user() -> String {
    "root".to_owned()
}

fn default_private_key() -> PathBuf {
    PathBuf::from("~/.ssh/id_rsa")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_num_retries() -> u32 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_reference_url() -> Url {
    Url::parse("https://explorer.globaltoken.org/api/status?q=getTxOutSetInfo")
        .expect("valid default reference url")
}

fn default_height_pointer() -> String {
    "/txoutsetinfo/height".to_owned()
}

fn default_remote_height_command() -> String {
    r#"/root/globaltoken/bin/globaltoken-cli -getinfo | grep -Po '"blocks": *\K[0-9]*'"#.to_owned()
}

fn default_tolerance_blocks() -> u64 {
    100
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_build_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_pre_setup_script() -> PathBuf {
    PathBuf::from("data/pre_setup.sh")
}

fn default_pre_setup_remote() -> PathBuf {
    PathBuf::from("/root/pre_setup.sh")
}

fn default_install_script() -> PathBuf {
    PathBuf::from("data/mn_setup.sh")
}

fn default_install_remote() -> PathBuf {
    PathBuf::from("/root/mn_setup.sh")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for the fleet tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub coins: IndexMap<String, CoinConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MNFLEET_CONFIG";

    /// Load configuration from disk, respecting the `MNFLEET_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a coin configuration by name.
    pub fn coin(&self, name: &str) -> Result<&CoinConfig> {
        self.coins.get(name).ok_or_else(|| {
            anyhow!(
                "coin '{}' is not configured (known: {})",
                name,
                self.coins.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.ssh.validate()?;
        self.sync.validate()?;
        if self.setup.build_poll_interval.is_zero() {
            return Err(anyhow!("setup.build_poll_interval must be greater than zero"));
        }
        for (name, coin) in &self.coins {
            coin.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Cloud provider settings used when creating instances.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base")]
    pub api_base: Url,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Optional file holding the API key; consulted when the variable is unset.
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    #[serde(default)]
    pub location_id: u32,
    #[serde(default)]
    pub plan_id: u32,
    #[serde(default)]
    pub os_id: u32,
    #[serde(default)]
    pub script_id: Option<u32>,
    #[serde(default)]
    pub ssh_key_ids: Vec<String>,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Resolve the API key from the environment or the configured key file.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Ok(key) = std::env::var(&self.api_key_env) {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_owned());
            }
        }
        if let Some(path) = &self.api_key_file {
            let path = expand_home(path);
            let key = fs::read_to_string(&path)
                .with_context(|| format!("unable to read api key file {}", path.display()))?;
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_owned());
            }
        }
        Err(anyhow!(
            "no provider api key found in ${} or provider.api_key_file",
            self.api_key_env
        ))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            api_key_file: None,
            location_id: 0,
            plan_id: 0,
            os_id: 0,
            script_id: None,
            ssh_key_ids: Vec::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Remote execution transport knobs, applied uniformly to every connection.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_private_key")]
    pub private_key_path: PathBuf,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tunnel_timeout: Duration,
    /// Upper bound for a whole remote command; unbounded when absent.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub command_timeout: Option<Duration>,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_delay: Duration,
}

impl SshConfig {
    /// Private key path with a leading `~` expanded.
    pub fn private_key(&self) -> PathBuf {
        expand_home(&self.private_key_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(anyhow!("ssh.user must not be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("ssh.connect_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            private_key_path: default_private_key(),
            connect_timeout: default_connect_timeout(),
            tunnel_timeout: default_connect_timeout(),
            command_timeout: None,
            num_retries: default_num_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Blockchain sync detection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_reference_url")]
    pub reference_url: Url,
    /// JSON pointer locating the height in the reference response.
    #[serde(default = "default_height_pointer")]
    pub height_pointer: String,
    /// Remote command whose first stdout line is the node's block height.
    #[serde(default = "default_remote_height_command")]
    pub remote_height_command: String,
    #[serde(default = "default_tolerance_blocks")]
    pub tolerance_blocks: u64,
    #[serde(default = "default_sync_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.height_pointer.is_empty() && !self.height_pointer.starts_with('/') {
            return Err(anyhow!(
                "sync.height_pointer must be a JSON pointer starting with '/'"
            ));
        }
        if self.remote_height_command.trim().is_empty() {
            return Err(anyhow!("sync.remote_height_command must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("sync.poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reference_url: default_reference_url(),
            height_pointer: default_height_pointer(),
            remote_height_command: default_remote_height_command(),
            tolerance_blocks: default_tolerance_blocks(),
            poll_interval: default_sync_interval(),
        }
    }
}

/// Script locations used by the setup stages.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_pre_setup_script")]
    pub pre_setup_script: PathBuf,
    #[serde(default = "default_pre_setup_remote")]
    pub pre_setup_remote: PathBuf,
    #[serde(default = "default_install_script")]
    pub install_script: PathBuf,
    #[serde(default = "default_install_remote")]
    pub install_remote: PathBuf,
    #[serde(default = "default_build_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub build_poll_interval: Duration,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            pre_setup_script: default_pre_setup_script(),
            pre_setup_remote: default_pre_setup_remote(),
            install_script: default_install_script(),
            install_remote: default_install_remote(),
            build_poll_interval: default_build_interval(),
        }
    }
}

/// Wallet-side settings for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    pub mn_conf_path: PathBuf,
    pub wallet_cli_path: PathBuf,
    pub node_port: u16,
    /// RPC noun used for masternode commands; derived from the coin name when absent.
    #[serde(default)]
    pub node_term: Option<String>,
}

impl CoinConfig {
    /// RPC noun for masternode commands (`smartnode` for SMART, `masternode` otherwise).
    pub fn node_term(&self, coin: &str) -> String {
        match &self.node_term {
            Some(term) => term.clone(),
            None if coin.eq_ignore_ascii_case("SMART") => "smartnode".to_owned(),
            None => "masternode".to_owned(),
        }
    }

    pub fn mn_conf(&self) -> PathBuf {
        expand_home(&self.mn_conf_path)
    }

    pub fn wallet_cli(&self) -> PathBuf {
        expand_home(&self.wallet_cli_path)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.node_port == 0 {
            return Err(anyhow!("coin '{}' must declare a non-zero node_port", name));
        }
        if self.wallet_cli_path.as_os_str().is_empty() {
            return Err(anyhow!("coin '{}' must declare wallet_cli_path", name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when neither `MNFLEET_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// File receiving the Prometheus text exposition when a command finishes.
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
}

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

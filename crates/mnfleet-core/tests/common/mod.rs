//! ---
//! mnf_section: "09-testing"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "test"
//! mnf_description: "In-memory provider, transport and chain fakes for integration tests."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mnfleet_common::{AppConfig, InstanceId, Ip, Label};
use mnfleet_core::{
    ChainError, ChainHeightSource, CloudProvider, Collaborators, ControllerSettings, CreateRequest,
    HostOutput, ProviderError, RemoteTransport, ServerDirectory, ServerRecord, ServerStatus,
    TransportError,
};
use parking_lot::Mutex;

pub fn ip(raw: &str) -> Ip {
    raw.parse().unwrap()
}

pub fn label(raw: &str) -> Label {
    raw.parse().unwrap()
}

/// Provider that hands out sequential ids and becomes ready after a number of polls.
#[derive(Default)]
pub struct FakeProvider {
    pub not_ready_polls: u32,
    pub fail_create_for: HashSet<String>,
    next_id: AtomicU32,
    polls: Mutex<HashMap<InstanceId, u32>>,
    /// Errors returned by the next `status` calls, in order.
    status_errors: Mutex<VecDeque<ProviderError>>,
    pub created: Mutex<Vec<Label>>,
    pub destroyed: Mutex<Vec<InstanceId>>,
}

impl FakeProvider {
    pub fn ready_after(polls: u32) -> Self {
        Self {
            not_ready_polls: polls,
            ..Self::default()
        }
    }

    pub fn with_status_errors(self, errors: impl IntoIterator<Item = ProviderError>) -> Self {
        self.status_errors.lock().extend(errors);
        self
    }

    pub fn failing_for(mut self, label: &str) -> Self {
        self.fail_create_for.insert(label.to_owned());
        self
    }

    fn address_for(id: &InstanceId) -> Option<Ip> {
        let n: u32 = id.as_str().trim_start_matches("sub").parse().ok()?;
        format!("10.0.0.{}", n).parse().ok()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn create(&self, request: &CreateRequest) -> Result<InstanceId, ProviderError> {
        if self.fail_create_for.contains(request.label.as_str()) {
            return Err(ProviderError::InvalidResponse("quota exceeded".into()));
        }
        self.created.lock().push(request.label.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sub{}", n).parse()?)
    }

    async fn status(&self, id: &InstanceId) -> Result<ServerStatus, ProviderError> {
        if let Some(err) = self.status_errors.lock().pop_front() {
            return Err(err);
        }
        let mut polls = self.polls.lock();
        let seen = polls.entry(id.clone()).or_insert(0);
        *seen += 1;
        if *seen <= self.not_ready_polls {
            return Ok(ServerStatus {
                ready: false,
                main_ip: None,
                state: "pending/none".into(),
            });
        }
        Ok(ServerStatus {
            ready: true,
            main_ip: Self::address_for(id),
            state: "active/ok".into(),
        })
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, ProviderError> {
        Ok(Vec::new())
    }

    async fn reboot(&self, _id: &InstanceId) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn reinstall(&self, _id: &InstanceId) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.destroyed.lock().push(id.clone());
        Ok(())
    }
}

/// Transport that records every call and answers from fixed tables.
pub struct FakeTransport {
    pub height_command: String,
    pub heights: Mutex<HashMap<Ip, u64>>,
    /// Height queries that fail like a daemon still starting up.
    pub height_failures: AtomicU32,
    pub unreachable: HashSet<Ip>,
    pub failing_copies: HashSet<Ip>,
    /// Commands containing the key exit with the given status.
    pub exit_overrides: Vec<(String, i32)>,
    pub commands: Mutex<Vec<(Ip, String)>>,
    pub copies: Mutex<Vec<(Ip, PathBuf, PathBuf)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            height_command: AppConfig::default().sync.remote_height_command,
            heights: Mutex::new(HashMap::new()),
            height_failures: AtomicU32::new(0),
            unreachable: HashSet::new(),
            failing_copies: HashSet::new(),
            exit_overrides: Vec::new(),
            commands: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
        }
    }

    pub fn set_height(&self, host: &Ip, height: u64) {
        self.heights.lock().insert(host.clone(), height);
    }

    pub fn commands_for(&self, host: &Ip) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn run(&self, host: &Ip, command: &str) -> Result<HostOutput, TransportError> {
        self.commands.lock().push((host.clone(), command.to_owned()));
        if self.unreachable.contains(host) {
            return Err(TransportError::Unreachable {
                host: host.clone(),
                attempts: 3,
                message: "connection refused".into(),
            });
        }
        if command == self.height_command {
            let failing = self
                .height_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Ok(HostOutput {
                    host: host.clone(),
                    exit_status: 1,
                    stdout: Vec::new(),
                    stderr: vec!["error: couldn't connect to server".into()],
                });
            }
            let height = self.heights.lock().get(host).copied().unwrap_or(0);
            return Ok(HostOutput {
                host: host.clone(),
                exit_status: 0,
                stdout: vec![height.to_string()],
                stderr: Vec::new(),
            });
        }
        if let Some((_, status)) = self.exit_overrides.iter().find(|(key, _)| command.contains(key.as_str())) {
            return Ok(HostOutput {
                host: host.clone(),
                exit_status: *status,
                stdout: Vec::new(),
                stderr: vec!["script failed".into()],
            });
        }
        Ok(HostOutput {
            host: host.clone(),
            exit_status: 0,
            stdout: vec!["ok".into()],
            stderr: Vec::new(),
        })
    }

    async fn transfer(
        &self,
        host: &Ip,
        local: &Path,
        remote: &Path,
        _recursive: bool,
    ) -> Result<(), TransportError> {
        self.copies
            .lock()
            .push((host.clone(), local.to_path_buf(), remote.to_path_buf()));
        if self.failing_copies.contains(host) || self.unreachable.contains(host) {
            return Err(TransportError::Transfer {
                host: host.clone(),
                local: local.to_path_buf(),
                remote: remote.to_path_buf(),
                attempts: 3,
                message: "permission denied".into(),
            });
        }
        Ok(())
    }
}

/// Fixed reference height with a call counter.
#[derive(Default)]
pub struct FakeChain {
    pub height: AtomicU64,
    pub calls: AtomicU32,
}

impl FakeChain {
    pub fn at(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChainHeightSource for FakeChain {
    async fn reference_height(&self) -> Result<u64, ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.height.load(Ordering::SeqCst))
    }
}

pub fn settings() -> Arc<ControllerSettings> {
    Arc::new(ControllerSettings::from_config(&AppConfig::default()))
}

/// Default settings with the sync wait capped at `attempts` checks.
pub fn settings_with_sync_attempts(attempts: u32) -> Arc<ControllerSettings> {
    let mut settings = ControllerSettings::from_config(&AppConfig::default());
    settings.sync_policy = settings.sync_policy.with_max_attempts(attempts);
    Arc::new(settings)
}

pub fn collaborators(
    provider: Arc<FakeProvider>,
    transport: Arc<FakeTransport>,
    chain: Arc<FakeChain>,
    directory: Option<Arc<dyn ServerDirectory>>,
) -> Collaborators {
    Collaborators {
        provider,
        transport,
        chain,
        directory,
        metrics: None,
    }
}

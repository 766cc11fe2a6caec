//! ---
//! mnf_section: "05-networking-external-interfaces"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Cloud provider abstraction and the Vultr REST client."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
use std::collections::HashMap;

use async_trait::async_trait;
use mnfleet_common::{Hostname, InstanceId, Ip, Label, ProviderConfig, ValidationError};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Parameters for creating one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRequest {
    pub label: Label,
    pub hostname: Hostname,
    pub location_id: u32,
    pub plan_id: u32,
    pub os_id: u32,
    pub ssh_key_ids: Vec<String>,
    pub script_id: Option<u32>,
}

impl CreateRequest {
    /// Build a request for `label` using the configured machine shape.
    pub fn from_config(config: &ProviderConfig, label: &Label) -> Self {
        Self {
            label: label.clone(),
            hostname: label.hostname(),
            location_id: config.location_id,
            plan_id: config.plan_id,
            os_id: config.os_id,
            ssh_key_ids: config.ssh_key_ids.clone(),
            script_id: config.script_id,
        }
    }
}

/// Build state reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Provider reports the machine built and usable.
    pub ready: bool,
    /// Primary address, once assigned.
    pub main_ip: Option<Ip>,
    /// Raw provider state for logging.
    pub state: String,
}

/// One machine as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: InstanceId,
    pub label: Option<Label>,
    pub main_ip: Option<Ip>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("instance {0} is unknown to the provider")]
    NotFound(InstanceId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ProviderError {
    /// Whether a readiness wait should treat this as "not ready yet".
    ///
    /// Throttling, server-side failures, dropped connections and garbled
    /// replies clear up on their own; so does a fresh id the list endpoint
    /// has not caught up with. Client errors such as a rejected key do not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::NotFound(_) => true,
            ProviderError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ProviderError::Validation(_) => false,
        }
    }
}

/// Machine lifecycle operations offered by a cloud provider.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Create a machine and return its identifier. Never retried: a second
    /// call creates a second machine.
    async fn create(&self, request: &CreateRequest) -> Result<InstanceId, ProviderError>;
    async fn status(&self, id: &InstanceId) -> Result<ServerStatus, ProviderError>;
    async fn list(&self) -> Result<Vec<ServerRecord>, ProviderError>;
    async fn reboot(&self, id: &InstanceId) -> Result<(), ProviderError>;
    async fn reinstall(&self, id: &InstanceId) -> Result<(), ProviderError>;
    async fn destroy(&self, id: &InstanceId) -> Result<(), ProviderError>;
}

/// Client for the Vultr v1 REST API.
#[derive(Debug, Clone)]
pub struct VultrProvider {
    client: Client,
    base: Url,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "SUBID")]
    subid: String,
}

#[derive(Debug, Deserialize)]
struct VultrServer {
    #[serde(rename = "SUBID", default)]
    subid: Option<String>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    server_state: String,
}

impl VultrServer {
    fn main_ip(&self) -> Option<Ip> {
        // Vultr reports "0" or "0.0.0.0" until an address is assigned.
        self.main_ip
            .parse::<Ip>()
            .ok()
            .filter(|ip| ip.as_str() != "0.0.0.0")
    }

    fn status(&self) -> ServerStatus {
        let main_ip = self.main_ip();
        ServerStatus {
            ready: self.status == "active" && self.server_state == "ok" && main_ip.is_some(),
            main_ip,
            state: format!("{}/{}", self.status, self.server_state),
        }
    }
}

impl VultrProvider {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base: config.api_base.clone(),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base
            .join(path)
            .map_err(|err| ProviderError::InvalidResponse(format!("bad endpoint {}: {}", path, err)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, ProviderError> {
        let response = request.header("API-Key", &self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(ProviderError::Api { status, body })
        }
    }

    async fn post_subid(&self, path: &str, id: &InstanceId) -> Result<(), ProviderError> {
        let url = self.endpoint(path)?;
        self.send(self.client.post(url).form(&[("SUBID", id.as_str())]))
            .await?;
        Ok(())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|err| ProviderError::InvalidResponse(err.to_string()))
}

/// Form fields for `server/create`.
fn create_form(request: &CreateRequest) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("DCID", request.location_id.to_string()),
        ("VPSPLANID", request.plan_id.to_string()),
        ("OSID", request.os_id.to_string()),
        ("hostname", request.hostname.to_string()),
        ("label", request.label.to_string()),
    ];
    if !request.ssh_key_ids.is_empty() {
        form.push(("SSHKEYID", request.ssh_key_ids.join(",")));
    }
    if let Some(script) = request.script_id {
        form.push(("SCRIPTID", script.to_string()));
    }
    form
}

fn parse_server_list(body: &str) -> Result<Vec<ServerRecord>, ProviderError> {
    // An empty account is reported as `[]` rather than `{}`.
    if body.trim() == "[]" {
        return Ok(Vec::new());
    }
    let servers: HashMap<String, VultrServer> = decode(body)?;
    let mut records = servers
        .into_iter()
        .map(|(key, server)| {
            let id: InstanceId = server.subid.clone().unwrap_or(key).parse()?;
            Ok(ServerRecord {
                id,
                label: server.label.parse().ok(),
                main_ip: server.main_ip(),
            })
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
}

#[async_trait]
impl CloudProvider for VultrProvider {
    async fn create(&self, request: &CreateRequest) -> Result<InstanceId, ProviderError> {
        let url = self.endpoint("server/create")?;
        let body = self
            .send(self.client.post(url).form(&create_form(request)))
            .await?;
        let created: CreateResponse = decode(&body)?;
        let id: InstanceId = created.subid.parse()?;
        info!(label = %request.label, instance = %id, "machine created");
        Ok(id)
    }

    async fn status(&self, id: &InstanceId) -> Result<ServerStatus, ProviderError> {
        let mut url = self.endpoint("server/list")?;
        url.query_pairs_mut().append_pair("SUBID", id.as_str());
        let body = self.send(self.client.get(url)).await?;
        if body.trim() == "[]" {
            return Err(ProviderError::NotFound(id.clone()));
        }
        let server: VultrServer = decode(&body)?;
        let status = server.status();
        debug!(instance = %id, state = %status.state, ready = status.ready, "status polled");
        Ok(status)
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, ProviderError> {
        let url = self.endpoint("server/list")?;
        let body = self.send(self.client.get(url)).await?;
        parse_server_list(&body)
    }

    async fn reboot(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.post_subid("server/reboot", id).await
    }

    async fn reinstall(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.post_subid("server/reinstall", id).await
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), ProviderError> {
        self.post_subid("server/destroy", id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_form_carries_machine_shape() {
        let config = ProviderConfig {
            location_id: 9,
            plan_id: 201,
            os_id: 215,
            ssh_key_ids: vec!["abc".into(), "def".into()],
            script_id: Some(42),
            ..ProviderConfig::default()
        };
        let label: Label = "GLT_MN01".parse().unwrap();
        let form = create_form(&CreateRequest::from_config(&config, &label));
        let get = |key: &str| form.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("DCID"), Some("9"));
        assert_eq!(get("VPSPLANID"), Some("201"));
        assert_eq!(get("OSID"), Some("215"));
        assert_eq!(get("SSHKEYID"), Some("abc,def"));
        assert_eq!(get("SCRIPTID"), Some("42"));
        assert_eq!(get("label"), Some("GLT_MN01"));
        assert_eq!(get("hostname"), Some("glt-mn01"));
    }

    #[test]
    fn throttling_and_outages_are_transient() {
        let api = |status: StatusCode| ProviderError::Api {
            status,
            body: String::new(),
        };
        assert!(api(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(api(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(ProviderError::InvalidResponse("truncated body".into()).is_transient());
        assert!(ProviderError::NotFound("sub1".parse().unwrap()).is_transient());
        assert!(!api(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!api(StatusCode::BAD_REQUEST).is_transient());
    }

    #[test]
    fn readiness_needs_active_ok_and_address() {
        let pending: VultrServer = serde_json::from_str(
            r#"{"SUBID":"1","status":"pending","server_state":"none","main_ip":"0"}"#,
        )
        .unwrap();
        assert!(!pending.status().ready);
        assert_eq!(pending.status().main_ip, None);

        let booting: VultrServer = serde_json::from_str(
            r#"{"SUBID":"1","status":"active","server_state":"installingbooting","main_ip":"45.1.2.3"}"#,
        )
        .unwrap();
        assert!(!booting.status().ready);

        let ready: VultrServer = serde_json::from_str(
            r#"{"SUBID":"1","status":"active","server_state":"ok","main_ip":"45.1.2.3"}"#,
        )
        .unwrap();
        let status = ready.status();
        assert!(status.ready);
        assert_eq!(status.main_ip.unwrap().as_str(), "45.1.2.3");
    }

    #[test]
    fn server_list_is_keyed_by_subid() {
        let body = r#"{
            "576965": {"SUBID":"576965","label":"GLT_MN02","main_ip":"45.1.2.4","status":"active","server_state":"ok"},
            "576964": {"SUBID":"576964","label":"GLT_MN01","main_ip":"0","status":"pending","server_state":"none"}
        }"#;
        let records = parse_server_list(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_str(), "576964");
        assert_eq!(records[0].main_ip, None);
        assert_eq!(records[1].label.as_ref().unwrap().as_str(), "GLT_MN02");
        assert!(parse_server_list("[]").unwrap().is_empty());
    }
}

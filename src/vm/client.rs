//! VM management API client

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use crate::Result;
use crate::auth::AccessTokenProvider;
use crate::error::Error;
use super::tracker::{TaskSource, TaskStatus};

/// Power-state transitions accepted by `/vm/{id}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
    Reboot,
    Reset,
    Suspend,
    Resume,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
            PowerAction::Reset => "reset",
            PowerAction::Suspend => "suspend",
            PowerAction::Resume => "resume",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a clone request
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub name: String,
    pub template: String,
    pub storage: String,
}

/// VM operations used by the provisioning and connect flows
#[async_trait]
pub trait VmApi: TaskSource {
    /// Clone a template; returns the task id
    async fn clone_vm(&self, request: &CloneRequest) -> Result<String>;

    async fn vm_id(&self, name: &str) -> Result<u64>;

    async fn status(&self, vm_id: u64) -> Result<Value>;

    /// Returns the task id when the transition runs in the background
    async fn change_state(&self, vm_id: u64, action: PowerAction) -> Result<Option<String>>;

    async fn edit_resources(&self, vm_id: u64, vcpus: u32, memory_mib: u64) -> Result<()>;

    /// Create the user account; returns its temporary password
    async fn provision_user(&self, vm_id: u64) -> Result<String>;

    async fn provision_ssh(&self, vm_id: u64, public_key: &str) -> Result<()>;

    /// Expand the disk and set the guest hostname
    async fn provision_guest(&self, vm_id: u64) -> Result<()>;

    async fn spice_proxy(&self, vm_id: u64) -> Result<Map<String, Value>>;
}

#[derive(Deserialize)]
struct VmIdReply {
    vm_id: u64,
}

#[derive(Deserialize)]
struct TemplatesReply {
    templates: Vec<String>,
}

#[derive(Deserialize)]
struct UserReply {
    temporary_ssh_password: String,
}

#[derive(Deserialize)]
struct LogEntry {
    #[serde(default)]
    t: String,
}

/// Bearer-authenticated JSON client for the VM API
#[derive(Clone)]
pub struct VmClient {
    http_client: Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl VmClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<String> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !(200..400).contains(&status.as_u16()) {
            return Err(Error::Api(error_detail(status.as_u16(), &body)));
        }
        Ok(body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.send(self.http_client.get(self.url(path))).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json(&self, path: &str, payload: Option<Value>) -> Result<String> {
        let mut request = self.http_client.post(self.url(path));
        if let Some(payload) = payload {
            request = request.json(&payload);
        }
        self.send(request).await
    }

    /// All VMs owned by the caller
    pub async fn list(&self) -> Result<Vec<Value>> {
        self.get_json("/vm/list").await
    }

    pub async fn templates(&self) -> Result<Vec<String>> {
        let reply: TemplatesReply = self.get_json("/vm/templates/list").await?;
        Ok(reply.templates)
    }
}

#[async_trait]
impl TaskSource for VmClient {
    async fn task_log(&self, upid: &str) -> Result<String> {
        let body: Value = self.get_json(&format!("/vm/upid/log/{}", upid)).await?;
        last_log_line(body)
    }

    async fn task_status(&self, upid: &str) -> Result<TaskStatus> {
        self.get_json(&format!("/vm/upid/status/{}", upid)).await
    }
}

#[async_trait]
impl VmApi for VmClient {
    async fn clone_vm(&self, request: &CloneRequest) -> Result<String> {
        tracing::info!("Cloning {} from template {}", request.name, request.template);
        let payload = json!({
            "name": request.name,
            "template_name": request.template,
            "storage_dev": request.storage,
        });
        let body = self.post_json("/vm/clone_vm", Some(payload)).await?;
        upid_from_reply(&body)?
            .ok_or_else(|| Error::Api("Clone request did not return a task id".to_string()))
    }

    async fn vm_id(&self, name: &str) -> Result<u64> {
        let request = self.http_client
            .get(self.url("/vm/vm_id"))
            .query(&[("vm_name", name)]);
        let body = self.send(request).await?;
        let reply: VmIdReply = serde_json::from_str(&body)?;
        Ok(reply.vm_id)
    }

    async fn status(&self, vm_id: u64) -> Result<Value> {
        self.get_json(&format!("/vm/{}/status", vm_id)).await
    }

    async fn change_state(&self, vm_id: u64, action: PowerAction) -> Result<Option<String>> {
        tracing::info!("Requesting {} of VM {}", action, vm_id);
        let body = self.post_json(&format!("/vm/{}/{}", vm_id, action), None).await?;
        upid_from_reply(&body)
    }

    async fn edit_resources(&self, vm_id: u64, vcpus: u32, memory_mib: u64) -> Result<()> {
        let payload = json!({
            "vm_id": vm_id,
            "vcpus": vcpus,
            "cores": vcpus,
            "sockets": 1,
            "description": "",
            "memory": memory_mib,
            "restart": false,
        });
        self.post_json("/vm/edit", Some(payload)).await?;
        Ok(())
    }

    async fn provision_user(&self, vm_id: u64) -> Result<String> {
        let body = self.post_json("/vm/provision/user", Some(json!({ "vm_id": vm_id }))).await?;
        let reply: UserReply = serde_json::from_str(&body)?;
        Ok(reply.temporary_ssh_password)
    }

    async fn provision_ssh(&self, vm_id: u64, public_key: &str) -> Result<()> {
        let payload = json!({
            "vm_id": vm_id,
            "ssh_public_key": public_key,
        });
        self.post_json("/vm/provision/ssh", Some(payload)).await?;
        Ok(())
    }

    async fn provision_guest(&self, vm_id: u64) -> Result<()> {
        self.post_json("/vm/provision/vm", Some(json!({ "vm_id": vm_id }))).await?;
        Ok(())
    }

    async fn spice_proxy(&self, vm_id: u64) -> Result<Map<String, Value>> {
        self.get_json(&format!("/vm/{}/spiceproxy", vm_id))
            .await
            .map_err(|e| match e {
                Error::Api(detail) => Error::Api(format!(
                    "VM {} is not configured to use spice proxy: {}",
                    vm_id, detail
                )),
                other => other,
            })
    }
}

/// Message for a non-success reply: the JSON `detail` field if present
fn error_detail(status: u16, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => match value.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(detail) => detail.to_string(),
            None => format!("Improper detail of the error returned ({}): {}", status, body),
        },
        Err(_) => format!("Error returned from the server ({}): {}", status, body),
    }
}

/// The task log endpoint returns either one entry or a list; the last wins
fn last_log_line(body: Value) -> Result<String> {
    let entry: Option<LogEntry> = match body {
        Value::Array(entries) => match entries.into_iter().last() {
            Some(last) => Some(serde_json::from_value(last)?),
            None => None,
        },
        other => Some(serde_json::from_value(other)?),
    };
    Ok(entry.map(|e| e.t).unwrap_or_default())
}

/// Power actions may answer with `{"upid": ...}`, `null`, or nothing
fn upid_from_reply(body: &str) -> Result<Option<String>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(body)?;
    Ok(value
        .get("upid")
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string))
}

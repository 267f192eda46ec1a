//! Remote console access to a VM

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use crate::Result;
use crate::error::Error;
use crate::ui;
use super::client::VmApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Spice,
    Vnc,
    Ssh,
}

/// Connect to `vm_id` over `protocol`, blocking until the session ends
pub async fn connect(api: &dyn VmApi, vm_id: u64, protocol: Protocol, remote_viewer: &Path) -> Result<()> {
    ensure_supported(protocol)?;
    match protocol {
        Protocol::Spice => connect_spice(api, vm_id, remote_viewer).await,
        _ => connect_ssh(api, vm_id).await,
    }
}

fn ensure_supported(protocol: Protocol) -> Result<()> {
    match protocol {
        Protocol::Vnc => Err(Error::Other(
            "Only spice proxy and ssh are currently supported".to_string(),
        )),
        Protocol::Spice | Protocol::Ssh => Ok(()),
    }
}

async fn connect_spice(api: &dyn VmApi, vm_id: u64, remote_viewer: &Path) -> Result<()> {
    ui::print_thinking("Connecting to VM via spice");
    let settings = api.spice_proxy(vm_id).await?;

    let dir = tempfile::tempdir()?;
    let file = write_viewer_file(dir.path(), vm_id, &settings)?;

    ui::print_step("Active spice session in another window");
    let status = Command::new(remote_viewer)
        .arg(&file)
        .status()
        .await
        .map_err(|e| Error::Other(format!("Failed to launch {:?}: {}", remote_viewer, e)))?;

    if !status.success() {
        tracing::warn!("remote-viewer exited with {}", status);
    }
    Ok(())
}

async fn connect_ssh(api: &dyn VmApi, vm_id: u64) -> Result<()> {
    ui::print_thinking("Connecting to VM via ssh");
    let status = api.status(vm_id).await?;
    let ip = first_interface_ip(&status)
        .ok_or_else(|| Error::Api(format!("VM {} has no network interface with an address", vm_id)))?;

    let status = Command::new("ssh")
        .args(ssh_args(ip))
        .status()
        .await
        .map_err(|e| Error::Other(format!("Failed to launch ssh: {}", e)))?;

    if !status.success() {
        tracing::warn!("ssh exited with {}", status);
    }
    Ok(())
}

/// Render spice proxy settings as a virt-viewer connection file
pub fn viewer_file_contents(settings: &Map<String, Value>) -> String {
    let mut contents = String::from("[virt-viewer]\n");
    for (key, value) in settings {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        contents.push_str(&format!("{}={}\n", key, value));
    }
    contents
}

fn write_viewer_file(dir: &Path, vm_id: u64, settings: &Map<String, Value>) -> Result<PathBuf> {
    let path = dir.join(format!("{}.vv", vm_id));
    std::fs::write(&path, viewer_file_contents(settings))?;
    Ok(path)
}

/// Address of the VM's first network interface, from its status document
pub fn first_interface_ip(status: &Value) -> Option<&str> {
    status
        .get("ifaces")?
        .as_array()?
        .first()?
        .get("ip")?
        .as_str()
        .filter(|ip| !ip.is_empty())
}

/// ssh arguments with host key verification turned off
pub fn ssh_args(ip: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        ip.to_string(),
    ]
}

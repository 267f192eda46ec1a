//! VM creation and provisioning
//!
//! Each step that starts a background task is followed to completion before
//! the next step runs. A task that fails or cannot be tracked stops the
//! workflow and its outcome is handed back to the caller.

use std::path::Path;
use std::time::Duration;
use crate::Result;
use crate::config::VmConfig;
use crate::retry::RetryPolicy;
use crate::ui;
use super::client::{CloneRequest, PowerAction, VmApi};
use super::tracker::{ProgressSink, TaskHandle, TaskOutcome, TaskTracker};

/// CPU and memory assigned to freshly provisioned VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub vcpus: u32,
    pub memory_mib: u64,
}

pub struct Provisioner<'a> {
    api: &'a dyn VmApi,
    tracker: TaskTracker,
    progress: &'a dyn ProgressSink,
    retry: RetryPolicy,
    resources: Resources,
    boot_wait: Duration,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        api: &'a dyn VmApi,
        tracker: TaskTracker,
        progress: &'a dyn ProgressSink,
        config: &VmConfig,
    ) -> Self {
        Self {
            api,
            tracker,
            progress,
            retry: RetryPolicy::new(config.retry_attempts),
            resources: Resources {
                vcpus: config.vcpus,
                memory_mib: config.memory,
            },
            boot_wait: Duration::from_secs(config.boot_wait_secs),
        }
    }

    pub fn with_boot_wait(mut self, boot_wait: Duration) -> Self {
        self.boot_wait = boot_wait;
        self
    }

    /// Clone a template into a new VM and provision it
    pub async fn create(&self, request: &CloneRequest, public_key_path: &Path) -> Result<TaskOutcome> {
        let public_key = read_public_key(public_key_path)?;

        ui::print_thinking("Creating new VM");
        let upid = self.api.clone_vm(request).await?;
        let outcome = self.follow(upid, "Copying data from template").await;
        if !outcome.is_success() {
            return Ok(outcome);
        }

        let vm_id = self.api.vm_id(&request.name).await?;
        ui::print_success(&format!("Created VM {} with id {}", request.name, vm_id));

        self.provision_with_key(vm_id, &public_key).await
    }

    /// Resize, boot and provision user access on an existing VM
    pub async fn provision(&self, vm_id: u64, public_key_path: &Path) -> Result<TaskOutcome> {
        let public_key = read_public_key(public_key_path)?;
        self.provision_with_key(vm_id, &public_key).await
    }

    async fn provision_with_key(&self, vm_id: u64, public_key: &str) -> Result<TaskOutcome> {
        let Resources { vcpus, memory_mib } = self.resources;
        self.retry
            .run(|| self.api.edit_resources(vm_id, vcpus, memory_mib))
            .await?;
        ui::print_success("Updated guest VM resources");

        let outcome = self.change_state(vm_id, PowerAction::Start).await?;
        if !outcome.is_success() {
            return Ok(outcome);
        }
        ui::print_success("Started VM");

        if !self.boot_wait.is_zero() {
            ui::print_thinking("Waiting for VM to boot");
            tokio::time::sleep(self.boot_wait).await;
        }

        let password = self.api.provision_user(vm_id).await?;
        ui::print_success(&format!("User provisioned. Temporary password: {}", password));

        self.retry
            .run(|| self.api.provision_ssh(vm_id, public_key))
            .await?;
        ui::print_success("SSH provisioned");

        self.api.provision_guest(vm_id).await?;
        ui::print_success("Updated guest VM network and remote display");

        let outcome = self.change_state(vm_id, PowerAction::Start).await?;
        if outcome.is_success() {
            ui::print_step(&format!(
                "You can now log in to VM {}. See 'muon vm connect --help'",
                vm_id
            ));
        }
        Ok(outcome)
    }

    /// Submit a power-state change and follow its task, if any
    pub async fn change_state(&self, vm_id: u64, action: PowerAction) -> Result<TaskOutcome> {
        match self.api.change_state(vm_id, action).await? {
            Some(upid) => Ok(self.follow(upid, &format!("VM {} {}", vm_id, action)).await),
            None => Ok(TaskOutcome::Succeeded),
        }
    }

    async fn follow(&self, upid: String, message: &str) -> TaskOutcome {
        self.progress.begin(message);
        let mut handle = TaskHandle::new(upid);
        self.tracker.track(self.api, &mut handle, self.progress).await
    }
}

fn read_public_key(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        crate::error::Error::Config(format!("Cannot read SSH public key {:?}: {}", path, e))
    })
}

//! Hypervisor access for the job state machine.
//!
//! The trait is the seam the state machine is tested against; the real
//! implementation delegates to the [`fulcrum_proxmox_api`] client and
//! translates its errors into the agent's error kinds.

use crate::config::Config;
use crate::error::Result;
use async_trait::async_trait;
use fulcrum_proxmox_api::{ProxmoxVeApi, TaskHandle, VmInfo};
use std::time::Duration;

/// Operations the agent needs from the hypervisor.
///
/// All mutating operations are asynchronous on the Proxmox side: they
/// return a [`TaskHandle`] that must be driven with [`wait_for_task`]
/// until the task exits.
///
/// [`wait_for_task`]: ProxmoxClient::wait_for_task
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxmoxClient: Send + Sync {
    /// Clone a template into a new, stopped VM.
    async fn clone_vm(&self, template_id: u32, new_vmid: u32, name: &str) -> Result<TaskHandle>;

    /// Apply shape and cloud-init user-data reference.
    async fn configure_vm(
        &self,
        vmid: u32,
        cores: u32,
        memory_mib: u32,
        cicustom: &str,
    ) -> Result<TaskHandle>;

    async fn start_vm(&self, vmid: u32) -> Result<TaskHandle>;

    async fn stop_vm(&self, vmid: u32) -> Result<TaskHandle>;

    async fn delete_vm(&self, vmid: u32) -> Result<TaskHandle>;

    /// Query VM state and resource usage.
    async fn vm_info(&self, vmid: u32) -> Result<VmInfo>;

    /// Poll a task at one-second cadence until it exits OK or the deadline
    /// passes.
    async fn wait_for_task(&self, task: &TaskHandle, timeout: Duration) -> Result<()>;
}

/// [`ProxmoxClient`] backed by the Proxmox VE HTTP API.
pub struct PveClient {
    api: ProxmoxVeApi,
}

impl PveClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api = ProxmoxVeApi::new(
            &config.proxmox_api_url,
            &config.proxmox_api_token,
            &config.proxmox_host,
            &config.proxmox_storage,
            config.skip_tls_verify,
        )
        .map_err(crate::error::Error::from)?;
        Ok(Self { api })
    }
}

#[async_trait]
impl ProxmoxClient for PveClient {
    async fn clone_vm(&self, template_id: u32, new_vmid: u32, name: &str) -> Result<TaskHandle> {
        Ok(self.api.clone_vm(template_id, new_vmid, name).await?)
    }

    async fn configure_vm(
        &self,
        vmid: u32,
        cores: u32,
        memory_mib: u32,
        cicustom: &str,
    ) -> Result<TaskHandle> {
        Ok(self.api.configure_vm(vmid, cores, memory_mib, cicustom).await?)
    }

    async fn start_vm(&self, vmid: u32) -> Result<TaskHandle> {
        Ok(self.api.start_vm(vmid).await?)
    }

    async fn stop_vm(&self, vmid: u32) -> Result<TaskHandle> {
        Ok(self.api.stop_vm(vmid).await?)
    }

    async fn delete_vm(&self, vmid: u32) -> Result<TaskHandle> {
        Ok(self.api.delete_vm(vmid).await?)
    }

    async fn vm_info(&self, vmid: u32) -> Result<VmInfo> {
        Ok(self.api.vm_info(vmid).await?)
    }

    async fn wait_for_task(&self, task: &TaskHandle, timeout: Duration) -> Result<()> {
        self.api.wait_for_task(task, timeout).await?;
        Ok(())
    }
}

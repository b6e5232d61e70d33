//! The job state machine.
//!
//! Each tick pulls at most one pending job from the control plane, claims
//! it, and reconciles the service's node topology across the hypervisor and
//! the tenant control plane. The result (or the failure) is reported back;
//! the agent itself keeps no state between jobs - the `Resources` snapshot
//! embedded in the job is the only memory of which VM backs which node.

use crate::cloudinit::{self, CloudInitParams};
use crate::error::{Error, Result};
use crate::fulcrum::FulcrumClient;
use crate::kamaji::KamajiClient;
use crate::model::{Job, JobAction, JobResponse, Node, NodeState, Resources};
use crate::proxmox::ProxmoxClient;
use crate::ssh::SshClient;
use fulcrum_proxmox_api::VmState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Kubernetes version for tenant control planes and worker nodes.
const KUBE_VERSION: &str = "v1.30.2";

/// Control plane replicas per tenant.
const TCP_REPLICAS: u32 = 1;

/// Validity of worker-node bootstrap tokens.
const JOIN_TOKEN_VALIDITY_HOURS: u32 = 24;

/// Deadline for a template clone.
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for configure/start/stop/delete tasks.
const VM_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Node join polling cadence and deadline.
const JOIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(600);

const NODE_USERNAME: &str = "ubuntu";
const NODE_PASSWORD: &str = "ubuntu";
const NODE_SSH_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBeZfPGgiVw7zMpOhs7RQMCL3+jxfA8U1iiGSiYDSXWy kube@testudo";

/// Processes jobs from the Fulcrum Core job queue.
pub struct JobHandler {
    fulcrum: Arc<dyn FulcrumClient>,
    proxmox: Arc<dyn ProxmoxClient>,
    kamaji: Arc<dyn KamajiClient>,
    ssh: Arc<dyn SshClient>,
    /// Template VM the worker nodes are cloned from.
    template_id: u32,
    /// Remote directory of the hypervisor snippet store.
    ci_path: String,
}

impl JobHandler {
    pub fn new(
        fulcrum: Arc<dyn FulcrumClient>,
        proxmox: Arc<dyn ProxmoxClient>,
        kamaji: Arc<dyn KamajiClient>,
        ssh: Arc<dyn SshClient>,
        template_id: u32,
        ci_path: &str,
    ) -> Self {
        Self {
            fulcrum,
            proxmox,
            kamaji,
            ssh,
            template_id,
            ci_path: ci_path.trim_end_matches('/').to_string(),
        }
    }

    /// One poll tick: claim and process at most the head pending job.
    pub async fn poll_and_process(&self) -> Result<()> {
        let jobs = self.fulcrum.get_pending_jobs().await?;
        let Some(job) = jobs.into_iter().next() else {
            debug!("no pending jobs");
            return Ok(());
        };

        if let Err(e) = self.fulcrum.claim_job(&job.id).await {
            // Another claimer won; the job is not ours to touch.
            warn!("failed to claim job {}: {e}", job.id);
            return Err(e);
        }

        info!("processing job {} ({:?})", job.id, job.action);
        match self.process(&job).await {
            Ok(response) => {
                if let Err(e) = self.fulcrum.complete_job(&job.id, &response).await {
                    error!("failed to mark job {} as completed: {e}", job.id);
                    return Err(e);
                }
                info!("job {} completed successfully", job.id);
            }
            Err(job_err) => {
                error!("job {} failed: {job_err}", job.id);
                if let Err(e) = self.fulcrum.fail_job(&job.id, &job_err.to_string()).await {
                    error!("failed to mark job {} as failed: {e}", job.id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn process(&self, job: &Job) -> Result<JobResponse> {
        match job.action {
            JobAction::ServiceCreate => self.handle_create(job).await,
            JobAction::ServiceStart => self.handle_start(job).await,
            JobAction::ServiceStop => self.handle_stop(job).await,
            JobAction::ServiceHotUpdate => self.handle_update(job, true).await,
            JobAction::ServiceColdUpdate => self.handle_update(job, false).await,
            JobAction::ServiceDelete => self.handle_delete(job).await,
        }
    }

    /// Provision a tenant control plane and its initial fleet of node VMs.
    ///
    /// Partial failures are reported as-is; nothing is rolled back. The
    /// control plane reacts to an observed failure with a compensating
    /// delete job, and a local rollback would race it.
    async fn handle_create(&self, job: &Job) -> Result<JobResponse> {
        let service = &job.service;
        let target = service
            .target_properties
            .as_ref()
            .ok_or_else(|| Error::InvalidJob("target properties are missing".to_string()))?;

        let tenant_name = &service.name;
        info!("creating tenant control plane {tenant_name}");

        self.kamaji
            .create_tenant_control_plane(tenant_name, KUBE_VERSION, TCP_REPLICAS)
            .await?;
        self.kamaji
            .wait_for_tenant_control_plane_ready(tenant_name)
            .await?;

        let tenant = self.kamaji.open_tenant(tenant_name).await?;
        tenant.install_cni().await?;

        let kube_config = self.kamaji.get_tenant_kube_config(tenant_name).await?;
        let mut resources = Resources {
            cluster_endpoint: Some(kube_config.endpoint),
            kube_config: Some(kube_config.config),
            nodes: BTreeMap::new(),
        };

        for node in &target.nodes {
            let vmid = self.create_node_vm(tenant_name, node).await?;
            resources.nodes.insert(node.id.clone(), vmid);
        }

        Ok(JobResponse {
            resources: Some(resources),
            external_id: Some(format!("cluster-{tenant_name}")),
        })
    }

    /// Start every current node whose desired state is On.
    async fn handle_start(&self, job: &Job) -> Result<JobResponse> {
        for (node, vmid) in current_nodes_with_vms(job) {
            if node.state == NodeState::On {
                self.start_vm_and_wait_join(vmid, &job.service.name, &node.id)
                    .await?;
            }
        }
        Ok(JobResponse {
            resources: job.service.resources.clone(),
            external_id: job.service.external_id.clone(),
        })
    }

    /// Stop every current node that is intended to be running.
    async fn handle_stop(&self, job: &Job) -> Result<JobResponse> {
        for (node, vmid) in current_nodes_with_vms(job) {
            if node.state == NodeState::On {
                self.stop_vm_checked(vmid).await?;
            }
        }
        Ok(JobResponse {
            resources: job.service.resources.clone(),
            external_id: job.service.external_id.clone(),
        })
    }

    /// Reconcile the current topology to the target topology.
    ///
    /// Hot and cold differ only in the power transitions applied to
    /// unchanged nodes: a cold update touches structure only. Node VMs are
    /// created before old ones are removed, and power transitions run last.
    async fn handle_update(&self, job: &Job, hot: bool) -> Result<JobResponse> {
        let service = &job.service;
        let target = service
            .target_properties
            .as_ref()
            .ok_or_else(|| Error::InvalidJob("target properties are missing".to_string()))?;
        let current = service
            .current_properties
            .as_ref()
            .ok_or_else(|| Error::InvalidJob("current properties are missing".to_string()))?;

        let current_map: BTreeMap<&str, &Node> =
            current.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let target_map: BTreeMap<&str, &Node> =
            target.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        // Reject shape changes before any mutation.
        for node in &target.nodes {
            if let Some(existing) = current_map.get(node.id.as_str()) {
                if existing.size != node.size {
                    return Err(Error::ResizeNotSupported(node.id.clone()));
                }
            }
        }

        let mut resources = service.resources.clone().unwrap_or_default();
        let mut to_start: Vec<String> = Vec::new();
        let mut to_stop: Vec<String> = Vec::new();

        // Create added nodes first to keep the cluster at minimum impact.
        for node in &target.nodes {
            if current_map.contains_key(node.id.as_str()) {
                if hot {
                    if node.state == NodeState::On {
                        to_start.push(node.id.clone());
                    } else {
                        to_stop.push(node.id.clone());
                    }
                }
                continue;
            }

            let vmid = self.create_node_vm(&service.name, node).await?;
            resources.nodes.insert(node.id.clone(), vmid);
            if hot && node.state == NodeState::On {
                to_start.push(node.id.clone());
            }
        }

        // Remove nodes that left the topology: VM first, then the node
        // record, so the control plane never points at a VM that is about
        // to disappear.
        let removed: Vec<&Node> = current
            .nodes
            .iter()
            .filter(|n| !target_map.contains_key(n.id.as_str()))
            .collect();
        if !removed.is_empty() {
            let tenant = self.kamaji.open_tenant(&service.name).await?;
            for node in removed {
                let Some(vmid) = resources.nodes.get(&node.id).copied() else {
                    continue;
                };
                self.delete_vm_and_wait(vmid).await?;
                let name = vm_name(&service.name, &node.id);
                tenant.delete_worker_node(&name).await?;
                self.remove_snippet(&name).await;
                resources.nodes.remove(&node.id);
            }
        }

        for node_id in &to_start {
            if let Some(vmid) = resources.nodes.get(node_id).copied() {
                self.start_vm_and_wait_join(vmid, &service.name, node_id).await?;
            }
        }
        for node_id in &to_stop {
            if let Some(vmid) = resources.nodes.get(node_id).copied() {
                self.stop_vm_checked(vmid).await?;
            }
        }

        Ok(JobResponse {
            resources: Some(resources),
            external_id: service.external_id.clone(),
        })
    }

    /// Tear down every node VM, the worker-node records, and finally the
    /// tenant control plane itself.
    async fn handle_delete(&self, job: &Job) -> Result<JobResponse> {
        let service = &job.service;
        let tenant = self.kamaji.open_tenant(&service.name).await?;

        for (node, vmid) in current_nodes_with_vms(job) {
            self.delete_vm_and_wait(vmid).await?;

            let name = vm_name(&service.name, &node.id);
            if let Err(e) = tenant.delete_worker_node(&name).await {
                warn!("failed to delete worker node {name}: {e}");
            }
            self.remove_snippet(&name).await;
        }

        self.kamaji
            .delete_tenant_control_plane(&service.name)
            .await?;

        Ok(JobResponse::default())
    }

    /// Clone, provision and configure one node VM. Returns the VM id.
    async fn create_node_vm(&self, service_name: &str, node: &Node) -> Result<u32> {
        let name = vm_name(service_name, &node.id);
        let vmid = vm_id(service_name, &node.id);
        let (cores, memory_mib) = node.size.attrs();

        info!("creating VM {name} ({vmid}) for node {}", node.id);

        let tenant = self.kamaji.open_tenant(service_name).await?;
        let token = tenant.create_join_token(JOIN_TOKEN_VALIDITY_HOURS).await?;
        let ca_cert_hash = self.kamaji.get_tenant_ca_hash(service_name).await?;
        let kube_config = self.kamaji.get_tenant_kube_config(service_name).await?;

        let user_data = cloudinit::render(&CloudInitParams {
            hostname: name.clone(),
            fqdn: name.clone(),
            username: NODE_USERNAME.to_string(),
            password: NODE_PASSWORD.to_string(),
            ssh_keys: vec![NODE_SSH_KEY.to_string()],
            expire_password: false,
            package_upgrade: true,
            join_url: kube_config.endpoint,
            join_token: token.full_token,
            ca_cert_hash,
            kube_version: KUBE_VERSION.to_string(),
        })?;

        let task = self.proxmox.clone_vm(self.template_id, vmid, &name).await?;
        self.proxmox.wait_for_task(&task, CLONE_TIMEOUT).await?;

        let file_name = snippet_file_name(&name);
        let remote_path = format!("{}/{}", self.ci_path, file_name);
        if let Err(e) = self.ssh.copy(&user_data, &remote_path).await {
            // Don't leave the fresh clone consuming the deterministic id.
            warn!("cloud-init upload for VM {vmid} failed, removing the clone");
            if let Ok(task) = self.proxmox.delete_vm(vmid).await {
                let _ = self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await;
            }
            return Err(Error::CloudInitUpload(e.to_string()));
        }

        let cicustom = format!("user=local:snippets/{file_name}");
        let task = self
            .proxmox
            .configure_vm(vmid, cores, memory_mib, &cicustom)
            .await?;
        self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await?;

        Ok(vmid)
    }

    /// Start a VM and block until its node registers Ready in the tenant
    /// cluster. A VM that is already running counts as success.
    async fn start_vm_and_wait_join(
        &self,
        vmid: u32,
        service_name: &str,
        node_id: &str,
    ) -> Result<()> {
        let info = self.proxmox.vm_info(vmid).await?;
        match info.state {
            VmState::Running => {
                debug!("VM {vmid} is already running");
                return Ok(());
            }
            VmState::Stopped => {}
            state => {
                return Err(Error::UnexpectedVmState(format!(
                    "VM {vmid} is {}, expected stopped",
                    state.as_str()
                )))
            }
        }

        let task = self.proxmox.start_vm(vmid).await?;
        self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await?;

        self.wait_join(service_name, &vm_name(service_name, node_id)).await
    }

    /// Poll the tenant cluster until the node reports Ready. Nodes that
    /// have not registered yet keep the poll going.
    async fn wait_join(&self, service_name: &str, vm_name: &str) -> Result<()> {
        let tenant = self.kamaji.open_tenant(service_name).await?;
        let deadline = tokio::time::Instant::now() + JOIN_TIMEOUT;

        loop {
            match tenant.get_node_status(vm_name).await {
                Ok(status) if status.ready => {
                    info!("node {vm_name} joined and is ready");
                    return Ok(());
                }
                Ok(_) => debug!("node {vm_name} registered but not ready yet"),
                Err(Error::NodeNotRegistered(_)) => debug!("node {vm_name} not registered yet"),
                Err(e) => warn!("failed to query node {vm_name}: {e}"),
            }

            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NodeJoinTimeout(vm_name.to_string()));
            }
        }
    }

    /// Stop a VM. A VM that is already stopped counts as success.
    async fn stop_vm_checked(&self, vmid: u32) -> Result<()> {
        let info = self.proxmox.vm_info(vmid).await?;
        match info.state {
            VmState::Stopped => {
                debug!("VM {vmid} is already stopped");
                return Ok(());
            }
            VmState::Running => {}
            state => {
                return Err(Error::UnexpectedVmState(format!(
                    "VM {vmid} is {}, expected running",
                    state.as_str()
                )))
            }
        }

        let task = self.proxmox.stop_vm(vmid).await?;
        self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await
    }

    /// Stop (best-effort) then delete a VM.
    async fn delete_vm_and_wait(&self, vmid: u32) -> Result<()> {
        if let Ok(task) = self.proxmox.stop_vm(vmid).await {
            if let Err(e) = self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await {
                debug!("stop of VM {vmid} before delete did not finish cleanly: {e}");
            }
        }

        let task = self.proxmox.delete_vm(vmid).await?;
        self.proxmox.wait_for_task(&task, VM_TASK_TIMEOUT).await
    }

    /// Best-effort removal of a node's cloud-init snippet.
    async fn remove_snippet(&self, vm_name: &str) {
        let path = format!("{}/{}", self.ci_path, snippet_file_name(vm_name));
        if let Err(e) = self.ssh.delete_file(&path).await {
            debug!("failed to remove cloud-init snippet {path}: {e}");
        }
    }
}

/// Current nodes paired with their VM ids from the resources snapshot.
/// Nodes without a recorded VM are skipped.
fn current_nodes_with_vms(job: &Job) -> Vec<(Node, u32)> {
    let nodes: &[Node] = job
        .service
        .current_properties
        .as_ref()
        .map(|p| p.nodes.as_slice())
        .unwrap_or_default();
    let vm_ids = job.service.resources.as_ref().map(|r| &r.nodes);

    nodes
        .iter()
        .filter_map(|node| {
            vm_ids
                .and_then(|ids| ids.get(&node.id).copied())
                .map(|vmid| (node.clone(), vmid))
        })
        .collect()
}

/// VM name for a node: `<service>-node-<node_id>`.
pub fn vm_name(service_name: &str, node_id: &str) -> String {
    format!("{service_name}-node-{node_id}")
}

/// Deterministic VM id for a node, in the range [1000, 9999].
///
/// Rolling hash over `service_name || node_id`; the mapping must stay
/// stable across restarts because the control plane remembers VM ids in
/// the service resources. Collisions surface as clone failures.
pub fn vm_id(service_name: &str, node_id: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in service_name.bytes().chain(node_id.bytes()) {
        hash = (hash * 31 + u32::from(byte)) % 9000;
    }
    hash + 1000
}

fn snippet_file_name(vm_name: &str) -> String {
    format!("kube-agent-ci-{vm_name}.yml")
}

//! Typed client for the Proxmox VE HTTP API.
//!
//! Covers the slice of the API the agent needs for worker-node VMs:
//! - cloning a VM from a template
//! - applying CPU/memory/cloud-init configuration
//! - start/stop/delete
//! - querying VM status and resource usage
//! - tracking the asynchronous tasks (UPIDs) those operations return
//!
//! Every mutating call returns a [`TaskHandle`] that must be polled with
//! [`ProxmoxVeApi::wait_for_task`] until the task reaches a terminal state.

use reqwest::{Client, IntoUrl, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error};

/// Interval between task status polls.
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error within the reqwest library
    #[error("Proxmox API request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Error returned by server
    #[error("HTTP error from API: {0}")]
    Http(StatusCode),

    /// The target VM id of a clone is already taken
    #[error("VM id {0} already exists")]
    VmIdInUse(u32),

    /// Task finished with an exit status other than OK
    #[error("task failed with exit status: {0}")]
    TaskFailed(String),

    /// Malformed UPID string
    #[error("invalid UPID: {0}")]
    InvalidUpid(String),

    /// Timeout waiting for a task to finish
    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structured form of a Proxmox task identifier.
///
/// Wire format:
/// `UPID:<node>:<pid-hex>:<pstart-hex>:<starttime-hex>:<type>:<id?>:<user@realm>:`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upid {
    pub node: String,
    pub pid: String,
    pub pstart: String,
    pub starttime: String,
    pub task_type: String,
    pub id: Option<String>,
    pub user: String,
}

impl FromStr for Upid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with("UPID:") {
            return Err(Error::InvalidUpid("must start with 'UPID:'".to_string()));
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 7 {
            return Err(Error::InvalidUpid(format!(
                "insufficient components, got {}, expected at least 6",
                parts.len()
            )));
        }

        // The id field is only present in the long form.
        let (id, user) = if parts.len() > 8 {
            (Some(parts[6].to_string()), parts[7].to_string())
        } else {
            (None, parts[6].to_string())
        };

        Ok(Upid {
            node: parts[1].to_string(),
            pid: parts[2].to_string(),
            pstart: parts[3].to_string(),
            starttime: parts[4].to_string(),
            task_type: parts[5].to_string(),
            id,
            user,
        })
    }
}

/// Handle for an asynchronous Proxmox task.
///
/// Keeps the raw UPID (the API addresses task status by the exact original
/// string) alongside its parsed form.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    upid: String,
    parsed: Upid,
}

impl TaskHandle {
    /// Parse a raw UPID string into a handle.
    pub fn parse(upid: &str) -> Result<Self> {
        let parsed: Upid = upid.parse()?;
        Ok(Self {
            upid: upid.to_string(),
            parsed,
        })
    }

    /// The raw UPID string, bit-identical to what the API returned.
    pub fn upid(&self) -> &str {
        &self.upid
    }

    /// The node that owns the task.
    pub fn node(&self) -> &str {
        &self.parsed.node
    }

    pub fn parsed(&self) -> &Upid {
        &self.parsed
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.upid)
    }
}

/// Status of an asynchronous task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status == "stopped"
    }

    /// Whether the task finished successfully.
    ///
    /// A stopped task without an exit status is treated as successful.
    pub fn is_ok(&self) -> bool {
        match &self.exitstatus {
            Some(exit) => exit == "OK",
            None => true,
        }
    }
}

/// Power state of a VM as reported by `/status/current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Stopped,
    Paused,
    Error,
    #[serde(other)]
    Unknown,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Paused => "paused",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
        }
    }
}

/// VM status and resource usage.
#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "status")]
    pub state: VmState,
    /// CPU usage as a fraction of the allocated cores (0.0 - 1.0).
    #[serde(default)]
    pub cpu: f64,
    /// Allocated cores.
    #[serde(default, rename = "cpus")]
    pub cores: u32,
    /// Currently used memory in bytes.
    #[serde(default)]
    pub mem: u64,
    /// Allocated memory in bytes.
    #[serde(default)]
    pub maxmem: u64,
    /// Root disk size in bytes.
    #[serde(default)]
    pub disk: u64,
    /// Uptime in seconds; zero when stopped.
    #[serde(default)]
    pub uptime: u64,
}

/// Client for a single Proxmox VE node.
pub struct ProxmoxVeApi {
    client: Client,
    base_url: Url,
    token: String,
    node: String,
    storage: String,
}

impl ProxmoxVeApi {
    /// Create a new client.
    ///
    /// `token` is the full API token in `user@realm!name=uuid` form; it is
    /// sent as `Authorization: PVEAPIToken=<token>`.
    pub fn new<T: IntoUrl>(
        base_url: T,
        token: &str,
        node: &str,
        storage: &str,
        allow_invalid_tls: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(allow_invalid_tls)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into_url()?,
            token: token.to_string(),
            node: node.to_string(),
            storage: storage.to_string(),
        })
    }

    /// The node name this client is configured for.
    pub fn node(&self) -> &str {
        &self.node
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        // Paths are built internally from validated components.
        let url = self.base_url.join(path).unwrap();
        self.client
            .request(method, url)
            .header("Authorization", format!("PVEAPIToken={}", self.token))
    }

    /// Clone a VM from a template.
    ///
    /// The clone is a full copy onto the configured storage; the new VM is
    /// created stopped. A clone targeting an already-used VM id fails with
    /// [`Error::VmIdInUse`].
    pub async fn clone_vm(&self, template_id: u32, new_vmid: u32, name: &str) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/clone", self.node, template_id);
        let params = CloneParams {
            newid: new_vmid,
            name: name.to_string(),
            full: 1,
            storage: self.storage.clone(),
        };

        let resp = self.request(Method::POST, &path).form(&params).send().await?;
        let status = resp.status();
        if status.is_success() {
            let task = task_handle(resp).await?;
            debug!("clone task for VM {new_vmid} started: {task}");
            Ok(task)
        } else {
            let body = resp.text().await.unwrap_or_default();
            error!("failed to clone template {template_id} to VM {new_vmid}: {status} - {body}");
            if body.contains("already exists") {
                Err(Error::VmIdInUse(new_vmid))
            } else {
                Err(Error::Http(status))
            }
        }
    }

    /// Apply CPU count, memory size and a cloud-init user-data reference.
    ///
    /// `cicustom` uses Proxmox syntax, e.g. `user=local:snippets/node.yml`.
    pub async fn configure_vm(
        &self,
        vmid: u32,
        cores: u32,
        memory_mib: u32,
        cicustom: &str,
    ) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/config", self.node, vmid);
        let params = ConfigParams {
            cores,
            memory: memory_mib,
            cicustom: cicustom.to_string(),
        };

        let resp = self.request(Method::POST, &path).form(&params).send().await?;
        self.expect_task(resp, "configure", vmid).await
    }

    /// Start a VM.
    pub async fn start_vm(&self, vmid: u32) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/status/start", self.node, vmid);
        let resp = self.request(Method::POST, &path).send().await?;
        self.expect_task(resp, "start", vmid).await
    }

    /// Stop a VM (hard stop, not a guest shutdown).
    pub async fn stop_vm(&self, vmid: u32) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/status/stop", self.node, vmid);
        let resp = self.request(Method::POST, &path).send().await?;
        self.expect_task(resp, "stop", vmid).await
    }

    /// Delete a VM. The VM must be stopped.
    pub async fn delete_vm(&self, vmid: u32) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu/{}", self.node, vmid);
        let resp = self.request(Method::DELETE, &path).send().await?;
        self.expect_task(resp, "delete", vmid).await
    }

    /// Get VM status and resource usage.
    pub async fn vm_info(&self, vmid: u32) -> Result<VmInfo> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/status/current", self.node, vmid);
        let resp = self.request(Method::GET, &path).send().await?;
        let status = resp.status();
        if status.is_success() {
            let resp: DataResponse<VmInfo> = resp.json().await?;
            Ok(resp.data)
        } else {
            error!("failed to get VM {vmid} status: {status}");
            Err(Error::Http(status))
        }
    }

    /// Get the current status of a task.
    ///
    /// The task is addressed on the node parsed out of its UPID, which may
    /// differ from the client's configured node.
    pub async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let path = format!(
            "/api2/json/nodes/{}/tasks/{}/status",
            task.node(),
            urlencoding::encode(task.upid())
        );
        let resp = self.request(Method::GET, &path).send().await?;
        let status = resp.status();
        if status.is_success() {
            let resp: DataResponse<TaskStatus> = resp.json().await?;
            Ok(resp.data)
        } else {
            error!("failed to get status of task {task}: {status}");
            Err(Error::Http(status))
        }
    }

    /// Poll a task until it terminates or the deadline passes.
    ///
    /// Polls at one-second cadence. A task that terminates with an exit
    /// status other than `OK` is an error.
    pub async fn wait_for_task(&self, task: &TaskHandle, timeout: Duration) -> Result<TaskStatus> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self.task_status(task).await?;
            if status.is_finished() {
                if status.is_ok() {
                    return Ok(status);
                }
                return Err(Error::TaskFailed(
                    status.exitstatus.unwrap_or_else(|| "unknown".to_string()),
                ));
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "task {task} did not complete within {timeout:?}"
                )));
            }

            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn expect_task(
        &self,
        resp: reqwest::Response,
        op: &str,
        vmid: u32,
    ) -> Result<TaskHandle> {
        let status = resp.status();
        if status.is_success() {
            let task = task_handle(resp).await?;
            debug!("{op} task for VM {vmid}: {task}");
            Ok(task)
        } else {
            let body = resp.text().await.unwrap_or_default();
            error!("failed to {op} VM {vmid}: {status} - {body}");
            Err(Error::Http(status))
        }
    }
}

async fn task_handle(resp: reqwest::Response) -> Result<TaskHandle> {
    let resp: DataResponse<String> = resp.json().await?;
    TaskHandle::parse(&resp.data)
}

/// Proxmox wraps every response payload in a `data` envelope.
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct CloneParams {
    newid: u32,
    name: String,
    full: u8,
    storage: String,
}

#[derive(Debug, Serialize)]
struct ConfigParams {
    cores: u32,
    memory: u32,
    cicustom: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_UPID: &str = "UPID:pve:0003C4D8:02A5B9C1:65D4E8F2:qmclone:9001:root@pam:";

    #[test]
    fn parse_upid_with_id() {
        let upid: Upid = LONG_UPID.parse().unwrap();
        assert_eq!(upid.node, "pve");
        assert_eq!(upid.pid, "0003C4D8");
        assert_eq!(upid.pstart, "02A5B9C1");
        assert_eq!(upid.starttime, "65D4E8F2");
        assert_eq!(upid.task_type, "qmclone");
        assert_eq!(upid.id.as_deref(), Some("9001"));
        assert_eq!(upid.user, "root@pam");
    }

    #[test]
    fn parse_upid_without_id() {
        let upid: Upid = "UPID:pve2:0000AB12:00001234:65D4E8F2:vncshell:root@pam"
            .parse()
            .unwrap();
        assert_eq!(upid.node, "pve2");
        assert_eq!(upid.task_type, "vncshell");
        assert_eq!(upid.id, None);
        assert_eq!(upid.user, "root@pam");
    }

    #[test]
    fn parse_upid_rejects_bad_prefix() {
        let err = "NOPID:pve:1:2:3:qmstart:root@pam:".parse::<Upid>().unwrap_err();
        assert!(matches!(err, Error::InvalidUpid(_)));
    }

    #[test]
    fn parse_upid_rejects_insufficient_components() {
        let err = "UPID:pve:1:2:3".parse::<Upid>().unwrap_err();
        assert!(matches!(err, Error::InvalidUpid(_)));
    }

    #[test]
    fn task_handle_display_is_bit_exact() {
        let handle = TaskHandle::parse(LONG_UPID).unwrap();
        assert_eq!(handle.to_string(), LONG_UPID);
        assert_eq!(handle.node(), "pve");
    }

    #[test]
    fn vm_state_parses_unknown_values() {
        let info: VmInfo =
            serde_json::from_str(r#"{"status":"suspended","cpu":0.5}"#).unwrap();
        assert_eq!(info.state, VmState::Unknown);

        let info: VmInfo = serde_json::from_str(
            r#"{"status":"running","cpu":0.25,"cpus":4,"mem":1073741824,"maxmem":4294967296,"uptime":120}"#,
        )
        .unwrap();
        assert_eq!(info.state, VmState::Running);
        assert_eq!(info.cores, 4);
        assert_eq!(info.mem, 1_073_741_824);
    }

    #[test]
    fn task_status_terminal_states() {
        let running = TaskStatus { status: "running".into(), exitstatus: None };
        assert!(!running.is_finished());

        let ok = TaskStatus { status: "stopped".into(), exitstatus: Some("OK".into()) };
        assert!(ok.is_finished());
        assert!(ok.is_ok());

        let failed = TaskStatus {
            status: "stopped".into(),
            exitstatus: Some("command 'qm clone' failed".into()),
        };
        assert!(failed.is_finished());
        assert!(!failed.is_ok());
    }
}

//! Domain model shared between the control plane wire format and the job
//! state machine.
//!
//! All of these types mirror the Fulcrum Core API payloads; the agent keeps
//! no state of its own beyond a [`Resources`] value while a job is being
//! processed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of work a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAction {
    ServiceCreate,
    ServiceStart,
    ServiceStop,
    ServiceHotUpdate,
    ServiceColdUpdate,
    ServiceDelete,
}

/// Lifecycle state of a job on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Desired power state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    On,
    Off,
}

/// Shape of a node VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSize {
    #[serde(rename = "s1")]
    S1,
    #[serde(rename = "s2")]
    S2,
    #[serde(rename = "s4")]
    S4,
}

impl NodeSize {
    /// The `(cores, memory_mib)` pair a size maps to.
    pub fn attrs(&self) -> (u32, u32) {
        match self {
            NodeSize::S1 => (2, 2048),
            NodeSize::S2 => (4, 4096),
            NodeSize::S4 => (8, 8192),
        }
    }
}

/// A logical worker slot backed by exactly one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub size: NodeSize,
    pub state: NodeState,
}

/// Ordered node topology of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// The agent's bookkeeping for a service, owned by the control plane.
///
/// `nodes` maps node id to hypervisor VM id and is the sole cross-restart
/// memory of which VM backs which node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default)]
    pub cluster_endpoint: Option<String>,
    #[serde(default)]
    pub kube_config: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, u32>,
}

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Creating,
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    HotUpdating,
    ColdUpdating,
    Deleting,
    Deleted,
}

/// A managed cluster service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub current_properties: Option<Properties>,
    #[serde(default)]
    pub target_properties: Option<Properties>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub current_status: Option<ServiceStatus>,
    #[serde(default)]
    pub target_status: Option<ServiceStatus>,
}

/// One page of the service listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePage {
    #[serde(default)]
    pub items: Vec<Service>,
    #[serde(default)]
    pub has_next: bool,
}

/// A work item from the Fulcrum Core job queue, with the service snapshot
/// taken at job-issue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub action: JobAction,
    pub state: JobState,
    #[serde(default)]
    pub priority: i64,
    pub service: Service,
}

/// The payload reported back on job completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub resources: Option<Resources>,
    pub external_id: Option<String>,
}

/// A single metric measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    pub external_id: String,
    pub resource_id: String,
    pub value: f64,
    pub type_name: String,
}

pub const METRIC_VM_CPU_USAGE: &str = "vm.cpu.usage";
pub const METRIC_VM_MEMORY_USAGE: &str = "vm.memory.usage";
pub const METRIC_VM_DISK_USAGE: &str = "vm.disk.usage";
pub const METRIC_VM_NETWORK_THROUGHPUT: &str = "vm.network.throughput";

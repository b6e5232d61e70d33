//! Error types for the agent.

use thiserror::Error;

/// Main error type for the agent.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The initial status update with the control plane failed
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The control plane returned no usable agent id
    #[error("invalid agent identity: {0}")]
    BadAgentIdentity(String),

    /// Control plane API error
    #[error("control plane API error: {0}")]
    ControlPlane(String),

    /// Another claimer won the race for the job
    #[error("job {0} is not claimable")]
    JobNotClaimable(String),

    /// The job payload is missing required fields
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Hypervisor API error or task exit status other than OK
    #[error("hypervisor operation failed: {0}")]
    Hypervisor(String),

    /// A hypervisor task missed its deadline
    #[error("task timeout: {0}")]
    TaskTimeout(String),

    /// Deterministic VM id is already taken on the hypervisor
    #[error("VM id conflict: {0}")]
    VmIdConflict(u32),

    /// The VM is in no state the requested transition accepts
    #[error("unexpected VM state: {0}")]
    UnexpectedVmState(String),

    /// Tenant API error
    #[error("tenant API error: {0}")]
    Tenant(String),

    /// Tenant control plane did not become ready in time
    #[error("tenant control plane {0} is not ready")]
    TenantNotReady(String),

    /// A worker node lookup in the tenant cluster found nothing
    #[error("node {0} is not registered")]
    NodeNotRegistered(String),

    /// A started node never reported Ready
    #[error("node {0} failed to join in time")]
    NodeJoinTimeout(String),

    /// Snippet upload to the hypervisor host failed
    #[error("cloud-init upload failed: {0}")]
    CloudInitUpload(String),

    /// Target topology changes the shape of an existing node
    #[error("changing VM size is not supported: node {0}")]
    ResizeNotSupported(String),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cloud-init template rendering error
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// Agent tasks did not stop within the shutdown budget
    #[error("timeout waiting for agent tasks to stop")]
    ShutdownTimeout,
}

impl Error {
    /// Create a new tenant API error.
    pub fn tenant(msg: impl Into<String>) -> Self {
        Error::Tenant(msg.into())
    }

    /// Create a new SSH error.
    pub fn ssh(msg: impl Into<String>) -> Self {
        Error::Ssh(msg.into())
    }

    /// Create a new control plane API error.
    pub fn control_plane(msg: impl Into<String>) -> Self {
        Error::ControlPlane(msg.into())
    }
}

impl From<fulcrum_proxmox_api::Error> for Error {
    fn from(err: fulcrum_proxmox_api::Error) -> Self {
        use fulcrum_proxmox_api::Error as Api;
        match err {
            Api::VmIdInUse(vmid) => Error::VmIdConflict(vmid),
            Api::Timeout(msg) => Error::TaskTimeout(msg),
            other => Error::Hypervisor(other.to_string()),
        }
    }
}

/// Result type alias for the agent.
pub type Result<T, E = Error> = std::result::Result<T, E>;

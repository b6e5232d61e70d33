//! Fulcrum Core agent for tenant Kubernetes clusters on Proxmox VE.
//!
//! One agent instance is bound to a single Proxmox node and owns a pool of
//! cluster services: each service is one Kamaji tenant control plane plus a
//! fleet of VMs that join it as worker nodes. The control plane (Fulcrum
//! Core) is authoritative for all state; the agent translates its jobs into
//! hypervisor and tenant-cluster operations and reports the outcome back.

pub mod agent;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod fulcrum;
pub mod jobs;
pub mod kamaji;
pub mod metrics;
pub mod model;
pub mod proxmox;
pub mod ssh;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, Result};

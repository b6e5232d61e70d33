//! Periodic VM resource sampling for running services.
//!
//! Each tick walks every page of the service listing, samples cpu and
//! memory for the VMs of services that are actually running, and streams
//! the measurements to the control plane. Stopped or mid-update services
//! emit nothing to avoid noise.

use crate::error::Result;
use crate::fulcrum::FulcrumClient;
use crate::model::{
    MetricEntry, Service, ServiceStatus, METRIC_VM_CPU_USAGE, METRIC_VM_MEMORY_USAGE,
};
use crate::proxmox::ProxmoxClient;
use fulcrum_proxmox_api::VmState;
use std::sync::Arc;
use tracing::{debug, error};

pub struct MetricsReporter {
    fulcrum: Arc<dyn FulcrumClient>,
    proxmox: Arc<dyn ProxmoxClient>,
}

impl MetricsReporter {
    pub fn new(fulcrum: Arc<dyn FulcrumClient>, proxmox: Arc<dyn ProxmoxClient>) -> Self {
        Self { fulcrum, proxmox }
    }

    /// One reporter tick over all pages of the service listing.
    ///
    /// A failed VM info lookup skips that VM; a failed metric post aborts
    /// the whole tick (the next tick resamples everything).
    pub async fn report_once(&self) -> Result<()> {
        let mut page = 1;
        loop {
            let services = self.fulcrum.get_services(page).await?;
            for service in &services.items {
                self.report_service(service).await?;
            }
            if !services.has_next {
                return Ok(());
            }
            page += 1;
        }
    }

    async fn report_service(&self, service: &Service) -> Result<()> {
        if service.current_status != Some(ServiceStatus::Started) {
            return Ok(());
        }
        let Some(external_id) = &service.external_id else {
            return Ok(());
        };
        let Some(resources) = &service.resources else {
            return Ok(());
        };
        if resources.nodes.is_empty() {
            return Ok(());
        }

        for (node_id, vmid) in &resources.nodes {
            let info = match self.proxmox.vm_info(*vmid).await {
                Ok(info) => info,
                Err(e) => {
                    error!("failed to get VM {vmid} info: {e}");
                    continue;
                }
            };
            if info.state != VmState::Running {
                debug!("VM {vmid} is {}, skipping metrics", info.state.as_str());
                continue;
            }

            let entries = [
                MetricEntry {
                    external_id: external_id.clone(),
                    resource_id: node_id.clone(),
                    value: info.cpu,
                    type_name: METRIC_VM_CPU_USAGE.to_string(),
                },
                MetricEntry {
                    external_id: external_id.clone(),
                    resource_id: node_id.clone(),
                    value: info.mem as f64,
                    type_name: METRIC_VM_MEMORY_USAGE.to_string(),
                },
            ];
            for entry in &entries {
                self.fulcrum.report_metric(entry).await?;
            }
        }
        Ok(())
    }
}

//! Cloud-init user-data rendering for worker-node VMs.
//!
//! The rendered document provisions the node user, installs the container
//! runtime and kubeadm/kubelet at the requested version, and joins the
//! tenant control plane with the bootstrap token baked into the file.

use crate::error::Result;
use handlebars::Handlebars;
use serde::Serialize;

static TEMPLATE: &str = include_str!("../templates/cloud-init.yaml.hbs");

/// Parameters for a node's cloud-init user-data.
#[derive(Debug, Clone, Serialize)]
pub struct CloudInitParams {
    pub hostname: String,
    pub fqdn: String,
    pub username: String,
    pub password: String,
    pub ssh_keys: Vec<String>,
    pub expire_password: bool,
    pub package_upgrade: bool,
    /// API server endpoint (`host:port`) passed to `kubeadm join`
    pub join_url: String,
    /// Full bootstrap token (`id.secret`)
    pub join_token: String,
    /// `sha256:<hex>` fingerprint of the tenant CA public key
    pub ca_cert_hash: String,
    /// Kubernetes version, e.g. `v1.30.2`
    pub kube_version: String,
}

/// Render the cloud-init user-data for the given parameters.
pub fn render(params: &CloudInitParams) -> Result<String> {
    let mut handlebars = Handlebars::new();
    // Output is YAML, not HTML.
    handlebars.register_escape_fn(handlebars::no_escape);

    let mut data = serde_json::to_value(params)?;
    // The package repository is keyed by minor version ("v1.30"), the
    // packages by the full version without the leading "v".
    data["kube_minor"] = minor_version(&params.kube_version).into();
    data["kube_pkg_version"] = params.kube_version.trim_start_matches('v').into();

    Ok(handlebars.render_template(TEMPLATE, &data)?)
}

fn minor_version(version: &str) -> String {
    match version.rfind('.') {
        Some(idx) => version[..idx].to_string(),
        None => version.to_string(),
    }
}

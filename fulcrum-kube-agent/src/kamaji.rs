//! Clients for the Kamaji manager cluster and the tenant clusters it hosts.
//!
//! The management client drives the `TenantControlPlane` CRD lifecycle and
//! reads the admin kubeconfig Kamaji publishes per tenant. Tenant sessions
//! authenticate with the client certificate from that kubeconfig and handle
//! the worker-node join protocol: CNI bootstrap, bootstrap tokens, node
//! readiness and node deletion.

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const TCP_API_PREFIX: &str = "/apis/kamaji.clastix.io/v1alpha1";

/// Namespace the TenantControlPlane resources live in.
const KAMAJI_NAMESPACE: &str = "default";

/// How long to wait for a tenant control plane to become ready.
const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between readiness checks.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

static CNI_MANIFEST: &str = include_str!("../templates/cni-flannel.yaml");

/// Admin kubeconfig of a tenant control plane.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Raw kubeconfig content
    pub config: String,
    /// API server endpoint (`host:port`)
    pub endpoint: String,
}

/// A bootstrap token for joining worker nodes.
#[derive(Debug, Clone)]
pub struct JoinToken {
    pub token_id: String,
    pub token_secret: String,
    /// `<token_id>.<token_secret>`
    pub full_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Status of a worker node in a tenant cluster.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    pub kubelet_version: String,
    pub addresses: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Tenant control plane lifecycle operations on the manager cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KamajiClient: Send + Sync {
    /// Create a tenant control plane. Idempotence is not guaranteed.
    async fn create_tenant_control_plane(
        &self,
        name: &str,
        version: &str,
        replicas: u32,
    ) -> Result<()>;

    async fn delete_tenant_control_plane(&self, name: &str) -> Result<()>;

    /// Block until the tenant control plane reports Ready, polling every
    /// five seconds for up to five minutes.
    async fn wait_for_tenant_control_plane_ready(&self, name: &str) -> Result<()>;

    async fn get_tenant_kube_config(&self, name: &str) -> Result<KubeConfig>;

    /// SHA-256 over the DER-encoded SubjectPublicKeyInfo of the tenant CA,
    /// as `sha256:<hex>`. This is the fingerprint a kubeadm join verifies.
    async fn get_tenant_ca_hash(&self, name: &str) -> Result<String>;

    /// Open a session scoped to the tenant's own API server.
    async fn open_tenant(&self, name: &str) -> Result<Box<dyn TenantClient>>;
}

/// Operations against a single tenant cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantClient: Send + Sync {
    /// Apply the baseline CNI manifest bundle. Idempotent.
    async fn install_cni(&self) -> Result<()>;

    /// Create a kubeadm-style bootstrap token.
    async fn create_join_token(&self, validity_hours: u32) -> Result<JoinToken>;

    /// Query a worker node; absent nodes are [`Error::NodeNotRegistered`].
    async fn get_node_status(&self, node_name: &str) -> Result<NodeStatus>;

    async fn delete_worker_node(&self, node_name: &str) -> Result<()>;
}

/// [`KamajiClient`] over the manager cluster's REST API.
pub struct HttpKamajiClient {
    client: Client,
    base_url: Url,
    token: String,
    skip_tls_verify: bool,
}

impl HttpKamajiClient {
    pub fn new(base_url: &str, token: &str, skip_tls_verify: bool) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(skip_tls_verify)
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::tenant(format!("invalid Kubernetes API URL: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            skip_tls_verify,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.base_url.join(path).unwrap();
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }

    fn tcp_path(name: Option<&str>) -> String {
        let base = format!("{TCP_API_PREFIX}/namespaces/{KAMAJI_NAMESPACE}/tenantcontrolplanes");
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    async fn get_tenant_control_plane(&self, name: &str) -> Result<TcpObject> {
        let resp = self
            .request(Method::GET, &Self::tcp_path(Some(name)))
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::tenant(format!(
                "failed to get tenant control plane {name}, status: {status}"
            )));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl KamajiClient for HttpKamajiClient {
    async fn create_tenant_control_plane(
        &self,
        name: &str,
        version: &str,
        replicas: u32,
    ) -> Result<()> {
        info!("creating tenant control plane {name} (version {version}, {replicas} replica(s))");

        let payload = tenant_control_plane_payload(name, version, replicas);
        let resp = self
            .request(Method::POST, &Self::tcp_path(None))
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::tenant(format!(
                "failed to create tenant control plane {name}, status: {status}, body: {body}"
            )));
        }
        Ok(())
    }

    async fn delete_tenant_control_plane(&self, name: &str) -> Result<()> {
        info!("deleting tenant control plane {name}");

        let resp = self
            .request(Method::DELETE, &Self::tcp_path(Some(name)))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::tenant(format!(
                "failed to delete tenant control plane {name}, status: {status}"
            ))),
        }
    }

    async fn wait_for_tenant_control_plane_ready(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

        loop {
            match self.get_tenant_control_plane(name).await {
                Ok(tcp) => {
                    let status = tcp.status.kubernetes_resources.version.status;
                    debug!("tenant control plane {name} status: {status:?}");
                    if status == "Ready" {
                        return Ok(());
                    }
                }
                Err(e) => warn!("failed to get tenant control plane {name} status: {e}"),
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::TenantNotReady(name.to_string()));
            }
        }
    }

    async fn get_tenant_kube_config(&self, name: &str) -> Result<KubeConfig> {
        let tcp = self.get_tenant_control_plane(name).await?;
        let secret_name = tcp.status.kubeconfig.admin.secret_name;
        if secret_name.is_empty() {
            return Err(Error::tenant(format!(
                "kubeconfig secret name not found for tenant {name}"
            )));
        }

        let path = format!("/api/v1/namespaces/{KAMAJI_NAMESPACE}/secrets/{secret_name}");
        let resp = self.request(Method::GET, &path).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::tenant(format!(
                "failed to get kubeconfig secret {secret_name}, status: {status}"
            )));
        }

        let secret: SecretObject = resp.json().await?;
        let encoded = secret
            .data
            .get("admin.conf")
            .ok_or_else(|| Error::tenant(format!("admin.conf not found in secret {secret_name}")))?;
        let config = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::tenant(format!("failed to decode kubeconfig: {e}")))?;
        let config = String::from_utf8(config)
            .map_err(|e| Error::tenant(format!("kubeconfig is not valid UTF-8: {e}")))?;

        Ok(KubeConfig {
            config,
            endpoint: tcp.status.control_plane_endpoint,
        })
    }

    async fn get_tenant_ca_hash(&self, name: &str) -> Result<String> {
        let kube_config = self.get_tenant_kube_config(name).await?;
        ca_hash_from_kubeconfig(&kube_config.config)
    }

    async fn open_tenant(&self, name: &str) -> Result<Box<dyn TenantClient>> {
        let kube_config = self.get_tenant_kube_config(name).await?;
        let kubeconfig: Kubeconfig = parse_kubeconfig(&kube_config.config)?;

        let cluster = kubeconfig.current_cluster()?;
        let user = kubeconfig.current_user()?;

        let cert = decode_b64_field(&user.client_certificate_data, "client-certificate-data")?;
        let key = decode_b64_field(&user.client_key_data, "client-key-data")?;
        let identity = Identity::from_pem(&[cert, key].concat())
            .map_err(|e| Error::tenant(format!("failed to build tenant identity: {e}")))?;

        let mut builder = Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .timeout(Duration::from_secs(30));

        if let Some(ca_data) = &cluster.certificate_authority_data {
            let ca_pem = decode_b64_field(&Some(ca_data.clone()), "certificate-authority-data")?;
            let ca = Certificate::from_pem(&ca_pem)
                .map_err(|e| Error::tenant(format!("failed to parse tenant CA: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }

        let base_url = Url::parse(&cluster.server)
            .map_err(|e| Error::tenant(format!("invalid tenant API server URL: {e}")))?;

        Ok(Box::new(HttpTenantClient {
            name: name.to_string(),
            client: builder.build()?,
            base_url,
        }))
    }
}

/// [`TenantClient`] over a tenant cluster's REST API with mTLS.
pub struct HttpTenantClient {
    name: String,
    client: Client,
    base_url: Url,
}

impl HttpTenantClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.base_url.join(path).unwrap();
        self.client.request(method, url)
    }

    async fn apply_manifest(&self, doc: &str) -> Result<()> {
        let obj: serde_yaml::Value = serde_yaml::from_str(doc)
            .map_err(|e| Error::tenant(format!("invalid manifest document: {e}")))?;

        let api_version = obj["apiVersion"]
            .as_str()
            .ok_or_else(|| Error::tenant("manifest document has no apiVersion"))?;
        let kind = obj["kind"]
            .as_str()
            .ok_or_else(|| Error::tenant("manifest document has no kind"))?;
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let namespace = obj["metadata"]["namespace"].as_str();

        let path = resource_path(api_version, kind, namespace);
        let body = serde_json::to_value(&obj)?;

        let resp = self.request(Method::POST, &path).json(&body).send().await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                debug!("created {kind} {name} in tenant {}", self.name);
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!("{kind} {name} already exists in tenant {}", self.name);
                Ok(())
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(Error::tenant(format!(
                    "failed to create {kind} {name}, status: {status}, body: {body}"
                )))
            }
        }
    }
}

#[async_trait]
impl TenantClient for HttpTenantClient {
    async fn install_cni(&self) -> Result<()> {
        info!("installing CNI bundle in tenant {}", self.name);

        for doc in CNI_MANIFEST.split("\n---") {
            if doc.trim().is_empty() {
                continue;
            }
            self.apply_manifest(doc).await?;
        }
        Ok(())
    }

    async fn create_join_token(&self, validity_hours: u32) -> Result<JoinToken> {
        let token_id = random_token(6);
        let token_secret = random_token(16);
        let full_token = format!("{token_id}.{token_secret}");

        let validity_hours = if validity_hours == 0 { 24 } else { validity_hours };
        let expires_at = Utc::now() + chrono::Duration::hours(i64::from(validity_hours));

        let payload = bootstrap_token_secret(&token_id, &token_secret, &expires_at);
        let resp = self
            .request(Method::POST, "/api/v1/namespaces/kube-system/secrets")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::tenant(format!(
                "failed to create join token, status: {status}, body: {body}"
            )));
        }

        debug!("created bootstrap token {token_id} for tenant {}", self.name);
        Ok(JoinToken {
            token_id,
            token_secret,
            full_token,
            expires_at,
        })
    }

    async fn get_node_status(&self, node_name: &str) -> Result<NodeStatus> {
        let resp = self
            .request(Method::GET, &format!("/api/v1/nodes/{node_name}"))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NodeNotRegistered(node_name.to_string())),
            status => {
                return Err(Error::tenant(format!(
                    "failed to get node {node_name}, status: {status}"
                )))
            }
        }

        let node: NodeObject = resp.json().await?;
        let ready = node
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True");
        let addresses = node
            .status
            .addresses
            .into_iter()
            .map(|a| (a.address_type, a.address))
            .collect();

        Ok(NodeStatus {
            name: node.metadata.name,
            ready,
            kubelet_version: node.status.node_info.kubelet_version,
            addresses,
            created_at: node.metadata.creation_timestamp,
        })
    }

    async fn delete_worker_node(&self, node_name: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &format!("/api/v1/nodes/{node_name}"))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::tenant(format!(
                "failed to delete worker node {node_name}, status: {status}"
            ))),
        }
    }
}

/// Build the TenantControlPlane object for a new tenant.
fn tenant_control_plane_payload(name: &str, version: &str, replicas: u32) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "kamaji.clastix.io/v1alpha1",
        "kind": "TenantControlPlane",
        "metadata": {
            "name": name,
            "labels": {
                "created-by": "fulcrum-kube-agent",
                "tenant.clastix.io": name,
            },
        },
        "spec": {
            "controlPlane": {
                "deployment": {
                    "replicas": replicas,
                },
                "service": {
                    "serviceType": "LoadBalancer",
                },
            },
            "kubernetes": {
                "version": version,
                "kubelet": {
                    "cgroupfs": "systemd",
                },
            },
            "networkProfile": {
                "port": 6443,
            },
            "addons": {
                "coreDNS": {},
                "kubeProxy": {},
                "konnectivity": {
                    "server": {
                        "port": 8132,
                    },
                },
            },
        },
    })
}

/// Build a kubeadm-compatible bootstrap-token Secret.
fn bootstrap_token_secret(
    token_id: &str,
    token_secret: &str,
    expires_at: &DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": format!("bootstrap-token-{token_id}"),
            "namespace": "kube-system",
        },
        "type": "bootstrap.kubernetes.io/token",
        "stringData": {
            "token-id": token_id,
            "token-secret": token_secret,
            "expiration": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "usage-bootstrap-authentication": "true",
            "usage-bootstrap-signing": "true",
            "auth-extra-groups": "system:bootstrappers:kubeadm:default-node-token",
        },
    })
}

/// REST path for a manifest object, derived from its group/version and kind.
fn resource_path(api_version: &str, kind: &str, namespace: Option<&str>) -> String {
    let plural = format!("{}s", kind.to_lowercase());
    let prefix = if api_version == "v1" {
        "/api/v1".to_string()
    } else {
        format!("/apis/{api_version}")
    };
    match namespace {
        Some(ns) => format!("{prefix}/namespaces/{ns}/{plural}"),
        None => format!("{prefix}/{plural}"),
    }
}

fn random_token(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Compute the CA fingerprint from a kubeconfig: SHA-256 over the DER
/// SubjectPublicKeyInfo of the current cluster's CA certificate.
fn ca_hash_from_kubeconfig(kubeconfig: &str) -> Result<String> {
    let kubeconfig: Kubeconfig = parse_kubeconfig(kubeconfig)?;
    let cluster = kubeconfig.current_cluster()?;
    let ca_data = cluster
        .certificate_authority_data
        .as_ref()
        .ok_or_else(|| Error::tenant("no certificate authority data in kubeconfig"))?;
    let ca_pem = BASE64
        .decode(ca_data.trim())
        .map_err(|e| Error::tenant(format!("failed to decode CA certificate: {e}")))?;
    spki_sha256(&ca_pem)
}

/// `sha256:<hex>` digest of the DER-encoded SubjectPublicKeyInfo of a
/// PEM-encoded certificate.
fn spki_sha256(cert_pem: &[u8]) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|e| Error::tenant(format!("failed to decode certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::tenant(format!("failed to parse X.509 certificate: {e}")))?;

    let digest = Sha256::digest(cert.public_key().raw);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256:{hex}"))
}

fn parse_kubeconfig(content: &str) -> Result<Kubeconfig> {
    serde_yaml::from_str(content).map_err(|e| Error::tenant(format!("failed to parse kubeconfig: {e}")))
}

fn decode_b64_field(field: &Option<String>, what: &str) -> Result<Vec<u8>> {
    let data = field
        .as_ref()
        .ok_or_else(|| Error::tenant(format!("no {what} in kubeconfig")))?;
    BASE64
        .decode(data.trim())
        .map_err(|e| Error::tenant(format!("failed to decode {what}: {e}")))
}

// Minimal kubeconfig slice: enough to resolve the current context's cluster
// and user credentials.

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

impl Kubeconfig {
    fn current_context(&self) -> Result<&ContextInfo> {
        if self.current_context.is_empty() {
            return Err(Error::tenant("no current-context in kubeconfig"));
        }
        self.contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .map(|c| &c.context)
            .ok_or_else(|| {
                Error::tenant(format!(
                    "context {} not found in kubeconfig",
                    self.current_context
                ))
            })
    }

    fn current_cluster(&self) -> Result<&ClusterInfo> {
        let context = self.current_context()?;
        self.clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                Error::tenant(format!("cluster {} not found in kubeconfig", context.cluster))
            })
    }

    fn current_user(&self) -> Result<&UserInfo> {
        let context = self.current_context()?;
        self.users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| Error::tenant(format!("user {} not found in kubeconfig", context.user)))
    }
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextInfo,
}

#[derive(Debug, Deserialize)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(rename = "client-certificate-data", default)]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", default)]
    client_key_data: Option<String>,
}

// Wire shapes read from the manager cluster.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TcpObject {
    status: TcpStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TcpStatus {
    control_plane_endpoint: String,
    kubernetes_resources: TcpKubernetesResources,
    kubeconfig: TcpKubeconfigStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TcpKubernetesResources {
    version: TcpVersionStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TcpVersionStatus {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TcpKubeconfigStatus {
    admin: TcpAdminKubeconfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TcpAdminKubeconfig {
    secret_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecretObject {
    data: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeObject {
    metadata: NodeMetadata,
    status: NodeStatusPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NodeMetadata {
    name: String,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NodeStatusPayload {
    conditions: Vec<NodeCondition>,
    addresses: Vec<NodeAddress>,
    node_info: NodeSystemInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeAddress {
    #[serde(rename = "type")]
    address_type: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NodeSystemInfo {
    kubelet_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // SPKI digest verified with:
    // openssl x509 -pubkey | openssl pkey -pubin -outform DER | openssl dgst -sha256
    const CA_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBPjCB8aADAgECAhQBjvKIFIT3Pajjkkw/9OQVPXiSfDAFBgMrZXAwFTETMBEG
A1UEAwwKa3ViZXJuZXRlczAeFw0yNjA4MDIwNjQzMTlaFw0zNjA3MzAwNjQzMTla
MBUxEzARBgNVBAMMCmt1YmVybmV0ZXMwKjAFBgMrZXADIQDg3D/iX/sNxkda1WNI
3uLc+eVUYK6tfidU1AMPXhLIuqNTMFEwHQYDVR0OBBYEFETkl75zpTzBr1X2HLgg
Rx4n30H7MB8GA1UdIwQYMBaAFETkl75zpTzBr1X2HLggRx4n30H7MA8GA1UdEwEB
/wQFMAMBAf8wBQYDK2VwA0EAn1Tu9syLSTbZ/VW8G895C6neeZ21Py6aLjHzvjCP
Qrkxd3UfGhkhTryCmKJv8N9aAwXuUixRECVyp20QbdX+Cg==
-----END CERTIFICATE-----
";

    const CA_CERT_SPKI_SHA256: &str =
        "sha256:5dbed2d5ca8e8d6820874d5fdd0522bc878b84d6173e6a40b2733fb3f8518ae7";

    fn test_kubeconfig() -> String {
        let ca_b64 = BASE64.encode(CA_CERT_PEM);
        format!(
            "apiVersion: v1\n\
             kind: Config\n\
             current-context: admin@tc\n\
             clusters:\n\
             - name: tc\n\
             \x20 cluster:\n\
             \x20   server: https://172.18.0.2:6443\n\
             \x20   certificate-authority-data: {ca_b64}\n\
             contexts:\n\
             - name: admin@tc\n\
             \x20 context:\n\
             \x20   cluster: tc\n\
             \x20   user: admin\n\
             users:\n\
             - name: admin\n\
             \x20 user:\n\
             \x20   client-certificate-data: {ca_b64}\n\
             \x20   client-key-data: {ca_b64}\n"
        )
    }

    #[test]
    fn spki_sha256_matches_openssl() {
        let hash = spki_sha256(CA_CERT_PEM.as_bytes()).unwrap();
        assert_eq!(hash, CA_CERT_SPKI_SHA256);
    }

    #[test]
    fn ca_hash_resolves_cluster_through_current_context() {
        let hash = ca_hash_from_kubeconfig(&test_kubeconfig()).unwrap();
        assert_eq!(hash, CA_CERT_SPKI_SHA256);
    }

    #[test]
    fn ca_hash_requires_ca_data() {
        let kubeconfig = "\
current-context: admin@tc
clusters:
- name: tc
  cluster:
    server: https://172.18.0.2:6443
contexts:
- name: admin@tc
  context:
    cluster: tc
    user: admin
";
        let err = ca_hash_from_kubeconfig(kubeconfig).unwrap_err();
        assert!(err.to_string().contains("certificate authority"));
    }

    #[test]
    fn kubeconfig_resolves_user_credentials() {
        let kubeconfig: Kubeconfig = parse_kubeconfig(&test_kubeconfig()).unwrap();
        let cluster = kubeconfig.current_cluster().unwrap();
        assert_eq!(cluster.server, "https://172.18.0.2:6443");
        let user = kubeconfig.current_user().unwrap();
        assert!(user.client_certificate_data.is_some());
        assert!(user.client_key_data.is_some());
    }

    #[test]
    fn join_token_charset_and_shape() {
        for _ in 0..32 {
            let id = random_token(6);
            let secret = random_token(16);
            assert_eq!(id.len(), 6);
            assert_eq!(secret.len(), 16);
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            assert!(secret.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn bootstrap_token_secret_has_standard_keys() {
        let expires = DateTime::parse_from_rfc3339("2026-08-03T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let secret = bootstrap_token_secret("abcdef", "0123456789abcdef", &expires);

        assert_eq!(secret["metadata"]["name"], "bootstrap-token-abcdef");
        assert_eq!(secret["metadata"]["namespace"], "kube-system");
        assert_eq!(secret["type"], "bootstrap.kubernetes.io/token");
        let data = &secret["stringData"];
        assert_eq!(data["token-id"], "abcdef");
        assert_eq!(data["token-secret"], "0123456789abcdef");
        assert_eq!(data["expiration"], "2026-08-03T00:00:00Z");
        assert_eq!(data["usage-bootstrap-authentication"], "true");
        assert_eq!(data["usage-bootstrap-signing"], "true");
        assert_eq!(
            data["auth-extra-groups"],
            "system:bootstrappers:kubeadm:default-node-token"
        );
    }

    #[test]
    fn resource_paths_for_core_and_group_kinds() {
        assert_eq!(
            resource_path("v1", "ConfigMap", Some("kube-flannel")),
            "/api/v1/namespaces/kube-flannel/configmaps"
        );
        assert_eq!(resource_path("v1", "Namespace", None), "/api/v1/namespaces");
        assert_eq!(
            resource_path("apps/v1", "DaemonSet", Some("kube-flannel")),
            "/apis/apps/v1/namespaces/kube-flannel/daemonsets"
        );
        assert_eq!(
            resource_path("rbac.authorization.k8s.io/v1", "ClusterRole", None),
            "/apis/rbac.authorization.k8s.io/v1/clusterroles"
        );
    }

    #[test]
    fn cni_bundle_documents_are_well_formed() {
        let mut kinds = Vec::new();
        for doc in CNI_MANIFEST.split("\n---") {
            if doc.trim().is_empty() {
                continue;
            }
            let obj: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
            assert!(obj["apiVersion"].as_str().is_some());
            kinds.push(obj["kind"].as_str().unwrap().to_string());
        }
        assert!(kinds.contains(&"Namespace".to_string()));
        assert!(kinds.contains(&"ConfigMap".to_string()));
        assert!(kinds.contains(&"DaemonSet".to_string()));
    }

    #[test]
    fn tenant_control_plane_payload_shape() {
        let payload = tenant_control_plane_payload("tc", "v1.30.2", 1);
        assert_eq!(payload["apiVersion"], "kamaji.clastix.io/v1alpha1");
        assert_eq!(payload["kind"], "TenantControlPlane");
        assert_eq!(payload["metadata"]["labels"]["tenant.clastix.io"], "tc");
        assert_eq!(payload["spec"]["kubernetes"]["version"], "v1.30.2");
        assert_eq!(payload["spec"]["controlPlane"]["deployment"]["replicas"], 1);
        assert_eq!(payload["spec"]["networkProfile"]["port"], 6443);
    }
}

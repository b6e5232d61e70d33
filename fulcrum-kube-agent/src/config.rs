//! Configuration loading for the agent.
//!
//! Configuration is merged from an optional JSON file and environment
//! variables with the `FULCRUM_AGENT_` prefix; the environment wins.
//! `.env.local` and `.env` are loaded first, best-effort.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "FULCRUM_AGENT_";

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Authentication token for the agent
    pub agent_token: String,

    /// Fulcrum Core API base URL
    pub fulcrum_api_url: String,

    /// How often to poll for jobs, in seconds
    pub job_poll_interval: u64,
    /// How often to report metrics, in seconds
    pub metric_report_interval: u64,

    /// Proxmox VE API base URL
    pub proxmox_api_url: String,
    /// Proxmox API token (`user@realm!name=uuid`)
    pub proxmox_api_token: String,
    /// Template VM id to clone worker nodes from
    pub proxmox_template: u32,
    /// Proxmox node name (e.g. "pve")
    pub proxmox_host: String,
    /// Storage pool for clones (e.g. "local-lvm")
    pub proxmox_storage: String,

    /// Host to upload cloud-init snippets to
    pub proxmox_ci_host: String,
    /// SSH user for snippet uploads
    pub proxmox_ci_user: String,
    /// Remote directory of the snippet store
    pub proxmox_ci_path: String,
    /// Path to the SSH private key used for snippet uploads
    pub proxmox_ci_pk_path: String,

    /// Management (Kamaji) Kubernetes API URL
    pub kube_api_url: String,
    /// Bearer token for the management cluster
    pub kube_api_token: String,

    /// Skip TLS certificate validation on outbound HTTPS
    pub skip_tls_verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_token: String::new(),
            fulcrum_api_url: "http://localhost:3000".to_string(),
            job_poll_interval: 5,
            metric_report_interval: 30,
            proxmox_api_url: String::new(),
            proxmox_api_token: String::new(),
            proxmox_template: 0,
            proxmox_host: String::new(),
            proxmox_storage: String::new(),
            proxmox_ci_host: String::new(),
            proxmox_ci_user: String::new(),
            proxmox_ci_path: String::new(),
            proxmox_ci_pk_path: String::new(),
            kube_api_url: String::new(),
            kube_api_token: String::new(),
            skip_tls_verify: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
            err: None,
        }
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval)
    }

    pub fn metric_report_interval(&self) -> Duration {
        Duration::from_secs(self.metric_report_interval)
    }

    /// Check that the configuration is complete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn required(value: &str, what: &str) -> Result<(), ConfigError> {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{what} is required")));
            }
            Ok(())
        }

        required(&self.agent_token, "agent token")?;
        required(&self.fulcrum_api_url, "the Fulcrum API URL")?;

        required(&self.proxmox_api_url, "Proxmox API URL")?;
        required(&self.proxmox_api_token, "Proxmox API token")?;
        if self.proxmox_template == 0 {
            return Err(ConfigError::Validation(
                "Proxmox template ID must be greater than 0".to_string(),
            ));
        }
        required(&self.proxmox_host, "Proxmox host")?;
        required(&self.proxmox_storage, "Proxmox storage")?;
        required(&self.proxmox_ci_host, "Proxmox cloud-init host")?;
        required(&self.proxmox_ci_user, "Proxmox cloud-init user")?;
        required(&self.proxmox_ci_path, "Proxmox cloud-init path")?;
        required(&self.proxmox_ci_pk_path, "Proxmox cloud-init private key path")?;

        required(&self.kube_api_url, "Kubernetes API URL")?;
        required(&self.kube_api_token, "Kubernetes API token")?;

        Ok(())
    }
}

/// Builder merging the configuration sources in order.
pub struct ConfigBuilder {
    config: Config,
    err: Option<ConfigError>,
}

impl ConfigBuilder {
    /// Merge a JSON config file. A `None` path is a no-op.
    pub fn load_file(mut self, path: Option<&Path>) -> Self {
        if self.err.is_some() {
            return self;
        }
        let Some(path) = path else {
            return self;
        };

        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                self.err = Some(ConfigError::Io(format!(
                    "failed to read config file {}: {e}",
                    path.display()
                )));
                return self;
            }
        };

        match serde_json::from_str::<Config>(&data) {
            Ok(config) => self.config = config,
            Err(e) => {
                self.err = Some(ConfigError::Parse(format!("failed to parse config file: {e}")));
            }
        }
        self
    }

    /// Override fields from `FULCRUM_AGENT_*` environment variables,
    /// loading `.env.local` and `.env` first.
    pub fn with_env(mut self) -> Self {
        if self.err.is_some() {
            return self;
        }

        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");

        if let Err(e) = self.apply_env() {
            self.err = Some(e);
        }
        self
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn var(suffix: &str) -> Option<String> {
            std::env::var(format!("{ENV_PREFIX}{suffix}"))
                .ok()
                .filter(|v| !v.is_empty())
        }

        fn parsed<T: std::str::FromStr>(suffix: &str) -> Result<Option<T>, ConfigError> {
            match var(suffix) {
                Some(raw) => raw.parse().map(Some).map_err(|_| {
                    ConfigError::Parse(format!("invalid value for {ENV_PREFIX}{suffix}: {raw:?}"))
                }),
                None => Ok(None),
            }
        }

        let c = &mut self.config;
        if let Some(v) = var("TOKEN") {
            c.agent_token = v;
        }
        if let Some(v) = var("API_URL") {
            c.fulcrum_api_url = v;
        }
        if let Some(v) = parsed("JOB_POLL_INTERVAL")? {
            c.job_poll_interval = v;
        }
        if let Some(v) = parsed("METRIC_REPORT_INTERVAL")? {
            c.metric_report_interval = v;
        }
        if let Some(v) = var("PROXMOX_API_URL") {
            c.proxmox_api_url = v;
        }
        if let Some(v) = var("PROXMOX_API_SECRET") {
            c.proxmox_api_token = v;
        }
        if let Some(v) = parsed("PROXMOX_TEMPLATE")? {
            c.proxmox_template = v;
        }
        if let Some(v) = var("PROXMOX_HOST") {
            c.proxmox_host = v;
        }
        if let Some(v) = var("PROXMOX_STORAGE") {
            c.proxmox_storage = v;
        }
        if let Some(v) = var("PROXMOX_CI_HOST") {
            c.proxmox_ci_host = v;
        }
        if let Some(v) = var("PROXMOX_CI_USER") {
            c.proxmox_ci_user = v;
        }
        if let Some(v) = var("PROXMOX_CI_PATH") {
            c.proxmox_ci_path = v;
        }
        if let Some(v) = var("PROXMOX_CI_PK_PATH") {
            c.proxmox_ci_pk_path = v;
        }
        if let Some(v) = var("KUBE_API_URL") {
            c.kube_api_url = v;
        }
        if let Some(v) = var("KUBE_API_SECRET") {
            c.kube_api_token = v;
        }
        if let Some(v) = parsed("SKIP_TLS_VERIFY")? {
            c.skip_tls_verify = v;
        }
        Ok(())
    }

    /// Validate and return the final configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        if let Some(err) = self.err {
            return Err(err);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

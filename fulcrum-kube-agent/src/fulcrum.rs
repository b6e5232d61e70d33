//! Client for the Fulcrum Core API.
//!
//! The control plane is the authoritative scheduler: the agent reports its
//! status there, pulls jobs from it, and posts job results and metric
//! entries back.

use crate::error::{Error, Result};
use crate::model::{Job, JobResponse, MetricEntry, ServicePage};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// Operations the agent needs from Fulcrum Core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FulcrumClient: Send + Sync {
    /// Report the agent state (`Connected` / `Disconnected`). Idempotent.
    async fn update_agent_status(&self, status: &str) -> Result<()>;

    /// Fetch the authenticated agent's record.
    async fn get_agent_info(&self) -> Result<serde_json::Value>;

    /// Fetch one page of the service listing.
    async fn get_services(&self, page: u32) -> Result<ServicePage>;

    /// Fetch the pending jobs for this agent, ordered by the control plane.
    async fn get_pending_jobs(&self) -> Result<Vec<Job>>;

    /// Transition a job Pending -> Processing. Loses the race with
    /// [`Error::JobNotClaimable`].
    async fn claim_job(&self, job_id: &str) -> Result<()>;

    /// Report a processed job's result. Only valid from Processing.
    async fn complete_job(&self, job_id: &str, response: &JobResponse) -> Result<()>;

    /// Report a job failure. Only valid from Processing.
    async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()>;

    /// Post a single metric entry. At-least-once semantics.
    async fn report_metric(&self, entry: &MetricEntry) -> Result<()>;
}

/// HTTP implementation of [`FulcrumClient`].
pub struct HttpFulcrumClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpFulcrumClient {
    pub fn new(base_url: &str, token: &str, skip_tls_verify: bool) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(skip_tls_verify)
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::control_plane(format!("invalid Fulcrum API URL: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        // Paths are compile-time constants plus validated ids.
        let url = self.base_url.join(path).unwrap();
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl FulcrumClient for HttpFulcrumClient {
    async fn update_agent_status(&self, status: &str) -> Result<()> {
        let resp = self
            .request(Method::PUT, "/api/v1/agents/me/status")
            .json(&serde_json::json!({ "state": status }))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(Error::control_plane(format!(
                "failed to update agent status, status: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_agent_info(&self) -> Result<serde_json::Value> {
        let resp = self.request(Method::GET, "/api/v1/agents/me").send().await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::control_plane(format!(
                "failed to get agent info, status: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn get_services(&self, page: u32) -> Result<ServicePage> {
        let resp = self
            .request(Method::GET, &format!("/api/v1/services?page={page}"))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::control_plane(format!(
                "failed to get services, status: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn get_pending_jobs(&self) -> Result<Vec<Job>> {
        let resp = self.request(Method::GET, "/api/v1/jobs/pending").send().await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::control_plane(format!(
                "failed to get pending jobs, status: {}",
                resp.status()
            )));
        }
        let jobs: Vec<Job> = resp.json().await?;
        debug!("fetched {} pending job(s)", jobs.len());
        Ok(jobs)
    }

    async fn claim_job(&self, job_id: &str) -> Result<()> {
        let resp = self
            .request(Method::POST, &format!("/api/v1/jobs/{job_id}/claim"))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(Error::JobNotClaimable(job_id.to_string())),
        }
    }

    async fn complete_job(&self, job_id: &str, response: &JobResponse) -> Result<()> {
        let resp = self
            .request(Method::POST, &format!("/api/v1/jobs/{job_id}/complete"))
            .json(response)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::control_plane(format!(
                "failed to complete job {job_id}, status: {status}"
            ))),
        }
    }

    async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()> {
        let resp = self
            .request(Method::POST, &format!("/api/v1/jobs/{job_id}/fail"))
            .json(&serde_json::json!({ "errorMessage": error_message }))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::control_plane(format!(
                "failed to mark job {job_id} as failed, status: {status}"
            ))),
        }
    }

    async fn report_metric(&self, entry: &MetricEntry) -> Result<()> {
        let resp = self
            .request(Method::POST, "/api/v1/metric-entries")
            .json(entry)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(Error::control_plane(format!(
                "failed to report metric, status: {status}"
            ))),
        }
    }
}

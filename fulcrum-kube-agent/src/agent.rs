//! The agent supervisor.
//!
//! Owns the process lifecycle: authenticate against the control plane,
//! report Connected, run the heartbeat / job poller / metrics reporter as
//! periodic tasks, and unwind them cooperatively on shutdown. Individual
//! tick failures are logged and retried on the next tick; only bootstrap
//! failures are fatal.

use crate::error::{Error, Result};
use crate::fulcrum::FulcrumClient;
use crate::jobs::JobHandler;
use crate::metrics::MetricsReporter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between Connected refreshes.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for the periodic tasks to unwind.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Agent {
    fulcrum: Arc<dyn FulcrumClient>,
    job_handler: Arc<JobHandler>,
    metrics_reporter: Arc<MetricsReporter>,
    poll_interval: Duration,
    metric_interval: Duration,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    agent_id: std::sync::Mutex<Option<String>>,
}

impl Agent {
    pub fn new(
        fulcrum: Arc<dyn FulcrumClient>,
        job_handler: JobHandler,
        metrics_reporter: MetricsReporter,
        poll_interval: Duration,
        metric_interval: Duration,
    ) -> Self {
        Self {
            fulcrum,
            job_handler: Arc::new(job_handler),
            metrics_reporter: Arc::new(metrics_reporter),
            poll_interval,
            metric_interval,
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            agent_id: std::sync::Mutex::new(None),
        }
    }

    /// Authenticate, report Connected, and launch the periodic tasks.
    pub async fn start(&self) -> Result<()> {
        let info = self.fulcrum.get_agent_info().await?;
        let id = info
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::BadAgentIdentity("agent info has no string id".to_string()))?
            .to_string();
        info!("agent authenticated with id {id}");
        *self.agent_id.lock().unwrap() = Some(id);

        self.fulcrum
            .update_agent_status("Connected")
            .await
            .map_err(|e| Error::RegistrationFailed(e.to_string()))?;
        info!("agent status updated to Connected");

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_job_poller());
        tasks.push(self.spawn_metrics_reporter());
        Ok(())
    }

    /// The agent id assigned by the control plane, once [`start`] returned.
    ///
    /// [`start`]: Agent::start
    pub fn agent_id(&self) -> Option<String> {
        self.agent_id.lock().unwrap().clone()
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let fulcrum = self.fulcrum.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The bootstrap already reported Connected.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = fulcrum.update_agent_status("Connected") => match result {
                        Ok(()) => debug!("heartbeat: agent status refreshed"),
                        Err(e) => warn!("failed to update agent status: {e}"),
                    }
                }
            }
        })
    }

    fn spawn_job_poller(&self) -> JoinHandle<()> {
        let handler = self.job_handler.clone();
        let cancel = self.cancel.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = handler.poll_and_process() => {
                        if let Err(e) = result {
                            error!("error polling jobs: {e}");
                        }
                    }
                }
            }
        })
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let reporter = self.metrics_reporter.clone();
        let cancel = self.cancel.clone();
        let interval = self.metric_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = reporter.report_once() => {
                        if let Err(e) = result {
                            error!("error reporting metrics: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Broadcast cancellation, wait for the periodic tasks to unwind, then
    /// report Disconnected. The status transition happens even when the
    /// tasks miss the shutdown budget.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let wait_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("agent task ended abnormally: {e}");
                }
            }
        };
        let timed_out = tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all)
            .await
            .is_err();

        match self.fulcrum.update_agent_status("Disconnected").await {
            Ok(()) => info!("agent status updated to Disconnected"),
            Err(e) => error!("failed to update agent status on shutdown: {e}"),
        }

        if timed_out {
            return Err(Error::ShutdownTimeout);
        }
        info!("agent shut down successfully");
        Ok(())
    }
}

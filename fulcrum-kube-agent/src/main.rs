//! fulcrum-kube-agent - manages tenant Kubernetes clusters on Proxmox VE.
//!
//! This daemon:
//! - Registers with Fulcrum Core and keeps a heartbeat
//! - Polls for desired-state jobs and reconciles them against Proxmox and
//!   the Kamaji tenant control planes
//! - Samples VM resource usage for running services and reports it upstream

use clap::Parser;
use fulcrum_kube_agent::agent::Agent;
use fulcrum_kube_agent::config::Config;
use fulcrum_kube_agent::fulcrum::{FulcrumClient, HttpFulcrumClient};
use fulcrum_kube_agent::jobs::JobHandler;
use fulcrum_kube_agent::kamaji::{HttpKamajiClient, KamajiClient};
use fulcrum_kube_agent::metrics::MetricsReporter;
use fulcrum_kube_agent::proxmox::{ProxmoxClient, PveClient};
use fulcrum_kube_agent::ssh::{ScpClient, SshClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fulcrum Core agent for Proxmox-backed tenant Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "fulcrum-kube-agent")]
#[command(about = "Fulcrum agent managing Kamaji tenant clusters on Proxmox VE")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("starting fulcrum-kube-agent");

    let config = Config::builder()
        .load_file(args.config.as_deref())
        .with_env()
        .build()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let agent = build_agent(&config)?;
    agent.start().await?;
    info!(
        "agent started successfully (agent id: {})",
        agent.agent_id().unwrap_or_default()
    );

    shutdown_signal().await;
    info!("received shutdown signal");

    if let Err(e) = agent.shutdown().await {
        error!("error during shutdown: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn build_agent(config: &Config) -> anyhow::Result<Agent> {
    let fulcrum: Arc<dyn FulcrumClient> = Arc::new(HttpFulcrumClient::new(
        &config.fulcrum_api_url,
        &config.agent_token,
        config.skip_tls_verify,
    )?);
    let proxmox: Arc<dyn ProxmoxClient> = Arc::new(PveClient::new(config)?);
    let kamaji: Arc<dyn KamajiClient> = Arc::new(HttpKamajiClient::new(
        &config.kube_api_url,
        &config.kube_api_token,
        config.skip_tls_verify,
    )?);
    let ssh: Arc<dyn SshClient> = Arc::new(ScpClient::new(
        &config.proxmox_ci_host,
        &config.proxmox_ci_user,
        &config.proxmox_ci_pk_path,
    ));

    let job_handler = JobHandler::new(
        fulcrum.clone(),
        proxmox.clone(),
        kamaji,
        ssh,
        config.proxmox_template,
        &config.proxmox_ci_path,
    );
    let metrics_reporter = MetricsReporter::new(fulcrum.clone(), proxmox);

    Ok(Agent::new(
        fulcrum,
        job_handler,
        metrics_reporter,
        config.job_poll_interval(),
        config.metric_report_interval(),
    ))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl-C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::try_new("debug,russh=info,hyper=info,reqwest=info")?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,russh=warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}

//! Kiln Runner
//!
//! The build executor: dequeues builds from the control plane and runs
//! their pipelines in a sandbox (shell, Docker, Firecracker or Kubernetes).
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repository: HTTP communication with the control plane
//! - Pipeline: Step planning, workspaces and task bookkeeping
//! - Runners: One sandbox per build, behind a common lifecycle
//! - Scheduler: Polling, heartbeats, reaping and shutdown cleanup

mod command;
mod config;
mod kube;
mod pipeline;
mod repository;
mod runner;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::command::{Command, ProcessCommand};
use crate::config::{Backend, CONTROL_PLANE_URL_VAR, Config};
use crate::kube::{KubeApi, KubeClient};
use crate::repository::{BuildRepository, HttpBuildRepository};
use crate::scheduler::{ActiveBuilds, Cleanup, JobPoller, Reaper};
use kiln_client::ControlPlaneClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Runner");

    // Load configuration
    let config = Arc::new(load_config()?);
    info!(
        "Loaded configuration: executor_name={}, control_plane_url={}, backend={}",
        config.executor_name,
        config.control_plane_url,
        config.backend()
    );

    // Initialize control-plane client
    let client = ControlPlaneClient::new(
        config.control_plane_url.clone(),
        config.executor_token.clone(),
    );
    let repository: Arc<dyn BuildRepository> = Arc::new(HttpBuildRepository::new(
        client,
        config.executor_name.clone(),
    ));

    let kube: Option<Arc<dyn KubeApi>> = if config.backend() == Backend::Kubernetes {
        let client = KubeClient::from_options(&config.kubernetes)
            .context("Failed to initialize Kubernetes client")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let command: Arc<dyn Command> = Arc::new(ProcessCommand::new());
    let shutdown = CancellationToken::new();
    let active = ActiveBuilds::new();

    let cleanup = Cleanup::new(
        Arc::clone(&repository),
        active.clone(),
        shutdown.clone(),
        config.cleanup_timeout,
    )
    .install()?;

    let reaper = Reaper::new(Arc::clone(&repository), &config);
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let poller = JobPoller::new(Arc::clone(&config), repository, command, kube, active);

    info!("Executor initialized successfully");
    let result = poller.run(shutdown.clone()).await;
    if let Err(e) = &result {
        error!("Poller error: {:#}", e);
        shutdown.cancel();
    }

    match cleanup.await {
        Ok(killed) if !killed.is_empty() => info!("Marked builds {:?} killed", killed),
        Ok(_) => {}
        Err(e) => error!("Cleanup task failed: {}", e),
    }
    if let Err(e) = reaper_handle.await {
        error!("Reaper task failed: {}", e);
    }

    info!("Kiln Runner stopped");
    result
}

/// Loads configuration from environment variables with fallback to defaults
///
/// Defaults are used only when the control-plane URL is not set at all; a
/// malformed variable stops the executor.
fn load_config() -> Result<Config> {
    let config = match Config::from_env().context("Invalid configuration")? {
        Some(config) => config,
        None => {
            info!("{} not set, using default configuration", CONTROL_PLANE_URL_VAR);
            Config::default()
        }
    };
    config.validate()?;
    Ok(config)
}

//! Shutdown cleanup
//!
//! On SIGINT or SIGTERM the executor stops taking work, cancels every
//! in-flight build and marks those builds killed before exiting.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ActiveBuilds, kill_build};
use crate::repository::BuildRepository;

pub struct Cleanup {
    repository: Arc<dyn BuildRepository>,
    active: ActiveBuilds,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl Cleanup {
    pub fn new(
        repository: Arc<dyn BuildRepository>,
        active: ActiveBuilds,
        shutdown: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            active,
            shutdown,
            timeout,
        }
    }

    /// Installs the signal handlers and runs cleanup on the first signal
    ///
    /// A shutdown triggered some other way (the token firing) also runs it.
    pub fn install(self) -> Result<JoinHandle<Vec<i64>>> {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = self.shutdown.cancelled() => info!("Shutdown requested"),
            }
            self.run().await
        }))
    }

    /// Cancels every active build and marks it killed
    ///
    /// The active set is snapshotted before cancelling, so builds that
    /// unregister while winding down are still reported. Returns the builds
    /// that were marked killed.
    pub async fn run(&self) -> Vec<i64> {
        let snapshot = self.active.snapshot().await;
        self.shutdown.cancel();

        if snapshot.is_empty() {
            return Vec::new();
        }
        info!("Marking {} active build(s) killed", snapshot.len());

        let now = Utc::now();
        let mut killed = Vec::new();
        let work = async {
            for build_id in &snapshot {
                match kill_build(self.repository.as_ref(), *build_id, now).await {
                    Ok(()) => killed.push(*build_id),
                    Err(e) => warn!("Failed to mark build {} killed: {:#}", build_id, e),
                }
            }
        };

        if tokio::time::timeout(self.timeout, work).await.is_err() {
            warn!(
                "Cleanup timed out after {:?}; builds may be left to the reaper",
                self.timeout
            );
        }
        killed
    }
}

//! Job poller
//!
//! Dequeues builds from the control plane and executes them. Each build runs
//! in its own task holding a semaphore permit, with a heartbeat and a log
//! sender running next to it.

use anyhow::Result;
use chrono::Utc;
use kiln_core::domain::job::Job;
use kiln_core::dto::build::BuildUpdate;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reaper::random_between;
use super::{ActiveBuilds, spawn_heartbeat};
use crate::command::Command;
use crate::config::Config;
use crate::kube::KubeApi;
use crate::pipeline::Pipeline;
use crate::repository::BuildRepository;
use crate::service::{InMemoryLogBuffer, LogBufferService};

/// Pause after a failed dequeue
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Everything a build task needs, shared by all of them
#[derive(Clone)]
struct Deps {
    config: Arc<Config>,
    repository: Arc<dyn BuildRepository>,
    command: Arc<dyn Command>,
    kube: Option<Arc<dyn KubeApi>>,
    active: ActiveBuilds,
}

/// Job poller that continuously dequeues and executes builds
pub struct JobPoller {
    deps: Deps,
    semaphore: Arc<Semaphore>,
}

impl JobPoller {
    /// Creates a new job poller
    ///
    /// # Arguments
    /// * `repository` - Repository authenticated with the executor token
    /// * `active` - Set shared with cleanup
    pub fn new(
        config: Arc<Config>,
        repository: Arc<dyn BuildRepository>,
        command: Arc<dyn Command>,
        kube: Option<Arc<dyn KubeApi>>,
        active: ActiveBuilds,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.parallel));
        Self {
            deps: Deps {
                config,
                repository,
                command,
                kube,
                active,
            },
            semaphore,
        }
    }

    /// Polls until `shutdown` fires, then waits for running builds to wind down
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let config = &self.deps.config;
        info!(
            "Starting job poller (queue: {}, parallel: {})",
            config.queue, config.parallel
        );

        // At most `parallel` dequeues per second
        let mut throttle = time::interval(Duration::from_secs(1) / config.parallel.max(1) as u32);
        throttle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = throttle.tick() => {}
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => permit?,
            };

            let backoff = match self.deps.repository.dequeue(&config.queue).await {
                Ok(Some(job)) => {
                    self.spawn_build(job, permit, shutdown.clone());
                    continue;
                }
                Ok(None) => {
                    debug!("Queue {} is empty", config.queue);
                    random_between(Duration::ZERO, config.max_queue_backoff)
                }
                Err(e) => {
                    error!("Failed to dequeue: {:#}", e);
                    ERROR_BACKOFF
                }
            };
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(backoff) => {}
            }
        }

        info!("Poller stopped, waiting for running builds");
        let all = config.parallel as u32;
        if time::timeout(config.cleanup_timeout, self.semaphore.acquire_many(all))
            .await
            .is_err()
        {
            warn!("Builds still running after {:?}", config.cleanup_timeout);
        }
        Ok(())
    }

    /// Spawns a task executing a single build
    fn spawn_build(&self, job: Job, permit: OwnedSemaphorePermit, shutdown: CancellationToken) {
        let deps = self.deps.clone();
        tokio::spawn(async move {
            Self::execute_build(job, deps, shutdown).await;
            // Permit is released when dropped
            drop(permit);
        });
    }

    /// Executes a single build with heartbeats and log streaming
    async fn execute_build(job: Job, deps: Deps, shutdown: CancellationToken) {
        let build_id = job.id;
        info!("Starting build {} ({}@{})", build_id, job.repository, job.commit);

        if !deps.active.insert(build_id).await {
            warn!("Build {} is already running here, ignoring", build_id);
            return;
        }

        let repository = deps.repository.for_job(&job.access_token);
        if let Err(e) = repository
            .update_build(build_id, BuildUpdate::started(Utc::now()))
            .await
        {
            warn!("Failed to mark build {} started: {:#}", build_id, e);
        }

        let stop = shutdown.child_token();
        let heartbeat = spawn_heartbeat(
            build_id,
            Arc::clone(&repository),
            deps.config.heartbeat_interval,
            stop.clone(),
        );

        let logs = Arc::new(InMemoryLogBuffer::new());
        let log_sender = Self::spawn_log_sender(
            build_id,
            Arc::clone(&logs),
            Arc::clone(&repository),
            deps.config.log_send_interval,
        );

        let pipeline = Pipeline::new(
            Arc::clone(&deps.config),
            job,
            Arc::clone(&deps.command),
            logs.clone(),
            Arc::clone(&repository),
            deps.kube.clone(),
        );
        let result = pipeline.run(&shutdown).await;

        stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task of build {} panicked: {}", build_id, e);
        }

        // Always abort log sender
        log_sender.abort();

        // Send remaining logs
        let remaining = logs.drain_all();
        if !remaining.is_empty() {
            debug!("Sending {} remaining logs for build {}", remaining.len(), build_id);
            if let Err(e) = repository.send_logs(build_id, remaining).await {
                warn!("Failed to send final logs of build {}: {:#}", build_id, e);
            }
        }

        if shutdown.is_cancelled() {
            info!("Build {} interrupted by shutdown", build_id);
        } else {
            let update = match &result {
                Ok(()) => {
                    info!("Build {} succeeded", build_id);
                    BuildUpdate::succeeded(Utc::now())
                }
                Err(e) => {
                    info!("Build {} failed: {}", build_id, e);
                    BuildUpdate::failed(Utc::now())
                }
            };
            if let Err(e) = repository.update_build(build_id, update).await {
                error!("Failed to report result of build {}: {:#}", build_id, e);
            }
        }

        deps.active.remove(build_id).await;
    }

    /// Spawns a background task to send finished log entries periodically
    fn spawn_log_sender(
        build_id: i64,
        logs: Arc<InMemoryLogBuffer>,
        repository: Arc<dyn BuildRepository>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                ticker.tick().await;

                let entries = logs.drain();

                if entries.is_empty() {
                    continue;
                }

                debug!("Sending {} logs for build {}", entries.len(), build_id);

                if let Err(e) = repository.send_logs(build_id, entries).await {
                    error!("Failed to send logs for build {}: {:#}", build_id, e);
                }
            }
        })
    }
}

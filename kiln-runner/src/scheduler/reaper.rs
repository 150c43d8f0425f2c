//! Reaper
//!
//! Periodically looks for builds whose executor stopped sending heartbeats
//! (crashed, lost its network, was killed without cleanup) and marks them
//! killed. Any executor may reap any build.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::kill_build;
use crate::config::{Config, ReaperOptions};
use crate::repository::BuildRepository;

pub struct Reaper {
    repository: Arc<dyn BuildRepository>,
    options: ReaperOptions,
    /// A build is stale once its last sign of life is older than this
    timeout: Duration,
}

impl Reaper {
    pub fn new(repository: Arc<dyn BuildRepository>, config: &Config) -> Self {
        Self {
            repository,
            options: config.reaper.clone(),
            timeout: config.reaper_timeout(),
        }
    }

    /// Runs reap passes with a random pause between them until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting reaper (timeout: {:?})", self.timeout);

        loop {
            let pause = random_between(self.options.min_sleep, self.options.max_sleep);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reaper stopped");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            match self.reap_once(Utc::now()).await {
                Ok(reaped) if !reaped.is_empty() => info!("Reaped builds {:?}", reaped),
                Ok(_) => {}
                Err(e) => error!("Reaper pass failed: {:#}", e),
            }
        }
    }

    /// Kills every active build that has been silent for longer than the
    /// timeout, returning their IDs
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let builds = self
            .repository
            .list_active_builds()
            .await
            .context("Failed to list active builds")?;

        let mut reaped = Vec::new();
        for build in builds {
            let Some(last_seen) = build.last_seen() else {
                continue;
            };
            if !self.is_stale(last_seen, now) {
                continue;
            }

            warn!(
                "Build {} last seen at {}, marking it killed",
                build.id, last_seen
            );
            match kill_build(self.repository.as_ref(), build.id, now).await {
                Ok(()) => reaped.push(build.id),
                Err(e) => warn!("Failed to reap build {}: {:#}", build.id, e),
            }
        }
        Ok(reaped)
    }

    fn is_stale(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - last_seen)
            .to_std()
            .map(|silence| silence > self.timeout)
            .unwrap_or(false)
    }
}

/// Uniformly random duration in `[min, max]`
pub(crate) fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

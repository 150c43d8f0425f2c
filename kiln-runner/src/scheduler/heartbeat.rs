//! Per-build heartbeat

use chrono::Utc;
use kiln_core::dto::build::BuildUpdate;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::repository::BuildRepository;

/// Spawns a task sending `heartbeatAt` for a build every `interval`
///
/// The task ends when `stop` fires or on the first failed update; the
/// reaper takes over from there.
pub fn spawn_heartbeat(
    build_id: i64,
    repository: Arc<dyn BuildRepository>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = repository
                .update_build(build_id, BuildUpdate::heartbeat(Utc::now()))
                .await
            {
                debug!("Heartbeat for build {} failed, stopping: {:#}", build_id, e);
                return;
            }
        }
    })
}

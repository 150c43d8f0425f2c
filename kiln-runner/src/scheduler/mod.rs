//! Scheduler layer for the executor
//!
//! This layer dequeues builds from the control plane and drives them to a
//! final status. It also runs the process-wide background duties: reaping
//! builds whose executor went silent and cleaning up on shutdown.

mod active;
mod cleanup;
mod heartbeat;
pub mod poller;
mod reaper;

pub use active::ActiveBuilds;
pub use cleanup::Cleanup;
pub use heartbeat::spawn_heartbeat;
pub use poller::JobPoller;
pub use reaper::Reaper;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_core::dto::build::BuildUpdate;
use kiln_core::dto::task::TaskUpdate;

use crate::repository::BuildRepository;

/// Marks a build killed and fails every task that has not ended
pub async fn kill_build(
    repository: &dyn BuildRepository,
    build_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    repository
        .update_build(build_id, BuildUpdate::killed(now))
        .await
        .with_context(|| format!("Failed to mark build {} killed", build_id))?;

    let tasks = repository
        .list_build_tasks(build_id)
        .await
        .with_context(|| format!("Failed to list tasks of build {}", build_id))?;

    for task in tasks.iter().filter(|t| !t.is_finished()) {
        repository
            .update_task(task.id, TaskUpdate::failed(now))
            .await
            .with_context(|| format!("Failed to fail task {}", task.id))?;
    }
    Ok(())
}

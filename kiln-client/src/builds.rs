//! Queue and build lifecycle endpoints

use crate::ControlPlaneClient;
use crate::error::Result;
use kiln_core::domain::build::Build;
use kiln_core::domain::job::Job;
use kiln_core::domain::log::ExecutionLogEntry;
use kiln_core::dto::build::BuildUpdate;
use kiln_core::dto::log::LogBatch;
use reqwest::StatusCode;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DequeueRequest<'a> {
    executor_name: &'a str,
}

impl ControlPlaneClient {
    // =============================================================================
    // Queue
    // =============================================================================

    /// Dequeue the next job from a queue
    ///
    /// # Arguments
    /// * `queue` - Name of the queue to dequeue from
    ///
    /// # Returns
    /// `None` when the queue is empty (204 No Content)
    pub async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        self.dequeue_as(queue, "").await
    }

    /// Dequeue the next job, identifying this executor by name
    pub async fn dequeue_as(&self, queue: &str, executor_name: &str) -> Result<Option<Job>> {
        let url = self.url(&format!("/.executors/queue/{}/dequeue", queue));
        let response = self
            .authorized(self.client.post(&url))
            .json(&DequeueRequest { executor_name })
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        self.handle_response(response).await.map(Some)
    }

    // =============================================================================
    // Build Lifecycle
    // =============================================================================

    /// Apply a partial update to a build
    ///
    /// # Arguments
    /// * `build_id` - The build to update
    /// * `update` - Fields to set; unset fields are left untouched
    pub async fn update_build(&self, build_id: i64, update: &BuildUpdate) -> Result<()> {
        let url = self.url(&format!("/.executors/builds/{}", build_id));
        let response = self
            .authorized(self.client.patch(&url))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// List every build the control plane considers active (started, not ended)
    pub async fn list_active_builds(&self) -> Result<Vec<Build>> {
        let url = self.url("/.executors/builds");
        let response = self
            .authorized(self.client.get(&url))
            .query(&[("active", "true")])
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Execution Logs
    // =============================================================================

    /// Ship execution log entries for a build
    ///
    /// # Arguments
    /// * `build_id` - The build these entries belong to
    /// * `entries` - Log entries to append
    pub async fn send_logs(&self, build_id: i64, entries: Vec<ExecutionLogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let url = self.url(&format!("/.executors/builds/{}/logs", build_id));
        let response = self
            .authorized(self.client.post(&url))
            .json(&LogBatch { build_id, entries })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

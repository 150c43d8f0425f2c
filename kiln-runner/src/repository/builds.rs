//! Builds repository
//!
//! Handles every control-plane call the executor makes:
//! - Dequeuing jobs
//! - Build and task status updates
//! - Listing active builds and build tasks (reaper, cleanup)
//! - Shipping execution logs
//! - Downloading workspace files

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_client::ControlPlaneClient;
use kiln_core::domain::build::Build;
use kiln_core::domain::job::Job;
use kiln_core::domain::log::ExecutionLogEntry;
use kiln_core::domain::task::Task;
use kiln_core::dto::build::BuildUpdate;
use kiln_core::dto::task::TaskUpdate;
use std::sync::Arc;

/// Repository trait for build-related operations with the control plane
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Dequeues the next job from a queue
    ///
    /// Returns `None` when the queue is empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>>;

    /// Applies a partial update to a build
    async fn update_build(&self, build_id: i64, update: BuildUpdate) -> Result<()>;

    /// Creates one task per label and returns their IDs in order
    async fn create_tasks(&self, build_id: i64, labels: Vec<String>) -> Result<Vec<i64>>;

    /// Applies a partial update to a task
    async fn update_task(&self, task_id: i64, update: TaskUpdate) -> Result<()>;

    /// Lists every task of a build
    async fn list_build_tasks(&self, build_id: i64) -> Result<Vec<Task>>;

    /// Lists builds the control plane considers running
    async fn list_active_builds(&self) -> Result<Vec<Build>>;

    /// Ships execution log entries of a build
    async fn send_logs(&self, build_id: i64, entries: Vec<ExecutionLogEntry>) -> Result<()>;

    /// Downloads a file from the control plane's file store
    async fn get_file(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Returns a repository authenticating with a job's own token
    fn for_job(&self, access_token: &str) -> Arc<dyn BuildRepository>;
}

/// HTTP implementation of BuildRepository
pub struct HttpBuildRepository {
    client: ControlPlaneClient,
    executor_name: String,
}

impl HttpBuildRepository {
    /// Creates a new HTTP build repository
    ///
    /// # Arguments
    /// * `client` - Control-plane client carrying the executor token
    /// * `executor_name` - Name reported when dequeuing
    pub fn new(client: ControlPlaneClient, executor_name: String) -> Self {
        Self {
            client,
            executor_name,
        }
    }
}

#[async_trait]
impl BuildRepository for HttpBuildRepository {
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        self.client
            .dequeue_as(queue, &self.executor_name)
            .await
            .with_context(|| format!("Failed to dequeue from queue {}", queue))
    }

    async fn update_build(&self, build_id: i64, update: BuildUpdate) -> Result<()> {
        self.client
            .update_build(build_id, &update)
            .await
            .with_context(|| format!("Failed to update build {}", build_id))
    }

    async fn create_tasks(&self, build_id: i64, labels: Vec<String>) -> Result<Vec<i64>> {
        let ids = self
            .client
            .create_tasks(build_id, &labels)
            .await
            .with_context(|| format!("Failed to create tasks for build {}", build_id))?;

        if ids.len() != labels.len() {
            anyhow::bail!(
                "Control plane created {} task(s) for {} step(s) of build {}",
                ids.len(),
                labels.len(),
                build_id
            );
        }

        Ok(ids)
    }

    async fn update_task(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        self.client
            .update_task(task_id, &update)
            .await
            .with_context(|| format!("Failed to update task {}", task_id))
    }

    async fn list_build_tasks(&self, build_id: i64) -> Result<Vec<Task>> {
        self.client
            .list_build_tasks(build_id)
            .await
            .with_context(|| format!("Failed to list tasks of build {}", build_id))
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        self.client
            .list_active_builds()
            .await
            .context("Failed to list active builds")
    }

    async fn send_logs(&self, build_id: i64, entries: Vec<ExecutionLogEntry>) -> Result<()> {
        self.client
            .send_logs(build_id, entries)
            .await
            .with_context(|| format!("Failed to send logs for build {}", build_id))
    }

    async fn get_file(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.client
            .get_file(bucket, key)
            .await
            .with_context(|| format!("Failed to download file {}/{}", bucket, key))
    }

    fn for_job(&self, access_token: &str) -> Arc<dyn BuildRepository> {
        Arc::new(Self {
            client: self.client.for_job(access_token),
            executor_name: self.executor_name.clone(),
        })
    }
}

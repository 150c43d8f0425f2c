//! Task endpoints

use crate::ControlPlaneClient;
use crate::error::Result;
use kiln_core::domain::task::Task;
use kiln_core::dto::task::{CreateTasks, CreatedTasks, NewTask, TaskUpdate};
use tracing::debug;

/// Upper bound on pages fetched by [`ControlPlaneClient::list_build_tasks`]
const MAX_TASK_PAGES: u32 = 100;

impl ControlPlaneClient {
    /// Create the tasks of a build
    ///
    /// # Arguments
    /// * `build_id` - The owning build
    /// * `labels` - One label per task, in pipeline order
    ///
    /// # Returns
    /// The created task IDs, in the same order as `labels`
    pub async fn create_tasks(&self, build_id: i64, labels: &[String]) -> Result<Vec<i64>> {
        let url = self.url(&format!("/.executors/builds/{}/tasks", build_id));
        let request = CreateTasks {
            tasks: labels
                .iter()
                .map(|label| NewTask {
                    label: label.clone(),
                })
                .collect(),
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await?;

        let created: CreatedTasks = self.handle_response(response).await?;
        Ok(created.ids)
    }

    /// Apply a partial update to a task
    pub async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> Result<()> {
        let url = self.url(&format!("/.executors/tasks/{}", task_id));
        let response = self
            .authorized(self.client.patch(&url))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Fetch one page of a build's tasks (pages start at 1)
    pub async fn list_build_tasks_page(&self, build_id: i64, page: u32) -> Result<Vec<Task>> {
        let url = self.url(&format!("/.executors/builds/{}/tasks", build_id));
        let response = self
            .authorized(self.client.get(&url))
            .query(&[("page", page)])
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Fetch every task of a build, following pages until an empty one
    pub async fn list_build_tasks(&self, build_id: i64) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();

        for page in 1..=MAX_TASK_PAGES {
            let batch = self.list_build_tasks_page(build_id, page).await?;
            if batch.is_empty() {
                break;
            }
            debug!(
                "Fetched {} task(s) from page {} of build {}",
                batch.len(),
                page,
                build_id
            );
            tasks.extend(batch);
        }

        Ok(tasks)
    }
}

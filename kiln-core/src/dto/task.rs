//! Task DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to create the tasks of a build, one per pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTasks {
    pub tasks: Vec<NewTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub label: String,
}

/// IDs of the created tasks, in request order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedTasks {
    pub ids: Vec<i64>,
}

/// Partial update of a task record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<bool>,
}

impl TaskUpdate {
    pub fn failed(now: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(now),
            failure: Some(true),
            ..Default::default()
        }
    }
}

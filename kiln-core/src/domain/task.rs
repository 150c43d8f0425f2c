//! Task domain types
//!
//! A task is one pipeline step within a build. The control plane stores
//! [`Task`] records; the executor tracks each in-flight step with a
//! [`TaskState`] whose transitions produce the [`TaskUpdate`]s to send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dto::task::TaskUpdate;

/// Control-plane record of a task, as returned by task listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub build_id: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub warnings: bool,
}

impl Task {
    /// A task is finished once its end time is recorded
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Status of a task as the executor sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Started,
    Skipped,
    Warned,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Started => write!(f, "Started"),
            TaskStatus::Skipped => write!(f, "Skipped"),
            TaskStatus::Warned => write!(f, "Warned"),
            TaskStatus::Succeeded => write!(f, "Succeeded"),
            TaskStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Rejected task transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task {task_id} already ended as {status}")]
    AlreadyEnded { task_id: i64, status: TaskStatus },

    #[error("task {task_id} cannot go from {from} to {to}")]
    Invalid {
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Per-step bookkeeping for one task of an in-flight build
///
/// Pending -> Started -> [Skipped | Warned]* -> {Succeeded | Failed}.
/// Failing straight from Pending is allowed so that steps which never ran
/// can be closed out when the build aborts.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub id: i64,
    pub build_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl TaskState {
    pub fn new(id: i64, build_id: i64) -> Self {
        Self {
            id,
            build_id,
            started_at: None,
            ended_at: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Marks the task as started
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, TransitionError> {
        self.check(TaskStatus::Started, &[TaskStatus::Pending])?;
        self.status = TaskStatus::Started;
        self.started_at = Some(now);
        Ok(TaskUpdate {
            started_at: Some(now),
            ..Default::default()
        })
    }

    /// Records that the step was skipped
    pub fn skip(&mut self) -> Result<TaskUpdate, TransitionError> {
        self.check(TaskStatus::Skipped, Self::RUNNING)?;
        self.status = TaskStatus::Skipped;
        Ok(TaskUpdate {
            skipped: Some(true),
            ..Default::default()
        })
    }

    /// Records that the step produced warnings
    pub fn warn(&mut self) -> Result<TaskUpdate, TransitionError> {
        self.check(TaskStatus::Warned, Self::RUNNING)?;
        self.status = TaskStatus::Warned;
        Ok(TaskUpdate {
            warnings: Some(true),
            ..Default::default()
        })
    }

    /// Ends the task successfully
    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, TransitionError> {
        self.check(TaskStatus::Succeeded, Self::RUNNING)?;
        self.status = TaskStatus::Succeeded;
        self.ended_at = Some(now);
        Ok(TaskUpdate {
            ended_at: Some(now),
            success: Some(true),
            ..Default::default()
        })
    }

    /// Ends the task as failed
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, TransitionError> {
        self.check(
            TaskStatus::Failed,
            &[
                TaskStatus::Pending,
                TaskStatus::Started,
                TaskStatus::Skipped,
                TaskStatus::Warned,
            ],
        )?;
        self.status = TaskStatus::Failed;
        self.ended_at = Some(now);
        Ok(TaskUpdate {
            ended_at: Some(now),
            failure: Some(true),
            ..Default::default()
        })
    }

    const RUNNING: &'static [TaskStatus] =
        &[TaskStatus::Started, TaskStatus::Skipped, TaskStatus::Warned];

    fn check(&self, to: TaskStatus, allowed: &[TaskStatus]) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyEnded {
                task_id: self.id,
                status: self.status,
            });
        }
        if !allowed.contains(&self.status) {
            return Err(TransitionError::Invalid {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

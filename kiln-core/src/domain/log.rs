//! Execution log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output and outcome of one command run on behalf of a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// Correlation key, e.g. `step.0.build` or `teardown.job`
    pub key: String,
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// None while the command is still running
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    /// Prefixed output lines (`stdout: ...` / `stderr: ...`)
    pub out: String,
}

impl ExecutionLogEntry {
    pub fn new(key: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            key: key.into(),
            command,
            started_at: Utc::now(),
            exit_code: None,
            duration_ms: None,
            out: String::new(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.exit_code.is_some()
    }
}

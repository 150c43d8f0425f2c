//! Log DTOs

use serde::{Deserialize, Serialize};

use crate::domain::log::ExecutionLogEntry;

/// Batch of execution log entries shipped from executor to control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    pub build_id: i64,
    pub entries: Vec<ExecutionLogEntry>,
}

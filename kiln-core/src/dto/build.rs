//! Build DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partial update of a build record
///
/// Only the fields that are set are sent; the control plane applies them
/// field by field, so a heartbeat and a final status update may race safely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killed: Option<bool>,
}

impl BuildUpdate {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat_at: Some(now),
            ..Default::default()
        }
    }

    pub fn succeeded(now: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(now),
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn failed(now: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(now),
            failure: Some(true),
            ..Default::default()
        }
    }

    /// Terminal update for a build the platform stopped
    pub fn killed(now: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(now),
            failure: Some(true),
            killed: Some(true),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_serializes_only_heartbeat() {
        let update = BuildUpdate::heartbeat(Utc::now());
        let json = serde_json::to_value(&update).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("heartbeatAt"));
    }

    #[test]
    fn test_killed_is_also_failure() {
        let update = BuildUpdate::killed(Utc::now());
        assert_eq!(update.killed, Some(true));
        assert_eq!(update.failure, Some(true));
        assert!(update.ended_at.is_some());
        assert_eq!(update.success, None);
    }
}

//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-plane record of a build's lifecycle
///
/// The executor reads these when reaping stale builds; it never stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: i64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub killed: bool,
}

impl Build {
    /// Most recent sign of life: the later of heartbeat and start
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match (self.heartbeat_at, self.started_at) {
            (Some(h), Some(s)) => Some(h.max(s)),
            (h, s) => h.or(s),
        }
    }

    pub fn status(&self) -> BuildStatus {
        if self.killed {
            BuildStatus::Killed
        } else if self.failure {
            BuildStatus::Failed
        } else if self.success {
            BuildStatus::Succeeded
        } else if self.started_at.is_some() {
            BuildStatus::Started
        } else {
            BuildStatus::Queued
        }
    }
}

/// Build lifecycle state
///
/// Queued -> Started -> {Succeeded | Failed | Killed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
    Killed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Killed
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "Queued"),
            BuildStatus::Started => write!(f, "Started"),
            BuildStatus::Succeeded => write!(f, "Succeeded"),
            BuildStatus::Failed => write!(f, "Failed"),
            BuildStatus::Killed => write!(f, "Killed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn build() -> Build {
        Build {
            id: 1,
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            success: false,
            failure: false,
            killed: false,
        }
    }

    #[test]
    fn test_last_seen_prefers_latest() {
        let now = Utc::now();
        let mut b = build();
        assert_eq!(b.last_seen(), None);

        b.started_at = Some(now - Duration::seconds(60));
        assert_eq!(b.last_seen(), b.started_at);

        b.heartbeat_at = Some(now);
        assert_eq!(b.last_seen(), Some(now));

        // A heartbeat older than the start (clock skew) does not win
        b.heartbeat_at = Some(now - Duration::seconds(120));
        assert_eq!(b.last_seen(), b.started_at);
    }

    #[test]
    fn test_status_precedence() {
        let mut b = build();
        assert_eq!(b.status(), BuildStatus::Queued);
        b.started_at = Some(Utc::now());
        assert_eq!(b.status(), BuildStatus::Started);
        b.failure = true;
        b.killed = true;
        assert_eq!(b.status(), BuildStatus::Killed);
        assert!(b.status().is_terminal());
    }
}

//! Kubernetes API access
//!
//! The executor only needs a handful of calls: create and delete Jobs,
//! Secrets and PersistentVolumeClaims, watch Pods by label and read
//! container logs. They sit behind [`KubeApi`]; [`KubeClient`] implements it
//! over the REST API with reqwest.

#[cfg(test)]
pub mod fake;
mod http;
pub mod job;
mod wait;

pub use http::KubeClient;
pub use wait::{WaitError, wait_for_pod};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by the Kubernetes API layer
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("kubernetes request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("kubernetes API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode kubernetes response: {0}")]
    Decode(String),

    #[error("kubernetes client configuration: {0}")]
    Config(String),
}

/// Phase of a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateTerminated {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub terminated: Option<ContainerStateTerminated>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerStatus {
    pub fn exit_code(&self) -> Option<i32> {
        self.state.terminated.as_ref().map(|t| t.exit_code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// The parts of a Pod the executor reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Statuses of init containers followed by regular containers
    pub fn all_container_statuses(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.status
            .init_container_statuses
            .iter()
            .chain(self.status.container_statuses.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
    Bookmark,
}

/// One event of a watch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: serde_json::Value,
}

impl WatchEvent {
    /// Decodes the event object when it is a Pod
    pub fn pod(&self) -> Option<Pod> {
        if self.object.get("kind").and_then(|k| k.as_str()) != Some("Pod") {
            return None;
        }
        serde_json::from_value(self.object.clone()).ok()
    }
}

/// Kubernetes operations used by the Kubernetes runner
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_job(&self, namespace: &str, job: &serde_json::Value) -> Result<(), KubeError>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    async fn create_secret(
        &self,
        namespace: &str,
        secret: &serde_json::Value,
    ) -> Result<(), KubeError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    async fn create_pvc(&self, namespace: &str, pvc: &serde_json::Value) -> Result<(), KubeError>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), KubeError>;

    /// Opens a watch on pods matching `label_selector`
    ///
    /// Events arrive on the returned channel; it closes when the stream ends.
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<WatchEvent>, KubeError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, KubeError>;
}

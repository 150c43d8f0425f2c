//! Job domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A queued unit of work handed out by the control plane
///
/// Structure shared between the control plane (enqueues) and the executor
/// (dequeues and runs). Read-only once dequeued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Build ID; every status update refers to it
    pub id: i64,
    pub queue: String,
    /// Repository name, e.g. `github.com/acme/app`
    pub repository: String,
    pub commit: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Token scoped to this job for control-plane calls
    pub access_token: String,
    #[serde(default)]
    pub priority: i32,
    /// Raw contents of the repository's build-config file
    #[serde(default)]
    pub config: Option<String>,
    /// Registry credentials overriding the executor-wide defaults
    #[serde(default)]
    pub docker_auth_config: Option<DockerAuthConfig>,
    /// Files to place in the workspace before any step runs
    #[serde(default)]
    pub workspace_files: Vec<WorkspaceFile>,
}

impl Job {
    /// Human readable reference used in logs (`repo@commit`)
    pub fn reference(&self) -> String {
        format!("{}@{}", self.repository, self.commit)
    }
}

/// Docker registry credentials in the layout of `~/.docker/config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuthConfig {
    pub auths: BTreeMap<String, DockerAuthEntry>,
}

impl DockerAuthConfig {
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }
}

/// Credentials for one registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuthEntry {
    /// base64 of `user:password`
    pub auth: String,
}

/// A file to materialize in the job workspace
///
/// Either `content` is inline, or `bucket`/`key` point into the control
/// plane's file store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFile {
    /// Path relative to the workspace root
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

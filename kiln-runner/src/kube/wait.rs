//! Waiting for a Job's pod to finish

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{KubeApi, Pod, PodPhase, WatchEventType};

/// Why waiting for a pod ended without success
#[derive(Debug, Error)]
pub enum WaitError {
    /// The watch itself failed; nothing is known about the pod
    #[error("{0}")]
    Plumbing(String),

    /// The pod ran and ended unsuccessfully
    #[error("{reason}")]
    PodFailed { pod: Box<Pod>, reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl WaitError {
    /// The pod, when the failure came from the pod itself
    pub fn pod(&self) -> Option<&Pod> {
        match self {
            WaitError::PodFailed { pod, .. } => Some(pod),
            _ => None,
        }
    }
}

/// Watches the pods of `job_name` until one reaches a terminal phase
///
/// Returns the pod when it succeeded. `ERROR` events and objects that are
/// not pods are skipped.
pub async fn wait_for_pod(
    api: &dyn KubeApi,
    cancel: &CancellationToken,
    namespace: &str,
    job_name: &str,
) -> Result<Pod, WaitError> {
    let selector = format!("job-name={}", job_name);
    let mut events = api
        .watch_pods(namespace, &selector)
        .await
        .map_err(|e| WaitError::Plumbing(format!("watching pod: {}", e)))?;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
        };

        let Some(event) = event else {
            return Err(WaitError::Plumbing(
                "watching pod: watch closed before the pod finished".to_string(),
            ));
        };

        match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => {}
            WatchEventType::Error => {
                debug!("Skipping error event while watching {}: {}", job_name, event.object);
                continue;
            }
            _ => continue,
        }

        let Some(pod) = event.pod() else {
            debug!("Skipping unexpected object while watching {}", job_name);
            continue;
        };

        debug!(
            "Pod {} of job {} is {:?}",
            pod.metadata.name, job_name, pod.status.phase
        );

        match pod.status.phase {
            PodPhase::Succeeded => return Ok(pod),
            PodPhase::Failed => {
                return Err(WaitError::PodFailed {
                    pod: Box::new(pod),
                    reason: "pod failed".to_string(),
                });
            }
            PodPhase::Pending if pod.metadata.deletion_timestamp.is_some() => {
                return Err(WaitError::PodFailed {
                    pod: Box::new(pod),
                    reason: "deleted by scheduler: pod could not be scheduled".to_string(),
                });
            }
            _ => {}
        }
    }
}

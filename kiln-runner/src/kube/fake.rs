//! Recording [`KubeApi`] used by tests

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{KubeApi, KubeError, WatchEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeCall {
    CreateJob(String),
    DeleteJob(String),
    CreateSecret(String),
    DeleteSecret(String),
    CreatePvc(String),
    DeletePvc(String),
    WatchPods(String),
    PodLogs(String, String),
}

/// Builds a watch event carrying a pod
pub fn pod_event(event_type: &str, name: &str, phase: &str, deleting: bool) -> WatchEvent {
    let mut metadata = json!({ "name": name });
    if deleting {
        metadata["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
    }
    serde_json::from_value(json!({
        "type": event_type,
        "object": {
            "kind": "Pod",
            "metadata": metadata,
            "status": { "phase": phase }
        }
    }))
    .unwrap()
}

/// Records calls and replays scripted watch streams
#[derive(Default)]
pub struct FakeKubeApi {
    calls: Mutex<Vec<KubeCall>>,
    jobs: Mutex<Vec<Value>>,
    secrets: Mutex<Vec<Value>>,
    pvcs: Mutex<Vec<Value>>,
    watches: Mutex<VecDeque<Vec<WatchEvent>>>,
    open_senders: Mutex<Vec<mpsc::Sender<WatchEvent>>>,
    failing: Mutex<HashSet<&'static str>>,
    hold_open: Mutex<bool>,
}

impl FakeKubeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the events of the next watch call
    pub fn push_watch(&self, events: Vec<WatchEvent>) {
        self.watches.lock().unwrap().push_back(events);
    }

    pub fn fail_watch(&self) {
        self.failing.lock().unwrap().insert("watch");
    }

    pub fn fail_delete_job(&self) {
        self.failing.lock().unwrap().insert("delete_job");
    }

    /// Keeps watch streams open after their scripted events
    pub fn hold_watch_open(&self) {
        *self.hold_open.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<KubeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn jobs(&self) -> Vec<Value> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn secrets(&self) -> Vec<Value> {
        self.secrets.lock().unwrap().clone()
    }

    pub fn pvcs(&self) -> Vec<Value> {
        self.pvcs.lock().unwrap().clone()
    }

    fn record(&self, call: KubeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, op: &str) -> bool {
        self.failing.lock().unwrap().contains(op)
    }
}

fn name_of(object: &Value) -> String {
    object["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl KubeApi for FakeKubeApi {
    async fn create_job(&self, _namespace: &str, job: &Value) -> Result<(), KubeError> {
        self.record(KubeCall::CreateJob(name_of(job)));
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        self.record(KubeCall::DeleteJob(name.to_string()));
        if self.fails("delete_job") {
            return Err(KubeError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn create_secret(&self, _namespace: &str, secret: &Value) -> Result<(), KubeError> {
        self.record(KubeCall::CreateSecret(name_of(secret)));
        self.secrets.lock().unwrap().push(secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        self.record(KubeCall::DeleteSecret(name.to_string()));
        Ok(())
    }

    async fn create_pvc(&self, _namespace: &str, pvc: &Value) -> Result<(), KubeError> {
        self.record(KubeCall::CreatePvc(name_of(pvc)));
        self.pvcs.lock().unwrap().push(pvc.clone());
        Ok(())
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<(), KubeError> {
        self.record(KubeCall::DeletePvc(name.to_string()));
        Ok(())
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<WatchEvent>, KubeError> {
        self.record(KubeCall::WatchPods(label_selector.to_string()));
        if self.fails("watch") {
            return Err(KubeError::Api {
                status: 403,
                message: "forbidden".to_string(),
            });
        }

        let events = self.watches.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        if *self.hold_open.lock().unwrap() {
            self.open_senders.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, KubeError> {
        self.record(KubeCall::PodLogs(pod.to_string(), container.to_string()));
        Ok(format!("log of {}\n", container))
    }
}

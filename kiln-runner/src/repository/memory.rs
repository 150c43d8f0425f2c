//! In-memory BuildRepository used by tests

use anyhow::Result;
use async_trait::async_trait;
use kiln_core::domain::build::Build;
use kiln_core::domain::job::Job;
use kiln_core::domain::log::ExecutionLogEntry;
use kiln_core::domain::task::Task;
use kiln_core::dto::build::BuildUpdate;
use kiln_core::dto::task::TaskUpdate;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use super::BuildRepository;

/// One recorded repository call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Dequeue(String),
    UpdateBuild(i64, BuildUpdate),
    CreateTasks(i64, Vec<String>),
    UpdateTask(i64, TaskUpdate),
    ListBuildTasks(i64),
    ListActiveBuilds,
    SendLogs(i64, Vec<ExecutionLogEntry>),
    GetFile(String, String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    jobs: VecDeque<Job>,
    active: Vec<Build>,
    tasks: HashMap<i64, Vec<Task>>,
    files: HashMap<(String, String), Vec<u8>>,
}

/// Records every call and serves canned data
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
    next_task_id: Arc<AtomicI64>,
    fail_updates: Arc<AtomicBool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            next_task_id: Arc::new(AtomicI64::new(100)),
            ..Default::default()
        }
    }

    pub fn push_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.push_back(job);
    }

    pub fn add_active_build(&self, build: Build) {
        self.state.lock().unwrap().active.push(build);
    }

    pub fn add_task(&self, task: Task) {
        self.state
            .lock()
            .unwrap()
            .tasks
            .entry(task.build_id)
            .or_default()
            .push(task);
    }

    pub fn add_file(&self, bucket: &str, key: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((bucket.to_string(), key.to_string()), content.to_vec());
    }

    /// Makes every update_build call fail
    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn build_updates(&self, build_id: i64) -> Vec<BuildUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UpdateBuild(id, update) if id == build_id => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn task_updates(&self, task_id: i64) -> Vec<TaskUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UpdateTask(id, update) if id == task_id => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn sent_logs(&self, build_id: i64) -> Vec<ExecutionLogEntry> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendLogs(id, entries) if id == build_id => Some(entries),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl BuildRepository for MemoryRepository {
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        self.record(Call::Dequeue(queue.to_string()));
        Ok(self.state.lock().unwrap().jobs.pop_front())
    }

    async fn update_build(&self, build_id: i64, update: BuildUpdate) -> Result<()> {
        self.record(Call::UpdateBuild(build_id, update));
        if self.fail_updates.load(Ordering::SeqCst) {
            anyhow::bail!("update of build {} rejected", build_id);
        }
        Ok(())
    }

    async fn create_tasks(&self, build_id: i64, labels: Vec<String>) -> Result<Vec<i64>> {
        self.record(Call::CreateTasks(build_id, labels.clone()));
        Ok(labels
            .iter()
            .map(|_| self.next_task_id.fetch_add(1, Ordering::SeqCst))
            .collect())
    }

    async fn update_task(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        self.record(Call::UpdateTask(task_id, update));
        Ok(())
    }

    async fn list_build_tasks(&self, build_id: i64) -> Result<Vec<Task>> {
        self.record(Call::ListBuildTasks(build_id));
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(&build_id).cloned().unwrap_or_default())
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        self.record(Call::ListActiveBuilds);
        Ok(self.state.lock().unwrap().active.clone())
    }

    async fn send_logs(&self, build_id: i64, entries: Vec<ExecutionLogEntry>) -> Result<()> {
        self.record(Call::SendLogs(build_id, entries));
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.record(Call::GetFile(bucket.to_string(), key.to_string()));
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("file {}/{} not found", bucket, key))
    }

    fn for_job(&self, _access_token: &str) -> Arc<dyn BuildRepository> {
        Arc::new(self.clone())
    }
}

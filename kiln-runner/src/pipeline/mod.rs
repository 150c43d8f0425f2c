//! Build pipelines
//!
//! A pipeline takes one dequeued job from its build config to a finished
//! set of tasks:
//! 1. Parse the build config and plan the steps (checkout first)
//! 2. Prepare the workspace: scripts and workspace files
//! 3. Create one control-plane task per step
//! 4. Set up the runner, run the steps, tear the runner down
//!
//! Task updates follow [`TaskState`]; the skip marker left by a step decides
//! which of the following steps are skipped.

mod config;
mod steps;
mod workspace;

pub use config::BuildConfig;
pub use steps::{
    CHECKOUT_STEP_KEY, PlannedStep, REPOSITORY_DIR, checkout_commands, clone_url, plan,
};
pub use workspace::Workspace;

use chrono::Utc;
use kiln_core::domain::job::Job;
use kiln_core::domain::task::{TaskState, TransitionError};
use kiln_core::dto::task::TaskUpdate;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Command, next_step};
use crate::config::Config;
use crate::kube::KubeApi;
use crate::repository::BuildRepository;
use crate::runner::{Runner, RunnerContext, RunnerError, Spec};
use crate::service::LogBufferService;

/// Why a pipeline did not succeed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid build config: {0}")]
    Config(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("step {key} failed: {source}")]
    Step {
        key: String,
        #[source]
        source: RunnerError,
    },

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("cancelled")]
    Cancelled,
}

/// Everything needed to run one build
pub struct Pipeline {
    config: Arc<Config>,
    job: Job,
    command: Arc<dyn Command>,
    logs: Arc<dyn LogBufferService>,
    /// Repository scoped to the job's token
    repository: Arc<dyn BuildRepository>,
    kube: Option<Arc<dyn KubeApi>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        job: Job,
        command: Arc<dyn Command>,
        logs: Arc<dyn LogBufferService>,
        repository: Arc<dyn BuildRepository>,
        kube: Option<Arc<dyn KubeApi>>,
    ) -> Self {
        Self {
            config,
            job,
            command,
            logs,
            repository,
            kube,
        }
    }

    /// Runs the build to completion
    ///
    /// On failure every task that has not ended is failed, except when the
    /// build was cancelled: cleanup owns the final state then.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let build = self.build_config()?;
        let steps = plan(&self.config, &self.job, &build)
            .map_err(|e| PipelineError::Setup(format!("{:#}", e)))?;

        let workspace = Workspace::create(&self.config.workspace_root)
            .await
            .map_err(|e| PipelineError::Setup(format!("{:#}", e)))?;

        let result = self.run_in(&workspace, &steps, cancel).await;
        workspace.close();
        result
    }

    fn build_config(&self) -> Result<BuildConfig, PipelineError> {
        let parsed = match self.job.config.as_deref() {
            Some(raw) => BuildConfig::parse(raw),
            None => Err("missing build config".to_string()),
        };

        parsed.map_err(|message| {
            warn!("Build {} has an unusable config: {}", self.job.id, message);
            self.logs
                .record("setup.config", vec![".kiln.json".to_string()], &message, 1);
            PipelineError::Config(message)
        })
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        steps: &[PlannedStep],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let ctx = RunnerContext {
            config: Arc::clone(&self.config),
            job: self.job.clone(),
            workspace: workspace.path().to_path_buf(),
            command: Arc::clone(&self.command),
            logs: Arc::clone(&self.logs),
            repository: Arc::clone(&self.repository),
            kube: self.kube.clone(),
        };
        let mut runner = Runner::for_backend(self.config.backend(), ctx)
            .map_err(|e| PipelineError::Setup(e.to_string()))?;

        let specs: Vec<_> = steps.iter().map(|s| s.spec.clone()).collect();
        workspace
            .write_scripts(&specs)
            .await
            .map_err(|e| PipelineError::Setup(format!("{:#}", e)))?;
        if !runner.runs_steps_together() {
            workspace
                .write_files(&self.job.workspace_files, self.repository.as_ref())
                .await
                .map_err(|e| PipelineError::Setup(format!("{:#}", e)))?;
        }

        let labels = specs.iter().map(|s| s.key.clone()).collect();
        let ids = self
            .repository
            .create_tasks(self.job.id, labels)
            .await
            .map_err(|e| PipelineError::ControlPlane(format!("{:#}", e)))?;
        let mut tasks: Vec<TaskState> = ids
            .into_iter()
            .map(|id| TaskState::new(id, self.job.id))
            .collect();

        let result = match runner.setup(cancel).await {
            Ok(()) if runner.runs_steps_together() => {
                self.run_together(&mut runner, steps, &mut tasks, cancel).await
            }
            Ok(()) => {
                self.run_each(&mut runner, steps, &mut tasks, workspace.path(), cancel)
                    .await
            }
            Err(RunnerError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::Setup(e.to_string())),
        };

        if let Err(e) = runner.teardown().await {
            warn!("Failed to tear down runner of build {}: {}", self.job.id, e);
        }

        if let Err(e) = &result {
            if !matches!(e, PipelineError::Cancelled) {
                self.fail_remaining(&mut tasks).await;
            }
        }
        result
    }

    /// Runs steps one at a time, honoring the skip marker
    async fn run_each(
        &self,
        runner: &mut Runner,
        steps: &[PlannedStep],
        tasks: &mut [TaskState],
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut i = 0;
        while i < steps.len() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let step = &steps[i];
            info!("Build {}: running {}", self.job.id, step.spec.key);
            self.transition(&mut tasks[i], |t| t.start(Utc::now())).await?;

            match runner.run(cancel, &Spec::single(step.spec.clone())).await {
                Ok(()) => {}
                Err(RunnerError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if step.allow_failure && e.is_job_failure() => {
                    warn!(
                        "Build {}: {} failed but is allowed to: {}",
                        self.job.id, step.spec.key, e
                    );
                    self.transition(&mut tasks[i], |t| t.warn()).await?;
                }
                Err(e) => {
                    self.transition(&mut tasks[i], |t| t.fail(Utc::now())).await?;
                    return Err(PipelineError::Step {
                        key: step.spec.key.clone(),
                        source: e,
                    });
                }
            }
            self.transition(&mut tasks[i], |t| t.succeed(Utc::now())).await?;
            i += 1;

            let next = match next_step(workspace) {
                Ok(next) => next,
                Err(e) => {
                    warn!("Build {}: ignoring unreadable skip marker: {}", self.job.id, e);
                    String::new()
                }
            };
            if next.is_empty() {
                continue;
            }

            let target = steps[i..]
                .iter()
                .position(|s| s.spec.key == next)
                .map(|offset| i + offset)
                .unwrap_or_else(|| {
                    warn!(
                        "Build {}: skip marker names unknown step {}, skipping the rest",
                        self.job.id, next
                    );
                    steps.len()
                });

            for task in &mut tasks[i..target] {
                debug!("Build {}: skipping task {}", self.job.id, task.id);
                self.transition(task, |t| t.start(Utc::now())).await?;
                self.transition(task, |t| t.skip()).await?;
                self.transition(task, |t| t.succeed(Utc::now())).await?;
            }
            i = target;
        }
        Ok(())
    }

    /// Hands every step to the runner at once
    async fn run_together(
        &self,
        runner: &mut Runner,
        steps: &[PlannedStep],
        tasks: &mut [TaskState],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for task in tasks.iter_mut() {
            self.transition(task, |t| t.start(Utc::now())).await?;
        }

        let spec = Spec {
            steps: steps.iter().map(|s| s.spec.clone()).collect(),
        };
        match runner.run(cancel, &spec).await {
            Ok(()) => {
                for task in tasks.iter_mut() {
                    self.transition(task, |t| t.succeed(Utc::now())).await?;
                }
                Ok(())
            }
            Err(RunnerError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::Step {
                key: format!("build.{}", self.job.id),
                source: e,
            }),
        }
    }

    /// Applies a task transition and reports it
    ///
    /// Rejected transitions are logged and not sent.
    async fn transition(
        &self,
        task: &mut TaskState,
        apply: impl FnOnce(&mut TaskState) -> Result<TaskUpdate, TransitionError>,
    ) -> Result<(), PipelineError> {
        let update = match apply(task) {
            Ok(update) => update,
            Err(e) => {
                warn!("Ignoring task transition: {}", e);
                return Ok(());
            }
        };

        self.repository
            .update_task(task.id, update)
            .await
            .map_err(|e| PipelineError::ControlPlane(format!("{:#}", e)))
    }

    async fn fail_remaining(&self, tasks: &mut [TaskState]) {
        for task in tasks.iter_mut().filter(|t| !t.is_ended()) {
            if let Err(e) = self.transition(task, |t| t.fail(Utc::now())).await {
                warn!("Failed to fail task {}: {}", task.id, e);
            }
        }
    }
}

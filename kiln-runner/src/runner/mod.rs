//! Sandbox runners
//!
//! A [`Runner`] owns the sandbox of exactly one build through a fixed
//! lifecycle: `setup`, one or more `run` calls, then `teardown`. Teardown is
//! always safe to call, whatever state setup or run left behind.
//!
//! Backends:
//! - [`ShellRunner`]: no isolation, scripts run on the host
//! - [`DockerRunner`]: one `docker run --rm` container per step
//! - [`FirecrackerRunner`]: one ignite microVM per build
//! - [`KubernetesRunner`]: Kubernetes Jobs, per step or in a single pod

mod auth;
mod cni;
mod docker;
mod firecracker;
mod kubernetes;
mod shell;

pub use docker::DockerRunner;
pub use firecracker::FirecrackerRunner;
pub use kubernetes::KubernetesRunner;
pub use shell::ShellRunner;

use kiln_core::domain::job::Job;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandError, CommandSpec};
use crate::config::{Backend, Config};
use crate::kube::KubeApi;
use crate::repository::BuildRepository;
use crate::service::LogBufferService;

/// One pipeline step as the runners see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    /// Log and task correlation key, e.g. `step.1.build`
    pub key: String,
    /// DNS-1123 safe form of the key
    pub name: String,
    pub image: String,
    /// Script path relative to the workspace root
    pub script_path: String,
    /// Working directory relative to the workspace root
    pub dir: String,
    pub env: Vec<(String, String)>,
    /// Environment holding credentials; kept out of manifests where possible
    pub secret_env: Vec<(String, String)>,
    /// Raw shell commands of the step
    pub commands: Vec<String>,
}

impl StepSpec {
    /// Script body run for the step; stops at the first failing command
    pub fn script(&self) -> String {
        let mut script = String::from("#!/bin/sh\nset -e\n");
        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }
        script
    }

    /// Plain and secret environment together
    pub fn all_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .chain(self.secret_env.iter())
            .cloned()
            .collect()
    }

    /// Credential values that must never reach a log
    pub fn secret_values(&self) -> impl Iterator<Item = String> + '_ {
        self.secret_env.iter().map(|(_, value)| value.clone())
    }
}

/// What a single `run` call executes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spec {
    pub steps: Vec<StepSpec>,
}

impl Spec {
    pub fn single(step: StepSpec) -> Self {
        Self { steps: vec![step] }
    }
}

/// Errors returned by runners
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The sandbox could not be provisioned
    #[error("setup failed: {0}")]
    Setup(String),

    /// A step command ran and failed
    #[error("step {key} failed: {source}")]
    Step {
        key: String,
        #[source]
        source: CommandError,
    },

    /// The pod or VM reported failure
    #[error("{0}")]
    Run(String),

    /// Plumbing failed (could not spawn, watch broke)
    #[error("infrastructure failure: {0}")]
    Infra(String),

    #[error("cancelled")]
    Cancelled,
}

impl RunnerError {
    /// Maps a command failure of `key` onto the runner taxonomy
    pub fn from_command(key: &str, err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => RunnerError::Cancelled,
            e if e.is_exit_failure() => RunnerError::Step {
                key: key.to_string(),
                source: e,
            },
            e => RunnerError::Infra(e.to_string()),
        }
    }

    /// True when the user's workload failed, as opposed to the platform
    pub fn is_job_failure(&self) -> bool {
        matches!(self, RunnerError::Step { .. } | RunnerError::Run(_))
    }
}

/// Dependencies handed to a runner for one build
#[derive(Clone)]
pub struct RunnerContext {
    pub config: Arc<Config>,
    pub job: Job,
    /// Workspace directory the pipeline prepared for the build
    pub workspace: PathBuf,
    pub command: Arc<dyn Command>,
    pub logs: Arc<dyn LogBufferService>,
    pub repository: Arc<dyn BuildRepository>,
    pub kube: Option<Arc<dyn KubeApi>>,
}

/// The sandbox of one build
pub enum Runner {
    Shell(ShellRunner),
    Docker(DockerRunner),
    Firecracker(FirecrackerRunner),
    Kubernetes(KubernetesRunner),
}

impl Runner {
    /// Builds the runner for the configured backend
    pub fn for_backend(backend: Backend, ctx: RunnerContext) -> Result<Self, RunnerError> {
        match backend {
            Backend::Shell => Ok(Runner::Shell(ShellRunner::new(ctx))),
            Backend::Docker => Ok(Runner::Docker(DockerRunner::new(ctx))),
            Backend::Firecracker => Ok(Runner::Firecracker(FirecrackerRunner::new(ctx))),
            Backend::Kubernetes => {
                let kube = ctx.kube.clone().ok_or_else(|| {
                    RunnerError::Setup("no Kubernetes client configured".to_string())
                })?;
                Ok(Runner::Kubernetes(KubernetesRunner::new(ctx, kube)))
            }
        }
    }

    /// Allocates the sandbox's ephemeral resources
    pub async fn setup(&mut self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        match self {
            Runner::Shell(r) => r.setup(),
            Runner::Docker(r) => r.setup(),
            Runner::Firecracker(r) => r.setup(cancel).await,
            Runner::Kubernetes(r) => r.setup(),
        }
    }

    /// Executes the steps of `spec` inside the sandbox
    pub async fn run(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        match self {
            Runner::Shell(r) => r.run(cancel, spec).await,
            Runner::Docker(r) => r.run(cancel, spec).await,
            Runner::Firecracker(r) => r.run(cancel, spec).await,
            Runner::Kubernetes(r) => r.run(cancel, spec).await,
        }
    }

    /// Releases everything setup allocated
    ///
    /// Secondary failures are logged; only losing track of the temp dir is
    /// returned.
    pub async fn teardown(&mut self) -> Result<(), RunnerError> {
        match self {
            Runner::Shell(r) => r.teardown(),
            Runner::Docker(r) => r.teardown(),
            Runner::Firecracker(r) => r.teardown().await,
            Runner::Kubernetes(r) => r.teardown().await,
        }
    }

    /// Path of the runner's temp dir; empty when the backend has none
    pub fn temp_dir(&self) -> &Path {
        match self {
            Runner::Shell(r) => r.temp_dir(),
            Runner::Docker(r) => r.temp_dir(),
            Runner::Firecracker(r) => r.temp_dir(),
            Runner::Kubernetes(r) => r.temp_dir(),
        }
    }

    /// Whether a single `run` call must receive every step of the build
    pub fn runs_steps_together(&self) -> bool {
        match self {
            Runner::Kubernetes(r) => r.single_job_pod(),
            _ => false,
        }
    }
}

/// Address of the executor host as seen from inside the sandbox
pub fn sandbox_host(config: &Config) -> Option<String> {
    match config.backend() {
        Backend::Docker => Some("host.docker.internal".to_string()),
        Backend::Firecracker => Some(config.firecracker.gateway()),
        Backend::Shell | Backend::Kubernetes => None,
    }
}

/// Creates the temp dir of a runner
fn create_temp_dir(prefix: &str) -> Result<(tempfile::TempDir, PathBuf), RunnerError> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|e| RunnerError::Setup(format!("creating temp dir: {}", e)))?;
    let path = dir.path().to_path_buf();
    Ok((dir, path))
}

/// Removes a runner's temp dir if it still exists
fn remove_temp_dir(dir: &mut Option<tempfile::TempDir>) -> Result<(), RunnerError> {
    match dir.take() {
        Some(dir) => dir
            .close()
            .map_err(|e| RunnerError::Infra(format!("removing temp dir: {}", e))),
        None => Ok(()),
    }
}

/// Joins a relative directory onto an in-sandbox mount point
fn sandbox_path(mount: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() || relative == "." {
        mount.to_string()
    } else {
        format!("{}/{}", mount.trim_end_matches('/'), relative)
    }
}

/// Runs command specs one after another, stopping at the first failure
async fn run_specs(
    command: &dyn Command,
    cancel: &CancellationToken,
    logs: &dyn LogBufferService,
    specs: Vec<CommandSpec>,
) -> Result<(), RunnerError> {
    for spec in specs {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        command
            .run(cancel, logs, &spec)
            .await
            .map_err(|e| RunnerError::from_command(&spec.key, e))?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::command::fake::FakeCommand;
    use crate::repository::memory::MemoryRepository;
    use crate::service::InMemoryLogBuffer;

    pub fn job() -> Job {
        Job {
            id: 42,
            queue: "default".to_string(),
            repository: "github.com/acme/app".to_string(),
            commit: "deadbeef".to_string(),
            branch: Some("main".to_string()),
            tag: None,
            access_token: "job-token".to_string(),
            priority: 0,
            config: None,
            docker_auth_config: None,
            workspace_files: Vec::new(),
        }
    }

    pub fn step(key: &str) -> StepSpec {
        StepSpec {
            key: key.to_string(),
            name: key.replace('.', "-"),
            image: "alpine:3.18".to_string(),
            script_path: format!(".kiln/{}.sh", key),
            dir: "repository".to_string(),
            env: vec![("CI".to_string(), "true".to_string())],
            secret_env: Vec::new(),
            commands: vec!["echo hello".to_string()],
        }
    }

    pub fn context(config: Config, command: Arc<FakeCommand>) -> RunnerContext {
        RunnerContext {
            config: Arc::new(config),
            job: job(),
            workspace: PathBuf::from("/tmp/kiln-ws"),
            command,
            logs: Arc::new(InMemoryLogBuffer::new()),
            repository: Arc::new(MemoryRepository::new()),
            kube: None,
        }
    }
}

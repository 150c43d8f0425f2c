//! Docker runner
//!
//! Each step runs in a fresh `docker run --rm` container with the workspace
//! bind-mounted at `/data`.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::auth::{effective_auth, write_docker_auth};
use super::firecracker::sanitize_image;
use super::{
    RunnerContext, RunnerError, Spec, StepSpec, create_temp_dir, remove_temp_dir, run_specs,
    sandbox_path,
};
use crate::command::CommandSpec;

/// Mount point of the workspace inside step containers
const WORKSPACE_MOUNT: &str = "/data";

pub struct DockerRunner {
    ctx: RunnerContext,
    temp: Option<TempDir>,
    temp_path: PathBuf,
    /// Directory passed to `docker --config`
    docker_config: Option<PathBuf>,
}

impl DockerRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self {
            ctx,
            temp: None,
            temp_path: PathBuf::new(),
            docker_config: None,
        }
    }

    pub fn setup(&mut self) -> Result<(), RunnerError> {
        let (dir, path) = create_temp_dir("kiln-docker-")?;
        self.temp = Some(dir);
        self.temp_path = path;

        let auth = effective_auth(
            self.ctx.job.docker_auth_config.as_ref(),
            self.ctx.config.docker.auth_config.as_ref(),
        );
        if let Some(auth) = auth {
            let dir = write_docker_auth(&self.temp_path, auth)
                .map_err(|e| RunnerError::Setup(format!("writing docker auth config: {}", e)))?;
            debug!("Wrote docker auth config to {}", dir.display());
            self.docker_config = Some(dir);
        }

        Ok(())
    }

    pub async fn run(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        let specs = spec.steps.iter().map(|step| self.command_for(step)).collect();
        run_specs(self.ctx.command.as_ref(), cancel, self.ctx.logs.as_ref(), specs).await
    }

    pub fn teardown(&mut self) -> Result<(), RunnerError> {
        self.docker_config = None;
        remove_temp_dir(&mut self.temp)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_path
    }

    fn command_for(&self, step: &StepSpec) -> CommandSpec {
        let options = &self.ctx.config.docker;
        let mut argv = vec!["docker".to_string()];

        if let Some(dir) = &self.docker_config {
            argv.push("--config".to_string());
            argv.push(dir.to_string_lossy().into_owned());
        }

        argv.extend([
            "run".to_string(),
            "--rm".to_string(),
            "--cpus".to_string(),
            options.cpus.clone(),
            "--memory".to_string(),
            options.memory.clone(),
        ]);

        if options.add_host_gateway {
            argv.push("--add-host=host.docker.internal:host-gateway".to_string());
        }

        argv.extend([
            "-v".to_string(),
            format!("{}:{}", self.ctx.workspace.display(), WORKSPACE_MOUNT),
            "-w".to_string(),
            sandbox_path(WORKSPACE_MOUNT, &step.dir),
        ]);

        for (key, value) in &step.env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        // Secrets are forwarded by name from the docker CLI's environment
        for (key, _) in &step.secret_env {
            argv.push("-e".to_string());
            argv.push(key.clone());
        }

        argv.extend([
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
            sanitize_image(&step.image),
            sandbox_path(WORKSPACE_MOUNT, &step.script_path),
        ]);

        CommandSpec::new(step.key.clone(), argv)
            .with_env(step.secret_env.clone())
            .with_secrets(step.secret_values())
            .with_operation("docker.run")
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, step};
    use super::*;
    use crate::command::fake::FakeCommand;
    use crate::config::Config;
    use crate::service::{InMemoryLogBuffer, LogBufferService};
    use kiln_core::domain::job::{DockerAuthConfig, DockerAuthEntry};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_docker_run_argv() {
        let fake = Arc::new(FakeCommand::new());
        let mut runner = DockerRunner::new(context(Config::default(), fake.clone()));
        runner.setup().unwrap();

        runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap();

        assert_eq!(
            fake.argvs()[0],
            vec![
                "docker",
                "run",
                "--rm",
                "--cpus",
                "4",
                "--memory",
                "12g",
                "--add-host=host.docker.internal:host-gateway",
                "-v",
                "/tmp/kiln-ws:/data",
                "-w",
                "/data/repository",
                "-e",
                "CI=true",
                "--entrypoint",
                "/bin/sh",
                "alpine:3.18",
                "/data/.kiln/step.1.build.sh",
            ]
        );

        runner.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_auth_config_adds_config_flag() {
        let fake = Arc::new(FakeCommand::new());
        let mut ctx = context(Config::default(), fake.clone());

        let mut auths = BTreeMap::new();
        auths.insert(
            "registry.example.com".to_string(),
            DockerAuthEntry {
                auth: "dXNlcjpwYXNz".to_string(),
            },
        );
        ctx.job.docker_auth_config = Some(DockerAuthConfig { auths });

        let mut runner = DockerRunner::new(ctx);
        runner.setup().unwrap();

        let mut digest_step = step("step.1.build");
        digest_step.image = format!("alpine:3.18@sha256:{}", "a".repeat(64));
        runner
            .run(&CancellationToken::new(), &Spec::single(digest_step))
            .await
            .unwrap();

        let argv = &fake.argvs()[0];
        assert_eq!(argv[1], "--config");
        let config_dir = PathBuf::from(&argv[2]);
        assert!(config_dir.starts_with(runner.temp_dir()));
        assert!(config_dir.join("config.json").exists());
        assert!(argv.contains(&"alpine:3.18".to_string()));

        runner.teardown().unwrap();
        assert!(!config_dir.exists());
    }

    #[tokio::test]
    async fn test_host_gateway_is_optional() {
        let fake = Arc::new(FakeCommand::new());
        let mut config = Config::default();
        config.docker.add_host_gateway = false;

        let mut runner = DockerRunner::new(context(config, fake.clone()));
        runner.setup().unwrap();
        let mut root_step = step("step.0.checkout");
        root_step.dir = String::new();
        runner
            .run(&CancellationToken::new(), &Spec::single(root_step))
            .await
            .unwrap();

        let argv = &fake.argvs()[0];
        assert!(!argv.iter().any(|a| a.starts_with("--add-host")));
        let w = argv.iter().position(|a| a == "-w").unwrap();
        assert_eq!(argv[w + 1], "/data");

        runner.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_secret_env_is_passed_by_name() {
        let fake = Arc::new(FakeCommand::new());
        let logs = Arc::new(InMemoryLogBuffer::new());
        let mut ctx = context(Config::default(), fake.clone());
        ctx.logs = logs.clone();

        let mut runner = DockerRunner::new(ctx);
        runner.setup().unwrap();
        let mut checkout = step("step.0.checkout");
        checkout.secret_env = vec![("KILN_CLONE_TOKEN".to_string(), "job-token".to_string())];
        runner
            .run(&CancellationToken::new(), &Spec::single(checkout))
            .await
            .unwrap();

        let call = &fake.calls()[0];
        assert!(call.command.contains(&"KILN_CLONE_TOKEN".to_string()));
        assert!(call.command.iter().all(|a| !a.contains("job-token")));
        assert_eq!(
            call.env,
            vec![("KILN_CLONE_TOKEN".to_string(), "job-token".to_string())]
        );

        let entries = logs.drain();
        assert!(entries[0].command.iter().all(|a| !a.contains("job-token")));

        runner.teardown().unwrap();
    }
}

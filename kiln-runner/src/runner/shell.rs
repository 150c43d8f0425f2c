//! Shell runner
//!
//! No isolation: step scripts run directly on the host. Meant for local
//! development.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    RunnerContext, RunnerError, Spec, create_temp_dir, remove_temp_dir, run_specs,
};
use crate::command::CommandSpec;

pub struct ShellRunner {
    ctx: RunnerContext,
    temp: Option<TempDir>,
    temp_path: PathBuf,
}

impl ShellRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self {
            ctx,
            temp: None,
            temp_path: PathBuf::new(),
        }
    }

    pub fn setup(&mut self) -> Result<(), RunnerError> {
        let (dir, path) = create_temp_dir("kiln-shell-")?;
        debug!("Shell runner for build {} using {}", self.ctx.job.id, path.display());
        self.temp = Some(dir);
        self.temp_path = path;
        Ok(())
    }

    pub async fn run(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        let specs = spec.steps.iter().map(|step| self.command_for(step)).collect();
        run_specs(self.ctx.command.as_ref(), cancel, self.ctx.logs.as_ref(), specs).await
    }

    pub fn teardown(&mut self) -> Result<(), RunnerError> {
        remove_temp_dir(&mut self.temp)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_path
    }

    fn command_for(&self, step: &super::StepSpec) -> CommandSpec {
        let workspace = &self.ctx.workspace;
        let script = workspace.join(&step.script_path);

        CommandSpec::new(
            step.key.clone(),
            vec!["/bin/sh".to_string(), script.to_string_lossy().into_owned()],
        )
        .with_dir(workspace.join(&step.dir))
        .with_env(step.all_env())
        .with_secrets(step.secret_values())
        .with_operation("shell.run")
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, step};
    use super::*;
    use crate::command::fake::FakeCommand;
    use crate::config::Config;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_script_on_host() {
        let fake = Arc::new(FakeCommand::new());
        let mut runner = ShellRunner::new(context(Config::default(), fake.clone()));
        runner.setup().unwrap();

        runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].command,
            vec!["/bin/sh", "/tmp/kiln-ws/.kiln/step.1.build.sh"]
        );
        assert_eq!(calls[0].dir, Some(PathBuf::from("/tmp/kiln-ws/repository")));
        assert_eq!(calls[0].key, "step.1.build");

        runner.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_step_failure_is_job_failure() {
        let fake = Arc::new(FakeCommand::new());
        fake.fail_when("step.1.build", 2);
        let mut runner = ShellRunner::new(context(Config::default(), fake));
        runner.setup().unwrap();

        let err = runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap_err();
        assert!(err.is_job_failure());

        runner.teardown().unwrap();
    }

    #[test]
    fn test_teardown_without_setup_is_safe() {
        let mut runner = ShellRunner::new(context(Config::default(), Arc::new(FakeCommand::new())));
        runner.teardown().unwrap();
        assert_eq!(runner.temp_dir(), Path::new(""));
    }
}

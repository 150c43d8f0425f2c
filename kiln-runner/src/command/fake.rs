//! Recording [`Command`] used by tests

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Command, CommandError, CommandSpec};
use crate::service::LogBufferService;

type Hook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

/// Records every spec instead of running it
///
/// Commands succeed unless their joined argv contains a needle registered
/// with [`FakeCommand::fail_when`].
#[derive(Default)]
pub struct FakeCommand {
    calls: Mutex<Vec<CommandSpec>>,
    failures: Mutex<Vec<(String, i32)>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl FakeCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose argv contains `needle` exit with `code`
    pub fn fail_when(&self, needle: &str, code: i32) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), code));
    }

    /// Runs `hook` whenever a command whose argv contains `needle` executes
    pub fn on(&self, needle: &str, hook: impl Fn(&CommandSpec) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((needle.to_string(), Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn argvs(&self) -> Vec<Vec<String>> {
        self.calls().into_iter().map(|c| c.command).collect()
    }
}

#[async_trait]
impl Command for FakeCommand {
    async fn run(
        &self,
        cancel: &CancellationToken,
        logs: &dyn LogBufferService,
        spec: &CommandSpec,
    ) -> Result<(), CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        let joined = spec.command.join(" ");

        for (needle, hook) in self.hooks.lock().unwrap().iter() {
            if joined.contains(needle.as_str()) {
                hook(spec);
            }
        }

        let id = logs.open(&spec.key, spec.redacted_command());
        if cancel.is_cancelled() {
            logs.finalize(id, -1);
            return Err(CommandError::Cancelled {
                key: spec.key.clone(),
            });
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, code)| *code);

        match failure {
            Some(code) => {
                logs.finalize(id, code);
                Err(CommandError::NonZeroExit {
                    key: spec.key.clone(),
                    code,
                })
            }
            None => {
                logs.finalize(id, 0);
                Ok(())
            }
        }
    }
}

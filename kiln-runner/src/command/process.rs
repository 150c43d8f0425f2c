//! Host process implementation of [`Command`]

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::{Command, CommandError, CommandSpec};
use crate::service::{EntryId, LogBufferService};

/// Exit code recorded when a command never produced one
const NO_EXIT_CODE: i32 = -1;

/// Spawns host processes with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessCommand;

impl ProcessCommand {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Command for ProcessCommand {
    async fn run(
        &self,
        cancel: &CancellationToken,
        logs: &dyn LogBufferService,
        spec: &CommandSpec,
    ) -> Result<(), CommandError> {
        let span = info_span!("command", operation = %spec.operation, key = %spec.key);
        run_process(cancel, logs, spec).instrument(span).await
    }
}

async fn run_process(
    cancel: &CancellationToken,
    logs: &dyn LogBufferService,
    spec: &CommandSpec,
) -> Result<(), CommandError> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(CommandError::Empty {
            key: spec.key.clone(),
        });
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    debug!("Running {:?}", spec.redacted_command());
    let id = logs.open(&spec.key, spec.redacted_command());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            logs.append(id, &format!("stderr: failed to start {}: {}", program, e));
            logs.finalize(id, NO_EXIT_CODE);
            return Err(CommandError::Spawn {
                program: program.clone(),
                source: e,
            });
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let outcome = {
        let pump = async {
            tokio::join!(
                forward_lines(stdout, logs, id, "stdout"),
                forward_lines(stderr, logs, id, "stderr")
            );
            child.wait().await
        };

        tokio::select! {
            status = pump => Some(status),
            _ = cancel.cancelled() => None,
        }
    };

    let status = match outcome {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {} after cancellation: {}", program, e);
            }
            logs.append(id, "stderr: cancelled");
            logs.finalize(id, NO_EXIT_CODE);
            return Err(CommandError::Cancelled {
                key: spec.key.clone(),
            });
        }
    };

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            logs.finalize(id, NO_EXIT_CODE);
            return Err(CommandError::Io(e));
        }
    };

    match status.code() {
        Some(0) => {
            logs.finalize(id, 0);
            Ok(())
        }
        Some(code) => {
            logs.finalize(id, code);
            Err(CommandError::NonZeroExit {
                key: spec.key.clone(),
                code,
            })
        }
        None => {
            logs.finalize(id, NO_EXIT_CODE);
            Err(CommandError::Signal {
                key: spec.key.clone(),
            })
        }
    }
}

async fn forward_lines<R>(
    stream: Option<R>,
    logs: &dyn LogBufferService,
    id: EntryId,
    prefix: &str,
) where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.append(id, &format!("{}: {}", prefix, line)),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {}: {}", prefix, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryLogBuffer;
    use std::time::Duration;

    fn sh(key: &str, script: &str) -> CommandSpec {
        CommandSpec::new(key, vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_captures_prefixed_output() {
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();

        ProcessCommand::new()
            .run(&cancel, &logs, &sh("echo", "echo hello; echo oops >&2"))
            .await
            .unwrap();

        let entries = logs.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exit_code, Some(0));
        assert!(entries[0].out.contains("stdout: hello"));
        assert!(entries[0].out.contains("stderr: oops"));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();

        let err = ProcessCommand::new()
            .run(&cancel, &logs, &sh("fail", "exit 3"))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::NonZeroExit { code: 3, .. }));
        assert_eq!(logs.drain()[0].exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_env_and_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();

        let spec = sh("env", "echo $KILN_TEST_VALUE; pwd")
            .with_dir(dir.path())
            .with_env(vec![("KILN_TEST_VALUE".into(), "forty-two".into())]);
        ProcessCommand::new().run(&cancel, &logs, &spec).await.unwrap();

        let out = &logs.drain()[0].out;
        assert!(out.contains("stdout: forty-two"));
        let name = dir.path().file_name().unwrap().to_str().unwrap();
        assert!(out.contains(name));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();
        let spec = CommandSpec::new("missing", vec!["/definitely/not/a/program".into()]);

        let err = ProcessCommand::new()
            .run(&cancel, &logs, &spec)
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(logs.drain()[0].exit_code, Some(NO_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = ProcessCommand::new()
            .run(&cancel, &logs, &sh("sleep", "sleep 30"))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_argv() {
        let logs = InMemoryLogBuffer::new();
        let cancel = CancellationToken::new();
        let err = ProcessCommand::new()
            .run(&cancel, &logs, &CommandSpec::new("empty", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Empty { .. }));
    }
}

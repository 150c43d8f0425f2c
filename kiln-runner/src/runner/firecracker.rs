//! Firecracker runner
//!
//! Runs every step of a build inside one microVM started with `ignite`.
//! Setup prepares the VM's side files in the temp dir (docker daemon config,
//! registry credentials, CNI network config), starts the VM and runs the
//! optional startup script. Steps are executed with `ignite exec`.

use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::auth::{effective_auth, write_docker_auth};
use super::cni::write_cni_config;
use super::{
    RunnerContext, RunnerError, Spec, StepSpec, create_temp_dir, remove_temp_dir, run_specs,
    sandbox_path,
};
use crate::command::{CommandSpec, shell_quote};

/// Mount point of the workspace inside the VM
const WORKSPACE_MOUNT: &str = "/work";

/// Docker daemon config file written into the temp dir
const DAEMON_CONFIG: &str = "docker-daemon.json";

/// Where side files land inside the VM
const VM_DAEMON_CONFIG: &str = "/etc/docker/daemon.json";
const VM_DOCKER_CONFIG_DIR: &str = "/etc/docker/cli";

/// Strips a `@sha256:<64 hex>` digest from an image reference
///
/// ignite cannot parse digests; tags are kept.
pub fn sanitize_image(image: &str) -> String {
    if let Some((name, digest)) = image.rsplit_once("@sha256:") {
        if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return name.to_string();
        }
    }
    image.to_string()
}

pub struct FirecrackerRunner {
    ctx: RunnerContext,
    temp: Option<TempDir>,
    temp_path: PathBuf,
    vm_name: String,
    /// `ignite run` was issued; the VM may exist even if it failed
    vm_created: bool,
    vm_started: bool,
    has_docker_auth: bool,
}

impl FirecrackerRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        let vm_name = format!(
            "{}-{}",
            ctx.config.firecracker.vm_prefix,
            uuid::Uuid::new_v4().simple()
        );
        Self {
            ctx,
            temp: None,
            temp_path: PathBuf::new(),
            vm_name,
            vm_created: false,
            vm_started: false,
            has_docker_auth: false,
        }
    }

    #[cfg(test)]
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub async fn setup(&mut self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let (dir, path) = create_temp_dir("kiln-firecracker-")?;
        self.temp = Some(dir);
        self.temp_path = path;

        let options = &self.ctx.config.firecracker;

        // source -> destination inside the VM
        let mut copy_files: BTreeMap<String, String> = BTreeMap::new();

        if !options.registry_mirrors.is_empty() {
            let daemon_config = self.temp_path.join(DAEMON_CONFIG);
            let contents = json!({ "registry-mirrors": options.registry_mirrors });
            std::fs::write(&daemon_config, contents.to_string())
                .map_err(|e| RunnerError::Setup(format!("writing docker daemon config: {}", e)))?;
            copy_files.insert(
                daemon_config.to_string_lossy().into_owned(),
                VM_DAEMON_CONFIG.to_string(),
            );
        }

        let auth = effective_auth(
            self.ctx.job.docker_auth_config.as_ref(),
            options.auth_config.as_ref(),
        );
        if let Some(auth) = auth {
            let dir = write_docker_auth(&self.temp_path, auth)
                .map_err(|e| RunnerError::Setup(format!("writing docker auth config: {}", e)))?;
            copy_files.insert(
                dir.to_string_lossy().into_owned(),
                VM_DOCKER_CONFIG_DIR.to_string(),
            );
            self.has_docker_auth = true;
        }

        if let Some(script) = &options.vm_startup_script {
            copy_files.insert(script.clone(), script.clone());
        }

        let cni_dir = write_cni_config(
            &self.temp_path,
            &options.cni_subnet,
            options.bandwidth_ingress,
            options.bandwidth_egress,
        )
        .map_err(|e| RunnerError::Setup(format!("writing CNI config: {}", e)))?;

        let mut argv = vec![
            "ignite".to_string(),
            "run".to_string(),
            "--runtime".to_string(),
            "docker".to_string(),
            "--network-plugin".to_string(),
            "cni".to_string(),
            "--cpus".to_string(),
            options.cpus.clone(),
            "--memory".to_string(),
            options.memory.clone(),
            "--size".to_string(),
            options.disk_space.clone(),
        ];
        for (source, destination) in &copy_files {
            argv.push("--copy-files".to_string());
            argv.push(format!("{}:{}", source, destination));
        }
        argv.extend([
            "--volumes".to_string(),
            format!("{}:{}", self.ctx.workspace.display(), WORKSPACE_MOUNT),
            "--ssh".to_string(),
            "--name".to_string(),
            self.vm_name.clone(),
            "--kernel-image".to_string(),
            sanitize_image(&options.kernel_image),
        ]);
        if let Some(args) = &options.kernel_args {
            argv.push("--kernel-args".to_string());
            argv.push(args.clone());
        }
        argv.extend([
            "--sandbox-image".to_string(),
            sanitize_image(&options.sandbox_image),
            sanitize_image(&options.image),
        ]);

        let start = CommandSpec::new("setup.firecracker.start", argv)
            .with_env(vec![(
                "CNI_CONF_DIR".to_string(),
                cni_dir.to_string_lossy().into_owned(),
            )])
            .with_operation("firecracker.setup");

        info!("Starting VM {} for build {}", self.vm_name, self.ctx.job.id);
        self.vm_created = true;
        self.ctx
            .command
            .run(cancel, self.ctx.logs.as_ref(), &start)
            .await
            .map_err(|e| match e {
                crate::command::CommandError::Cancelled { .. } => RunnerError::Cancelled,
                e => RunnerError::Setup(format!("starting VM {}: {}", self.vm_name, e)),
            })?;
        self.vm_started = true;

        if let Some(script) = &options.vm_startup_script {
            let startup = CommandSpec::new(
                "setup.startup-script",
                vec![
                    "ignite".to_string(),
                    "exec".to_string(),
                    self.vm_name.clone(),
                    "--".to_string(),
                    script.clone(),
                ],
            )
            .with_operation("firecracker.setup");

            self.ctx
                .command
                .run(cancel, self.ctx.logs.as_ref(), &startup)
                .await
                .map_err(|e| match e {
                    crate::command::CommandError::Cancelled { .. } => RunnerError::Cancelled,
                    e => RunnerError::Setup(format!("running VM startup script: {}", e)),
                })?;
        }

        Ok(())
    }

    pub async fn run(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        if !self.vm_started {
            return Err(RunnerError::Infra(format!(
                "VM {} is not running",
                self.vm_name
            )));
        }

        let specs = spec.steps.iter().map(|step| self.command_for(step)).collect();
        run_specs(self.ctx.command.as_ref(), cancel, self.ctx.logs.as_ref(), specs).await
    }

    pub async fn teardown(&mut self) -> Result<(), RunnerError> {
        if self.vm_created {
            let remove = CommandSpec::new(
                "teardown.firecracker.remove",
                vec![
                    "ignite".to_string(),
                    "rm".to_string(),
                    "-f".to_string(),
                    self.vm_name.clone(),
                ],
            )
            .with_operation("firecracker.teardown");

            // Teardown must finish even when the build was cancelled
            let detached = CancellationToken::new();
            if let Err(e) = self
                .ctx
                .command
                .run(&detached, self.ctx.logs.as_ref(), &remove)
                .await
            {
                warn!("Failed to remove VM {}: {}", self.vm_name, e);
            }
            self.vm_created = false;
            self.vm_started = false;
        }

        remove_temp_dir(&mut self.temp)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_path
    }

    fn command_for(&self, step: &StepSpec) -> CommandSpec {
        let mut script = format!("cd {} && env", shell_quote(&sandbox_path(WORKSPACE_MOUNT, &step.dir)));
        if self.has_docker_auth {
            script.push_str(&format!(" DOCKER_CONFIG={}", VM_DOCKER_CONFIG_DIR));
        }
        for (key, value) in step.all_env() {
            script.push_str(&format!(" {}={}", key, shell_quote(&value)));
        }
        script.push_str(&format!(
            " /bin/sh {}",
            shell_quote(&sandbox_path(WORKSPACE_MOUNT, &step.script_path))
        ));

        CommandSpec::new(
            step.key.clone(),
            vec![
                "ignite".to_string(),
                "exec".to_string(),
                self.vm_name.clone(),
                "--".to_string(),
                script,
            ],
        )
        .with_secrets(step.secret_values())
        .with_operation("firecracker.run")
    }
}

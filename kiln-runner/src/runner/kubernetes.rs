//! Kubernetes runner
//!
//! Two modes:
//! - per step: one Job per step, all sharing the executor's workspace claim
//! - single pod: one Job per build, steps run as ordered init containers
//!   over a volume the job owns

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RunnerContext, RunnerError, Spec, StepSpec};
use crate::config::JobVolumeType;
use crate::kube::job::{self, SingleJob, TOKEN_KEY};
use crate::kube::{KubeApi, KubeError, Pod, PodPhase, WaitError, wait_for_pod};
use crate::pipeline::{self, CHECKOUT_STEP_KEY, REPOSITORY_DIR};

pub struct KubernetesRunner {
    ctx: RunnerContext,
    kube: Arc<dyn KubeApi>,
    /// Jobs created so far, deleted on teardown
    jobs: Vec<String>,
    secret: Option<String>,
    pvc: Option<String>,
}

impl KubernetesRunner {
    pub fn new(ctx: RunnerContext, kube: Arc<dyn KubeApi>) -> Self {
        Self {
            ctx,
            kube,
            jobs: Vec::new(),
            secret: None,
            pvc: None,
        }
    }

    /// Nothing is provisioned before the first run
    pub fn setup(&mut self) -> Result<(), RunnerError> {
        Ok(())
    }

    pub fn single_job_pod(&self) -> bool {
        self.ctx.config.kubernetes.single_job_pod
    }

    pub async fn run(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        if self.single_job_pod() {
            self.run_single(cancel, spec).await
        } else {
            for step in &spec.steps {
                if cancel.is_cancelled() {
                    return Err(RunnerError::Cancelled);
                }
                self.run_step(cancel, step).await?;
            }
            Ok(())
        }
    }

    /// Deletes the jobs, secret and claim this runner created
    ///
    /// Failures are logged and recorded as teardown entries; they never
    /// abort the rest of the cleanup.
    pub async fn teardown(&mut self) -> Result<(), RunnerError> {
        let options = &self.ctx.config.kubernetes;
        if options.keep_jobs {
            debug!("Keeping jobs {:?}", self.jobs);
            self.jobs.clear();
            self.secret = None;
            self.pvc = None;
            return Ok(());
        }

        let namespace = options.namespace.clone();
        for name in std::mem::take(&mut self.jobs) {
            let result = self.kube.delete_job(&namespace, &name).await;
            self.report_teardown("job", &name, result.err());
        }
        if let Some(name) = self.secret.take() {
            let result = self.kube.delete_secret(&namespace, &name).await;
            self.report_teardown("secret", &name, result.err());
        }
        if let Some(name) = self.pvc.take() {
            let result = self.kube.delete_pvc(&namespace, &name).await;
            self.report_teardown("pvc", &name, result.err());
        }
        Ok(())
    }

    /// Kubernetes runs keep no local temp dir
    pub fn temp_dir(&self) -> &Path {
        Path::new("")
    }

    fn report_teardown(&self, kind: &str, name: &str, err: Option<KubeError>) {
        if let Some(e) = err {
            warn!("Failed to delete {} {}: {}", kind, name, e);
            self.ctx.logs.record(
                &format!("teardown.{}", kind),
                vec!["delete".to_string(), kind.to_string(), name.to_string()],
                &e.to_string(),
                1,
            );
        }
    }

    fn namespace(&self) -> &str {
        &self.ctx.config.kubernetes.namespace
    }

    /// Workspace directory relative to the shared claim
    fn sub_path(&self) -> String {
        let workspace = &self.ctx.workspace;
        workspace
            .strip_prefix(&self.ctx.config.workspace_root)
            .unwrap_or(workspace)
            .to_string_lossy()
            .into_owned()
    }

    async fn run_step(&mut self, cancel: &CancellationToken, step: &StepSpec) -> Result<(), RunnerError> {
        let build = self.ctx.job.id.to_string();
        let name = job::job_name(&["kiln", &self.ctx.job.queue, &build, &step.key]);
        let manifest = job::step_job(&self.ctx.config.kubernetes, &name, step, &self.sub_path());

        info!("Creating job {} for step {}", name, step.key);
        self.kube
            .create_job(self.namespace(), &manifest)
            .await
            .map_err(|e| RunnerError::Infra(format!("creating job {}: {}", name, e)))?;
        self.jobs.push(name.clone());

        let result = wait_for_pod(self.kube.as_ref(), cancel, self.namespace(), &name).await;
        let containers = [(step.name.clone(), step.key.clone(), step.commands.clone())];
        match result {
            Ok(pod) => {
                self.collect_logs(&pod, &containers).await;
                Ok(())
            }
            Err(e) => {
                if let Some(pod) = e.pod() {
                    self.collect_logs(pod, &containers).await;
                }
                Err(wait_error(&name, e))
            }
        }
    }

    async fn run_single(&mut self, cancel: &CancellationToken, spec: &Spec) -> Result<(), RunnerError> {
        let options = self.ctx.config.kubernetes.clone();
        let build = self.ctx.job.id.to_string();
        let name = job::job_name(&["kiln", &self.ctx.job.queue, &build]);

        let mut secret_data = BTreeMap::new();
        secret_data.insert(TOKEN_KEY.to_string(), self.ctx.job.access_token.clone());
        for step in spec.steps.iter().filter(|s| s.key != CHECKOUT_STEP_KEY) {
            for (key, value) in &step.secret_env {
                secret_data.insert(key.clone(), value.clone());
            }
        }

        let secret_name = format!("{}-secrets", name);
        let secret = job::secret(&options, &secret_name, &secret_data);
        self.kube
            .create_secret(&options.namespace, &secret)
            .await
            .map_err(|e| RunnerError::Setup(format!("creating secret {}: {}", secret_name, e)))?;
        self.secret = Some(secret_name.clone());

        let pvc_name = if options.job_volume_type == JobVolumeType::PersistentVolumeClaim {
            let pvc_name = format!("{}-pvc", name);
            let pvc = job::pvc(&options, &pvc_name);
            self.kube
                .create_pvc(&options.namespace, &pvc)
                .await
                .map_err(|e| RunnerError::Setup(format!("creating pvc {}: {}", pvc_name, e)))?;
            self.pvc = Some(pvc_name.clone());
            Some(pvc_name)
        } else {
            None
        };

        let files = self.workspace_files().await?;
        let clone_url = pipeline::clone_url(&self.ctx.config, &self.ctx.job.repository)
            .map_err(|e| RunnerError::Setup(format!("building clone URL: {}", e)))?;

        let mut checkout = vec![
            format!("mkdir -p {}", REPOSITORY_DIR),
            format!("cd {}", REPOSITORY_DIR),
        ];
        checkout.extend(pipeline::checkout_commands(
            clone_url.as_str(),
            &self.ctx.job.commit,
            "$TOKEN",
        ));
        checkout.push(format!("cd {}", job::JOB_MOUNT_PATH));

        let secret_keys: Vec<&str> = secret_data.keys().map(String::as_str).collect();
        let manifest = job::single_job(
            &options,
            &SingleJob {
                name: &name,
                steps: &spec.steps,
                checkout_key: CHECKOUT_STEP_KEY,
                checkout,
                files: &files,
                secret_name: &secret_name,
                secret_keys,
                pvc_name: pvc_name.as_deref(),
            },
        );

        info!("Creating job {} with {} steps", name, spec.steps.len());
        self.kube
            .create_job(&options.namespace, &manifest)
            .await
            .map_err(|e| RunnerError::Infra(format!("creating job {}: {}", name, e)))?;
        self.jobs.push(name.clone());

        let mut containers = vec![(
            "setup-workspace".to_string(),
            CHECKOUT_STEP_KEY.to_string(),
            vec!["setup-workspace".to_string()],
        )];
        containers.extend(
            spec.steps
                .iter()
                .filter(|s| s.key != CHECKOUT_STEP_KEY)
                .map(|s| (s.name.clone(), s.key.clone(), s.commands.clone())),
        );

        let result = wait_for_pod(self.kube.as_ref(), cancel, &options.namespace, &name).await;
        match result {
            Ok(pod) => {
                self.collect_logs(&pod, &containers).await;
                Ok(())
            }
            Err(e) => {
                if let Some(pod) = e.pod() {
                    self.collect_logs(pod, &containers).await;
                }
                Err(wait_error(&name, e))
            }
        }
    }

    /// Resolves the job's workspace files to (path, bytes) pairs
    async fn workspace_files(&self) -> Result<Vec<(String, Vec<u8>)>, RunnerError> {
        let mut files = Vec::new();
        for file in &self.ctx.job.workspace_files {
            let content = match (&file.content, &file.bucket, &file.key) {
                (Some(content), _, _) => content.clone().into_bytes(),
                (None, Some(bucket), Some(key)) => {
                    self
                        .ctx
                        .repository
                        .get_file(bucket, key)
                        .await
                        .map_err(|e| {
                            RunnerError::Setup(format!("fetching workspace file {}: {:#}", file.path, e))
                        })?
                }
                _ => {
                    return Err(RunnerError::Setup(format!(
                        "workspace file {} has neither content nor a stored object",
                        file.path
                    )));
                }
            };
            files.push((file.path.clone(), content));
        }
        Ok(files)
    }

    /// Copies container logs of `pod` into the log buffer
    ///
    /// Containers that never terminated are skipped. When the pod reports
    /// no container statuses, the pod phase decides the exit code.
    async fn collect_logs(&self, pod: &Pod, containers: &[(String, String, Vec<String>)]) {
        let reported = pod.all_container_statuses().next().is_some();
        let fallback = if pod.status.phase == PodPhase::Succeeded { 0 } else { 1 };

        for (container, key, command) in containers {
            let status = pod.all_container_statuses().find(|s| &s.name == container);
            let exit_code = match status.map(|s| s.exit_code()) {
                Some(Some(code)) => code,
                Some(None) => continue,
                None if reported => continue,
                None => fallback,
            };
            self.read_logs(pod, container, key, command, exit_code).await;
        }
    }

    async fn read_logs(
        &self,
        pod: &Pod,
        container: &str,
        key: &str,
        command: &[String],
        exit_code: i32,
    ) {
        let out = match self
            .kube
            .pod_logs(self.namespace(), &pod.metadata.name, container)
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!("Failed to read logs of {}/{}: {}", pod.metadata.name, container, e);
                format!("failed to read logs: {}", e)
            }
        };
        self.ctx.logs.record(key, command.to_vec(), &out, exit_code);
    }
}

fn wait_error(job_name: &str, err: WaitError) -> RunnerError {
    match err {
        WaitError::Plumbing(cause) => RunnerError::Infra(format!(
            "waiting for job {} to complete: {}",
            job_name, cause
        )),
        WaitError::PodFailed { pod, reason } => {
            let message = pod
                .status
                .message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("job {} failed: {}", job_name, reason));
            RunnerError::Run(message)
        }
        WaitError::Cancelled => RunnerError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, step};
    use super::*;
    use crate::command::fake::FakeCommand;
    use crate::config::Config;
    use crate::kube::fake::{FakeKubeApi, KubeCall, pod_event};
    use crate::repository::memory::MemoryRepository;
    use crate::service::{InMemoryLogBuffer, LogBufferService};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use kiln_core::domain::job::WorkspaceFile;
    use std::path::PathBuf;

    fn runner(config: Config, kube: Arc<FakeKubeApi>) -> (KubernetesRunner, InMemoryLogBuffer) {
        let logs = InMemoryLogBuffer::new();
        let mut ctx = context(config, Arc::new(FakeCommand::new()));
        ctx.logs = Arc::new(logs.clone());
        ctx.workspace = PathBuf::from("/tmp/kiln-ws");
        (KubernetesRunner::new(ctx, kube), logs)
    }

    fn single_config() -> Config {
        let mut config = Config::default();
        config.use_docker = false;
        config.use_kubernetes = true;
        config.kubernetes.single_job_pod = true;
        config
    }

    #[tokio::test]
    async fn test_single_pod_lifecycle() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![
            pod_event("ADDED", "kiln-default-42-x", "Pending", false),
            pod_event("MODIFIED", "kiln-default-42-x", "Succeeded", false),
        ]);
        let (mut runner, logs) = runner(single_config(), kube.clone());
        assert!(runner.single_job_pod());

        let spec = Spec {
            steps: vec![step(CHECKOUT_STEP_KEY), step("step.1.build")],
        };
        runner.run(&CancellationToken::new(), &spec).await.unwrap();
        runner.teardown().await.unwrap();

        assert_eq!(
            kube.calls(),
            vec![
                KubeCall::CreateSecret("kiln-default-42-secrets".to_string()),
                KubeCall::CreateJob("kiln-default-42".to_string()),
                KubeCall::WatchPods("job-name=kiln-default-42".to_string()),
                KubeCall::PodLogs("kiln-default-42-x".to_string(), "setup-workspace".to_string()),
                KubeCall::PodLogs("kiln-default-42-x".to_string(), "step-1-build".to_string()),
                KubeCall::DeleteJob("kiln-default-42".to_string()),
                KubeCall::DeleteSecret("kiln-default-42-secrets".to_string()),
            ]
        );

        let secret = &kube.secrets()[0];
        assert_eq!(secret["data"]["TOKEN"], "am9iLXRva2Vu");

        let job = &kube.jobs()[0];
        let init = job["spec"]["template"]["spec"]["initContainers"]
            .as_array()
            .unwrap();
        assert_eq!(init.len(), 2);
        let setup = init[0]["args"][0].as_str().unwrap();
        assert!(setup.contains("mkdir -p repository; cd repository; git init"));
        assert!(setup.contains("git remote add origin http://localhost:3080/.executors/git/github.com/acme/app"));

        let entries = logs.drain();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec![CHECKOUT_STEP_KEY, "step.1.build"]);
        assert_eq!(entries[1].out, "log of step-1-build\n");
    }

    #[tokio::test]
    async fn test_single_pod_with_claim_and_files() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("MODIFIED", "p", "Succeeded", false)]);
        let mut config = single_config();
        config.kubernetes.job_volume_type = JobVolumeType::PersistentVolumeClaim;

        let blob: &[u8] = &[0xff, 0x00, 0xfe, b'\n'];
        let repository = MemoryRepository::new();
        repository.add_file("artifacts", "tool.bin", blob);

        let (mut runner, _logs) = runner(config, kube.clone());
        runner.ctx.repository = Arc::new(repository);
        runner.ctx.job.workspace_files = vec![
            WorkspaceFile {
                path: "/etc/app.conf".to_string(),
                content: Some("debug = true".to_string()),
                bucket: None,
                key: None,
            },
            WorkspaceFile {
                path: "bin/tool".to_string(),
                content: None,
                bucket: Some("artifacts".to_string()),
                key: Some("tool.bin".to_string()),
            },
        ];

        runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap();
        runner.teardown().await.unwrap();

        let calls = kube.calls();
        assert!(calls.contains(&KubeCall::CreatePvc("kiln-default-42-pvc".to_string())));
        assert_eq!(
            calls.last(),
            Some(&KubeCall::DeletePvc("kiln-default-42-pvc".to_string()))
        );

        let job = &kube.jobs()[0];
        let setup = job["spec"]["template"]["spec"]["initContainers"][0]["args"][0]
            .as_str()
            .unwrap();
        assert!(setup.contains("printf '%s' 'ZGVidWcgPSB0cnVl' | base64 -d > 'etc/app.conf'"));

        // Non-UTF-8 content survives byte for byte
        let marker = " | base64 -d > 'bin/tool'";
        let end = setup.find(marker).unwrap();
        let start = setup[..end].rfind("printf '%s' '").unwrap() + "printf '%s' '".len();
        let encoded = setup[start..end].trim_end_matches('\'');
        assert_eq!(STANDARD.decode(encoded).unwrap(), blob);
    }

    #[tokio::test]
    async fn test_per_step_jobs() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("MODIFIED", "p1", "Succeeded", false)]);
        kube.push_watch(vec![pod_event("MODIFIED", "p2", "Succeeded", false)]);

        let mut config = Config::default();
        config.workspace_root = PathBuf::from("/tmp");
        let (mut runner, _logs) = runner(config, kube.clone());
        assert!(!runner.single_job_pod());

        let spec = Spec {
            steps: vec![step(CHECKOUT_STEP_KEY), step("step.1.build")],
        };
        runner.run(&CancellationToken::new(), &spec).await.unwrap();

        let jobs = kube.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["metadata"]["name"], "kiln-default-42-step-0-checkout");
        assert_eq!(
            jobs[1]["spec"]["template"]["spec"]["containers"][0]["volumeMounts"][0]["subPath"],
            "kiln-ws"
        );

        runner.teardown().await.unwrap();
        let deletes: Vec<KubeCall> = kube
            .calls()
            .into_iter()
            .filter(|c| matches!(c, KubeCall::DeleteJob(_)))
            .collect();
        assert_eq!(deletes.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_pod_is_a_run_failure() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("MODIFIED", "p1", "Failed", false)]);
        let (mut runner, _logs) = runner(Config::default(), kube.clone());

        let err = runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap_err();
        assert!(err.is_job_failure());
        assert!(err.to_string().contains("pod failed"));
    }

    #[tokio::test]
    async fn test_broken_watch_is_infra() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.fail_watch();
        let (mut runner, _logs) = runner(Config::default(), kube.clone());

        let err = runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Infra(_)));
        assert!(err.to_string().contains("waiting for job kiln-default-42-step-1-build to complete"));
    }

    #[tokio::test]
    async fn test_keep_jobs_skips_deletion() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("MODIFIED", "p1", "Succeeded", false)]);
        let mut config = Config::default();
        config.kubernetes.keep_jobs = true;
        let (mut runner, _logs) = runner(config, kube.clone());

        runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap();
        runner.teardown().await.unwrap();

        assert!(!kube.calls().iter().any(|c| matches!(c, KubeCall::DeleteJob(_))));
    }

    #[tokio::test]
    async fn test_failed_delete_is_recorded() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("MODIFIED", "p1", "Succeeded", false)]);
        kube.fail_delete_job();
        let (mut runner, logs) = runner(Config::default(), kube.clone());

        runner
            .run(&CancellationToken::new(), &Spec::single(step("step.1.build")))
            .await
            .unwrap();
        logs.drain();

        runner.teardown().await.unwrap();
        let entries = logs.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "teardown.job");
        assert_eq!(entries[0].exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let kube = Arc::new(FakeKubeApi::new());
        kube.push_watch(vec![pod_event("ADDED", "p1", "Running", false)]);
        kube.hold_watch_open();
        let (mut runner, _logs) = runner(Config::default(), kube.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = runner
            .run(&cancel, &Spec::single(step("step.1.build")))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }
}

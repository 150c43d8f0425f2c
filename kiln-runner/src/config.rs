//! Executor configuration
//!
//! Defines every tunable of the executor: control-plane connection, worker
//! concurrency, heartbeat and reaper timing, and the options of each sandbox
//! backend. Loaded once at start and shared read-only.

use kiln_core::domain::job::DockerAuthConfig;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// The one variable without a default
pub const CONTROL_PLANE_URL_VAR: &str = "KILN_CONTROL_PLANE_URL";

/// Sandbox backend used to run builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Shell,
    Docker,
    Firecracker,
    Kubernetes,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Shell => write!(f, "shell"),
            Backend::Docker => write!(f, "docker"),
            Backend::Firecracker => write!(f, "firecracker"),
            Backend::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Executor configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev laptops vs. VM fleets).
#[derive(Debug, Clone)]
pub struct Config {
    /// Name reported to the control plane when dequeuing
    pub executor_name: String,

    /// Control plane base URL (e.g., "http://localhost:3080")
    pub control_plane_url: String,

    /// Token for queue-level calls (dequeue, reaper, cleanup)
    pub executor_token: String,

    /// Queue to dequeue from
    pub queue: String,

    /// Max builds in flight; also the dequeue rate per second
    pub parallel: usize,

    /// Upper bound of the random back-off when the queue is empty
    pub max_queue_backoff: Duration,

    /// How often in-flight builds report liveness
    pub heartbeat_interval: Duration,

    /// How often buffered execution logs are shipped
    pub log_send_interval: Duration,

    /// Parent directory of per-build workspaces
    pub workspace_root: PathBuf,

    pub use_firecracker: bool,
    pub use_kubernetes: bool,
    pub use_docker: bool,

    /// Image used for the checkout step
    pub git_image: String,

    /// Image used by steps that name none
    pub default_image: String,

    /// Deadline for marking builds killed on shutdown
    pub cleanup_timeout: Duration,

    pub docker: DockerOptions,
    pub firecracker: FirecrackerOptions,
    pub kubernetes: KubernetesOptions,
    pub reaper: ReaperOptions,
}

/// Docker backend options
#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    /// Value of `--cpus`
    pub cpus: String,
    /// Value of `--memory`
    pub memory: String,
    /// Adds `--add-host=host.docker.internal:host-gateway`
    pub add_host_gateway: bool,
    /// Default registry credentials; a job's own auth config takes precedence
    pub auth_config: Option<DockerAuthConfig>,
}

/// Firecracker (ignite) backend options
#[derive(Debug, Clone, Default)]
pub struct FirecrackerOptions {
    pub cpus: String,
    pub memory: String,
    pub disk_space: String,
    /// Root filesystem image of the VM
    pub image: String,
    /// Image of the VM sandbox (`--sandbox-image`)
    pub sandbox_image: String,
    pub kernel_image: String,
    pub kernel_args: Option<String>,
    /// Script executed once inside every fresh VM
    pub vm_startup_script: Option<String>,
    /// Docker registry mirrors configured inside the VM
    pub registry_mirrors: Vec<String>,
    /// Max ingress bandwidth in bytes/s; 0 disables shaping
    pub bandwidth_ingress: u64,
    /// Max egress bandwidth in bytes/s; 0 disables shaping
    pub bandwidth_egress: u64,
    /// Subnet handed to the CNI bridge
    pub cni_subnet: String,
    /// Prefix of VM names
    pub vm_prefix: String,
    pub auth_config: Option<DockerAuthConfig>,
}

impl FirecrackerOptions {
    /// Address of the host as seen from inside a VM (the bridge gateway)
    pub fn gateway(&self) -> String {
        let network = self.cni_subnet.split('/').next().unwrap_or_default();
        let mut octets: Vec<&str> = network.split('.').collect();
        if octets.len() != 4 {
            return network.to_string();
        }
        octets[3] = "1";
        octets.join(".")
    }
}

/// Volume type backing the single-pod job workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVolumeType {
    EmptyDir,
    PersistentVolumeClaim,
}

impl FromStr for JobVolumeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emptyDir" | "empty-dir" => Ok(JobVolumeType::EmptyDir),
            "pvc" | "persistentVolumeClaim" => Ok(JobVolumeType::PersistentVolumeClaim),
            other => anyhow::bail!("unsupported job volume type '{}'", other),
        }
    }
}

/// Kubernetes backend options
#[derive(Debug, Clone)]
pub struct KubernetesOptions {
    pub namespace: String,
    pub node_name: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub job_annotations: BTreeMap<String, String>,
    pub image_pull_secrets: Vec<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub fs_group: Option<i64>,
    /// Shared claim mounted by per-step jobs
    pub persistence_volume: Option<String>,
    /// Run all steps of a build in one pod
    pub single_job_pod: bool,
    /// Leave jobs, secrets and claims behind for debugging
    pub keep_jobs: bool,
    /// Image for the setup and completion containers of single-pod jobs
    pub step_image: String,
    pub job_volume_type: JobVolumeType,
    pub job_volume_size: String,
    pub job_volume_storage_class: Option<String>,
    /// Base URL repository names are resolved against for cloning
    pub git_base_path: String,
    pub deadline_seconds: Option<i64>,
    /// API server URL; in-cluster discovery is used when unset
    pub api_url: Option<String>,
    pub token: Option<String>,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            node_name: None,
            node_selector: BTreeMap::new(),
            job_annotations: BTreeMap::new(),
            image_pull_secrets: Vec::new(),
            cpu_limit: None,
            memory_limit: None,
            cpu_request: None,
            memory_request: None,
            run_as_user: None,
            run_as_group: None,
            fs_group: None,
            persistence_volume: None,
            single_job_pod: false,
            keep_jobs: false,
            step_image: "alpine/git:latest".to_string(),
            job_volume_type: JobVolumeType::EmptyDir,
            job_volume_size: "5Gi".to_string(),
            job_volume_storage_class: None,
            git_base_path: "http://localhost:3080/.executors/git/".to_string(),
            deadline_seconds: Some(1200),
            api_url: None,
            token: None,
        }
    }
}

/// Reaper timing
#[derive(Debug, Clone)]
pub struct ReaperOptions {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    /// Margin for clock differences between executors and control plane
    pub heartbeat_skew: Duration,
}

impl Default for ReaperOptions {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_secs(30),
            max_sleep: Duration::from_secs(90),
            heartbeat_skew: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(executor_name: String, control_plane_url: String) -> Self {
        Self {
            executor_name,
            control_plane_url,
            executor_token: String::new(),
            queue: "default".to_string(),
            parallel: 2,
            max_queue_backoff: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            log_send_interval: Duration::from_secs(5),
            workspace_root: std::env::temp_dir(),
            use_firecracker: false,
            use_kubernetes: false,
            use_docker: true,
            git_image: "alpine/git:latest".to_string(),
            default_image: "alpine:latest".to_string(),
            cleanup_timeout: Duration::from_secs(5),
            docker: DockerOptions {
                cpus: "4".to_string(),
                memory: "12g".to_string(),
                add_host_gateway: true,
                auth_config: None,
            },
            firecracker: FirecrackerOptions {
                cpus: "4".to_string(),
                memory: "12G".to_string(),
                disk_space: "20G".to_string(),
                image: "weaveworks/ignite-ubuntu:latest".to_string(),
                sandbox_image: "weaveworks/ignite:v0.10.0".to_string(),
                kernel_image: "weaveworks/ignite-kernel:5.10.51".to_string(),
                kernel_args: None,
                vm_startup_script: None,
                registry_mirrors: Vec::new(),
                bandwidth_ingress: 0,
                bandwidth_egress: 0,
                cni_subnet: "10.61.0.0/16".to_string(),
                vm_prefix: "kiln".to_string(),
                auth_config: None,
            },
            kubernetes: KubernetesOptions::default(),
            reaper: ReaperOptions::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Only `KILN_CONTROL_PLANE_URL` is required; every other `KILN_*`
    /// variable falls back to its default.
    ///
    /// # Returns
    /// `None` when `KILN_CONTROL_PLANE_URL` is unset; an error when any
    /// variable that is set cannot be parsed
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        Self::from_vars(&|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`
    pub fn from_vars(lookup: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Option<Self>> {
        let vars = Vars { lookup };
        let Some(control_plane_url) = vars.string(CONTROL_PLANE_URL_VAR) else {
            return Ok(None);
        };
        let executor_name = vars
            .string("KILN_EXECUTOR_NAME")
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut config = Self::new(executor_name, control_plane_url);

        config.executor_token = vars.string("KILN_EXECUTOR_TOKEN").unwrap_or_default();
        config.queue = vars.string("KILN_QUEUE").unwrap_or(config.queue);
        config.parallel = vars.parse("KILN_PARALLEL")?.unwrap_or(config.parallel);
        config.max_queue_backoff =
            vars.secs("KILN_MAX_QUEUE_BACKOFF")?.unwrap_or(config.max_queue_backoff);
        config.heartbeat_interval =
            vars.secs("KILN_HEARTBEAT_INTERVAL")?.unwrap_or(config.heartbeat_interval);
        config.log_send_interval =
            vars.secs("KILN_LOG_SEND_INTERVAL")?.unwrap_or(config.log_send_interval);
        config.cleanup_timeout = vars.secs("KILN_CLEANUP_TIMEOUT")?.unwrap_or(config.cleanup_timeout);
        if let Some(root) = vars.string("KILN_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        config.use_firecracker = vars.parse("KILN_USE_FIRECRACKER")?.unwrap_or(false);
        config.use_kubernetes = vars.parse("KILN_USE_KUBERNETES")?.unwrap_or(false);
        config.use_docker = vars.parse("KILN_USE_DOCKER")?.unwrap_or(true);
        config.git_image = vars.string("KILN_GIT_IMAGE").unwrap_or(config.git_image);
        config.default_image = vars.string("KILN_DEFAULT_IMAGE").unwrap_or(config.default_image);

        let auth_config: Option<DockerAuthConfig> = vars.json("KILN_DOCKER_AUTH_CONFIG")?;

        let docker = &mut config.docker;
        docker.cpus = vars.string("KILN_DOCKER_CPUS").unwrap_or(docker.cpus.clone());
        docker.memory = vars.string("KILN_DOCKER_MEMORY").unwrap_or(docker.memory.clone());
        docker.add_host_gateway =
            vars.parse("KILN_DOCKER_ADD_HOST_GATEWAY")?.unwrap_or(docker.add_host_gateway);
        docker.auth_config = auth_config.clone();

        let fc = &mut config.firecracker;
        fc.cpus = vars.string("KILN_FIRECRACKER_CPUS").unwrap_or(fc.cpus.clone());
        fc.memory = vars.string("KILN_FIRECRACKER_MEMORY").unwrap_or(fc.memory.clone());
        fc.disk_space = vars.string("KILN_FIRECRACKER_DISK_SPACE").unwrap_or(fc.disk_space.clone());
        fc.image = vars.string("KILN_FIRECRACKER_IMAGE").unwrap_or(fc.image.clone());
        fc.sandbox_image =
            vars.string("KILN_FIRECRACKER_SANDBOX_IMAGE").unwrap_or(fc.sandbox_image.clone());
        fc.kernel_image =
            vars.string("KILN_FIRECRACKER_KERNEL_IMAGE").unwrap_or(fc.kernel_image.clone());
        fc.kernel_args = vars.string("KILN_FIRECRACKER_KERNEL_ARGS");
        fc.vm_startup_script = vars.string("KILN_FIRECRACKER_STARTUP_SCRIPT");
        fc.registry_mirrors = vars.json("KILN_FIRECRACKER_REGISTRY_MIRRORS")?.unwrap_or_default();
        fc.bandwidth_ingress = vars.parse("KILN_FIRECRACKER_BANDWIDTH_INGRESS")?.unwrap_or(0);
        fc.bandwidth_egress = vars.parse("KILN_FIRECRACKER_BANDWIDTH_EGRESS")?.unwrap_or(0);
        fc.cni_subnet = vars.string("KILN_FIRECRACKER_CNI_SUBNET").unwrap_or(fc.cni_subnet.clone());
        fc.auth_config = auth_config;

        let k8s = &mut config.kubernetes;
        k8s.namespace = vars.string("KILN_KUBERNETES_NAMESPACE").unwrap_or(k8s.namespace.clone());
        k8s.node_name = vars.string("KILN_KUBERNETES_NODE_NAME");
        k8s.node_selector = vars.json("KILN_KUBERNETES_NODE_SELECTOR")?.unwrap_or_default();
        k8s.job_annotations = vars.json("KILN_KUBERNETES_JOB_ANNOTATIONS")?.unwrap_or_default();
        k8s.image_pull_secrets = vars.string("KILN_KUBERNETES_IMAGE_PULL_SECRETS")
            .map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        k8s.cpu_limit = vars.string("KILN_KUBERNETES_CPU_LIMIT");
        k8s.memory_limit = vars.string("KILN_KUBERNETES_MEMORY_LIMIT");
        k8s.cpu_request = vars.string("KILN_KUBERNETES_CPU_REQUEST");
        k8s.memory_request = vars.string("KILN_KUBERNETES_MEMORY_REQUEST");
        k8s.run_as_user = vars.parse("KILN_KUBERNETES_RUN_AS_USER")?;
        k8s.run_as_group = vars.parse("KILN_KUBERNETES_RUN_AS_GROUP")?;
        k8s.fs_group = vars.parse("KILN_KUBERNETES_FS_GROUP")?;
        k8s.persistence_volume = vars.string("KILN_KUBERNETES_PERSISTENCE_VOLUME");
        k8s.single_job_pod = vars.parse("KILN_KUBERNETES_SINGLE_JOB_POD")?.unwrap_or(false);
        k8s.keep_jobs = vars.parse("KILN_KUBERNETES_KEEP_JOBS")?.unwrap_or(false);
        k8s.step_image = vars.string("KILN_KUBERNETES_STEP_IMAGE").unwrap_or(k8s.step_image.clone());
        k8s.job_volume_type =
            vars.parse("KILN_KUBERNETES_JOB_VOLUME_TYPE")?.unwrap_or(k8s.job_volume_type);
        k8s.job_volume_size =
            vars.string("KILN_KUBERNETES_JOB_VOLUME_SIZE").unwrap_or(k8s.job_volume_size.clone());
        k8s.job_volume_storage_class = vars.string("KILN_KUBERNETES_JOB_VOLUME_STORAGE_CLASS");
        k8s.git_base_path =
            vars.string("KILN_KUBERNETES_GIT_BASE_PATH").unwrap_or(k8s.git_base_path.clone());
        k8s.deadline_seconds =
            vars.parse("KILN_KUBERNETES_DEADLINE_SECONDS")?.or(k8s.deadline_seconds);
        k8s.api_url = vars.string("KILN_KUBERNETES_API_URL");
        k8s.token = vars.string("KILN_KUBERNETES_TOKEN");

        let reaper = &mut config.reaper;
        reaper.min_sleep = vars.secs("KILN_REAPER_MIN_SLEEP")?.unwrap_or(reaper.min_sleep);
        reaper.max_sleep = vars.secs("KILN_REAPER_MAX_SLEEP")?.unwrap_or(reaper.max_sleep);
        reaper.heartbeat_skew = vars.secs("KILN_HEARTBEAT_SKEW")?.unwrap_or(reaper.heartbeat_skew);

        Ok(Some(config))
    }

    /// Selects the sandbox backend: Firecracker, else Kubernetes, else
    /// Docker, else plain shell
    pub fn backend(&self) -> Backend {
        if self.use_firecracker {
            Backend::Firecracker
        } else if self.use_kubernetes {
            Backend::Kubernetes
        } else if self.use_docker {
            Backend::Docker
        } else {
            Backend::Shell
        }
    }

    /// Age after which a build without heartbeat is considered abandoned
    pub fn reaper_timeout(&self) -> Duration {
        self.heartbeat_interval + self.reaper.heartbeat_skew
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.executor_name.is_empty() {
            anyhow::bail!("executor_name cannot be empty");
        }

        if !self.control_plane_url.starts_with("http://")
            && !self.control_plane_url.starts_with("https://")
        {
            anyhow::bail!("control_plane_url must start with http:// or https://");
        }

        if self.queue.is_empty() {
            anyhow::bail!("queue cannot be empty");
        }

        if self.parallel == 0 {
            anyhow::bail!("parallel must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.log_send_interval.is_zero() {
            anyhow::bail!("log_send_interval must be greater than 0");
        }

        if self.reaper.min_sleep > self.reaper.max_sleep {
            anyhow::bail!("reaper min_sleep must not exceed max_sleep");
        }

        if self.backend() == Backend::Kubernetes
            && self.kubernetes.single_job_pod
            && self.kubernetes.job_volume_type == JobVolumeType::PersistentVolumeClaim
            && self.kubernetes.job_volume_size.is_empty()
        {
            anyhow::bail!("a job volume size is required for persistent volume claims");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:3080".to_string(),
        )
    }
}

/// Typed access to `KILN_*` variables; empty values count as unset
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e)),
            None => Ok(None),
        }
    }

    fn secs(&self, name: &str) -> anyhow::Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn json<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.string(name) {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {}", name, e)),
            None => Ok(None),
        }
    }
}

//! Kubernetes object manifests
//!
//! Jobs use `backoffLimit: 0` and `restartPolicy: Never`: a failed step is
//! never retried by Kubernetes. Every container mounts the job volume at
//! [`JOB_MOUNT_PATH`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::command::shell_quote;
use crate::config::{JobVolumeType, KubernetesOptions};
use crate::runner::StepSpec;

/// Where the workspace is mounted in every container
pub const JOB_MOUNT_PATH: &str = "/job";

/// Volume name of the job workspace
pub const JOB_VOLUME: &str = "job-data";

/// Secret key holding the job token
pub const TOKEN_KEY: &str = "TOKEN";

/// Claim used by per-step jobs when none is configured
pub const DEFAULT_CLAIM: &str = "kiln-executor-pvc";

/// Prints "skip" while the skip marker names a later step
///
/// `$1` is the marker, `$2` the current step key. Reaching the named step
/// consumes the marker.
pub const NEXT_INDEX_SCRIPT: &str = r#"#!/bin/sh
file="$1"
key="$2"
if [ ! -f "$file" ]; then
  exit 0
fi
next=$(sed -n 's/.*"nextStep"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p' "$file")
if [ -z "$next" ] || [ "$next" = "$key" ]; then
  rm -f "$file"
  exit 0
fi
echo "skip"
"#;

/// Maximum length of a Kubernetes object name
const MAX_NAME_LEN: usize = 63;

/// Builds a DNS-1123 label from name parts
///
/// Lowercases, maps every other character to `-`, collapses dashes and
/// trims the result to 63 characters.
pub fn job_name(parts: &[&str]) -> String {
    let mut name = String::new();
    for c in parts.join("-").chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (name.is_empty() || name.ends_with('-')) {
            continue;
        }
        name.push(c);
    }

    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

fn metadata(options: &KubernetesOptions, name: &str) -> Value {
    let mut meta = json!({
        "name": name,
        "namespace": options.namespace,
    });
    if !options.job_annotations.is_empty() {
        meta["annotations"] = json!(options.job_annotations);
    }
    meta
}

fn resources(options: &KubernetesOptions) -> Value {
    let mut limits = Map::new();
    let mut requests = Map::new();
    if let Some(cpu) = &options.cpu_limit {
        limits.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &options.memory_limit {
        limits.insert("memory".to_string(), json!(memory));
    }
    if let Some(cpu) = &options.cpu_request {
        requests.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &options.memory_request {
        requests.insert("memory".to_string(), json!(memory));
    }
    json!({ "limits": limits, "requests": requests })
}

fn env_list(env: &[(String, String)]) -> Vec<Value> {
    env.iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect()
}

fn secret_env_list(names: &[&str], secret_name: &str) -> Vec<Value> {
    names
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "valueFrom": {
                    "secretKeyRef": { "name": secret_name, "key": name }
                }
            })
        })
        .collect()
}

fn workdir(relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() || relative == "." {
        JOB_MOUNT_PATH.to_string()
    } else {
        format!("{}/{}", JOB_MOUNT_PATH, relative)
    }
}

/// Pod spec fields shared by both job shapes
fn pod_spec(options: &KubernetesOptions, volume: Value) -> Map<String, Value> {
    let mut spec = Map::new();
    spec.insert("restartPolicy".to_string(), json!("Never"));
    if let Some(node) = &options.node_name {
        spec.insert("nodeName".to_string(), json!(node));
    }
    if !options.node_selector.is_empty() {
        spec.insert("nodeSelector".to_string(), json!(options.node_selector));
    }
    if !options.image_pull_secrets.is_empty() {
        let secrets: Vec<Value> = options
            .image_pull_secrets
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        spec.insert("imagePullSecrets".to_string(), json!(secrets));
    }

    let mut security = Map::new();
    if let Some(user) = options.run_as_user {
        security.insert("runAsUser".to_string(), json!(user));
    }
    if let Some(group) = options.run_as_group {
        security.insert("runAsGroup".to_string(), json!(group));
    }
    if let Some(fs_group) = options.fs_group {
        security.insert("fsGroup".to_string(), json!(fs_group));
    }
    spec.insert("securityContext".to_string(), Value::Object(security));
    spec.insert("volumes".to_string(), json!([volume]));
    spec
}

fn job(options: &KubernetesOptions, name: &str, pod_spec: Map<String, Value>) -> Value {
    let mut spec = json!({
        "backoffLimit": 0,
        "template": { "spec": pod_spec },
    });
    if let Some(deadline) = options.deadline_seconds {
        spec["activeDeadlineSeconds"] = json!(deadline);
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata(options, name),
        "spec": spec,
    })
}

/// Job running one step against the shared workspace claim
///
/// # Arguments
/// * `name` - Job name (see [`job_name`])
/// * `step` - The step to run
/// * `sub_path` - Workspace directory within the claim
pub fn step_job(options: &KubernetesOptions, name: &str, step: &StepSpec, sub_path: &str) -> Value {
    let claim = options
        .persistence_volume
        .as_deref()
        .unwrap_or(DEFAULT_CLAIM);
    let volume = json!({
        "name": JOB_VOLUME,
        "persistentVolumeClaim": { "claimName": claim },
    });

    let container = json!({
        "name": step.name,
        "image": step.image,
        "command": ["/bin/sh", format!("{}/{}", JOB_MOUNT_PATH, step.script_path)],
        "workingDir": workdir(&step.dir),
        "env": env_list(&step.all_env()),
        "resources": resources(options),
        "volumeMounts": [{
            "name": JOB_VOLUME,
            "mountPath": JOB_MOUNT_PATH,
            "subPath": sub_path,
        }],
    });

    let mut spec = pod_spec(options, volume);
    spec.insert("containers".to_string(), json!([container]));
    job(options, name, spec)
}

/// Inputs of a single-pod job
pub struct SingleJob<'a> {
    pub name: &'a str,
    /// Steps run as ordered init containers; the checkout step is folded
    /// into the setup container
    pub steps: &'a [StepSpec],
    pub checkout_key: &'a str,
    /// Commands cloning the repository, reading the token from `$TOKEN`
    pub checkout: Vec<String>,
    /// Files written before any step runs: (relative path, raw bytes)
    pub files: &'a [(String, Vec<u8>)],
    pub secret_name: &'a str,
    /// Secret keys exposed to step containers as environment
    pub secret_keys: Vec<&'a str>,
    pub pvc_name: Option<&'a str>,
}

/// `writer` receives the quoted, workspace-relative target path
fn write_commands(path: &str, writer: impl FnOnce(String) -> String) -> Vec<String> {
    let path = path.trim_start_matches('/');
    let mut commands = Vec::new();
    if let Some((dir, _)) = path.rsplit_once('/') {
        commands.push(format!("mkdir -p {}", shell_quote(dir)));
    }
    commands.push(writer(shell_quote(path)));
    commands
}

fn write_file_commands(path: &str, content: &str) -> Vec<String> {
    write_commands(path, |target| {
        format!("printf '%s' {} > {}", shell_quote(content), target)
    })
}

/// Arbitrary bytes travel base64-encoded and are decoded in the container
fn write_binary_commands(path: &str, content: &[u8]) -> Vec<String> {
    let encoded = STANDARD.encode(content);
    write_commands(path, |target| {
        format!("printf '%s' {} | base64 -d > {}", shell_quote(&encoded), target)
    })
}

/// Script of the `setup-workspace` init container
fn setup_script(job: &SingleJob<'_>) -> String {
    let mut commands = vec!["set -e".to_string()];
    commands.extend(job.checkout.iter().cloned());

    commands.extend(write_file_commands("nextIndex.sh", NEXT_INDEX_SCRIPT));
    commands.push("chmod +x nextIndex.sh".to_string());

    for (path, content) in job.files {
        commands.extend(write_binary_commands(path, content));
    }

    for step in job.steps.iter().filter(|s| s.key != job.checkout_key) {
        commands.extend(write_file_commands(&step.script_path, &step.script()));
    }

    let mut script = commands.join("; ");
    script.push(';');
    script
}

/// Job running every step of a build in one pod
pub fn single_job(options: &KubernetesOptions, job_spec: &SingleJob<'_>) -> Value {
    let volume = match (options.job_volume_type, job_spec.pvc_name) {
        (JobVolumeType::PersistentVolumeClaim, Some(claim)) => json!({
            "name": JOB_VOLUME,
            "persistentVolumeClaim": { "claimName": claim },
        }),
        _ => json!({
            "name": JOB_VOLUME,
            "emptyDir": { "sizeLimit": options.job_volume_size },
        }),
    };
    let mount = json!([{ "name": JOB_VOLUME, "mountPath": JOB_MOUNT_PATH }]);

    let mut init_containers = vec![json!({
        "name": "setup-workspace",
        "image": options.step_image,
        "command": ["sh", "-c"],
        "args": [setup_script(job_spec)],
        "workingDir": JOB_MOUNT_PATH,
        "env": secret_env_list(&[TOKEN_KEY], job_spec.secret_name),
        "resources": resources(options),
        "volumeMounts": mount,
    })];

    for step in job_spec.steps.iter().filter(|s| s.key != job_spec.checkout_key) {
        let guarded = format!(
            "if [ \"$({mount}/nextIndex.sh {mount}/skip.json {key})\" != \"skip\" ]; then /bin/sh {mount}/{script}; fi",
            mount = JOB_MOUNT_PATH,
            key = step.key,
            script = step.script_path,
        );

        let mut env = env_list(&step.env);
        let secret_names: Vec<&str> = step
            .secret_env
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| job_spec.secret_keys.contains(name))
            .collect();
        env.extend(secret_env_list(&secret_names, job_spec.secret_name));

        init_containers.push(json!({
            "name": step.name,
            "image": step.image,
            "command": ["sh", "-c"],
            "args": [guarded],
            "workingDir": workdir(&step.dir),
            "env": env,
            "resources": resources(options),
            "volumeMounts": mount,
        }));
    }

    let main = json!({
        "name": "main",
        "image": options.step_image,
        "command": ["sh", "-c"],
        "args": ["echo 'complete'"],
        "workingDir": JOB_MOUNT_PATH,
        "resources": resources(options),
        "volumeMounts": mount,
    });

    let mut spec = pod_spec(options, volume);
    spec.insert("initContainers".to_string(), json!(init_containers));
    spec.insert("containers".to_string(), json!([main]));
    job(options, job_spec.name, spec)
}

/// Secret holding the given keys, base64 encoded
pub fn secret(options: &KubernetesOptions, name: &str, data: &BTreeMap<String, String>) -> Value {
    let encoded: BTreeMap<&String, String> = data
        .iter()
        .map(|(key, value)| (key, STANDARD.encode(value)))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": options.namespace },
        "type": "Opaque",
        "data": encoded,
    })
}

/// Claim backing a single-pod job's workspace
pub fn pvc(options: &KubernetesOptions, name: &str) -> Value {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": options.job_volume_size } },
    });
    if let Some(class) = &options.job_volume_storage_class {
        spec["storageClassName"] = json!(class);
    }

    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": name, "namespace": options.namespace },
        "spec": spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn options() -> KubernetesOptions {
        let mut annotations = BTreeMap::new();
        annotations.insert("foo".to_string(), "bar".to_string());
        KubernetesOptions {
            namespace: "default".to_string(),
            node_name: Some("my-node".to_string()),
            job_annotations: annotations,
            image_pull_secrets: vec!["my-secret".to_string()],
            persistence_volume: Some("my-pvc".to_string()),
            cpu_limit: Some("10".to_string()),
            memory_limit: Some("10Gi".to_string()),
            cpu_request: Some("1".to_string()),
            memory_request: Some("1Gi".to_string()),
            fs_group: Some(1000),
            step_image: "step-image:latest".to_string(),
            ..Default::default()
        }
    }

    fn step(key: &str, name: &str, dir: &str) -> StepSpec {
        StepSpec {
            key: key.to_string(),
            name: name.to_string(),
            image: "my-image:latest".to_string(),
            script_path: format!(".kiln/{}.sh", name),
            dir: dir.to_string(),
            env: vec![("FOO".to_string(), "bar".to_string())],
            secret_env: Vec::new(),
            commands: vec!["echo hello".to_string()],
        }
    }

    #[test]
    fn test_job_name_is_dns_safe() {
        assert_eq!(
            job_name(&["kiln", "default", "42", "step.1.build"]),
            "kiln-default-42-step-1-build"
        );
        assert_eq!(job_name(&["Kiln", "My_Queue", "7"]), "kiln-my-queue-7");

        let long = "x".repeat(100);
        let name = job_name(&["kiln", "default", "1", &long]);
        assert_eq!(name.len(), 63);

        // Truncation never leaves a trailing dash
        let name = job_name(&["kiln", &"a".repeat(61), "b"]);
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_step_job() {
        let job = step_job(
            &options(),
            "my-job",
            &step("step.0.build", "my-container", ""),
            "/my/path",
        );

        assert_eq!(job["metadata"]["name"], "my-job");
        assert_eq!(job["metadata"]["annotations"]["foo"], "bar");
        assert_eq!(job["spec"]["backoffLimit"], 0);

        let pod = &job["spec"]["template"]["spec"];
        assert_eq!(pod["nodeName"], "my-node");
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["imagePullSecrets"][0]["name"], "my-secret");
        assert_eq!(pod["securityContext"]["fsGroup"], 1000);
        assert!(pod["securityContext"].get("runAsUser").is_none());

        let container = &pod["containers"][0];
        assert_eq!(container["name"], "my-container");
        assert_eq!(container["image"], "my-image:latest");
        assert_eq!(container["command"], json!(["/bin/sh", "/job/.kiln/my-container.sh"]));
        assert_eq!(container["workingDir"], "/job");
        assert_eq!(container["env"], json!([{"name": "FOO", "value": "bar"}]));
        assert_eq!(container["resources"]["limits"]["cpu"], "10");
        assert_eq!(container["resources"]["requests"]["memory"], "1Gi");
        assert_eq!(container["volumeMounts"][0]["name"], JOB_VOLUME);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/job");
        assert_eq!(container["volumeMounts"][0]["subPath"], "/my/path");

        assert_eq!(pod["volumes"][0]["persistentVolumeClaim"]["claimName"], "my-pvc");
    }

    #[test]
    fn test_single_job() {
        let steps = vec![
            step("step.0.checkout", "step-0-checkout", ""),
            step("step.1.a", "my-container-0", "repository"),
            step("step.2.b", "my-container-1", "repository"),
        ];
        let files = vec![("/my/path/script1.sh".to_string(), b"echo hello".to_vec())];
        let job = single_job(
            &options(),
            &SingleJob {
                name: "my-job",
                steps: &steps,
                checkout_key: "step.0.checkout",
                checkout: vec!["git clone x".to_string()],
                files: &files,
                secret_name: "my-secret",
                secret_keys: vec![TOKEN_KEY],
                pvc_name: None,
            },
        );

        let pod = &job["spec"]["template"]["spec"];
        let init = pod["initContainers"].as_array().unwrap();
        assert_eq!(init.len(), 3);

        let setup = &init[0];
        assert_eq!(setup["name"], "setup-workspace");
        assert_eq!(setup["image"], "step-image:latest");
        assert_eq!(setup["workingDir"], "/job");
        assert_eq!(setup["command"], json!(["sh", "-c"]));
        let script = setup["args"][0].as_str().unwrap();
        assert!(script.starts_with("set -e; git clone x; "));
        assert!(script.contains("printf '%s' 'ZWNobyBoZWxsbw==' | base64 -d > 'my/path/script1.sh'"));
        assert!(script.contains("> '.kiln/my-container-0.sh'"));
        assert!(script.contains("chmod +x nextIndex.sh"));
        assert!(!script.contains("step-0-checkout.sh"));
        assert_eq!(
            setup["env"][0],
            json!({"name": "TOKEN", "valueFrom": {"secretKeyRef": {"name": "my-secret", "key": "TOKEN"}}})
        );

        assert_eq!(init[1]["name"], "my-container-0");
        assert_eq!(init[1]["workingDir"], "/job/repository");
        assert_eq!(
            init[1]["args"][0],
            "if [ \"$(/job/nextIndex.sh /job/skip.json step.1.a)\" != \"skip\" ]; then /bin/sh /job/.kiln/my-container-0.sh; fi"
        );
        assert_eq!(init[2]["name"], "my-container-1");

        let main = &pod["containers"][0];
        assert_eq!(main["name"], "main");
        assert_eq!(main["args"][0], "echo 'complete'");
        assert_eq!(main["resources"]["limits"]["memory"], "10Gi");

        assert!(pod["volumes"][0].get("emptyDir").is_some());
    }

    #[test]
    fn test_single_job_with_claim() {
        let mut opts = options();
        opts.job_volume_type = JobVolumeType::PersistentVolumeClaim;
        let job = single_job(
            &opts,
            &SingleJob {
                name: "my-job",
                steps: &[],
                checkout_key: "step.0.checkout",
                checkout: Vec::new(),
                files: &[],
                secret_name: "my-secret",
                secret_keys: vec![TOKEN_KEY],
                pvc_name: Some("my-job-pvc"),
            },
        );
        assert_eq!(
            job["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "my-job-pvc"
        );
    }

    #[test]
    fn test_secret_is_base64() {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_KEY.to_string(), "hunter2".to_string());
        let secret = secret(&options(), "my-secret", &data);
        assert_eq!(secret["data"]["TOKEN"], "aHVudGVyMg==");
        assert_eq!(secret["metadata"]["name"], "my-secret");
    }

    #[test]
    fn test_pvc() {
        let mut opts = options();
        opts.job_volume_size = "10Gi".to_string();
        opts.job_volume_storage_class = Some("fast".to_string());
        let claim = pvc(&opts, "my-job-pvc");
        assert_eq!(claim["spec"]["resources"]["requests"]["storage"], "10Gi");
        assert_eq!(claim["spec"]["storageClassName"], "fast");
    }
}

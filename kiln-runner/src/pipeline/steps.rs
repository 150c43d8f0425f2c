//! Step planning
//!
//! Turns a job and its build config into the ordered [`StepSpec`]s the
//! runners execute, starting with the checkout step.

use anyhow::{Context, Result};
use kiln_core::domain::job::Job;
use reqwest::Url;

use super::config::BuildConfig;
use crate::config::{Backend, Config};
use crate::kube::job::job_name;
use crate::runner::{StepSpec, sandbox_host};

/// Key of the step cloning the repository
pub const CHECKOUT_STEP_KEY: &str = "step.0.checkout";

/// Directory of the checkout, relative to the workspace
pub const REPOSITORY_DIR: &str = "repository";

/// Directory of generated step scripts, relative to the workspace
pub const SCRIPT_DIR: &str = ".kiln";

/// Variable carrying the clone token into the checkout step
pub const CLONE_TOKEN_ENV: &str = "KILN_CLONE_TOKEN";

/// A planned step plus the bits only the pipeline cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub spec: StepSpec,
    pub allow_failure: bool,
}

/// Commands fetching `commit` into the current directory
///
/// `token` is substituted into a double-quoted header, so a shell
/// variable reference like `$TOKEN` is expanded at run time.
pub fn checkout_commands(clone_url: &str, commit: &str, token: &str) -> Vec<String> {
    vec![
        "git init".to_string(),
        format!("git remote add origin {}", clone_url),
        "git config --local gc.auto 0".to_string(),
        format!(
            "git -c http.extraHeader=\"Authorization: token {}\" -c protocol.version=2 fetch --progress --no-recurse-submodules --no-tags --depth=1 origin {}",
            token, commit
        ),
        format!("git checkout --progress --force {}", commit),
    ]
}

/// Points a loopback URL at the executor host as seen from the sandbox
pub fn sandbox_url(config: &Config, url: &str) -> Result<Url> {
    let mut url = Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
    let loopback = matches!(url.host_str(), Some("localhost") | Some("127.0.0.1"));
    if loopback {
        if let Some(host) = sandbox_host(config) {
            url.set_host(Some(&host))
                .with_context(|| format!("Invalid sandbox host {}", host))?;
        }
    }
    Ok(url)
}

/// URL the checkout step clones from
pub fn clone_url(config: &Config, repository: &str) -> Result<Url> {
    if config.backend() == Backend::Kubernetes {
        let mut base = config.kubernetes.git_base_path.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).with_context(|| format!("Invalid git base path {}", base))?;
        return base
            .join(repository)
            .with_context(|| format!("Invalid repository name {}", repository));
    }

    sandbox_url(
        config,
        &format!(
            "{}/.executors/git/{}",
            config.control_plane_url.trim_end_matches('/'),
            repository
        ),
    )
}

/// URL steps use to upload srclib output for the commit
pub fn srclib_import_url(config: &Config, job: &Job) -> Result<Url> {
    sandbox_url(
        config,
        &format!(
            "{}/.api/repos/{}/-/srclib-import?commit={}",
            config.control_plane_url.trim_end_matches('/'),
            job.repository,
            job.commit
        ),
    )
}

/// Environment every step receives
fn base_env(config: &Config, job: &Job) -> Result<Vec<(String, String)>> {
    Ok(vec![
        ("CI".to_string(), "true".to_string()),
        ("KILN_BUILD_ID".to_string(), job.id.to_string()),
        ("KILN_COMMIT".to_string(), job.commit.clone()),
        ("KILN_BRANCH".to_string(), job.branch.clone().unwrap_or_default()),
        ("KILN_TAG".to_string(), job.tag.clone().unwrap_or_default()),
        ("KILN_REPOSITORY".to_string(), job.repository.clone()),
        (
            "SRCLIB_IMPORT_URL".to_string(),
            srclib_import_url(config, job)?.to_string(),
        ),
    ])
}

fn step_dir(dir: Option<&str>) -> String {
    match dir.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty() && *d != ".") {
        Some(dir) => format!("{}/{}", REPOSITORY_DIR, dir),
        None => REPOSITORY_DIR.to_string(),
    }
}

/// Plans every step of a build, checkout first
pub fn plan(config: &Config, job: &Job, build: &BuildConfig) -> Result<Vec<PlannedStep>> {
    let env = base_env(config, job)?;
    let clone = clone_url(config, &job.repository)?;

    let mut steps = vec![PlannedStep {
        spec: StepSpec {
            key: CHECKOUT_STEP_KEY.to_string(),
            name: job_name(&[CHECKOUT_STEP_KEY]),
            image: config.git_image.clone(),
            script_path: format!("{}/0.checkout.sh", SCRIPT_DIR),
            dir: REPOSITORY_DIR.to_string(),
            env: env.clone(),
            secret_env: vec![(CLONE_TOKEN_ENV.to_string(), job.access_token.clone())],
            commands: checkout_commands(
                clone.as_str(),
                &job.commit,
                &format!("${}", CLONE_TOKEN_ENV),
            ),
        },
        allow_failure: false,
    }];

    for (i, step) in build.steps.iter().enumerate() {
        let index = i + 1;
        let key = format!("step.{}.{}", index, step.key);

        let mut step_env = env.clone();
        step_env.extend(build.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        step_env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let image = step
            .image
            .clone()
            .or_else(|| build.image.clone())
            .unwrap_or_else(|| config.default_image.clone());

        steps.push(PlannedStep {
            spec: StepSpec {
                name: job_name(&[&key]),
                key,
                image,
                script_path: format!("{}/{}.{}.sh", SCRIPT_DIR, index, step.key),
                dir: step_dir(step.dir.as_deref()),
                env: step_env,
                secret_env: Vec::new(),
                commands: step.commands.clone(),
            },
            allow_failure: step.allow_failure,
        });
    }

    Ok(steps)
}

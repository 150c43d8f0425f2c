//! Registry credentials on disk

use kiln_core::domain::job::DockerAuthConfig;
use std::io;
use std::path::{Path, PathBuf};

/// Picks the credentials for a build
///
/// A non-empty per-job config wins over the executor default.
pub fn effective_auth<'a>(
    job: Option<&'a DockerAuthConfig>,
    default: Option<&'a DockerAuthConfig>,
) -> Option<&'a DockerAuthConfig> {
    job.filter(|c| !c.is_empty())
        .or(default.filter(|c| !c.is_empty()))
}

/// Writes `{"auths": {...}}` to `<parent>/docker_auth_<uuid>/config.json`
///
/// # Returns
/// The generated directory, suitable for `docker --config`
pub fn write_docker_auth(parent: &Path, config: &DockerAuthConfig) -> io::Result<PathBuf> {
    let dir = parent.join(format!("docker_auth_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;

    let contents = serde_json::to_vec(config)?;
    std::fs::write(dir.join("config.json"), contents)?;

    Ok(dir)
}

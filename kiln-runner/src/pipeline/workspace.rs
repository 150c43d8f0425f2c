//! Build workspaces
//!
//! Each build gets its own directory under the workspace root. It holds the
//! checkout, the generated step scripts and the job's workspace files, and
//! is removed when the build ends.

use anyhow::{Context, Result, bail};
use kiln_core::domain::job::WorkspaceFile;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::steps::REPOSITORY_DIR;
use crate::repository::BuildRepository;
use crate::runner::StepSpec;

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates an empty workspace with the checkout directory in place
    pub async fn create(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;

        let dir = tempfile::Builder::new()
            .prefix("kiln-workspace-")
            .tempdir_in(root)
            .context("Failed to create workspace")?;

        tokio::fs::create_dir_all(dir.path().join(REPOSITORY_DIR))
            .await
            .context("Failed to create checkout directory")?;

        debug!("Created workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes the script of every step
    pub async fn write_scripts(&self, steps: &[StepSpec]) -> Result<()> {
        for step in steps {
            self.write(&step.script_path, step.script().as_bytes())
                .await
                .with_context(|| format!("Failed to write script of {}", step.key))?;
        }
        Ok(())
    }

    /// Materializes the job's workspace files, fetching stored ones
    pub async fn write_files(
        &self,
        files: &[WorkspaceFile],
        repository: &dyn BuildRepository,
    ) -> Result<()> {
        for file in files {
            let content = match (&file.content, &file.bucket, &file.key) {
                (Some(content), _, _) => content.clone().into_bytes(),
                (None, Some(bucket), Some(key)) => repository
                    .get_file(bucket, key)
                    .await
                    .with_context(|| format!("Failed to fetch workspace file {}", file.path))?,
                _ => bail!(
                    "Workspace file {} has neither content nor a stored object",
                    file.path
                ),
            };
            self.write(&file.path, &content)
                .await
                .with_context(|| format!("Failed to write workspace file {}", file.path))?;
        }
        Ok(())
    }

    /// Removes the workspace, logging failures
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
    }

    async fn write(&self, relative: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    /// Joins a relative path onto the workspace, refusing to escape it
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = Path::new(relative.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("Path {} leaves the workspace", relative.display());
        }
        Ok(self.dir.path().join(relative))
    }
}

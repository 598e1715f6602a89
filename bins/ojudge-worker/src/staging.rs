// Source file staging: each submission is written to a uniquely named file
// in a shared directory that sandboxes mount read-only at /app
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait FileStager: Send + Sync {
    /// Write `source` to `<uuid>.<language>` and return its absolute path
    async fn stage(&self, language: &str, source: &str) -> Result<PathBuf>;

    /// Remove a staged file. Failures are logged, never returned.
    async fn unstage(&self, path: &Path);
}

pub struct LocalStager {
    dir: PathBuf,
}

impl LocalStager {
    /// Create the staging directory if needed. The path is made absolute
    /// because Docker bind mounts reject relative host paths.
    pub async fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create staging directory {}", dir.display()))?;
        let dir = tokio::fs::canonicalize(dir)
            .await
            .with_context(|| format!("Failed to resolve staging directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl FileStager for LocalStager {
    async fn stage(&self, language: &str, source: &str) -> Result<PathBuf> {
        if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!("Invalid language tag: {:?}", language);
        }

        let path = self
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), language.to_ascii_lowercase()));
        tokio::fs::write(&path, source)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Staged source file");
        Ok(path)
    }

    async fn unstage(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

/// A staged file that must be unstaged exactly once.
/// `release` does it inline; dropping an unreleased guard spawns it.
pub struct StagedSource {
    stager: Arc<dyn FileStager>,
    path: Option<PathBuf>,
}

impl StagedSource {
    pub fn new(stager: Arc<dyn FileStager>, path: PathBuf) -> Self {
        Self {
            stager,
            path: Some(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    pub async fn release(mut self) {
        if let Some(path) = self.path.take() {
            self.stager.unstage(&path).await;
        }
    }
}

impl Drop for StagedSource {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let stager = self.stager.clone();
            // Only reachable when the judging future is cancelled or panics
            tokio::spawn(async move {
                stager.unstage(&path).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_writes_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let stager = LocalStager::create(dir.path()).await.unwrap();

        let a = stager.stage("py", "print(1)").await.unwrap();
        let b = stager.stage("py", "print(1)").await.unwrap();

        assert_ne!(a, b);
        assert!(a.is_absolute());
        assert_eq!(a.extension().unwrap(), "py");
        assert_eq!(tokio::fs::read_to_string(&a).await.unwrap(), "print(1)");
    }

    #[tokio::test]
    async fn test_unstage_removes_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let stager = LocalStager::create(dir.path()).await.unwrap();

        let path = stager.stage("js", "console.log(1)").await.unwrap();
        stager.unstage(&path).await;
        assert!(!path.exists());

        // Second removal only logs
        stager.unstage(&path).await;
    }

    #[tokio::test]
    async fn test_rejects_path_like_language() {
        let dir = tempfile::tempdir().unwrap();
        let stager = LocalStager::create(dir.path()).await.unwrap();
        assert!(stager.stage("../py", "x").await.is_err());
        assert!(stager.stage("", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_release_unstages() {
        let dir = tempfile::tempdir().unwrap();
        let stager: Arc<dyn FileStager> = Arc::new(LocalStager::create(dir.path()).await.unwrap());
        let path = stager.stage("py", "").await.unwrap();

        let staged = StagedSource::new(stager.clone(), path.clone());
        assert_eq!(staged.path(), path.as_path());
        staged.release().await;
        assert!(!path.exists());
    }
}

//! Optional source-control collaborator used when an applied evolution is
//! rolled back after a failed deployment.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::error::{OpsError, OpsResult};
use crate::model::{Evolution, SourceFile};
use crate::services::process::run_command;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Write the restored files, remove `deleted`, commit, return the commit id.
    async fn commit_revert(&self, evolution: &Evolution, files: &[SourceFile], deleted: &[String]) -> OpsResult<String>;
}

/// A local git working copy, one directory per application.
pub struct GitSourceControl {
    repo_dir: PathBuf,
    author: String,
}

impl GitSourceControl {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            author: "autonomic <autonomic@localhost>".to_string(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    fn resolve(&self, rel: &str) -> OpsResult<PathBuf> {
        let rel = Path::new(rel.trim_start_matches('/'));
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(OpsError::Validation(format!("path escapes repository: {}", rel.display())));
        }
        Ok(self.repo_dir.join(rel))
    }

    async fn git(&self, args: &[&str]) -> OpsResult<String> {
        let (out, code) = run_command("git", args, Some(&self.repo_dir), &[])
            .await
            .map_err(|e| OpsError::transient("git", e))?;
        if code != 0 {
            return Err(OpsError::transient("git", format!("git {} failed: {}", args.join(" "), out.trim())));
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn commit_revert(&self, evolution: &Evolution, files: &[SourceFile], deleted: &[String]) -> OpsResult<String> {
        for file in files {
            let path = self.resolve(&file.path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, &file.content).await?;
        }
        for rel in deleted {
            let path = self.resolve(rel)?;
            if fs::try_exists(&path).await? {
                fs::remove_file(&path).await?;
            }
        }

        self.git(&["add", "-A"]).await?;
        let message = format!("Revert evolution {}\n\n{}", evolution.id, evolution.prompt);
        self.git(&["commit", "--allow-empty", "--author", &self.author, "-m", &message]).await?;
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        let commit = head.split_whitespace().next().unwrap_or_default().to_string();
        info!(evolution_id = %evolution.id, commit = %commit, "revert committed");
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_parent_components() {
        let scm = GitSourceControl::new("/tmp/repo");
        assert!(scm.resolve("src/main.ts").is_ok());
        assert!(scm.resolve("/src/main.ts").unwrap().starts_with("/tmp/repo"));
        assert!(matches!(scm.resolve("../etc/passwd"), Err(OpsError::Validation(_))));
    }
}

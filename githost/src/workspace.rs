//! Temporary checkouts of a pushed branch, used as Docker build contexts.

use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::git_ops::{GitError, GitRunner};

const WORKSPACE_PREFIX: &str = "githost-deploy-";

/// A depth-1 checkout that is deleted when dropped
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    head: String,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Commit checked out in the workspace
    pub fn head(&self) -> &str {
        &self.head
    }

    /// Whether the checkout has a Dockerfile at its root
    pub fn has_dockerfile(&self) -> bool {
        self.dir.path().join("Dockerfile").is_file()
    }
}

/// Clone `branch` of the bare repository at `repo_path` into a fresh
/// temporary directory. The directory is removed on every error path.
pub async fn materialize(
    git: &dyn GitRunner,
    repo_path: &Path,
    branch: &str,
    expected_sha: &str,
) -> Result<Workspace, GitError> {
    let dir = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir()?;

    let head = git.shallow_clone(repo_path, branch, dir.path()).await?;
    if head != expected_sha {
        warn!(
            pushed = expected_sha,
            checked_out = %head,
            "branch moved since the push, deploying the checked out commit"
        );
    }

    debug!(dir = %dir.path().display(), head = %head, "materialized workspace");
    Ok(Workspace { dir, head })
}

//! Local git operations: bare repository setup and shallow checkouts.
//!
//! Repository metadata is handled with git2. Cloning shells out to the git
//! binary because libgit2 cannot fetch shallowly over the local transport.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use git2::{Repository, RepositoryInitOptions};
use tokio::process::Command;
use tracing::debug;

/// Repository variables git exports to hooks; they would redirect a clone
/// run from inside a hook to the pushed repository
const HOOK_ENV_VARS: &[&str] = &[
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_OBJECT_DIRECTORY",
    "GIT_ALTERNATE_OBJECT_DIRECTORIES",
    "GIT_QUARANTINE_PATH",
];

/// Error type for git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid reference: {0}")]
    InvalidRef(String),
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Initialize a bare git repository with a default branch
pub fn init_bare_repo(path: &Path, default_branch: &str) -> Result<Repository, GitError> {
    let mut opts = RepositoryInitOptions::new();
    opts.bare(true);
    opts.initial_head(default_branch);

    let repo = Repository::init_opts(path, &opts)?;
    Ok(repo)
}

/// Whether `path` holds a bare repository
pub fn is_bare_repo(path: &Path) -> bool {
    Repository::open_bare(path)
        .map(|repo| repo.is_bare())
        .unwrap_or(false)
}

/// Resolve the commit HEAD points at in a checkout or bare repository
pub fn head_commit(path: &Path) -> Result<String, GitError> {
    let repo = Repository::open(path)?;
    let head = repo.head()?;
    let target = head
        .target()
        .ok_or_else(|| GitError::InvalidRef("HEAD has no target".to_string()))?;
    Ok(target.to_string())
}

/// Git collaborator used by the repository store and the deploy pipeline
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Create a bare repository whose HEAD points at `default_branch`
    async fn init_bare(&self, path: &Path, default_branch: &str) -> Result<(), GitError>;

    /// Clone `branch` of the local repository at `repo` into `dest` with
    /// depth 1. Returns the checked-out commit.
    async fn shallow_clone(&self, repo: &Path, branch: &str, dest: &Path)
        -> Result<String, GitError>;
}

/// `GitRunner` backed by git2 and the git executable
#[derive(Debug, Clone)]
pub struct SystemGit {
    git_binary: String,
}

impl SystemGit {
    pub fn new(git_binary: impl Into<String>) -> Self {
        SystemGit {
            git_binary: git_binary.into(),
        }
    }
}

#[async_trait]
impl GitRunner for SystemGit {
    async fn init_bare(&self, path: &Path, default_branch: &str) -> Result<(), GitError> {
        let path = path.to_path_buf();
        let default_branch = default_branch.to_string();
        tokio::task::spawn_blocking(move || init_bare_repo(&path, &default_branch).map(|_| ()))
            .await
            .map_err(|e| GitError::Io(std::io::Error::other(e)))?
    }

    async fn shallow_clone(
        &self,
        repo: &Path,
        branch: &str,
        dest: &Path,
    ) -> Result<String, GitError> {
        // A file:// URL makes git honour --depth for local clones
        let url = format!("file://{}", repo.display());
        let mut command = Command::new(&self.git_binary);
        for var in HOOK_ENV_VARS {
            command.env_remove(var);
        }
        let output = command
            .arg("clone")
            .arg("--quiet")
            .arg("--depth=1")
            .arg("--single-branch")
            .arg(format!("--branch={}", branch))
            .arg(&url)
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let dest: PathBuf = dest.to_path_buf();
        let head = tokio::task::spawn_blocking(move || head_commit(&dest))
            .await
            .map_err(|e| GitError::Io(std::io::Error::other(e)))??;
        debug!(repo = %repo.display(), branch, head = %head, "cloned workspace");
        Ok(head)
    }
}

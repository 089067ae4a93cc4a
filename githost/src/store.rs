//! Repository store: maps repository names to bare repositories on disk and
//! installs the post-receive hook that drives deployments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info};

use crate::git_ops::{is_bare_repo, GitError, GitRunner};
use crate::name::{sanitize_name, NameError};

/// Error type for repository store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("Failed to initialize repository: {0}")]
    Git(#[from] GitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command the post-receive hook script runs, with stdin inherited
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HookCommand {
    /// Render the hook as a POSIX shell script
    pub fn script(&self) -> String {
        let mut line = format!("exec {}", shell_quote(&self.program.to_string_lossy()));
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        format!("#!/bin/sh\n{}\n", line)
    }
}

/// Single-quote a word for /bin/sh
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Append `.git` unless the name already carries it
fn ensure_git_suffix(name: &str) -> String {
    if name.ends_with(".git") {
        name.to_string()
    } else {
        format!("{}.git", name)
    }
}

/// Bare repositories rooted at a single directory
#[derive(Clone)]
pub struct RepoStore {
    root: PathBuf,
    default_branch: String,
    hook: HookCommand,
    git: Arc<dyn GitRunner>,
}

impl RepoStore {
    /// Open the store, creating `root` if needed. The root is made absolute
    /// so hook scripts and relays never depend on the working directory.
    pub fn open(
        root: &Path,
        default_branch: &str,
        hook: HookCommand,
        git: Arc<dyn GitRunner>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(RepoStore {
            root,
            default_branch: default_branch.to_string(),
            hook,
            git,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path a repository name maps to, without touching the disk
    pub fn path(&self, name: &str) -> Result<PathBuf, NameError> {
        let name = sanitize_name(name)?;
        // `.git` alone would map to a repository with an empty name
        if name.strip_suffix(".git") == Some("") {
            return Err(NameError::Empty);
        }
        Ok(self.root.join(ensure_git_suffix(name)))
    }

    /// Whether a bare repository exists for `name`
    pub fn exists(&self, name: &str) -> Result<bool, NameError> {
        Ok(is_bare_repo(&self.path(name)?))
    }

    /// Return the repository path, initializing the bare repository and its
    /// post-receive hook on first use. Calling it again is a no-op.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf, StoreError> {
        let repo_path = self.path(name)?;

        if !is_bare_repo(&repo_path) {
            debug!(dir = %repo_path.display(), "repo does not exist, initializing");
            fs::create_dir_all(&repo_path).await?;
            self.git.init_bare(&repo_path, &self.default_branch).await?;
            info!(dir = %repo_path.display(), "initialized bare git repository");
        }

        let hook_path = repo_path.join("hooks").join("post-receive");
        if !fs::try_exists(&hook_path).await? {
            self.install_hook(&hook_path).await?;
        }

        Ok(repo_path)
    }

    async fn install_hook(&self, hook_path: &Path) -> Result<(), StoreError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(hooks_dir) = hook_path.parent() {
            fs::create_dir_all(hooks_dir).await?;
        }
        fs::write(hook_path, self.hook.script()).await?;
        fs::set_permissions(hook_path, std::fs::Permissions::from_mode(0o755)).await?;

        info!(hook = %hook_path.display(), "installed post-receive hook");
        Ok(())
    }
}

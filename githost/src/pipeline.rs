//! Deploy pipeline: checkout, image build and container swap for one push.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::image::{BuildError, ImageBuilder, LogSink};
use crate::git_ops::{GitError, GitRunner};
use crate::hook::{RefUpdate, SkipReason};
use crate::lock::DeployLock;
use crate::swap::{SwapError, SwapManager};
use crate::workspace::materialize;

/// Error type for a deploy
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to acquire deploy lock: {0}")]
    Lock(std::io::Error),
    #[error("Failed to check out workspace: {0}")]
    Workspace(#[from] GitError),
    #[error("Image build failed: {0}")]
    Build(#[from] BuildError),
    #[error("Container swap failed: {0}")]
    Swap(#[from] SwapError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Deployed {
        image_id: String,
        container_id: String,
        commit: String,
    },
    Skipped(SkipReason),
}

pub struct Pipeline {
    git: Arc<dyn GitRunner>,
    builder: Arc<dyn ImageBuilder>,
    swap: SwapManager,
    sink: Arc<dyn LogSink>,
}

impl Pipeline {
    pub fn new(
        git: Arc<dyn GitRunner>,
        builder: Arc<dyn ImageBuilder>,
        swap: SwapManager,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Pipeline {
            git,
            builder,
            swap,
            sink,
        }
    }

    /// Deploy `update` of the repository at `repo_path`.
    ///
    /// Deploys of the same repository run one at a time. The checkout is
    /// removed before returning, whatever the outcome.
    pub async fn run(
        &self,
        repo: &str,
        repo_path: &Path,
        update: &RefUpdate,
    ) -> Result<PipelineOutcome, PipelineError> {
        let _lock = DeployLock::acquire(repo_path)
            .await
            .map_err(PipelineError::Lock)?;

        let branch = update
            .ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&update.ref_name);
        let workspace = materialize(self.git.as_ref(), repo_path, branch, &update.new_sha).await?;

        if !workspace.has_dockerfile() {
            info!(repo, commit = workspace.head(), "no Dockerfile, skipping deploy");
            return Ok(PipelineOutcome::Skipped(SkipReason::NoBuildDescriptor));
        }

        let commit = workspace.head().to_string();
        let image_id = self
            .builder
            .build(workspace.path(), repo, &commit, self.sink.as_ref())
            .await?;
        let container_id = self.swap.swap(&image_id, repo, &commit).await?;

        Ok(PipelineOutcome::Deployed {
            image_id,
            container_id,
            commit,
        })
    }
}

//! The `hook post-receive` command, run by git inside a bare repository
//! after a push has been accepted.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{Database, DeploymentStatus, Repository};
use crate::hook::{HookListener, RefUpdate};
use crate::name::{sanitize_name, NameError};
use crate::pipeline::{Pipeline, PipelineError, PipelineOutcome};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook must run inside a bare repository: {0}")]
    NotARepository(PathBuf),
    #[error("Invalid repository name: {0}")]
    Name(#[from] NameError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Repository name for a bare repository directory: its basename without `.git`
pub fn repo_name_from_path(repo_path: &Path) -> Result<String, HookError> {
    let dir_name = repo_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HookError::NotARepository(repo_path.to_path_buf()))?;
    let name = dir_name.strip_suffix(".git").unwrap_or(dir_name);
    Ok(sanitize_name(name)?.to_string())
}

/// What the hook knows about the repository being pushed to
pub struct HookContext {
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub deploy_branch: String,
    db: Option<Database>,
    record: Option<Repository>,
}

impl HookContext {
    /// Resolve the repository and its deploy branch. The database is
    /// optional: when it cannot be reached the configured branch is used and
    /// nothing is recorded.
    pub async fn load(repo_path: &Path, config: &Config, db: Option<Database>) -> Result<Self, HookError> {
        let repo_name = repo_name_from_path(repo_path)?;

        let record = match &db {
            Some(db) => match find_or_register(db, &repo_name, &config.deploy_branch).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(repo = %repo_name, "Failed to load repository record: {}", e);
                    None
                }
            },
            None => None,
        };
        let deploy_branch = record
            .as_ref()
            .map(|r| r.deploy_branch.clone())
            .unwrap_or_else(|| config.deploy_branch.clone());

        Ok(HookContext {
            repo_name,
            repo_path: repo_path.to_path_buf(),
            deploy_branch,
            db,
            record,
        })
    }

    /// Listener for pushes to the deploy branch
    pub fn listener(&self) -> HookListener {
        HookListener::new(format!("refs/heads/{}", self.deploy_branch))
    }

    /// Run the pipeline for `update`, recording the deployment when possible
    pub async fn deploy(
        &self,
        pipeline: &Pipeline,
        update: &RefUpdate,
    ) -> Result<PipelineOutcome, HookError> {
        let deployment_id = self.start_deployment(update).await;

        let result = pipeline
            .run(&self.repo_name, &self.repo_path, update)
            .await;

        self.finish_deployment(deployment_id, update, &result).await;

        match &result {
            Ok(PipelineOutcome::Deployed {
                container_id,
                commit,
                ..
            }) => info!(repo = %self.repo_name, commit = %commit, container = %container_id, "deployed"),
            Ok(PipelineOutcome::Skipped(reason)) => {
                info!(repo = %self.repo_name, ?reason, "deploy skipped")
            }
            Err(e) => error!(repo = %self.repo_name, "deploy failed: {}", e),
        }
        Ok(result?)
    }

    async fn start_deployment(&self, update: &RefUpdate) -> Option<i64> {
        let (db, record) = (self.db.as_ref()?, self.record.as_ref()?);

        if let Err(e) = db
            .update_repository(record.id, None, None, Some(&update.new_sha))
            .await
        {
            warn!(repo = %self.repo_name, "Failed to update latest commit: {}", e);
        }

        match db
            .create_deployment(
                record.id,
                &self.deploy_branch,
                &update.new_sha,
                DeploymentStatus::Running,
            )
            .await
        {
            Ok(deployment) => Some(deployment.id),
            Err(e) => {
                warn!(repo = %self.repo_name, "Failed to record deployment: {}", e);
                None
            }
        }
    }

    async fn finish_deployment(
        &self,
        deployment_id: Option<i64>,
        update: &RefUpdate,
        result: &Result<PipelineOutcome, PipelineError>,
    ) {
        let (Some(db), Some(id)) = (self.db.as_ref(), deployment_id) else {
            return;
        };

        let recorded = match result {
            Ok(PipelineOutcome::Deployed { .. }) => {
                match db.update_deployment_status(id, DeploymentStatus::Success).await {
                    Ok(()) => db.activate_deployment(id).await,
                    Err(e) => Err(e),
                }
            }
            // Nothing was built, so there is no deployment to keep
            Ok(PipelineOutcome::Skipped(_)) => db.delete_deployment(id).await,
            Err(_) => db.update_deployment_status(id, DeploymentStatus::Failed).await,
        };

        if let Err(e) = recorded {
            warn!(
                repo = %self.repo_name,
                commit = %update.new_sha,
                "Failed to record deployment result: {}",
                e
            );
        }
    }
}

async fn find_or_register(
    db: &Database,
    name: &str,
    deploy_branch: &str,
) -> Result<Repository, sqlx::Error> {
    if let Some(record) = db.get_repository_by_name(name).await? {
        return Ok(record);
    }
    // Repositories created by a first push have no record yet
    info!(repo = name, "registering repository");
    db.create_repository(name, "", deploy_branch).await
}

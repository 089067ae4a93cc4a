//! Repository management shared by the REST API and the CLI.

use tracing::info;

use crate::database::{Database, Repository};
use crate::name::{sanitize_name, NameError};
use crate::store::{RepoStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RepoServiceError {
    #[error("Invalid repository name: {0}")]
    InvalidName(#[from] NameError),
    #[error("Repository '{0}' already exists")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Strip a trailing `.git` so records are keyed by the bare name
fn canonical_name(name: &str) -> Result<&str, NameError> {
    let name = sanitize_name(name)?;
    let bare = name.strip_suffix(".git").unwrap_or(name);
    if bare.is_empty() {
        return Err(NameError::Empty);
    }
    Ok(bare)
}

#[derive(Clone)]
pub struct RepoService {
    db: Database,
    store: RepoStore,
    deploy_branch: String,
}

impl RepoService {
    pub fn new(db: Database, store: RepoStore, deploy_branch: impl Into<String>) -> Self {
        RepoService {
            db,
            store,
            deploy_branch: deploy_branch.into(),
        }
    }

    /// Create the bare repository and its record
    pub async fn create_repository(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Repository, RepoServiceError> {
        let name = canonical_name(name)?;
        if !self.is_available(name).await? {
            return Err(RepoServiceError::Conflict(name.to_string()));
        }

        let path = self.store.ensure(name).await?;
        let repo = self
            .db
            .create_repository(name, description, &self.deploy_branch)
            .await?;

        info!(repo = %repo.name, path = %path.display(), "created repository");
        Ok(repo)
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, RepoServiceError> {
        Ok(self.db.list_repositories().await?)
    }

    /// Whether `name` is valid and not taken
    pub async fn check_name(&self, name: &str) -> Result<bool, RepoServiceError> {
        match canonical_name(name) {
            Ok(name) => self.is_available(name).await,
            Err(_) => Ok(false),
        }
    }

    async fn is_available(&self, name: &str) -> Result<bool, RepoServiceError> {
        if self.db.get_repository_by_name(name).await?.is_some() {
            return Ok(false);
        }
        Ok(!self.store.exists(name)?)
    }
}

//! Replaces the running container of a repository with one built from a
//! new image.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::labels::DeployLabels;

/// Error type for container operations
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Failed to {action} container {id}: {reason}")]
    Container {
        action: &'static str,
        id: String,
        reason: String,
    },
}

/// A container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Parameters for a new container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Container operations the swap needs from the runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers, stopped ones included, carrying every label in `labels`
    async fn list_labeled(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ManagedContainer>, SwapError>;

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), SwapError>;

    async fn remove(&self, id: &str) -> Result<(), SwapError>;

    /// Create a container that restarts unless stopped; returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SwapError>;

    async fn start(&self, id: &str) -> Result<(), SwapError>;
}

/// Name of the container running `commit` of `repo`
pub fn container_name(repo: &str, commit: &str) -> String {
    let short = commit.get(..7).unwrap_or(commit);
    format!("{}-{}", repo, short)
}

/// Stops and removes the containers of a repository, then starts the new one
#[derive(Clone)]
pub struct SwapManager {
    runtime: Arc<dyn ContainerRuntime>,
    labels: DeployLabels,
    stop_timeout: Duration,
}

impl SwapManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        labels: DeployLabels,
        stop_timeout: Duration,
    ) -> Self {
        SwapManager {
            runtime,
            labels,
            stop_timeout,
        }
    }

    /// Replace every deployed container of `repo` with one running `image_id`.
    ///
    /// Any failure aborts the swap; containers already removed stay removed.
    pub async fn swap(&self, image_id: &str, repo: &str, commit: &str) -> Result<String, SwapError> {
        let existing = self
            .runtime
            .list_labeled(&self.labels.selector(repo))
            .await?;

        for container in &existing {
            debug!(container = %container.id, repo, "stopping container");
            self.runtime.stop(&container.id, self.stop_timeout).await?;
            self.runtime.remove(&container.id).await?;
            info!(container = %container.id, repo, "removed previous container");
        }

        let spec = ContainerSpec {
            name: container_name(repo, commit),
            image: image_id.to_string(),
            labels: self.labels.for_commit(repo, commit),
        };
        let id = self.runtime.create(&spec).await?;
        self.runtime.start(&id).await?;

        info!(container = %id, name = %spec.name, commit, "container started");
        Ok(id)
    }
}

//! Docker Engine client backing image builds and container swaps.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, TagImageOptions};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::image::{image_repository, pack_context, BuildError, BuildProgress, ImageBuilder, LogSink};
use crate::labels::DeployLabels;
use crate::swap::{ContainerRuntime, ContainerSpec, ManagedContainer, SwapError};

/// Docker API client over the local socket, connected on first use
pub struct DockerClient {
    docker: OnceCell<Docker>,
    labels: DeployLabels,
}

impl DockerClient {
    pub fn new(labels: DeployLabels) -> Self {
        DockerClient {
            docker: OnceCell::new(),
            labels,
        }
    }

    /// Connect using `DOCKER_HOST` or the default local socket
    async fn docker(&self) -> Result<&Docker, DockerError> {
        self.docker
            .get_or_try_init(|| async { Docker::connect_with_local_defaults() })
            .await
    }
}

/// The daemon answers 304 when the container is already stopped
fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ImageBuilder for DockerClient {
    async fn build(
        &self,
        context: &Path,
        repo: &str,
        commit: &str,
        sink: &dyn LogSink,
    ) -> Result<String, BuildError> {
        let context_dir = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack_context(&context_dir))
            .await
            .map_err(|e| BuildError::Context(std::io::Error::other(e)))??;
        debug!(bytes = archive.len(), "packed build context");

        let image = image_repository(repo);
        let tag = format!("{}:{}", image, commit);
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.clone(),
            nocache: true,
            rm: true,
            labels: self.labels.for_commit(repo, commit),
            ..Default::default()
        };

        info!(tag = %tag, "building image");
        let mut progress = BuildProgress::default();
        let docker = self.docker().await?;
        let mut stream = docker.build_image(options, None, Some(Bytes::from(archive)));
        // Keep reading after a failure so the daemon finishes the build
        while let Some(message) = stream.next().await {
            match message {
                Ok(info) => progress.observe(&info, sink),
                Err(e) => {
                    sink.line(&e.to_string());
                    progress.fail(e.to_string());
                }
            }
        }
        let image_id = progress.finish()?;

        docker
            .tag_image(
                &image_id,
                Some(TagImageOptions {
                    repo: image.as_str(),
                    tag: "latest",
                }),
            )
            .await?;

        info!(image = %image_id, tag = %tag, "image built");
        Ok(image_id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_labeled(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ManagedContainer>, SwapError> {
        let label_filters: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), label_filters)]),
            ..Default::default()
        };

        let containers = self.docker().await?.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                Some(ManagedContainer {
                    id: summary.id?,
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), SwapError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker().await?.stop_container(id, Some(options)).await {
            Err(e) if is_not_modified(&e) => {
                debug!(container = id, "container already stopped");
                Ok(())
            }
            result => Ok(result?),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SwapError> {
        self.docker()
            .await?
            .remove_container(id, Some(RemoveContainerOptions::default()))
            .await?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, SwapError> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker().await?.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            debug!(container = %response.id, "docker warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), SwapError> {
        self.docker()
            .await?
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }
}

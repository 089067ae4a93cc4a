//! Image builds: packaging the build context and following the daemon's
//! build output.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use bollard::models::BuildInfo;
use tracing::info;

/// Receives build output one line at a time
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Forwards build output to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, line: &str) {
        info!(target: "githost::build", "{}", line);
    }
}

/// Error type for image builds
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to package build context: {0}")]
    Context(#[from] io::Error),
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Build failed: {0}")]
    Failed(String),
    #[error("Build finished without an image id")]
    MissingImageId,
}

/// Builds an image from a checked-out workspace
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `context` as `<repo>:<commit>` (also tagged `latest`) and
    /// return the image id
    async fn build(
        &self,
        context: &Path,
        repo: &str,
        commit: &str,
        sink: &dyn LogSink,
    ) -> Result<String, BuildError>;
}

/// Docker repository names must be lowercase
pub fn image_repository(repo: &str) -> String {
    repo.to_ascii_lowercase()
}

/// Accumulates the messages of a build stream
#[derive(Debug, Default)]
pub struct BuildProgress {
    image_id: Option<String>,
    errors: Vec<String>,
}

impl BuildProgress {
    pub fn observe(&mut self, info: &BuildInfo, sink: &dyn LogSink) {
        if let Some(stream) = info.stream.as_deref() {
            for line in stream.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
                sink.line(line);
            }
        }
        if let Some(id) = info.aux.as_ref().and_then(|aux| aux.id.as_ref()) {
            self.image_id = Some(id.clone());
        }
        if let Some(error) = info.error.as_deref() {
            sink.line(error);
            self.errors.push(error.trim().to_string());
        }
    }

    /// Record a failure that did not come from a build message
    pub fn fail(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn finish(self) -> Result<String, BuildError> {
        if !self.errors.is_empty() {
            return Err(BuildError::Failed(self.errors.join("; ")));
        }
        self.image_id.ok_or(BuildError::MissingImageId)
    }
}

/// Pack `dir` into an in-memory tar archive, leaving out `.git`
pub fn pack_context(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    builder.into_inner()
}

//! Relays smart HTTP requests to `git upload-pack` / `git receive-pack`
//! running in stateless-rpc mode.
//!
//! Nothing is buffered beyond a pipe-sized chunk: the request body is copied
//! into the child's stdin by a background task while the child's stdout is
//! exposed as a byte stream that the HTTP layer hands to the client as-is.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::protocol::{service_announcement, ProtocolError, RelayMode, Service};

/// Bytes of git stderr kept for logging
const MAX_STDERR: usize = 64 * 1024;

/// Output of a relayed git process, ending with an error if git failed
pub type RelayStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Error type for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to spawn git {0}: {1}")]
    Spawn(Service, io::Error),
    #[error("git {service} exited with {status}: {stderr}")]
    Exit {
        service: Service,
        status: ExitStatus,
        stderr: String,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Spawns git subprocesses for the smart HTTP protocol
#[derive(Debug, Clone)]
pub struct Relay {
    git_binary: String,
}

impl Relay {
    pub fn new(git_binary: impl Into<String>) -> Self {
        Relay {
            git_binary: git_binary.into(),
        }
    }

    /// Start `git <service> --stateless-rpc [--advertise-refs] <repo>`.
    ///
    /// In advertise mode the returned stream starts with the service
    /// announcement. `input` is piped to stdin when given, otherwise stdin is
    /// closed. Spawn failures are returned before any byte is produced;
    /// a non-zero exit surfaces as the final item of the stream. Dropping the
    /// stream kills the child.
    pub fn start<R>(
        &self,
        service: Service,
        repo_path: &Path,
        mode: RelayMode,
        input: Option<R>,
    ) -> Result<RelayStream, RelayError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let announcement = match mode {
            RelayMode::Advertise => Some(Bytes::from(service_announcement(service)?)),
            RelayMode::Rpc => None,
        };

        let mut command = Command::new(&self.git_binary);
        command.arg(service.subcommand()).arg("--stateless-rpc");
        if mode == RelayMode::Advertise {
            command.arg("--advertise-refs");
        }
        command
            .arg(repo_path)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = ?command.as_std(), "executing git command");
        let mut child = command
            .spawn()
            .map_err(|e| RelayError::Spawn(service, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("git stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("git stderr was not captured"))?;

        let stdin_task = match (input, child.stdin.take()) {
            (Some(mut input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut input, &mut stdin).await;
                let _ = stdin.shutdown().await;
                copied
            })),
            _ => None,
        };
        let stderr_task = tokio::spawn(collect_stderr(stderr));

        let completion = async move {
            let status = child.wait().await?;

            if let Some(task) = stdin_task {
                match task.await {
                    Ok(Ok(bytes)) => debug!(%service, bytes, "request body relayed"),
                    // git may stop reading early, e.g. when it rejects a push
                    Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(%service, "git closed stdin before the body ended")
                    }
                    Ok(Err(e)) => warn!(%service, "Failed to relay request body: {}", e),
                    Err(e) => warn!(%service, "request body task failed: {}", e),
                }
            }

            let stderr = stderr_task.await.unwrap_or_default();
            if status.success() {
                if !stderr.is_empty() {
                    debug!(%service, stderr = %stderr, "git stderr");
                }
                return Ok(());
            }

            error!(%service, %status, stderr = %stderr, "git command failed");
            Err::<(), io::Error>(io::Error::other(RelayError::Exit {
                service,
                status,
                stderr,
            }))
        };

        let tail = stream::once(completion).filter_map(|result: io::Result<()>| async move {
            result.err().map(Err::<Bytes, io::Error>)
        });

        Ok(Box::pin(
            stream::iter(announcement.map(Ok))
                .chain(ReaderStream::new(stdout))
                .chain(tail),
        ))
    }
}

/// Drain stderr completely so git never blocks on a full pipe, keeping
/// the first `MAX_STDERR` bytes.
async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match stderr.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_STDERR.saturating_sub(kept.len());
                kept.extend_from_slice(&buffer[..n.min(room)]);
            }
            Err(e) => {
                warn!("Failed to read git stderr: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

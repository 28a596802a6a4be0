//! Container image build through the engine's command line.

use crate::channel::OutputSink;
use crate::error::{CoreError, Result};
use crate::process::{self, OutputMode, ProcessError};
use crate::session::{SessionId, Stage};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Tag of a session's image, `<prefix>:<session-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageTag {
    tag: String,
    session: SessionId,
}

impl ImageTag {
    /// Unique tag for one session.
    pub fn for_session(prefix: &str, id: SessionId) -> Self {
        Self {
            tag: format!("{prefix}:{id}"),
            session: id,
        }
    }

    /// The tag as passed to the engine.
    pub fn as_str(&self) -> &str {
        &self.tag
    }

    /// Name of the interactive container started from this image.
    pub fn container_name(&self) -> String {
        format!("buildshell-{}", self.session.as_uuid().simple())
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Builds container images from a context directory.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `context` into an image tagged `tag`, streaming raw output.
    async fn build_image(
        &self,
        context: &Path,
        tag: &ImageTag,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> Result<()>;

    /// Delete a previously built image.
    async fn remove_image(&self, _tag: &ImageTag) -> Result<()> {
        Ok(())
    }
}

/// [`ImageBuilder`] driving `docker build` (or a compatible engine).
#[derive(Debug, Clone)]
pub struct DockerImageBuilder {
    engine: String,
}

impl DockerImageBuilder {
    /// Create a builder invoking `engine`.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build_image(
        &self,
        context: &Path,
        tag: &ImageTag,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::info!(%tag, context = %context.display(), "Building image");

        let mut command = Command::new(&self.engine);
        command.arg("build").arg("-t").arg(tag.as_str()).arg(context);

        let outcome = process::run_streaming(command, OutputMode::Raw, cancel, sink)
            .await
            .map_err(|e| match e {
                ProcessError::Cancelled => CoreError::Cancelled {
                    stage: Stage::BuildingImage,
                },
                ProcessError::Spawn(e) => CoreError::ImageBuild {
                    exit_code: None,
                    reason: format!("failed to start {}: {e}", self.engine),
                },
                ProcessError::Wait(e) => CoreError::ImageBuild {
                    exit_code: None,
                    reason: format!("waiting for {}: {e}", self.engine),
                },
            })?;

        if !outcome.status.success() {
            tracing::warn!(%tag, exit_code = ?outcome.status.code(), "Image build failed");
            return Err(CoreError::ImageBuild {
                exit_code: outcome.status.code(),
                reason: process::describe_status(&outcome.status),
            });
        }

        tracing::info!(
            %tag,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image built"
        );
        Ok(())
    }

    async fn remove_image(&self, tag: &ImageTag) -> Result<()> {
        tracing::debug!(%tag, "Removing image");
        let output = Command::new(&self.engine)
            .args(["rmi", "-f", tag.as_str()])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CoreError::Io(std::io::Error::other(format!(
                "{} rmi {tag}: {}",
                self.engine,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }
}

//! External build step: stage the build script and run it on a recipe.

use crate::channel::OutputSink;
use crate::error::{CoreError, Result};
use crate::fetch::{self, SpecFile};
use crate::process::{self, OutputMode, ProcessError};
use crate::session::Stage;
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// File name of the staged build script.
const SCRIPT_NAME: &str = "builder.py";

/// Directory produced by the build step and used as image build context.
///
/// The directory and everything in it is removed when this value is dropped.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: TempDir,
}

impl BuildWorkspace {
    /// Wrap a temporary directory.
    pub fn new(dir: TempDir) -> Self {
        Self { dir }
    }

    /// Path of the workspace.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Runs the external build procedure for a recipe.
#[async_trait]
pub trait BuildInvoker: Send + Sync {
    /// Build `spec`, streaming the tool's output line by line to `sink`.
    ///
    /// Every forwarded line has reached the sink when this returns.
    async fn build(
        &self,
        spec: &SpecFile,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> Result<BuildWorkspace>;
}

/// [`BuildInvoker`] that downloads a script and runs it with an interpreter.
///
/// Runs `<interpreter> <staging>/builder.py <spec>` with a fresh workspace as
/// working directory. The staging directory is removed when the call
/// returns; the workspace is handed to the caller.
#[derive(Debug, Clone)]
pub struct ScriptBuildInvoker {
    client: Client,
    script_url: String,
    interpreter: String,
    work_root: PathBuf,
    max_script_bytes: u64,
}

impl ScriptBuildInvoker {
    /// Create an invoker.
    pub fn new(
        script_url: impl Into<String>,
        interpreter: impl Into<String>,
        work_root: impl Into<PathBuf>,
        max_script_bytes: u64,
    ) -> Result<Self> {
        Ok(Self {
            client: fetch::http_client()?,
            script_url: script_url.into(),
            interpreter: interpreter.into(),
            work_root: work_root.into(),
            max_script_bytes,
        })
    }

    /// Download the build script into `staging`.
    async fn stage_script(&self, staging: &Path) -> std::result::Result<PathBuf, String> {
        let url = fetch::parse_http_url(&self.script_url)?;
        let response = fetch::get_checked(&self.client, url, self.max_script_bytes).await?;

        let script_path = staging.join(SCRIPT_NAME);
        let mut file = tokio::fs::File::create(&script_path)
            .await
            .map_err(|e| format!("creating {}: {e}", script_path.display()))?;
        let bytes = fetch::copy_body(response, &mut file, self.max_script_bytes).await?;

        tracing::debug!(path = %script_path.display(), bytes, "Build script staged");
        Ok(script_path)
    }
}

fn setup_error(reason: String) -> CoreError {
    CoreError::Build {
        exit_code: None,
        last_lines: Vec::new(),
        reason,
    }
}

#[async_trait]
impl BuildInvoker for ScriptBuildInvoker {
    async fn build(
        &self,
        spec: &SpecFile,
        cancel: &CancellationToken,
        sink: &OutputSink,
    ) -> Result<BuildWorkspace> {
        let start = std::time::Instant::now();
        let staging = tempfile::Builder::new()
            .prefix("builder")
            .tempdir_in(&self.work_root)
            .map_err(|e| setup_error(format!("creating script staging directory: {e}")))?;

        let script = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CoreError::Cancelled { stage: Stage::BuildingScript });
            }
            staged = self.stage_script(staging.path()) => staged
                .map_err(|e| setup_error(format!("fetching build script: {e}")))?,
        };

        let workspace = tempfile::Builder::new()
            .prefix("buildshell-workspace-")
            .tempdir_in(&self.work_root)
            .map_err(|e| setup_error(format!("creating workspace: {e}")))?;

        tracing::info!(
            interpreter = %self.interpreter,
            spec = %spec.path().display(),
            workspace = %workspace.path().display(),
            "Running build script"
        );

        let mut command = Command::new(&self.interpreter);
        command
            .arg(&script)
            .arg(spec.path())
            .current_dir(workspace.path());

        let outcome = process::run_streaming(command, OutputMode::Lines, cancel, sink)
            .await
            .map_err(|e| match e {
                ProcessError::Cancelled => CoreError::Cancelled {
                    stage: Stage::BuildingScript,
                },
                ProcessError::Spawn(e) => {
                    setup_error(format!("failed to start {}: {e}", self.interpreter))
                }
                ProcessError::Wait(e) => setup_error(format!("waiting for build script: {e}")),
            })?;

        if !outcome.status.success() {
            tracing::warn!(
                exit_code = ?outcome.status.code(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Build script failed"
            );
            return Err(CoreError::Build {
                exit_code: outcome.status.code(),
                last_lines: outcome.tail,
                reason: process::describe_status(&outcome.status),
            });
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Build script completed"
        );
        Ok(BuildWorkspace::new(workspace))
    }
}

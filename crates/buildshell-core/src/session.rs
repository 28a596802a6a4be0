//! Session orchestration.
//!
//! A session walks a strictly linear state machine:
//!
//! ```text
//! Idle → Downloading → BuildingScript → BuildingImage → Attaching → Interactive → Closed
//!   └──────────────┴──────────────┴───────────────┴────────────┴→ Failed → Closed
//! ```
//!
//! Stage output funnels through one [`OutputSink`] backed by the client's
//! outbound queue: text frames until the terminal is attached, binary frames
//! afterwards. A per-session [`CancellationToken`] (a child of the
//! orchestrator's shutdown token) is fired by client disconnect, an explicit
//! cancel request, or shutdown, and every adapter observes it before it
//! starts anything.

use crate::attach::{AttachedTerminal, DockerAttacher, TerminalAttacher};
use crate::builder::{BuildInvoker, ScriptBuildInvoker};
use crate::channel::{ClientChannel, Frame, OutputSink};
use crate::config::{PipelineConfig, TerminalSize};
use crate::error::{CoreError, Result, SPEC_REQUIRED};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::image::{DockerImageBuilder, ImageBuilder, ImageTag};
use crate::registry::SessionRegistry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A client message consisting solely of this byte (Ctrl-C) cancels the
/// session while it is still building.
pub const CANCEL_BYTE: u8 = 0x03;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Connected, nothing started yet.
    Idle,
    /// Fetching the recipe.
    Downloading,
    /// Running the external build script.
    BuildingScript,
    /// Building the container image.
    BuildingImage,
    /// Starting the interactive container.
    Attaching,
    /// Forwarding terminal bytes in both directions.
    Interactive,
    /// Channel closed; terminal.
    Closed,
    /// A stage failed; only `Closed` may follow.
    Failed,
}

impl Stage {
    /// True for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::BuildingScript => "building_script",
            Self::BuildingImage => "building_image",
            Self::Attaching => "attaching",
            Self::Interactive => "interactive",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Parameters of one connection request.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Locator of the recipe to build. Required.
    pub spec_url: Option<String>,
    /// Initial terminal size; the configured default when absent.
    pub terminal_size: Option<TerminalSize>,
}

impl SessionRequest {
    /// Request for the given recipe locator.
    pub fn new(spec_url: impl Into<String>) -> Self {
        Self {
            spec_url: Some(spec_url.into()),
            terminal_size: None,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The terminal was attached; the session ended when either side hung up.
    Interactive,
    /// A stage failed and a diagnostic was sent.
    Failed(CoreError),
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    /// Session identifier.
    pub id: SessionId,
    /// Every stage entered, in order, starting with `Idle`.
    pub transitions: Vec<Stage>,
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Tag of the image, if the image stage was reached.
    pub image: Option<ImageTag>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

impl SessionReport {
    /// The error that ended the session, if any.
    pub fn error(&self) -> Option<&CoreError> {
        match &self.outcome {
            SessionOutcome::Failed(e) => Some(e),
            SessionOutcome::Interactive => None,
        }
    }

    /// True if the session reached `Interactive`.
    pub fn reached_interactive(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Interactive)
    }
}

/// The stage adapters a session drives.
#[derive(Clone)]
pub struct Adapters {
    /// Recipe download.
    pub fetcher: Arc<dyn Fetcher>,
    /// External build step.
    pub invoker: Arc<dyn BuildInvoker>,
    /// Image build.
    pub images: Arc<dyn ImageBuilder>,
    /// Interactive attach.
    pub attacher: Arc<dyn TerminalAttacher>,
}

impl Adapters {
    /// HTTP download, script build and container engine adapters.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(
                &config.work_root,
                config.max_download_bytes,
            )?),
            invoker: Arc::new(ScriptBuildInvoker::new(
                &config.script_url,
                &config.interpreter,
                &config.work_root,
                config.max_download_bytes,
            )?),
            images: Arc::new(DockerImageBuilder::new(&config.engine)),
            attacher: Arc::new(DockerAttacher::new(&config.engine, &config.shell)),
        })
    }
}

/// Runs sessions against a fixed set of adapters.
pub struct Orchestrator {
    config: PipelineConfig,
    adapters: Adapters,
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with explicit adapters.
    pub fn new(config: PipelineConfig, adapters: Adapters) -> Self {
        let registry = SessionRegistry::new(config.max_sessions);
        Self {
            config,
            adapters,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create an orchestrator using the HTTP and container engine adapters.
    pub fn with_defaults(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let adapters = Adapters::from_config(&config)?;
        Ok(Self::new(config, adapters))
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Live sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Cancel every live session and refuse new ones.
    pub fn shutdown(&self) {
        tracing::info!(active = self.registry.len(), "Cancelling all sessions");
        self.shutdown.cancel();
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Drive one session to completion over `channel`.
    ///
    /// Returns once the session is `Closed`. All outbound senders are dropped
    /// by then, so the transport sees the outbound queue end.
    pub async fn run_session(&self, request: SessionRequest, channel: ClientChannel) -> SessionReport {
        let ClientChannel { inbound, outbound } = channel;
        let (stage_tx, stage_rx) = watch::channel(Stage::Idle);
        let mut session = Session {
            id: SessionId::new(),
            stage: Stage::Idle,
            transitions: vec![Stage::Idle],
            stage_tx,
            cancel: self.shutdown.child_token(),
            sink: OutputSink::new(outbound.clone()),
            image: None,
        };
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        tracing::info!(session_id = %session.id, "Session started");

        let url = match recipe_locator(&request) {
            Ok(url) => url,
            Err(e) => {
                let outcome = session.fail(e).await;
                return session.finish(outcome, started_at);
            }
        };

        let _registration = match self.registry.register(session.id, stage_rx) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Session rejected");
                let outcome = session.fail(e).await;
                return session.finish(outcome, started_at);
            }
        };

        let handoff = CancellationToken::new();
        let watcher = tokio::spawn(watch_client(
            inbound,
            session.cancel.clone(),
            handoff.clone(),
        ));

        let outcome = match self.prepare(&mut session, url).await {
            Ok(tag) => match self.attach(&mut session, &request, tag, handoff, watcher, outbound).await {
                Ok(()) => SessionOutcome::Interactive,
                Err(e) => session.fail(e).await,
            },
            Err(e) => {
                watcher.abort();
                let _ = watcher.await;
                drop(outbound);
                session.fail(e).await
            }
        };

        session.cancel.cancel();
        let report = session.finish(outcome, started_at);

        if self.config.cleanup_images {
            if let Some(tag) = &report.image {
                if let Err(e) = self.adapters.images.remove_image(tag).await {
                    tracing::warn!(session_id = %report.id, %tag, error = %e, "Failed to remove image");
                }
            }
        }

        tracing::info!(
            session_id = %report.id,
            interactive = report.reached_interactive(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Session closed"
        );
        report
    }

    /// Download, build script and build image. The recipe file and the build
    /// workspace are both removed before this returns.
    async fn prepare(&self, session: &mut Session, url: &str) -> Result<ImageTag> {
        session.enter(Stage::Downloading)?;
        let spec = self.adapters.fetcher.fetch(url, &session.cancel).await?;

        session.enter(Stage::BuildingScript)?;
        let workspace = self
            .adapters
            .invoker
            .build(&spec, &session.cancel, &session.sink)
            .await?;
        drop(spec);

        session.enter(Stage::BuildingImage)?;
        let tag = ImageTag::for_session(&self.config.image_prefix, session.id);
        session.image = Some(tag.clone());
        self.adapters
            .images
            .build_image(workspace.path(), &tag, &session.cancel, &session.sink)
            .await?;

        tracing::debug!(session_id = %session.id, workspace = %workspace.path().display(), "Removing workspace");
        drop(workspace);
        Ok(tag)
    }

    /// Attach the terminal and forward bytes until either side hangs up.
    async fn attach(
        &self,
        session: &mut Session,
        request: &SessionRequest,
        tag: ImageTag,
        handoff: CancellationToken,
        watcher: JoinHandle<Option<mpsc::Receiver<Bytes>>>,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<()> {
        let terminal = match self.start_terminal(session, request, &tag).await {
            Ok(terminal) => terminal,
            Err(e) => {
                watcher.abort();
                let _ = watcher.await;
                return Err(e);
            }
        };

        handoff.cancel();
        let Some(inbound) = watcher.await.ok().flatten() else {
            return Err(CoreError::Cancelled {
                stage: Stage::Attaching,
            });
        };
        // Dropping `terminal` on this error path kills the process.
        session.enter(Stage::Interactive)?;

        let (output, input, guard) = terminal.into_parts();
        let mut to_terminal = tokio::spawn(forward_input(inbound, input));
        let mut to_client = tokio::spawn(forward_output(output, outbound));

        let (client_done, terminal_done) = tokio::select! {
            _ = session.cancel.cancelled() => (false, false),
            _ = &mut to_terminal => (true, false),
            _ = &mut to_client => (false, true),
        };
        let reason = match (client_done, terminal_done) {
            (true, _) => "client disconnected",
            (_, true) => "terminal exited",
            _ => "cancelled",
        };
        tracing::info!(session_id = %session.id, reason, "Interactive stage ended");

        guard.terminate();
        if !client_done {
            to_terminal.abort();
            let _ = to_terminal.await;
        }
        if !terminal_done {
            to_client.abort();
            let _ = to_client.await;
        }
        session.transition(Stage::Closed);
        Ok(())
    }

    async fn start_terminal(
        &self,
        session: &mut Session,
        request: &SessionRequest,
        tag: &ImageTag,
    ) -> Result<AttachedTerminal> {
        session.enter(Stage::Attaching)?;
        let size = request
            .terminal_size
            .unwrap_or(self.config.default_terminal_size);
        self.adapters
            .attacher
            .attach(tag, size, &session.cancel)
            .await
    }
}

/// The trimmed recipe locator, checked before anything else happens.
fn recipe_locator(request: &SessionRequest) -> Result<&str> {
    request
        .spec_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| CoreError::ClientRequest(SPEC_REQUIRED.to_string()))
}

/// Mutable per-session state.
struct Session {
    id: SessionId,
    stage: Stage,
    transitions: Vec<Stage>,
    stage_tx: watch::Sender<Stage>,
    cancel: CancellationToken,
    sink: OutputSink,
    image: Option<ImageTag>,
}

impl Session {
    /// Enter `next`, unless cancellation already fired.
    fn enter(&mut self, next: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            let stage = if self.stage == Stage::Idle {
                next
            } else {
                self.stage
            };
            return Err(CoreError::Cancelled { stage });
        }
        self.transition(next);
        Ok(())
    }

    fn transition(&mut self, next: Stage) {
        debug_assert!(
            !self.stage.is_terminal() || next == Stage::Closed,
            "{} cannot follow {}",
            next,
            self.stage
        );
        tracing::debug!(session_id = %self.id, from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
        self.transitions.push(next);
        self.stage_tx.send_replace(next);
    }

    /// Enter `Failed`, send the diagnostic, then close.
    async fn fail(&mut self, error: CoreError) -> SessionOutcome {
        if error.is_cancelled() {
            tracing::info!(session_id = %self.id, stage = %self.stage, "Session cancelled");
        } else {
            tracing::warn!(session_id = %self.id, stage = %self.stage, error = %error, "Session failed");
        }
        self.transition(Stage::Failed);
        if self.sink.send_text(error.diagnostic()).await.is_err() {
            tracing::debug!(session_id = %self.id, "Client gone before diagnostic");
        }
        self.transition(Stage::Closed);
        SessionOutcome::Failed(error)
    }

    fn finish(self, outcome: SessionOutcome, started_at: DateTime<Utc>) -> SessionReport {
        SessionReport {
            id: self.id,
            transitions: self.transitions,
            outcome,
            image: self.image,
            started_at,
        }
    }
}

/// Watch the client before the terminal is attached.
///
/// Disconnect or a lone [`CANCEL_BYTE`] fires `cancel`; other input is
/// discarded. Once `handoff` fires the receiver is returned for the
/// interactive stage.
async fn watch_client(
    mut inbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    handoff: CancellationToken,
) -> Option<mpsc::Receiver<Bytes>> {
    loop {
        tokio::select! {
            biased;
            _ = handoff.cancelled() => return Some(inbound),
            message = inbound.recv() => match message {
                None => {
                    tracing::info!("Client disconnected");
                    cancel.cancel();
                    return None;
                }
                Some(bytes) if bytes.as_ref() == [CANCEL_BYTE] => {
                    tracing::info!("Client requested cancellation");
                    cancel.cancel();
                    return None;
                }
                Some(bytes) => tracing::trace!(len = bytes.len(), "Ignoring input before attach"),
            },
        }
    }
}

async fn forward_input(mut inbound: mpsc::Receiver<Bytes>, input: mpsc::Sender<Bytes>) {
    while let Some(bytes) = inbound.recv().await {
        if input.send(bytes).await.is_err() {
            break;
        }
    }
}

async fn forward_output(mut output: mpsc::Receiver<Bytes>, outbound: mpsc::Sender<Frame>) {
    while let Some(bytes) = output.recv().await {
        if outbound.send(Frame::Binary(bytes)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [
            Stage::Idle,
            Stage::Downloading,
            Stage::BuildingScript,
            Stage::BuildingImage,
            Stage::Attaching,
            Stage::Interactive,
            Stage::Closed,
            Stage::Failed,
        ] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.to_string());
        }
    }

    #[test]
    fn test_terminal_stages() {
        assert!(Stage::Closed.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Interactive.is_terminal());
    }

    #[test]
    fn test_session_id_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        let uuid = Uuid::new_v4();
        assert_eq!(SessionId::from(uuid).to_string(), uuid.to_string());
    }

    #[tokio::test]
    async fn test_watch_client_cancel_byte() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handoff = CancellationToken::new();
        let task = tokio::spawn(watch_client(rx, cancel.clone(), handoff));

        tx.send(Bytes::from_static(b"ls")).await.unwrap();
        tx.send(Bytes::from_static(&[CANCEL_BYTE])).await.unwrap();

        assert!(task.await.unwrap().is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_client_disconnect() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_client(rx, cancel.clone(), CancellationToken::new()));

        drop(tx);
        assert!(task.await.unwrap().is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_client_handoff_returns_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handoff = CancellationToken::new();
        let task = tokio::spawn(watch_client(rx, cancel.clone(), handoff.clone()));

        handoff.cancel();
        let mut inbound = task.await.unwrap().expect("receiver handed back");
        assert!(!cancel.is_cancelled());

        tx.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), Bytes::from_static(b"x"));
    }
}

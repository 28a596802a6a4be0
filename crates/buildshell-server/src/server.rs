//! BuildShellServer - shared state behind every HTTP handler.

use crate::config::ServerConfig;
use buildshell_core::{Adapters, Orchestrator, SessionSummary};
use std::sync::Arc;

/// Server state: the session orchestrator and its adapters.
///
/// Cheap to clone; all clones drive the same orchestrator.
#[derive(Clone)]
pub struct BuildShellServer {
    orchestrator: Arc<Orchestrator>,
}

impl BuildShellServer {
    /// Create a server using the HTTP and container engine adapters.
    pub fn new(config: &ServerConfig) -> buildshell_core::Result<Self> {
        let orchestrator = Orchestrator::with_defaults(config.pipeline.clone())?;
        tracing::info!(
            engine = %config.pipeline.engine,
            image_prefix = %config.pipeline.image_prefix,
            max_sessions = config.pipeline.max_sessions,
            "Orchestrator ready"
        );
        Ok(Self::from_orchestrator(orchestrator))
    }

    /// Create a server with injected stage adapters.
    pub fn with_adapters(config: &ServerConfig, adapters: Adapters) -> Self {
        Self::from_orchestrator(Orchestrator::new(config.pipeline.clone(), adapters))
    }

    fn from_orchestrator(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// The session orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Snapshot of live sessions.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.orchestrator.registry().list()
    }

    /// Cancel every live session.
    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

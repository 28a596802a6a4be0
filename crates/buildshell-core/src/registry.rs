//! Registry of live sessions.

use crate::error::{CoreError, Result};
use crate::session::{SessionId, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Stage the session is currently in.
    pub stage: Stage,
    /// When the client connected.
    pub started_at: DateTime<Utc>,
}

struct Entry {
    stage: watch::Receiver<Stage>,
    started_at: DateTime<Utc>,
}

/// Tracks live sessions and enforces the concurrent session limit.
///
/// Cloning is cheap; all clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, Entry>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a registry allowing `max_sessions` live sessions (0 = unlimited).
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session; it is removed when the returned guard drops.
    pub fn register(&self, id: SessionId, stage: watch::Receiver<Stage>) -> Result<Registration> {
        let mut sessions = self.lock();
        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            return Err(CoreError::ClientRequest(format!(
                "session limit reached ({})",
                self.max_sessions
            )));
        }
        sessions.insert(
            id,
            Entry {
                stage,
                started_at: Utc::now(),
            },
        );
        tracing::debug!(session_id = %id, active = sessions.len(), "Session registered");
        Ok(Registration {
            id,
            registry: self.clone(),
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no session is live.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current stage of every live session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .lock()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: id.to_string(),
                stage: *entry.stage.borrow(),
                started_at: entry.started_at,
            })
            .collect();
        list.sort_by_key(|s| s.started_at);
        list
    }
}

/// Keeps a session listed in its registry.
pub struct Registration {
    id: SessionId,
    registry: SessionRegistry,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut sessions = self.registry.lock();
        sessions.remove(&self.id);
        tracing::debug!(session_id = %self.id, active = sessions.len(), "Session unregistered");
    }
}

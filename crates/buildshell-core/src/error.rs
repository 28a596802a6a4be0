//! Error types for buildshell-core.

use crate::session::Stage;
use thiserror::Error;

/// Result type alias for buildshell-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Diagnostic sent when the connection request carries no recipe locator.
pub const SPEC_REQUIRED: &str = "spec query param required";

/// Errors that can end a session.
///
/// Each variant corresponds to the stage that failed. The `Display` output is
/// the diagnostic text delivered to the client before the channel closes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or invalid connection request; no stage was started.
    #[error("{0}")]
    ClientRequest(String),

    /// The recipe could not be fetched.
    #[error("download failed: {0}")]
    Download(String),

    /// The external build script failed or could not be run.
    #[error("builder error: {reason}")]
    Build {
        /// Exit code of the script, if it ran to completion.
        exit_code: Option<i32>,
        /// Last lines the script printed before failing.
        last_lines: Vec<String>,
        /// Human readable cause.
        reason: String,
    },

    /// The container engine failed to build the image.
    #[error("docker build error: {reason}")]
    ImageBuild {
        /// Exit code of the engine, if it ran to completion.
        exit_code: Option<i32>,
        /// Human readable cause.
        reason: String,
    },

    /// The interactive container could not be started.
    #[error("terminal start failed: {0}")]
    Attach(String),

    /// The session was cancelled by the client or by server shutdown.
    #[error("cancelled during {stage}")]
    Cancelled {
        /// Stage that was in flight when cancellation fired.
        stage: Stage,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The diagnostic line sent to the client for this error.
    pub fn diagnostic(&self) -> String {
        format!("{self}\n")
    }

    /// True if the session ended because cancellation fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

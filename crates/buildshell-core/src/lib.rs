//! # buildshell-core
//!
//! Session orchestration for buildshell: turns a remote build recipe into an
//! interactive shell inside a freshly built container image, streaming every
//! stage's output over one duplex client channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                             │
//! │                                                               │
//! │  Idle → Downloading → BuildingScript → BuildingImage          │
//! │           │               │                 │                 │
//! │           ▼               ▼                 ▼                 │
//! │       Fetcher       BuildInvoker       ImageBuilder           │
//! │    (HTTP → temp)   (script, lines)   (engine build, raw)      │
//! │                                                               │
//! │       → Attaching → Interactive → Closed                      │
//! │           │             ▲   │                                 │
//! │           ▼             │   ▼                                 │
//! │     TerminalAttacher   client ⇄ pty forwarding tasks          │
//! └───────────────────────────────────────────────────────────────┘
//!                 │ Frame::Text / Frame::Binary
//!                 ▼
//!           ClientChannel (bounded queues, transport-agnostic)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use buildshell_core::{ClientChannel, Orchestrator, PipelineConfig, SessionRequest};
//!
//! # async fn example() -> buildshell_core::Result<()> {
//! let orchestrator = Orchestrator::with_defaults(PipelineConfig::default())?;
//! let (channel, transport) = ClientChannel::pair(256);
//!
//! // Hand `transport` to whatever pumps bytes to and from the client.
//! let report = orchestrator
//!     .run_session(SessionRequest::new("https://example.com/recipe.yaml"), channel)
//!     .await;
//! println!("session {} ended: {:?}", report.id, report.outcome);
//! # Ok(())
//! # }
//! ```

mod attach;
mod builder;
mod channel;
mod config;
mod error;
mod fetch;
mod image;
mod process;
mod registry;
mod session;

pub use attach::{AttachedTerminal, DockerAttacher, TerminalAttacher, TerminalGuard};
pub use builder::{BuildInvoker, BuildWorkspace, ScriptBuildInvoker};
pub use channel::{ClientChannel, Frame, OutputSink, SinkClosed, TransportEnd, Utf8Chunker};
pub use config::{
    PipelineConfig, PipelineConfigBuilder, TerminalSize, DEFAULT_MAX_DOWNLOAD_BYTES,
    DEFAULT_SCRIPT_URL,
};
pub use error::{CoreError, Result, SPEC_REQUIRED};
pub use fetch::{Fetcher, HttpFetcher, SpecFile};
pub use image::{DockerImageBuilder, ImageBuilder, ImageTag};
pub use registry::{Registration, SessionRegistry, SessionSummary};
pub use session::{
    Adapters, Orchestrator, SessionId, SessionOutcome, SessionReport, SessionRequest, Stage,
    CANCEL_BYTE,
};

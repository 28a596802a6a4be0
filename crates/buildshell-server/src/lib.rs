//! # buildshell-server
//!
//! WebSocket server that turns a build recipe into an interactive shell
//! inside a freshly built container image.
//!
//! ## Quick Start
//!
//! Run the server with default configuration:
//!
//! ```bash
//! cargo run -p buildshell-server
//! ```
//!
//! Configure via environment variables:
//!
//! ```bash
//! export BUILDSHELL_HTTP_PORT=8080
//! export BUILDSHELL_ENGINE=podman
//! export BUILDSHELL_WORK_DIR=/var/tmp/buildshell
//! cargo run -p buildshell-server
//! ```
//!
//! Then connect a terminal client to `ws://localhost:8080/ws?spec=<recipe-url>`.
//!
//! ## Session protocol
//!
//! | Stage | Server → client | Client → server |
//! |-------|-----------------|-----------------|
//! | download, build script, image build | text: log lines, progress, diagnostics | a single `0x03` byte cancels |
//! | interactive | binary: raw terminal output | text or binary: terminal input |

pub mod http;
pub mod ws;

mod config;
mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::BuildShellServer;

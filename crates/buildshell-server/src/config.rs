//! Configuration for the buildshell server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use buildshell_core::{CoreError, PipelineConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for the buildshell server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Settings shared by every session.
    pub pipeline: PipelineConfig,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("work directory not found: {0}")]
    MissingWorkDir(PathBuf),

    #[error(transparent)]
    Pipeline(#[from] CoreError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BUILDSHELL_HTTP_HOST` | `0.0.0.0` |
    /// | `BUILDSHELL_HTTP_PORT` | `8080` |
    /// | `BUILDSHELL_SCRIPT_URL` | NeuroDesk `builder/build.py` |
    /// | `BUILDSHELL_INTERPRETER` | `python` |
    /// | `BUILDSHELL_ENGINE` | `docker` |
    /// | `BUILDSHELL_IMAGE_PREFIX` | `buildshell` |
    /// | `BUILDSHELL_SHELL` | `/bin/bash` |
    /// | `BUILDSHELL_WORK_DIR` | system temp dir |
    /// | `BUILDSHELL_CLEANUP_IMAGES` | `true` |
    /// | `BUILDSHELL_MAX_SESSIONS` | `16` (0 = unlimited) |
    pub fn from_env() -> Self {
        let default = PipelineConfig::default();

        let http_host: IpAddr = std::env::var("BUILDSHELL_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let http_port: u16 = std::env::var("BUILDSHELL_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let pipeline = PipelineConfig {
            script_url: std::env::var("BUILDSHELL_SCRIPT_URL").unwrap_or(default.script_url),
            interpreter: std::env::var("BUILDSHELL_INTERPRETER").unwrap_or(default.interpreter),
            engine: std::env::var("BUILDSHELL_ENGINE").unwrap_or(default.engine),
            image_prefix: std::env::var("BUILDSHELL_IMAGE_PREFIX")
                .unwrap_or(default.image_prefix),
            shell: std::env::var("BUILDSHELL_SHELL").unwrap_or(default.shell),
            work_root: std::env::var("BUILDSHELL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.work_root),
            cleanup_images: std::env::var("BUILDSHELL_CLEANUP_IMAGES")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.cleanup_images),
            max_sessions: std::env::var("BUILDSHELL_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sessions),
            ..default
        };

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            pipeline,
        }
    }

    /// Validate the configuration.
    ///
    /// Call this at startup to get clear error messages about bad settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pipeline.work_root.is_dir() {
            return Err(ConfigError::MissingWorkDir(self.pipeline.work_root.clone()));
        }
        self.pipeline.validate()?;
        Ok(())
    }

    /// Log warnings for external tools that cannot be found.
    ///
    /// Sessions fail at the matching stage if a tool is really missing.
    pub fn validate_warn(&self) {
        if which::which(&self.pipeline.interpreter).is_err() {
            tracing::warn!("Interpreter not found on PATH: {}", self.pipeline.interpreter);
        }

        if which::which(&self.pipeline.engine).is_err() {
            tracing::warn!("Container engine not found on PATH: {}", self.pipeline.engine);
        }
    }
}

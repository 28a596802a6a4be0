//! Pipeline configuration types.

use crate::error::CoreError;
use std::path::PathBuf;

/// Build script fetched for every session unless overridden.
pub const DEFAULT_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/NeuroDesk/neurocontainers/main/builder/build.py";

/// Maximum size of a downloaded recipe or build script (10 MB).
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Initial size of the pseudo-terminal, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Configuration shared by every session of an orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// URL of the build script staged for each session.
    pub script_url: String,
    /// Interpreter that runs the build script (default: `python`).
    pub interpreter: String,
    /// Container engine binary (default: `docker`).
    pub engine: String,
    /// Repository part of per-session image tags (default: `buildshell`).
    pub image_prefix: String,
    /// Shell started inside the built image (default: `/bin/bash`).
    pub shell: String,
    /// Directory for recipes, script staging and build workspaces.
    pub work_root: PathBuf,
    /// Size limit for downloads.
    pub max_download_bytes: u64,
    /// Capacity of the per-session outbound and inbound queues.
    pub queue_capacity: usize,
    /// Remove the session image once the session closes (default: true).
    pub cleanup_images: bool,
    /// Maximum number of concurrent sessions (0 = unlimited).
    pub max_sessions: usize,
    /// Terminal size used when the client does not send one.
    pub default_terminal_size: TerminalSize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            script_url: DEFAULT_SCRIPT_URL.to_string(),
            interpreter: "python".to_string(),
            engine: "docker".to_string(),
            image_prefix: "buildshell".to_string(),
            shell: "/bin/bash".to_string(),
            work_root: std::env::temp_dir(),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            queue_capacity: 256,
            cleanup_images: true,
            max_sessions: 16,
            default_terminal_size: TerminalSize::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new config builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.script_url.trim().is_empty() {
            return Err(CoreError::InvalidConfig("script_url is required".into()));
        }
        if reqwest::Url::parse(&self.script_url).is_err() {
            return Err(CoreError::InvalidConfig(format!(
                "script_url is not a valid URL: {}",
                self.script_url
            )));
        }
        if self.interpreter.trim().is_empty() {
            return Err(CoreError::InvalidConfig("interpreter is required".into()));
        }
        if self.engine.trim().is_empty() {
            return Err(CoreError::InvalidConfig("engine is required".into()));
        }
        if !is_valid_repository(&self.image_prefix) {
            return Err(CoreError::InvalidConfig(format!(
                "image_prefix is not a valid repository name: {:?}",
                self.image_prefix
            )));
        }
        if self.shell.trim().is_empty() {
            return Err(CoreError::InvalidConfig("shell is required".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.max_download_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "max_download_bytes must be > 0".into(),
            ));
        }
        let size = self.default_terminal_size;
        if size.cols == 0 || size.rows == 0 {
            return Err(CoreError::InvalidConfig(
                "terminal size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// Docker repository names: lowercase alphanumerics separated by `.`, `_`, `-` or `/`.
fn is_valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
}

/// Builder for PipelineConfig.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the build script URL.
    pub fn script_url(mut self, url: impl Into<String>) -> Self {
        self.config.script_url = url.into();
        self
    }

    /// Set the script interpreter.
    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.config.interpreter = interpreter.into();
        self
    }

    /// Set the container engine binary.
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.config.engine = engine.into();
        self
    }

    /// Set the image repository prefix.
    pub fn image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.image_prefix = prefix.into();
        self
    }

    /// Set the shell started in the container.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self
    }

    /// Set the working directory root.
    pub fn work_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.work_root = path.into();
        self
    }

    /// Set the download size limit.
    pub fn max_download_bytes(mut self, bytes: u64) -> Self {
        self.config.max_download_bytes = bytes;
        self
    }

    /// Set the per-session queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Enable or disable image removal at session end.
    pub fn cleanup_images(mut self, enabled: bool) -> Self {
        self.config.cleanup_images = enabled;
        self
    }

    /// Set the concurrent session limit (0 = unlimited).
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the default terminal size.
    pub fn default_terminal_size(mut self, size: TerminalSize) -> Self {
        self.config.default_terminal_size = size;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<PipelineConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.script_url, DEFAULT_SCRIPT_URL);
        assert_eq!(config.interpreter, "python");
        assert_eq!(config.engine, "docker");
        assert_eq!(config.shell, "/bin/bash");
        assert!(config.cleanup_images);
        assert_eq!(config.default_terminal_size, TerminalSize { cols: 80, rows: 24 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_prefix() {
        assert!(PipelineConfig::builder()
            .image_prefix("Has-Upper")
            .build()
            .is_err());
        assert!(PipelineConfig::builder().image_prefix("").build().is_err());
        assert!(PipelineConfig::builder()
            .image_prefix("-leading")
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_bad_script_url() {
        let result = PipelineConfig::builder().script_url("not a url").build();
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_zero_queue() {
        assert!(PipelineConfig::builder().queue_capacity(0).build().is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = PipelineConfig::builder()
            .script_url("http://localhost:9000/build.py")
            .interpreter("python3")
            .engine("podman")
            .image_prefix("registry.local/recipes")
            .shell("/bin/sh")
            .work_root("/var/tmp/buildshell")
            .cleanup_images(false)
            .max_sessions(4)
            .default_terminal_size(TerminalSize { cols: 120, rows: 40 })
            .build()
            .expect("should build successfully");

        assert_eq!(config.engine, "podman");
        assert_eq!(config.image_prefix, "registry.local/recipes");
        assert_eq!(config.work_root, PathBuf::from("/var/tmp/buildshell"));
        assert!(!config.cleanup_images);
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.default_terminal_size.cols, 120);
    }
}

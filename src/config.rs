//! # Configuration Management
//!
//! Loads the settings that shape how alignment runs: daemon mode, the idle
//! cleanup timeout, the device, and where models live.
//!
//! ## Sources (highest priority first):
//! 1. Command-line flags (applied by `main`, not here)
//! 2. Environment variables: `SPEECH_ALIGN__ALIGNMENT__DEVICE=cpu`
//! 3. Configuration file: `speech-align.toml` in the working directory
//! 4. Default values (the `Default` impl below)
//!
//! A `.env` file is read into the environment before any of this runs.
//!
//! ## Example `speech-align.toml`:
//! ```toml
//! [alignment]
//! enable_daemon_process = true
//! auto_cleanup_timeout_seconds = 120
//! apply_timeout_seconds = 0   # 0 waits forever
//! device = "cuda"
//! model_dir = "/models/align"
//! ```
//!
//! ## Key Rust Concepts Used:
//! - **`config::Config::builder()`**: layers sources; later sources override
//!   earlier ones key by key, so a partial file only changes what it names
//! - **Serde defaults**: `Config::try_from(&AppConfig::default())` seeds the
//!   builder, so every key has a value before the file is read
//! - **`anyhow::Context`**: attaches the file path to a load failure

use crate::alignment::ContainerState;    // What the container actually consumes
use crate::device::DevicePreference;
use anyhow::{Context, Result};           // Error handling with context
use serde::{Deserialize, Serialize};     // File/env <-> struct conversion
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base name of the optional configuration file.
const CONFIG_FILE: &str = "speech-align";

/// Environment variable prefix; sections and keys are separated by `__`.
const ENV_PREFIX: &str = "SPEECH_ALIGN";

/// Application configuration.
///
/// Grouped in sections so the file and environment keys read
/// `alignment.device` / `SPEECH_ALIGN__ALIGNMENT__DEVICE`.
///
/// ## Why a single section:
/// Everything configurable today concerns alignment. Keeping it under
/// `[alignment]` leaves room for other sections without renaming keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub alignment: AlignmentConfig,
}

/// Alignment settings.
///
/// ## Fields:
/// - `enable_daemon_process`: run alignment in a disposable worker process
/// - `auto_cleanup_timeout_seconds`: idle time before the worker is stopped
/// - `apply_timeout_seconds`: upper bound for one worker call, `0` for none
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
/// - `model_dir`: where alignment models are looked up
/// - `auth_token`: forwarded to the backend when loading models
///
/// ## Common values:
/// - `enable_daemon_process = false`: debugging, or hosts where spawning a
///   second process is not allowed
/// - `auto_cleanup_timeout_seconds = 300`: batch jobs with short gaps between
///   files, trading idle GPU memory for fewer model reloads
/// - `device = "cpu"`: force CPU even when a GPU is present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    pub enable_daemon_process: bool,
    pub auto_cleanup_timeout_seconds: u64,
    pub apply_timeout_seconds: u64,
    pub device: String, // parsed by `device_preference`, checked by `validate`
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            alignment: AlignmentConfig {
                enable_daemon_process: true,
                auto_cleanup_timeout_seconds: 60, // one minute of idleness frees the GPU
                apply_timeout_seconds: 0,
                device: "auto".to_string(),
                model_dir: None,
                auth_token: None,
            },
        }
    }
}

impl AppConfig {
    /// Load defaults, then `speech-align.toml` if present, then the
    /// environment.
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(CONFIG_FILE).required(false))
    }

    /// Like [`AppConfig::load`], but with an explicit configuration file that
    /// must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(config::File::from(path).required(true))
            .with_context(|| format!("loading configuration from {}", path.display()))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Reject settings that cannot work.
    ///
    /// ## Checks:
    /// - the cleanup timeout is not zero (the worker would die after every call)
    /// - the device name is one of the known preferences
    pub fn validate(&self) -> Result<()> {
        if self.alignment.auto_cleanup_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "Auto cleanup timeout must be greater than 0 seconds"
            ));
        }

        self.device_preference()?;
        Ok(())
    }

    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.alignment
            .device
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// `None` when calls may take as long as they need.
    pub fn apply_timeout(&self) -> Option<Duration> {
        match self.alignment.apply_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// The container settings derived from this configuration.
    pub fn container_state(&self) -> ContainerState {
        ContainerState {
            enable_daemon_process: self.alignment.enable_daemon_process,
            auto_cleanup_timeout_seconds: self.alignment.auto_cleanup_timeout_seconds,
            auth_token: self.alignment.auth_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.alignment.enable_daemon_process);
        assert_eq!(config.alignment.auto_cleanup_timeout_seconds, 60);
        assert_eq!(config.apply_timeout(), None);
        assert_eq!(config.device_preference().unwrap(), DevicePreference::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.alignment.auto_cleanup_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.alignment.device = "tpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[alignment]\nauto_cleanup_timeout_seconds = 5\napply_timeout_seconds = 30\ndevice = \"cpu\"\nmodel_dir = \"/models\""
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.alignment.auto_cleanup_timeout_seconds, 5);
        assert_eq!(config.apply_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.device_preference().unwrap(), DevicePreference::Cpu);
        assert_eq!(config.alignment.model_dir, Some(PathBuf::from("/models")));
        // untouched keys keep their defaults
        assert!(config.alignment.enable_daemon_process);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(AppConfig::load_from(Path::new("/nonexistent/speech-align.toml")).is_err());
    }

    #[test]
    fn test_container_state_mirrors_alignment_section() {
        let mut config = AppConfig::default();
        config.alignment.enable_daemon_process = false;
        config.alignment.auth_token = Some("token".to_string());

        let state = config.container_state();
        assert!(!state.enable_daemon_process);
        assert_eq!(state.auto_cleanup_timeout_seconds, 60);
        assert_eq!(state.auth_token.as_deref(), Some("token"));
    }
}

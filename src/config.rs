//! Application configuration using Figment.
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults (a simulated microscope writing to `data/scope_daq.zarr`)
//! 2. a TOML file, `config/scope_daq.toml` unless another path is given
//! 3. environment variables prefixed with `SCOPE_DAQ_`, nesting on `__`
//!    (e.g. `SCOPE_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! The acquisition plan itself is not part of this file; see
//! [`crate::experiment::plan`].
//!
//! # Example
//! ```no_run
//! use scope_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Writing to {}", config.storage.root.display());
//! # Ok::<(), scope_daq::error::ScopeError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, ScopeError};
use crate::experiment::engine::RetryPolicy;
use crate::hardware::registry::{mock_microscope, DeviceConfig};
use crate::relay::DisplayLauncher;
use crate::telemetry::{parse_log_level, OutputFormat};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scope_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Array store settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Acquisition engine settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Display process settings
    #[serde(default)]
    pub display: DisplayConfig,
    /// Device definitions
    #[serde(default = "mock_microscope")]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Array store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Zarr store directory, created on first use
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

/// Acquisition engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Capture retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Frames buffered between capture and storage
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Pause between live-preview captures
    #[serde(default = "default_live_interval", with = "humantime_serde")]
    pub live_interval: Duration,
}

/// Display process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Whether to launch the display at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Display executable; this binary when absent
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Arguments passed to the display executable
    #[serde(default = "default_display_args")]
    pub args: Vec<String>,
    /// How often the display polls the host
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

// Default value functions
fn default_app_name() -> String {
    "scope_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("data/scope_daq.zarr")
}

fn default_channel_capacity() -> usize {
    64
}

fn default_live_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_enabled() -> bool {
    true
}

fn default_display_args() -> Vec<String> {
    vec!["display".to_string()]
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            storage: StorageConfig::default(),
            acquisition: AcquisitionConfig::default(),
            display: DisplayConfig::default(),
            devices: mock_microscope(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            channel_capacity: default_channel_capacity(),
            live_interval: default_live_interval(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            program: None,
            args: default_display_args(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate().map_err(ScopeError::Configuration)?;
        Ok(config)
    }

    /// The layered provider, exposed so callers can add their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;

        if self.storage.root.as_os_str().is_empty() {
            return Err("storage.root must not be empty".to_string());
        }

        if self.acquisition.retry.attempts == 0 {
            return Err("acquisition.retry.attempts must be at least 1".to_string());
        }
        if self.acquisition.channel_capacity == 0 {
            return Err("acquisition.channel_capacity must be at least 1".to_string());
        }
        if self.acquisition.live_interval.is_zero() {
            return Err("acquisition.live_interval must be positive".to_string());
        }
        if self.display.poll_interval.is_zero() {
            return Err("display.poll_interval must be positive".to_string());
        }

        // Device names are the keys of configuration trees
        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() || device.name.contains('.') {
                return Err(format!("Invalid device name '{}'", device.name));
            }
            if !names.insert(&device.name) {
                return Err(format!("Duplicate device name: {}", device.name));
            }
        }

        Ok(())
    }

    /// Command line of the display process.
    pub fn display_launcher(&self) -> AppResult<DisplayLauncher> {
        let program = match &self.display.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(DisplayLauncher::new(program, self.display.args.clone()))
    }
}

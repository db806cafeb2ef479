//! Taskweave configuration
//!
//! Scheduler settings are plain [`SchedulerConfig`] values. They can be
//! built in code or read from a RON file; every field is optional in the
//! file and falls back to its default.
//!
//! # Lookup
//!
//! ```text
//! Priority (high → low):
//! 1. Explicit path passed to `load_config`
//! 2. TASKWEAVE_CONFIG environment variable
//! 3. Default values
//! ```
//!
//! # Example file
//!
//! ```text
//! (
//!     thread_name_prefix: "render-worker",
//!     fault_capacity: 1,
//!     startup_timeout: Some((secs: 5, nanos: 0)),
//! )
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::runtime::scheduler::SchedulerConfig;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TASKWEAVE_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] ron::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Parse a config from RON text.
pub fn from_ron_str(text: &str) -> Result<SchedulerConfig, ConfigError> {
    let config: SchedulerConfig = ron::from_str(text)?;
    validate(&config)?;
    Ok(config)
}

/// Render a config as pretty RON.
pub fn to_ron_string(config: &SchedulerConfig) -> Result<String, ConfigError> {
    Ok(ron::ser::to_string_pretty(
        config,
        ron::ser::PrettyConfig::default(),
    )?)
}

/// Load a config file.
pub fn load_config(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_ron_str(&text)
}

/// Load the file named by `TASKWEAVE_CONFIG`, or the defaults when unset.
pub fn load_from_env() -> Result<SchedulerConfig, ConfigError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => load_config(Path::new(&path)),
        None => Ok(SchedulerConfig::default()),
    }
}

fn validate(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.fault_capacity == 0 {
        return Err(ConfigError::Invalid(
            "fault_capacity must be at least 1".to_string(),
        ));
    }
    if config.thread_name_prefix.contains('\0') {
        return Err(ConfigError::Invalid(
            "thread_name_prefix must not contain NUL".to_string(),
        ));
    }
    Ok(())
}

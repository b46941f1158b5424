use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid watch mode: {0}")]
    WatchMode(#[from] devloop_core::WatchError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} directory {1} does not exist")]
    MissingDirectory(&'static str, PathBuf),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

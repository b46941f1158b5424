use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

pub const CONFIG_FILE_NAME: &str = "devloop.toml";

/// Root configuration from devloop.toml. Every key is optional; missing keys
/// fall back to built-in defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DevloopToml {
    /// [backend] section - the supervised, restartable server
    #[serde(default)]
    pub backend: BackendSection,

    /// [frontend] section - launched once the backend is ready
    #[serde(default)]
    pub frontend: FrontendSection,

    /// [watch] section - what counts as a source change
    #[serde(default)]
    pub watch: WatchSection,

    /// [shutdown] section
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BackendSection {
    /// Working directory, relative to the config file
    pub dir: Option<PathBuf>,

    /// argv, e.g. ["cargo", "run"]
    pub command: Option<Vec<String>>,

    /// Passed to the backend as HOST
    pub host: Option<String>,

    /// Host the readiness check connects to
    pub ready_host: Option<String>,

    /// Passed as PORT and checked for readiness
    pub port: Option<u16>,

    /// Passed as RUST_LOG
    pub log: Option<String>,

    /// Passed as DATABASE_URL
    pub database_url: Option<String>,

    /// How long to wait for the first successful connect
    pub ready_timeout_secs: Option<u64>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FrontendSection {
    pub dir: Option<PathBuf>,
    pub command: Option<Vec<String>>,
    /// Freed before launch; never checked
    pub port: Option<u16>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WatchSection {
    /// "poll" or "notify"
    pub mode: Option<String>,
    pub interval_ms: Option<u64>,
    pub extensions: Option<Vec<String>>,
    pub exclude_dirs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ShutdownSection {
    /// Process names killed on interrupt, in addition to the managed trees
    #[serde(default)]
    pub kill_patterns: Vec<String>,
}

impl DevloopToml {
    /// Load devloop.toml from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    /// Parse devloop.toml content
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }
}

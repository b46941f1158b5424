use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devloop_core::WatchMode;
use devloop_core::defaults;
use devloop_core::snapshot::{WatchFilter, normalize_extension};

use super::devloop_toml::DevloopToml;
use super::error::{ConfigError, Result};

const DEFAULT_BACKEND_DIR: &str = "backend-rust";
const DEFAULT_FRONTEND_DIR: &str = "web";
const DEFAULT_BACKEND_HOST: &str = "0.0.0.0";
const DEFAULT_READY_HOST: &str = "127.0.0.1";
const DEFAULT_BACKEND_LOG: &str = "info";

fn default_backend_command() -> Vec<String> {
    vec!["cargo".to_string(), "run".to_string()]
}

fn default_frontend_command() -> Vec<String> {
    vec!["npm".to_string(), "run".to_string(), "dev".to_string()]
}

/// Command-line values that take precedence over devloop.toml.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend_dir: Option<PathBuf>,
    pub frontend_dir: Option<PathBuf>,
    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub ready_timeout_secs: Option<u64>,
    pub watch_mode: Option<WatchMode>,
    pub no_frontend: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub dir: PathBuf,
    pub command: Vec<String>,
    pub host: String,
    pub ready_host: String,
    pub port: u16,
    pub log: String,
    pub database_url: Option<String>,
    pub ready_timeout: Duration,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontendConfig {
    pub dir: PathBuf,
    pub command: Vec<String>,
    pub port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub mode: WatchMode,
    pub interval: Duration,
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
}

/// Fully resolved configuration: defaults < devloop.toml < CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct DevConfig {
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub watch: WatchConfig,
    pub kill_patterns: Vec<String>,
}

impl DevConfig {
    /// Merge the optional file with CLI overrides.
    ///
    /// Directories from the file are relative to `config_dir`; directories from
    /// the command line are relative to `cwd`.
    pub fn resolve(
        file: Option<DevloopToml>,
        config_dir: &Path,
        cwd: &Path,
        overrides: &Overrides,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();
        let b = file.backend;
        let f = file.frontend;
        let w = file.watch;

        let backend_dir = match &overrides.backend_dir {
            Some(dir) => absolutize(cwd, dir),
            None => absolutize(
                config_dir,
                b.dir.as_deref().unwrap_or(Path::new(DEFAULT_BACKEND_DIR)),
            ),
        };
        let frontend_dir = match &overrides.frontend_dir {
            Some(dir) => absolutize(cwd, dir),
            None => absolutize(
                config_dir,
                f.dir.as_deref().unwrap_or(Path::new(DEFAULT_FRONTEND_DIR)),
            ),
        };

        let mode = match (overrides.watch_mode, w.mode.as_deref()) {
            (Some(mode), _) => mode,
            (None, Some(raw)) => raw.parse()?,
            (None, None) => WatchMode::default(),
        };

        let ready_timeout = overrides
            .ready_timeout_secs
            .or(b.ready_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults::READY_TIMEOUT);

        let extensions: Vec<String> = match w.extensions {
            Some(exts) => exts.iter().map(|e| normalize_extension(e)).collect(),
            None => defaults::WATCH_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        };
        let exclude_dirs = w.exclude_dirs.unwrap_or_else(|| {
            defaults::EXCLUDED_DIRS
                .iter()
                .map(|d| d.to_string())
                .collect()
        });

        let config = Self {
            backend: BackendConfig {
                dir: backend_dir,
                command: b.command.unwrap_or_else(default_backend_command),
                host: b.host.unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string()),
                ready_host: b.ready_host.unwrap_or_else(|| DEFAULT_READY_HOST.to_string()),
                port: overrides
                    .backend_port
                    .or(b.port)
                    .unwrap_or(defaults::BACKEND_PORT),
                log: b.log.unwrap_or_else(|| DEFAULT_BACKEND_LOG.to_string()),
                database_url: b.database_url,
                ready_timeout,
                env: b.env,
            },
            frontend: FrontendConfig {
                dir: frontend_dir,
                command: f.command.unwrap_or_else(default_frontend_command),
                port: overrides
                    .frontend_port
                    .or(f.port)
                    .unwrap_or(defaults::FRONTEND_PORT),
                enabled: !overrides.no_frontend && f.enabled.unwrap_or(true),
            },
            watch: WatchConfig {
                mode,
                interval: w
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults::POLL_INTERVAL),
                extensions,
                exclude_dirs,
            },
            kill_patterns: file.shutdown.kill_patterns,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "backend.command must not be empty".to_string(),
            ));
        }
        if self.frontend.enabled
            && self
                .frontend
                .command
                .first()
                .is_none_or(|p| p.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "frontend.command must not be empty".to_string(),
            ));
        }
        if self.backend.port == 0 {
            return Err(ConfigError::Validation(
                "backend.port must be non-zero".to_string(),
            ));
        }
        if self.frontend.enabled && self.frontend.port == 0 {
            return Err(ConfigError::Validation(
                "frontend.port must be non-zero".to_string(),
            ));
        }
        if self.frontend.enabled && self.frontend.port == self.backend.port {
            return Err(ConfigError::Validation(format!(
                "backend and frontend cannot share port {}",
                self.backend.port
            )));
        }
        if self.watch.interval.is_zero() {
            return Err(ConfigError::Validation(
                "watch.interval_ms must be non-zero".to_string(),
            ));
        }
        if self.watch.extensions.iter().all(|e| e.is_empty()) {
            return Err(ConfigError::Validation(
                "watch.extensions must list at least one extension".to_string(),
            ));
        }
        if self.backend.ready_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "backend.ready_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Both managed directories must exist before anything is launched.
    pub fn check_directories(&self) -> Result<()> {
        if !self.backend.dir.is_dir() {
            return Err(ConfigError::MissingDirectory(
                "Backend",
                self.backend.dir.clone(),
            ));
        }
        if self.frontend.enabled && !self.frontend.dir.is_dir() {
            return Err(ConfigError::MissingDirectory(
                "Frontend",
                self.frontend.dir.clone(),
            ));
        }
        Ok(())
    }

    /// Environment overlay for the backend. HOST, PORT and RUST_LOG always
    /// match the resolved values so the readiness check and the server agree.
    pub fn backend_env(&self) -> HashMap<String, String> {
        let mut env = self.backend.env.clone();
        if let Some(url) = &self.backend.database_url {
            env.insert("DATABASE_URL".to_string(), url.clone());
        }
        env.insert("HOST".to_string(), self.backend.host.clone());
        env.insert("PORT".to_string(), self.backend.port.to_string());
        env.insert("RUST_LOG".to_string(), self.backend.log.clone());
        env
    }

    pub fn watch_filter(&self) -> WatchFilter {
        WatchFilter::new(&self.watch.extensions, &self.watch.exclude_dirs)
    }

    /// Ports cleaned up before launch.
    pub fn managed_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.backend.port];
        if self.frontend.enabled {
            ports.push(self.frontend.port);
        }
        ports
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use devloop_core::WatchMode;

use crate::config::{ConfigError, DevConfig, DevloopToml, Overrides};
use crate::orchestrator::{self, DevError, RunOptions};
use crate::paths;

/// devloop - run a Rust backend and a frontend dev server together,
/// restarting the backend when its sources change
#[derive(Parser, Debug)]
#[command(name = "devloop")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Path to devloop.toml (defaults to ./devloop.toml when present)
    #[arg(long, global = true, env = "DEVLOOP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend working directory
    #[arg(long, global = true)]
    pub backend_dir: Option<PathBuf>,

    /// Frontend working directory
    #[arg(long, global = true)]
    pub frontend_dir: Option<PathBuf>,

    /// Backend port, checked for readiness
    #[arg(long, global = true)]
    pub backend_port: Option<u16>,

    /// Frontend port, freed before launch
    #[arg(long, global = true)]
    pub frontend_port: Option<u16>,

    /// Seconds to wait for the backend before giving up
    #[arg(long, global = true, value_name = "SECS")]
    pub ready_timeout: Option<u64>,

    /// How source changes are detected: poll or notify
    #[arg(long, global = true, value_name = "MODE")]
    pub watch_mode: Option<WatchMode>,

    /// Only run the backend
    #[arg(long, global = true)]
    pub no_frontend: bool,

    /// Do not kill existing listeners on the managed ports
    #[arg(long, global = true)]
    pub no_reap: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Print the resolved configuration and exit
    Check,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            backend_dir: self.backend_dir.clone(),
            frontend_dir: self.frontend_dir.clone(),
            backend_port: self.backend_port,
            frontend_port: self.frontend_port,
            ready_timeout_secs: self.ready_timeout,
            watch_mode: self.watch_mode,
            no_frontend: self.no_frontend,
        }
    }

    /// Load devloop.toml and merge it with the command-line overrides.
    pub fn load_config(&self) -> Result<DevConfig, DevError> {
        let cwd = std::env::current_dir()?;
        let (file, dir) = paths::config_location(self.config.as_deref(), &cwd);
        let parsed = if file.is_file() {
            Some(DevloopToml::load_from_file(&file)?)
        } else if self.config.is_some() {
            return Err(ConfigError::FileRead(
                file,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
            .into());
        } else {
            None
        };
        if parsed.is_some() {
            tracing::debug!(path = %file.display(), "loaded config");
        }
        Ok(DevConfig::resolve(parsed, &dir, &cwd, &self.overrides())?)
    }

    pub fn run(self) -> Result<(), DevError> {
        let config = self.load_config()?;

        match self.command {
            Some(Commands::Check) => orchestrator::check(&config),
            None => {
                let rt = tokio::runtime::Runtime::new()?;
                let options = RunOptions {
                    reap: !self.no_reap,
                    events: None,
                };
                rt.block_on(orchestrator::run(config, options))
            }
        }
    }
}

mod cli;
mod config;
mod orchestrator;
mod output;
mod paths;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Checked before RUST_LOG so the backend's own RUST_LOG stays independent.
const LOG_ENV: &str = "DEVLOOP_LOG";

fn main() {
    let cli = Cli::parse();

    crate::output::set_verbose(cli.verbose);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("info")
            } else {
                EnvFilter::new("warn")
            }
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = cli.run() {
        crate::output::error_stderr(&e.to_string());
        std::process::exit(1);
    }
}

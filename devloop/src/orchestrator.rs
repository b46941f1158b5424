//! Startup sequence for `devloop`: reap stale listeners, supervise the
//! backend, gate the frontend on backend readiness and tear everything down on
//! interrupt.

use std::time::Duration;

use devloop_core::defaults::OUTPUT_CHANNEL_CAPACITY;
use devloop_core::{
    ChangeDetector, CommandSpec, ManagedProcess, OutputLine, ProcessError, ReadinessError,
    Supervisor, SupervisorError, SupervisorEvent, SupervisorHandle, WatchError, WatcherHandle,
    kill_processes_matching, reap_port, spawn_change_loop, wait_for_port,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigError, DevConfig};
use crate::output::{self, BACKEND_LABEL, FRONTEND_LABEL};
use crate::paths::{platform_argv, resolve_program};

/// How long shutdown waits for the printer tasks to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DevError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start backend: {0}")]
    BackendSpawn(#[source] SupervisorError),

    #[error("Failed to start frontend: {0}")]
    FrontendSpawn(#[source] ProcessError),

    #[error("Backend failed to start: {0}")]
    NotReady(#[from] ReadinessError),

    #[error("Failed to watch backend sources: {0}")]
    Watch(#[from] WatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Milestones of a run, for callers that want to observe sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    PortsReaped,
    BackendStarted,
    BackendReady,
    FrontendLaunched,
    ShutdownComplete,
}

#[derive(Debug, Default)]
pub struct RunOptions {
    /// Kill stale listeners on the managed ports first.
    pub reap: bool,
    pub events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl RunOptions {
    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Run until Ctrl-C / SIGTERM.
pub async fn run(config: DevConfig, options: RunOptions) -> Result<(), DevError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });
    run_until(config, options, shutdown_rx).await
}

/// Run until `shutdown` turns true.
pub async fn run_until(
    config: DevConfig,
    options: RunOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DevError> {
    config.check_directories()?;

    if options.reap {
        output::step("Cleaning up ports...");
        for port in config.managed_ports() {
            reap(port).await;
        }
        options.emit(RunEvent::PortsReaped);
    }

    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let printer = tokio::spawn(print_output(out_rx));
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_supervisor_events(ev_rx));

    let backend = backend_spec(&config)?;
    output::step(&format!("Starting Backend ({})...", backend.command_line()));

    // Baseline first so an edit made while the backend boots still counts.
    let backend_dir = config.backend.dir.clone();
    let filter = config.watch_filter();
    let detector =
        tokio::task::spawn_blocking(move || ChangeDetector::new(backend_dir, filter))
            .await
            .map_err(std::io::Error::other)?;
    tracing::info!(
        root = %detector.root().display(),
        files = detector.watched_files(),
        mode = %config.watch.mode,
        "watching backend sources"
    );

    let supervisor = Supervisor::new(backend, BACKEND_LABEL, out_tx.clone())
        .with_events(ev_tx)
        .start()
        .map_err(DevError::BackendSpawn)?;
    options.emit(RunEvent::BackendStarted);

    let trigger = supervisor.trigger();
    let watcher = match spawn_change_loop(
        detector,
        config.watch.mode,
        config.watch.interval,
        move || match trigger.request() {
            Ok(true) => {}
            Ok(false) => tracing::debug!("restart already pending"),
            Err(e) => tracing::debug!(error = %e, "restart dropped"),
        },
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            supervisor.shutdown().await;
            return Err(e.into());
        }
    };

    let result = serve(&config, &options, &supervisor, out_tx, &mut shutdown).await;

    output::error("Stopping all services...");
    stop_all(watcher, supervisor, result.frontend, &config.kill_patterns).await;
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, printer).await;
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, reporter).await;
    options.emit(RunEvent::ShutdownComplete);

    result.outcome
}

struct Served {
    outcome: Result<(), DevError>,
    frontend: Option<ManagedProcess>,
}

/// Wait for readiness, launch the frontend, then idle until shutdown.
async fn serve(
    config: &DevConfig,
    options: &RunOptions,
    supervisor: &SupervisorHandle,
    out_tx: mpsc::Sender<OutputLine>,
    shutdown: &mut watch::Receiver<bool>,
) -> Served {
    let host = &config.backend.ready_host;
    let port = config.backend.port;
    output::step(&format!("Waiting for Backend to start on port {port}..."));

    let ready = tokio::select! {
        r = wait_for_port(host, port, config.backend.ready_timeout) => Some(r),
        _ = shutdown.wait_for(|stop| *stop) => None,
    };
    match ready {
        None => {
            return Served {
                outcome: Ok(()),
                frontend: None,
            };
        }
        Some(Err(e)) => {
            tracing::error!(port, state = ?supervisor.state(), "backend never became ready");
            output::error("Backend failed to start initially. Exiting.");
            return Served {
                outcome: Err(e.into()),
                frontend: None,
            };
        }
        Some(Ok(())) => {
            output::success(&format!("Backend is ready on port {port}!"));
            options.emit(RunEvent::BackendReady);
        }
    }

    let mut frontend = None;
    if config.frontend.enabled {
        let spec = match frontend_spec(config) {
            Ok(spec) => spec,
            Err(e) => {
                return Served {
                    outcome: Err(e),
                    frontend: None,
                };
            }
        };
        output::step(&format!("Starting Frontend ({})...", spec.command_line()));
        match ManagedProcess::spawn(spec, FRONTEND_LABEL, out_tx) {
            Ok(process) => {
                tracing::info!(pid = process.pid(), port = config.frontend.port, "frontend launched");
                options.emit(RunEvent::FrontendLaunched);
                frontend = Some(process);
            }
            Err(e) => {
                return Served {
                    outcome: Err(DevError::FrontendSpawn(e)),
                    frontend: None,
                };
            }
        }
    } else {
        drop(out_tx);
    }

    output::section("Services are running. Press Ctrl+C to stop.");

    let mut frontend_exited = false;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            status = wait_frontend(&mut frontend), if !frontend_exited => {
                frontend_exited = true;
                match status {
                    Ok(status) if status.success() => output::warning("Frontend exited."),
                    Ok(status) => output::error(&format!("Frontend exited ({status}).")),
                    Err(e) => tracing::warn!(error = %e, "lost track of frontend"),
                }
            }
        }
    }

    Served {
        outcome: Ok(()),
        frontend,
    }
}

async fn wait_frontend(
    frontend: &mut Option<ManagedProcess>,
) -> Result<std::process::ExitStatus, ProcessError> {
    match frontend {
        Some(process) => process.wait_exit().await,
        None => std::future::pending().await,
    }
}

/// Kill every managed tree, then anything matching the configured patterns.
async fn stop_all(
    watcher: WatcherHandle,
    supervisor: SupervisorHandle,
    frontend: Option<ManagedProcess>,
    kill_patterns: &[String],
) {
    watcher.stop();
    drop(watcher);

    supervisor.shutdown().await;

    if let Some(mut frontend) = frontend
        && let Err(e) = frontend.terminate().await
    {
        tracing::warn!(error = %e, "failed to stop frontend");
    }

    if !kill_patterns.is_empty() {
        let patterns = kill_patterns.to_vec();
        match tokio::task::spawn_blocking(move || kill_processes_matching(&patterns)).await {
            Ok(killed) if !killed.is_empty() => {
                tracing::info!(count = killed.len(), "killed processes by pattern");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "pattern kill task failed"),
        }
    }
}

async fn reap(port: u16) {
    match tokio::task::spawn_blocking(move || reap_port(port)).await {
        Ok(Ok(killed)) => {
            for pid in killed {
                output::warning(&format!("Killing process {pid} on port {port}..."));
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(port, error = %e, "port cleanup failed");
            output::warning(&format!("Could not clean up port {port}: {e}"));
        }
        Err(e) => tracing::warn!(port, error = %e, "port cleanup task failed"),
    }
}

fn backend_spec(config: &DevConfig) -> Result<CommandSpec, DevError> {
    let mut argv = config.backend.command.clone();
    if let Some(program) = argv.first_mut() {
        *program = resolve_program(program);
    }
    let spec = CommandSpec::from_argv(&platform_argv(&argv), &config.backend.dir)
        .map_err(|e| DevError::BackendSpawn(e.into()))?;
    Ok(spec.envs(config.backend_env()))
}

fn frontend_spec(config: &DevConfig) -> Result<CommandSpec, DevError> {
    CommandSpec::from_argv(
        &platform_argv(&config.frontend.command),
        &config.frontend.dir,
    )
    .map_err(DevError::FrontendSpawn)
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        output::child_line(&line);
    }
}

async fn report_supervisor_events(mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SupervisorEvent::RestartRequested => {
                output::warning("File change detected! Restarting backend...");
            }
            SupervisorEvent::Spawned { generation, pid } => {
                tracing::debug!(generation, pid, "backend spawned");
                if generation > 1 {
                    output::step("Backend restarted.");
                }
            }
            SupervisorEvent::SpawnFailed { error, .. } => {
                output::error(&format!(
                    "Failed to start backend: {error}. Waiting for file changes to restart..."
                ));
            }
            SupervisorEvent::Exited { status, .. } if status.success() => {
                output::warning("Backend stopped. Waiting for file changes to restart...");
            }
            SupervisorEvent::Exited { status, .. } => {
                output::error(&format!(
                    "Backend crashed ({status}). Waiting for file changes to restart..."
                ));
            }
            SupervisorEvent::Terminated { generation } => {
                tracing::debug!(generation, "backend terminated");
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Print the resolved configuration without launching anything.
pub fn check(config: &DevConfig) -> Result<(), DevError> {
    output::section("Backend");
    output::step(&format!("dir: {}", config.backend.dir.display()));
    output::step(&format!("command: {}", config.backend.command.join(" ")));
    output::step(&format!(
        "bind: {}:{} (ready check {}:{}, timeout {}s)",
        config.backend.host,
        config.backend.port,
        config.backend.ready_host,
        config.backend.port,
        config.backend.ready_timeout.as_secs()
    ));
    if output::is_verbose() {
        let mut env: Vec<_> = config.backend_env().into_iter().collect();
        env.sort();
        for (key, value) in env {
            let shown = if key == "DATABASE_URL" { "<set>".to_string() } else { value };
            output::muted(&format!("  {key}={shown}"));
        }
    }

    output::section("Frontend");
    if config.frontend.enabled {
        output::step(&format!("dir: {}", config.frontend.dir.display()));
        output::step(&format!("command: {}", config.frontend.command.join(" ")));
        output::step(&format!("port: {}", config.frontend.port));
    } else {
        output::muted("disabled");
    }

    output::section("Watch");
    output::step(&format!(
        "mode: {} every {}ms",
        config.watch.mode,
        config.watch.interval.as_millis()
    ));
    output::step(&format!("extensions: {}", config.watch.extensions.join(", ")));
    output::step(&format!("excluded: {}", config.watch.exclude_dirs.join(", ")));

    match config.check_directories() {
        Ok(()) => {
            output::success("Configuration is valid");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

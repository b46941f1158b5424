//! Backend supervisor.
//!
//! A single actor task owns the current backend [`ManagedProcess`]. Restart
//! requests, exit observation and shutdown all go through that task, so at most
//! one backend instance is ever alive and a replacement is only spawned after
//! the previous instance has been killed, reaped and drained.
//!
//! Restart requests are coalesced with a queue depth of one: a request that
//! arrives while a restart is already pending is folded into it, and a request
//! that arrives during a restart cycle causes exactly one more cycle afterwards.

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::process::{CommandSpec, ManagedProcess, OutputLine, ProcessError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("supervisor is no longer running")]
    Stopped,
}

/// How a backend instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    /// Terminated by a signal (no exit code).
    Signal,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitStatus::Code(code),
            None => ExitStatus::Signal,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit code {c}"),
            ExitStatus::Signal => f.write_str("killed by signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    /// Exited non-zero on its own. Waits for the next restart request.
    Crashed { generation: u64, status: ExitStatus },
    Starting { generation: u64 },
    /// The process exists; it may not be accepting connections yet.
    Running { generation: u64, pid: Option<u32> },
    Stopping { generation: u64 },
}

/// Lifecycle notifications, emitted in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    RestartRequested,
    Spawned { generation: u64, pid: Option<u32> },
    SpawnFailed { generation: u64, error: String },
    /// Natural exit, not caused by the supervisor.
    Exited { generation: u64, status: ExitStatus },
    /// Killed by a restart or shutdown; the tree is dead and output drained.
    Terminated { generation: u64 },
}

/// Builder for the supervisor actor.
pub struct Supervisor {
    spec: CommandSpec,
    label: String,
    sink: mpsc::Sender<OutputLine>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Supervisor {
    pub fn new(
        spec: CommandSpec,
        label: impl Into<String>,
        sink: mpsc::Sender<OutputLine>,
    ) -> Self {
        Self {
            spec,
            label: label.into(),
            sink,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the first instance and hand it to a background actor.
    ///
    /// Fails if the first instance cannot be started at all; later spawn
    /// failures are reported as [`SupervisorEvent::SpawnFailed`].
    pub fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Stopped);
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut actor = Actor {
            spec: self.spec,
            label: self.label,
            sink: self.sink,
            events: self.events,
            state: state_tx,
            current: None,
            generation: 0,
        };
        actor.spawn_next()?;

        let task = tokio::spawn(actor.run(restart_rx, shutdown_rx));

        Ok(SupervisorHandle {
            restart: RestartTrigger { tx: restart_tx },
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Cloneable sender of restart requests.
#[derive(Debug, Clone)]
pub struct RestartTrigger {
    tx: mpsc::Sender<()>,
}

impl RestartTrigger {
    /// Ask for a restart cycle. Returns `Ok(false)` when the request was folded
    /// into one that is already pending.
    pub fn request(&self) -> Result<bool, SupervisorError> {
        match self.tx.try_send(()) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(())) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SupervisorError::Stopped),
        }
    }
}

/// Owner-side handle to a running supervisor.
pub struct SupervisorHandle {
    restart: RestartTrigger,
    state: watch::Receiver<SupervisorState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn trigger(&self) -> RestartTrigger {
        self.restart.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Kill the current instance (if any) and stop the actor.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "supervisor task ended abnormally");
        }
    }
}

enum Next {
    Restart,
    Exited(Result<std::process::ExitStatus, ProcessError>),
    Shutdown,
}

struct Actor {
    spec: CommandSpec,
    label: String,
    sink: mpsc::Sender<OutputLine>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    state: watch::Sender<SupervisorState>,
    current: Option<ManagedProcess>,
    generation: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut restart_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => Next::Shutdown,
                req = restart_rx.recv() => match req {
                    Some(()) => Next::Restart,
                    None => Next::Shutdown,
                },
                status = wait_current(&mut self.current) => Next::Exited(status),
            };

            match next {
                Next::Shutdown => {
                    self.stop_current().await;
                    self.state.send_replace(SupervisorState::Stopped);
                    tracing::debug!(label = %self.label, "supervisor stopped");
                    return;
                }
                Next::Restart => {
                    self.emit(SupervisorEvent::RestartRequested);
                    self.stop_current().await;
                    if let Err(e) = self.spawn_next() {
                        tracing::error!(label = %self.label, error = %e, "restart failed");
                    }
                }
                Next::Exited(result) => self.observe_exit(result).await,
            }
        }
    }

    fn spawn_next(&mut self) -> Result<(), ProcessError> {
        debug_assert!(self.current.is_none(), "previous instance still owned");
        self.generation += 1;
        let generation = self.generation;
        self.state.send_replace(SupervisorState::Starting { generation });
        tracing::info!(label = %self.label, generation, command = %self.spec, "starting");

        match ManagedProcess::spawn(self.spec.clone(), self.label.clone(), self.sink.clone()) {
            Ok(process) => {
                let pid = process.pid();
                self.current = Some(process);
                self.state.send_replace(SupervisorState::Running { generation, pid });
                self.emit(SupervisorEvent::Spawned { generation, pid });
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(SupervisorState::Stopped);
                self.emit(SupervisorEvent::SpawnFailed {
                    generation,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn stop_current(&mut self) {
        let Some(mut process) = self.current.take() else {
            return;
        };
        let generation = self.generation;
        self.state.send_replace(SupervisorState::Stopping { generation });
        tracing::info!(label = %self.label, generation, pid = process.pid(), "stopping");

        if let Err(e) = process.terminate().await {
            tracing::warn!(label = %self.label, generation, error = %e, "terminate failed");
        }
        self.emit(SupervisorEvent::Terminated { generation });
    }

    async fn observe_exit(&mut self, result: Result<std::process::ExitStatus, ProcessError>) {
        let Some(mut process) = self.current.take() else {
            return;
        };
        let generation = self.generation;

        let status = match result {
            Ok(status) => ExitStatus::from(status),
            Err(e) => {
                tracing::warn!(label = %self.label, generation, error = %e, "lost track of process");
                let _ = process.terminate().await;
                ExitStatus::Signal
            }
        };
        // The wrapper is gone; make sure nothing it forked is left holding the port.
        if let Err(e) = process.kill_tree() {
            tracing::debug!(label = %self.label, generation, error = %e, "group kill after exit failed");
        }
        let _ = process.wait().await;

        if status.success() {
            tracing::info!(label = %self.label, generation, "exited");
            self.state.send_replace(SupervisorState::Stopped);
        } else {
            tracing::warn!(label = %self.label, generation, %status, "crashed; waiting for changes");
            self.state.send_replace(SupervisorState::Crashed { generation, status });
        }
        self.emit(SupervisorEvent::Exited { generation, status });
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn wait_current(
    current: &mut Option<ManagedProcess>,
) -> Result<std::process::ExitStatus, ProcessError> {
    match current {
        Some(process) => process.wait_exit().await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str, cwd: &std::path::Path) -> CommandSpec {
        CommandSpec::new("sh", cwd).args(["-c", script])
    }

    fn start(
        script: &str,
        dir: &std::path::Path,
    ) -> (
        SupervisorHandle,
        mpsc::UnboundedReceiver<SupervisorEvent>,
        mpsc::Receiver<OutputLine>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let handle = Supervisor::new(sh(script, dir), "Backend", out_tx)
            .with_events(ev_tx)
            .start()
            .unwrap();
        (handle, ev_rx, out_rx)
    }

    async fn wait_for_state<F>(handle: &SupervisorHandle, f: F) -> SupervisorState
    where
        F: Fn(&SupervisorState) -> bool,
    {
        let mut rx = handle.subscribe();
        timeout(Duration::from_secs(5), async {
            loop {
                let s = *rx.borrow_and_update();
                if f(&s) {
                    return s;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached")
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Replays events and checks that no two instances were ever alive at once
    /// and that every spawn follows the end of the previous generation.
    fn assert_serialized(events: &[SupervisorEvent]) {
        let mut live = 0i32;
        let mut last_ended = 0u64;
        for ev in events {
            match ev {
                SupervisorEvent::Spawned { generation, .. } => {
                    live += 1;
                    assert!(live <= 1, "two live instances: {events:?}");
                    assert_eq!(*generation, last_ended + 1, "spawn before previous end: {events:?}");
                }
                SupervisorEvent::Exited { generation, .. }
                | SupervisorEvent::Terminated { generation } => {
                    live -= 1;
                    last_ended = *generation;
                }
                SupervisorEvent::SpawnFailed { generation, .. } => last_ended = *generation,
                SupervisorEvent::RestartRequested => {}
            }
            assert!(live >= 0);
        }
    }

    #[tokio::test]
    async fn start_runs_first_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, mut out) = start("echo up; sleep 30", dir.path());

        let line = timeout(Duration::from_secs(5), out.recv()).await.unwrap().unwrap();
        assert_eq!(line.text, "up");
        assert_eq!(line.label, "Backend");
        assert!(matches!(
            handle.state(),
            SupervisorState::Running { generation: 1, .. }
        ));

        handle.shutdown().await;
        let evs = drain_events(&mut events);
        assert!(matches!(evs[0], SupervisorEvent::Spawned { generation: 1, .. }));
        assert_eq!(evs.last(), Some(&SupervisorEvent::Terminated { generation: 1 }));
    }

    #[tokio::test]
    async fn restart_terminates_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, _out) = start("sleep 30", dir.path());

        assert!(handle.trigger().request().unwrap());
        wait_for_state(&handle, |s| {
            matches!(s, SupervisorState::Running { generation: 2, .. })
        })
        .await;
        handle.shutdown().await;

        let evs = drain_events(&mut events);
        assert_serialized(&evs);
        let kinds: Vec<_> = evs
            .iter()
            .filter(|e| !matches!(e, SupervisorEvent::RestartRequested))
            .cloned()
            .collect();
        assert!(matches!(kinds[0], SupervisorEvent::Spawned { generation: 1, .. }));
        assert_eq!(kinds[1], SupervisorEvent::Terminated { generation: 1 });
        assert!(matches!(kinds[2], SupervisorEvent::Spawned { generation: 2, .. }));
        assert_eq!(kinds[3], SupervisorEvent::Terminated { generation: 2 });
    }

    #[tokio::test]
    async fn burst_of_requests_coalesces_into_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, _out) = start("sleep 30", dir.path());

        // current_thread runtime: the actor cannot run between these calls.
        let accepted: Vec<bool> = (0..5).map(|_| handle.trigger().request().unwrap()).collect();
        assert_eq!(accepted, vec![true, false, false, false, false]);

        wait_for_state(&handle, |s| {
            matches!(s, SupervisorState::Running { generation: 2, .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            handle.state(),
            SupervisorState::Running { generation: 2, .. }
        ));

        handle.shutdown().await;
        let evs = drain_events(&mut events);
        assert_serialized(&evs);
        let spawns = evs
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Spawned { .. }))
            .count();
        assert_eq!(spawns, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_never_overlap_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, _out) = start("sleep 30", dir.path());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let trigger = handle.trigger();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _ = trigger.request();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        let evs = drain_events(&mut events);
        assert_serialized(&evs);
        let spawns = evs
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Spawned { .. }))
            .count();
        assert!(spawns >= 2);
        assert!(spawns <= 21);
    }

    #[tokio::test]
    async fn crash_waits_for_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, _out) = start("exit 3", dir.path());

        let state = wait_for_state(&handle, |s| matches!(s, SupervisorState::Crashed { .. })).await;
        assert_eq!(
            state,
            SupervisorState::Crashed {
                generation: 1,
                status: ExitStatus::Code(3)
            }
        );

        // No automatic restart.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(handle.state(), SupervisorState::Crashed { generation: 1, .. }));

        handle.trigger().request().unwrap();
        wait_for_state(&handle, |s| {
            matches!(s, SupervisorState::Crashed { generation: 2, .. })
        })
        .await;
        handle.shutdown().await;

        let evs = drain_events(&mut events);
        assert_serialized(&evs);
        assert!(evs.contains(&SupervisorEvent::Exited {
            generation: 1,
            status: ExitStatus::Code(3)
        }));
    }

    #[tokio::test]
    async fn clean_exit_is_stopped_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events, _out) = start("exit 0", dir.path());
        let state = wait_for_state(&handle, |s| {
            matches!(s, SupervisorState::Stopped | SupervisorState::Crashed { .. })
        })
        .await;
        assert_eq!(state, SupervisorState::Stopped);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn first_spawn_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let (out_tx, _out_rx) = mpsc::channel(1);
        let spec = CommandSpec::new("sh", dir.path().join("missing"));
        let err = Supervisor::new(spec, "Backend", out_tx).start().err().unwrap();
        assert!(matches!(
            err,
            SupervisorError::Process(ProcessError::MissingDirectory(_))
        ));
    }

    #[tokio::test]
    async fn requests_after_shutdown_report_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events, _out) = start("sleep 30", dir.path());
        let trigger = handle.trigger();
        handle.shutdown().await;
        assert!(matches!(trigger.request(), Err(SupervisorError::Stopped)));
    }
}

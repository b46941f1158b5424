//! Child process runner with labelled, line-buffered output.
//!
//! Every child is placed in its own process group so that terminating it also
//! takes down whatever it forked (`cargo run` -> the real server binary).
//! Stdout and stderr share one pipe, so lines arrive in the order the child
//! wrote them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound on how long termination waits for the output pipes to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("working directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("failed to start `{command}` in {cwd}: {source}")]
    Spawn {
        command: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill process tree of pid {pid}: {reason}")]
    Kill { pid: u32, reason: String },
}

/// What to run, where, and with which environment overlay.
///
/// The overlay is applied on top of the supervisor's own environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    /// Build from an argv vector; the first element is the program.
    pub fn from_argv(argv: &[String], cwd: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        Ok(Self::new(program.clone(), cwd).args(args.iter().cloned()))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// One decoded line of combined stdout/stderr output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub label: String,
    pub text: String,
}

/// A spawned OS process whose output is being streamed to a sink.
pub struct ManagedProcess {
    spec: CommandSpec,
    label: String,
    pid: Option<u32>,
    child: Child,
    reader: Option<JoinHandle<()>>,
    status: Option<std::process::ExitStatus>,
}

impl ManagedProcess {
    /// Start `spec` and begin forwarding its output to `sink`. Returns as soon
    /// as the process exists.
    pub fn spawn(
        spec: CommandSpec,
        label: impl Into<String>,
        sink: mpsc::Sender<OutputLine>,
    ) -> Result<Self, ProcessError> {
        let label = label.into();
        if spec.program.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        if !spec.cwd.is_dir() {
            return Err(ProcessError::MissingDirectory(spec.cwd.clone()));
        }

        let spawn_error = |source| ProcessError::Spawn {
            command: spec.command_line(),
            cwd: spec.cwd.clone(),
            source,
        };

        let (pipe_reader, stdout_writer) = std::io::pipe().map_err(spawn_error)?;
        let stderr_writer = stdout_writer.try_clone().map_err(spawn_error)?;

        let mut c = Command::new(&spec.program);
        c.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_writer))
            .stderr(Stdio::from(stderr_writer))
            .kill_on_drop(true);

        #[cfg(unix)]
        c.process_group(0);

        let child = c.spawn().map_err(spawn_error)?;
        // The command still holds our copies of the write end; EOF only
        // arrives once they are closed.
        drop(c);
        let pid = child.id();

        let reader = spawn_reader(pipe_reader, label.clone(), sink).map_err(spawn_error)?;

        tracing::debug!(label = %label, pid, command = %spec, cwd = %spec.cwd.display(), "spawned");

        Ok(Self {
            spec,
            label,
            pid,
            child,
            reader: Some(reader),
            status: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit, without waiting for its output.
    ///
    /// Cancel safe: dropping the future before it resolves loses nothing.
    pub async fn wait_exit(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(|source| ProcessError::Wait {
            pid: self.pid.unwrap_or_default(),
            source,
        })?;
        self.status = Some(status);
        Ok(status)
    }

    /// Wait for natural exit and for the output to drain.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        let status = self.wait_exit().await?;
        self.drain().await;
        Ok(status)
    }

    /// Kill the whole process tree, reap it, and wait for its output to drain.
    pub async fn terminate(&mut self) -> Result<std::process::ExitStatus, ProcessError> {
        if let Err(e) = self.kill_tree() {
            tracing::warn!(label = %self.label, error = %e, "kill failed");
        }
        self.wait().await
    }

    /// Signal the process tree without waiting.
    ///
    /// The group is signalled even after the direct child exited, since the
    /// wrapper may have died while the server it forked is still running.
    pub fn kill_tree(&mut self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // taskkill cannot walk the tree of a pid that is already gone.
        #[cfg(windows)]
        if self.status.is_some() {
            return Ok(());
        }
        kill_process_tree(pid)?;
        if self.status.is_none() {
            let _ = self.child.start_kill();
        }
        Ok(())
    }

    async fn drain(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            tracing::warn!(label = %self.label, "output pipe still open after exit; detaching");
            reader.abort();
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("command", &self.spec.command_line())
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(unix)]
fn spawn_reader(
    pipe: std::io::PipeReader,
    label: String,
    sink: mpsc::Sender<OutputLine>,
) -> std::io::Result<JoinHandle<()>> {
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(pipe.into())?;
    Ok(tokio::spawn(forward_lines(receiver, label, sink)))
}

// Tokio has no async anonymous pipes on Windows; read on a blocking thread.
#[cfg(windows)]
fn spawn_reader(
    pipe: std::io::PipeReader,
    label: String,
    sink: mpsc::Sender<OutputLine>,
) -> std::io::Result<JoinHandle<()>> {
    use std::io::BufRead;

    Ok(tokio::task::spawn_blocking(move || {
        let mut sink_open = true;
        for segment in std::io::BufReader::new(pipe).split(b'\n') {
            let segment = match segment {
                Ok(segment) => segment,
                Err(e) => {
                    tracing::debug!(label = %label, error = %e, "output read failed");
                    break;
                }
            };
            if sink_open {
                let line = OutputLine {
                    label: label.clone(),
                    text: decode_line(&segment),
                };
                sink_open = sink.blocking_send(line).is_ok();
            }
        }
    }))
}

#[cfg(unix)]
async fn forward_lines<R>(r: R, label: String, sink: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(r).split(b'\n');
    let mut sink_open = true;
    loop {
        let segment = match segments.next_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(label = %label, error = %e, "output read failed");
                break;
            }
        };
        if !sink_open {
            // Keep reading so the child never blocks on a full pipe.
            continue;
        }
        let line = OutputLine {
            label: label.clone(),
            text: decode_line(&segment),
        };
        if sink.send(line).await.is_err() {
            sink_open = false;
        }
    }
}

/// Lossy UTF-8 decode with the trailing `\r` of CRLF output removed.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Kill `pid` and every process in its group / tree.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) -> Result<(), ProcessError> {
    let pgid = i32::try_from(pid).map_err(|_| ProcessError::Kill {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    // Children are spawned with process_group(0), so pgid == pid.
    let r = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if r == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ProcessError::Kill {
        pid,
        reason: err.to_string(),
    })
}

#[cfg(windows)]
pub fn kill_process_tree(pid: u32) -> Result<(), ProcessError> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| ProcessError::Kill {
            pid,
            reason: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::Kill {
            pid,
            reason: format!("taskkill exited with {status}"),
        })
    }
}

/// Kill every process whose executable name contains one of `patterns`
/// (case-insensitive). The current process is skipped. Returns the pids killed.
pub fn kill_processes_matching(patterns: &[String]) -> Vec<u32> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return Vec::new();
    }

    let own = sysinfo::Pid::from_u32(std::process::id());
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut killed = Vec::new();
    for (pid, process) in sys.processes() {
        if *pid == own {
            continue;
        }
        let name = process.name().to_string_lossy().to_ascii_lowercase();
        if !patterns.iter().any(|p| name.contains(p.as_str())) {
            continue;
        }
        if process.kill() {
            tracing::info!(pid = pid.as_u32(), name = %name, "killed by pattern");
            killed.push(pid.as_u32());
        } else {
            tracing::warn!(pid = pid.as_u32(), name = %name, "pattern kill failed");
        }
    }
    killed
}

//! Process supervision primitives for `devloop`.
//!
//! Nothing here knows which backend or frontend is being managed. The
//! [`supervisor`] keeps at most one backend generation alive and is fed by the
//! change loop in [`watcher`].

pub mod defaults;
pub mod process;
pub mod readiness;
pub mod reaper;
pub mod snapshot;
pub mod supervisor;
pub mod watcher;

pub use process::{
    CommandSpec, ManagedProcess, OutputLine, ProcessError, kill_process_tree,
    kill_processes_matching,
};
pub use readiness::{ReadinessError, port_open, wait_for_port};
pub use reaper::{ReapError, reap_port};
pub use snapshot::{FileSnapshot, WatchFilter, changed, snapshot};
pub use supervisor::{
    ExitStatus, RestartTrigger, Supervisor, SupervisorError, SupervisorEvent, SupervisorHandle,
    SupervisorState,
};
pub use watcher::{ChangeDetector, WatchError, WatchMode, WatcherHandle, spawn_change_loop};

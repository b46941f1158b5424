use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const READY_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const READY_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const READY_TIMEOUT: Duration = Duration::from_secs(600);
pub const NOTIFY_DEBOUNCE: Duration = Duration::from_millis(150);

pub const BACKEND_PORT: u16 = 8080;
pub const FRONTEND_PORT: u16 = 5173;

pub const WATCH_EXTENSIONS: &[&str] = &["rs", "toml"];
pub const EXCLUDED_DIRS: &[&str] = &["target", ".git"];

/// Capacity of the per-process output line channel.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

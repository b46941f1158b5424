//! Change loop that turns source edits into restart requests.
//!
//! Both modes make the same decision: a restart is requested only when
//! [`changed`] says the latest snapshot differs from the previous one. In
//! `notify` mode filesystem events merely tell the loop when to look.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::defaults::NOTIFY_DEBOUNCE;
use crate::snapshot::{FileSnapshot, WatchFilter, changed};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("unknown watch mode '{0}' (expected 'poll' or 'notify')")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Re-walk the tree every interval.
    #[default]
    Poll,
    /// Re-walk the tree when the OS reports activity under the root.
    Notify,
}

impl FromStr for WatchMode {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" => Ok(WatchMode::Poll),
            "notify" => Ok(WatchMode::Notify),
            other => Err(WatchError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatchMode::Poll => "poll",
            WatchMode::Notify => "notify",
        })
    }
}

/// Holds the previous snapshot and compares each new one against it.
#[derive(Debug)]
pub struct ChangeDetector {
    root: PathBuf,
    filter: WatchFilter,
    last: FileSnapshot,
}

impl ChangeDetector {
    /// Take the baseline snapshot.
    pub fn new(root: impl Into<PathBuf>, filter: WatchFilter) -> Self {
        let root = root.into();
        let last = FileSnapshot::take(&root, &filter);
        tracing::debug!(root = %root.display(), files = last.len(), "baseline snapshot");
        Self { root, filter, last }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &WatchFilter {
        &self.filter
    }

    pub fn watched_files(&self) -> usize {
        self.last.len()
    }

    /// Re-walk the tree. Returns true (once) if anything changed since the
    /// previous call; any number of edits between two calls count as one.
    pub fn poll(&mut self) -> bool {
        let next = FileSnapshot::take(&self.root, &self.filter);
        if changed(&self.last, &next) {
            self.last = next;
            true
        } else {
            false
        }
    }
}

/// Keeps the change loop (and the OS watcher, in notify mode) alive.
pub struct WatcherHandle {
    task: JoinHandle<()>,
    _debouncer: Option<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the change loop. `on_change` runs once per detected change.
pub fn spawn_change_loop<F>(
    detector: ChangeDetector,
    mode: WatchMode,
    interval: Duration,
    on_change: F,
) -> Result<WatcherHandle, WatchError>
where
    F: Fn() + Send + Sync + 'static,
{
    match mode {
        WatchMode::Poll => {
            let task = tokio::spawn(poll_loop(detector, interval, on_change));
            Ok(WatcherHandle {
                task,
                _debouncer: None,
                _thread: None,
            })
        }
        WatchMode::Notify => spawn_notify_loop(detector, on_change),
    }
}

async fn poll_loop<F>(mut detector: ChangeDetector, interval: Duration, on_change: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the baseline already covers it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let (returned, is_changed) = match check(detector).await {
            Some(result) => result,
            None => return,
        };
        detector = returned;
        if is_changed {
            tracing::info!(root = %detector.root().display(), "change detected");
            on_change();
        }
    }
}

fn spawn_notify_loop<F>(detector: ChangeDetector, on_change: F) -> Result<WatcherHandle, WatchError>
where
    F: Fn() + Send + Sync + 'static,
{
    let root = detector.root().to_path_buf();
    let (tx, rx) = std_mpsc::channel();
    let mut debouncer = new_debouncer(NOTIFY_DEBOUNCE, tx).map_err(|source| WatchError::Notify {
        path: root.clone(),
        source,
    })?;
    debouncer
        .watcher()
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Notify {
            path: root.clone(),
            source,
        })?;

    // Capacity 1: a burst of events while a walk is running collapses into
    // one more walk.
    let (hint_tx, mut hint_rx) = mpsc::channel::<()>(1);
    let filter = detector.filter().clone();
    let thread_root = root.clone();
    let thread = std::thread::spawn(move || {
        for result in rx {
            match result {
                Ok(events) => {
                    let relevant = events.iter().any(|event| {
                        !filter.is_excluded(&thread_root, &event.path)
                            && (filter.watches_file(&event.path) || event.path.is_dir())
                    });
                    if relevant && hint_tx.try_send(()).is_err() && hint_tx.is_closed() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "watch error");
                }
            }
        }
    });

    let task = tokio::spawn(async move {
        let mut detector = detector;
        while hint_rx.recv().await.is_some() {
            let (returned, is_changed) = match check(detector).await {
                Some(result) => result,
                None => return,
            };
            detector = returned;
            if is_changed {
                tracing::info!(root = %detector.root().display(), "change detected");
                on_change();
            }
        }
    });

    Ok(WatcherHandle {
        task,
        _debouncer: Some(debouncer),
        _thread: Some(thread),
    })
}

/// Run one poll off the async threads.
async fn check(mut detector: ChangeDetector) -> Option<(ChangeDetector, bool)> {
    match tokio::task::spawn_blocking(move || {
        let is_changed = detector.poll();
        (detector, is_changed)
    })
    .await
    {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "snapshot task failed; change detection stopped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn touch(path: &Path, offset_secs: u64) {
        fs::write(path, offset_secs.to_string()).unwrap();
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset_secs))
            .unwrap();
    }

    async fn wait_for_count(count: &AtomicUsize, expected: usize) -> bool {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn parses_watch_mode() {
        assert_eq!("poll".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert_eq!(" Notify ".parse::<WatchMode>().unwrap(), WatchMode::Notify);
        assert!("inotify".parse::<WatchMode>().is_err());
        assert_eq!(WatchMode::default().to_string(), "poll");
    }

    #[test]
    fn many_edits_between_polls_count_once() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.rs", "b.rs", "c.rs"] {
            touch(&dir.path().join(name), 0);
        }
        let mut detector = ChangeDetector::new(dir.path(), WatchFilter::default());
        assert_eq!(detector.watched_files(), 3);
        assert!(!detector.poll());

        for (i, name) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            touch(&dir.path().join(name), 10 + i as u64);
        }
        assert!(detector.poll());
        assert!(!detector.poll());
    }

    #[test]
    fn ignored_files_do_not_trip_detector() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("server.src"), 0);
        touch(&dir.path().join("server.out"), 0);
        let filter = WatchFilter::new(["src"], ["target", ".git"]);
        let mut detector = ChangeDetector::new(dir.path(), filter);

        touch(&dir.path().join("server.out"), 5);
        assert!(!detector.poll());
        touch(&dir.path().join("server.src"), 5);
        assert!(detector.poll());
    }

    #[tokio::test]
    async fn poll_loop_reports_watched_change() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("main.rs"), 0);
        touch(&dir.path().join("notes.txt"), 0);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let detector = ChangeDetector::new(dir.path(), WatchFilter::default());
        let handle = spawn_change_loop(
            detector,
            WatchMode::Poll,
            Duration::from_millis(50),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        touch(&dir.path().join("notes.txt"), 3);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        touch(&dir.path().join("main.rs"), 3);
        assert!(wait_for_count(&count, 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.stop();
    }

    #[tokio::test]
    async fn notify_loop_reports_watched_change_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("target")).unwrap();
        touch(&dir.path().join("main.rs"), 0);
        touch(&dir.path().join("notes.txt"), 0);
        touch(&dir.path().join("target/build.rs"), 0);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let detector = ChangeDetector::new(dir.path(), WatchFilter::default());
        let handle = spawn_change_loop(
            detector,
            WatchMode::Notify,
            Duration::from_secs(60),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        touch(&dir.path().join("notes.txt"), 3);
        touch(&dir.path().join("target/build.rs"), 3);
        touch(&dir.path().join("target/new.rs"), 0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        touch(&dir.path().join("main.rs"), 3);
        assert!(wait_for_count(&count, 1).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.stop();
    }
}

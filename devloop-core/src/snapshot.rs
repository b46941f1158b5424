//! Source tree snapshots used to decide whether the backend needs a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::defaults::{EXCLUDED_DIRS, WATCH_EXTENSIONS};

/// Which files count as watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchFilter {
    /// Lower-cased extensions without the leading dot.
    extensions: Vec<String>,
    /// Directory names whose whole subtree is skipped.
    exclude_dirs: Vec<String>,
}

impl WatchFilter {
    pub fn new<E, D>(extensions: E, exclude_dirs: D) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            exclude_dirs: exclude_dirs
                .into_iter()
                .map(|d| d.as_ref().to_string())
                .collect(),
        }
    }

    pub fn exclude_dirs(&self) -> &[String] {
        &self.exclude_dirs
    }

    pub fn watches_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|w| w.eq_ignore_ascii_case(e)))
    }

    pub fn excludes_dir(&self, name: &str) -> bool {
        self.exclude_dirs.iter().any(|d| d == name)
    }

    /// True if any component of `path` below `root` is an excluded directory.
    pub fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        relative
            .parent()
            .into_iter()
            .flat_map(|p| p.components())
            .any(|c| c.as_os_str().to_str().is_some_and(|n| self.excludes_dir(n)))
    }
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self::new(WATCH_EXTENSIONS.iter(), EXCLUDED_DIRS.iter())
    }
}

pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Modification times of every watched file under a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    root: PathBuf,
    entries: HashMap<PathBuf, SystemTime>,
}

impl FileSnapshot {
    /// Walk `root` and record the mtime of each watched file.
    ///
    /// Unreadable entries are skipped; they show up again on the next walk if
    /// they become readable.
    pub fn take(root: &Path, filter: &WatchFilter) -> Self {
        let excluded = filter.exclude_dirs().to_vec();
        let mut walker = ignore::WalkBuilder::new(root);
        walker
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !(is_dir
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| excluded.iter().any(|d| d == n)))
            });

        let mut entries = HashMap::new();
        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::trace!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !filter.watches_file(path) {
                continue;
            }
            let mtime = entry
                .metadata()
                .map_err(|e| e.to_string())
                .and_then(|m| m.modified().map_err(|e| e.to_string()));
            match mtime {
                Ok(mtime) => {
                    entries.insert(path.to_path_buf(), mtime);
                }
                Err(e) => {
                    tracing::trace!(path = %path.display(), error = %e, "stat failed");
                }
            }
        }

        Self {
            root: root.to_path_buf(),
            entries,
        }
    }

    /// Number of watched files.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Convenience wrapper for [`FileSnapshot::take`].
pub fn snapshot(root: &Path, filter: &WatchFilter) -> FileSnapshot {
    FileSnapshot::take(root, filter)
}

/// Whether anything watched changed between two snapshots of the same root.
pub fn changed(prev: &FileSnapshot, curr: &FileSnapshot) -> bool {
    debug_assert_eq!(prev.root, curr.root, "snapshots of different roots");
    if prev.entries.len() != curr.entries.len() {
        return true;
    }
    curr.entries
        .iter()
        .any(|(path, mtime)| prev.entries.get(path) != Some(mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn set_mtime(path: &Path, offset_secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset_secs))
            .unwrap();
    }

    fn src_filter() -> WatchFilter {
        WatchFilter::new(["src"], ["target", ".git"])
    }

    #[test]
    fn unmodified_tree_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();

        let filter = WatchFilter::default();
        let a = snapshot(dir.path(), &filter);
        let b = snapshot(dir.path(), &filter);
        assert_eq!(a.len(), 2);
        assert!(!changed(&a, &a));
        assert!(!changed(&a, &b));
    }

    #[test]
    fn ignored_extension_never_changes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("server.src");
        let ignored = dir.path().join("server.out");
        fs::write(&watched, "a").unwrap();
        fs::write(&ignored, "a").unwrap();
        set_mtime(&watched, 0);
        set_mtime(&ignored, 0);

        let filter = src_filter();
        let s1 = snapshot(dir.path(), &filter);

        fs::write(&ignored, "b").unwrap();
        set_mtime(&ignored, 10);
        let s2 = snapshot(dir.path(), &filter);
        assert!(!changed(&s1, &s2));

        fs::write(&watched, "b").unwrap();
        set_mtime(&watched, 20);
        let s3 = snapshot(dir.path(), &filter);
        assert!(changed(&s1, &s3));
        assert!(changed(&s2, &s3));
    }

    #[test]
    fn added_and_removed_files_are_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "").unwrap();
        let filter = WatchFilter::default();
        let before = snapshot(dir.path(), &filter);

        fs::write(dir.path().join("b.rs"), "").unwrap();
        let added = snapshot(dir.path(), &filter);
        assert!(changed(&before, &added));

        fs::remove_file(dir.path().join("a.rs")).unwrap();
        let swapped = snapshot(dir.path(), &filter);
        // Same cardinality as `before`, different path.
        assert_eq!(swapped.len(), before.len());
        assert!(changed(&before, &swapped));
    }

    #[test]
    fn excluded_directories_are_not_walked() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target/debug/build")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("src/target_utils")).unwrap();
        fs::write(dir.path().join("target/debug/build/out.rs"), "").unwrap();
        fs::write(dir.path().join(".git/config.toml"), "").unwrap();
        fs::write(dir.path().join("src/target_utils/mod.rs"), "").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        let snap = snapshot(dir.path(), &WatchFilter::default());
        let mut paths: Vec<_> = snap
            .entries
            .keys()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("src/lib.rs"),
                PathBuf::from("src/target_utils/mod.rs")
            ]
        );
    }

    #[test]
    fn filter_normalizes_extensions() {
        let filter = WatchFilter::new([".RS", " toml "], Vec::<String>::new());
        assert_eq!(filter.extensions, ["rs", "toml"]);
        assert!(filter.watches_file(Path::new("/x/main.rs")));
        assert!(filter.watches_file(Path::new("/x/Cargo.TOML")));
        assert!(!filter.watches_file(Path::new("/x/README")));
    }

    #[test]
    fn is_excluded_checks_parent_components() {
        let filter = WatchFilter::default();
        let root = Path::new("/repo");
        assert!(filter.is_excluded(root, Path::new("/repo/target/debug/a.rs")));
        assert!(!filter.is_excluded(root, Path::new("/repo/src/a.rs")));
        assert!(!filter.is_excluded(root, Path::new("/repo/target")));
    }
}

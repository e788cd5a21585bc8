//! Source tree watcher
//!
//! Watches every directory under the root (hidden directories and `public`
//! excluded) and raises a [`ChangeSignal`] when a source file matching the
//! extension pattern is modified. With an `on_changed` callback registered,
//! bursts of events are debounced into one call after a quiet period.
//!
//! ```text
//! notify thread → mpsc bridge → watch loop → ChangeSignal
//!                                         ↘ debounce timer → on_changed(path)
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Conventional static assets directory, never watched
const PUBLIC_DIR: &str = "public";

/// Deadline used while the debounce timer is disarmed
const DISARMED: Duration = Duration::from_secs(86_400);

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

pub type ChangeCallback = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, ()> + Send + Sync>;

/// A sticky "sources changed" edge. Stays set until reset.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    changed: AtomicBool,
}

impl ChangeSignal {
    pub fn is_set(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    /// Clear the signal, returning whether it was set
    pub fn take(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }
}

pub struct ChangeWatcher {
    root: PathBuf,
    pattern: Regex,
    debounce: Duration,
    signal: Arc<ChangeSignal>,
    /// Last processed modification time per path
    seen: Mutex<HashMap<PathBuf, SystemTime>>,
    on_changed: Option<ChangeCallback>,
}

impl ChangeWatcher {
    /// Watch `root` for files whose extension matches `files`, an alternation
    /// such as `go|tmpl`
    pub fn new(root: impl AsRef<Path>, files: &str) -> Result<Self, regex::Error> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let pattern = Regex::new(&format!(r"\.({})$", files))?;

        Ok(Self {
            root,
            pattern,
            debounce: DEFAULT_DEBOUNCE,
            signal: Arc::new(ChangeSignal::default()),
            seen: Mutex::new(HashMap::new()),
            on_changed: None,
        })
    }

    /// Set the quiet period before `on_changed` fires (builder pattern)
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Register a callback fired once per burst of changes (builder pattern)
    pub fn on_changed<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_changed = Some(Arc::new(move |path| callback(path).boxed()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signal(&self) -> Arc<ChangeSignal> {
        Arc::clone(&self.signal)
    }

    pub fn is_changed(&self) -> bool {
        self.signal.is_set()
    }

    pub fn reset(&self) {
        self.signal.reset();
    }

    pub fn take_changed(&self) -> bool {
        self.signal.take()
    }

    /// Raise the signal without a filesystem event
    pub fn mark_changed(&self) {
        self.signal.set();
    }

    /// Directories the watcher registers, root first
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.dirs_under(&self.root)
    }

    fn dirs_under(&self, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.file_type().is_dir() && !is_ignored_dir(self.relative(entry.path()))
            })
            .flatten()
            .map(|entry| entry.into_path())
            .collect()
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// Whether an event on `path` should raise the signal
    pub fn qualifies(&self, path: &Path) -> bool {
        if is_temp_file(path) {
            return false;
        }
        if !self.pattern.is_match(&path.to_string_lossy()) {
            return false;
        }

        // Removed files have no timestamp and always count
        if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
            let mut seen = self.seen.lock();
            if seen.get(path) == Some(&modified) {
                return false;
            }
            seen.insert(path.to_path_buf(), modified);
        }
        true
    }

    /// Watch until the process ends
    pub async fn watch(self: Arc<Self>) -> notify::Result<()> {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;

        let dirs = self.watched_dirs();
        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        info!(root = %self.root.display(), dirs = dirs.len(), "Watching for changes");

        let (async_tx, mut async_rx) = tokio::sync::mpsc::channel::<notify::Event>(64);
        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if async_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Watch error"),
                }
            }
        });

        let timer = tokio::time::sleep(DISARMED);
        tokio::pin!(timer);
        let mut armed = false;
        let mut last_path: Option<PathBuf> = None;

        loop {
            tokio::select! {
                event = async_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let Some(path) = self.handle_event(&mut watcher, event) {
                        if self.on_changed.is_some() {
                            timer.as_mut().reset(Instant::now() + self.debounce);
                            armed = true;
                        }
                        last_path = Some(path);
                    }
                }
                () = &mut timer, if armed => {
                    armed = false;
                    if let (Some(callback), Some(path)) = (&self.on_changed, last_path.take()) {
                        debug!(path = %path.display(), "Debounce elapsed");
                        tokio::spawn(callback(path));
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns the last qualifying path of the event, if any
    fn handle_event(&self, watcher: &mut RecommendedWatcher, event: notify::Event) -> Option<PathBuf> {
        if matches!(event.kind, EventKind::Access(_)) {
            return None;
        }

        let mut qualifying = None;
        for path in event.paths {
            if matches!(event.kind, EventKind::Create(_)) && path.is_dir() {
                if is_ignored_dir(self.relative(&path)) {
                    continue;
                }
                for dir in self.dirs_under(&path) {
                    match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                        Ok(()) => debug!(dir = %dir.display(), "Watching new directory"),
                        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
                    }
                }
                continue;
            }

            if self.qualifies(&path) {
                if self.is_changed() {
                    debug!(path = %self.relative(&path).display(), "Source changed again");
                } else {
                    info!(path = %self.relative(&path).display(), "Source changed");
                }
                self.signal.set();
                qualifying = Some(path);
            }
        }
        qualifying
    }
}

/// Editor swap and backup files
pub fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    matches!(ext.as_str(), "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

/// Hidden directories and the public assets directory, given a path
/// relative to the watch root
pub fn is_ignored_dir(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || name == PUBLIC_DIR
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_is_temp_file() {
        assert!(is_temp_file(Path::new("main.go~")));
        assert!(is_temp_file(Path::new("main.go.swp")));
        assert!(is_temp_file(Path::new("main.go.SWP")));
        assert!(is_temp_file(Path::new("notes.Bak")));
        assert!(is_temp_file(Path::new(".#main.go")));
        assert!(!is_temp_file(Path::new("main.go")));
    }

    #[test]
    fn test_is_ignored_dir() {
        assert!(is_ignored_dir(Path::new(".git")));
        assert!(is_ignored_dir(Path::new("src/.cache")));
        assert!(is_ignored_dir(Path::new("public")));
        assert!(is_ignored_dir(Path::new("public/css")));
        assert!(!is_ignored_dir(Path::new("")));
        assert!(!is_ignored_dir(Path::new("handlers")));
        assert!(!is_ignored_dir(Path::new("publications")));
    }

    #[test]
    fn test_watched_dirs_skip_ignored() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["handlers/api", ".git/objects", "public/css", "models"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();

        let watcher = ChangeWatcher::new(dir.path(), "go").unwrap();
        let mut dirs: Vec<PathBuf> = watcher
            .watched_dirs()
            .iter()
            .map(|d| watcher.relative(d).to_path_buf())
            .collect();
        dirs.sort();

        assert_eq!(
            dirs,
            vec![
                PathBuf::from(""),
                PathBuf::from("handlers"),
                PathBuf::from("handlers/api"),
                PathBuf::from("models"),
            ]
        );
    }

    #[test]
    fn test_qualifies_filters_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = ChangeWatcher::new(dir.path(), "go|tmpl").unwrap();

        let source = dir.path().join("main.go");
        std::fs::write(&source, "package main").unwrap();
        assert!(watcher.qualifies(&source));
        // Same timestamp again
        assert!(!watcher.qualifies(&source));

        let template = dir.path().join("index.tmpl");
        std::fs::write(&template, "{{.}}").unwrap();
        assert!(watcher.qualifies(&template));

        assert!(!watcher.qualifies(&dir.path().join("style.css")));
        assert!(!watcher.qualifies(&dir.path().join("main.go~")));
        assert!(watcher.qualifies(&dir.path().join("deleted.go")));
    }

    #[test]
    fn test_signal_take_and_reset() {
        let watcher = ChangeWatcher::new(".", "go").unwrap();
        assert!(!watcher.is_changed());

        watcher.mark_changed();
        assert!(watcher.is_changed());
        assert!(watcher.take_changed());
        assert!(!watcher.take_changed());

        watcher.mark_changed();
        watcher.reset();
        assert!(!watcher.is_changed());
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ChangeWatcher::new(".", "go|(").is_err());
    }

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..60 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_sets_signal_on_source_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();

        let watcher = Arc::new(ChangeWatcher::new(dir.path(), "go").unwrap());
        let signal = watcher.signal();
        let task = tokio::spawn(Arc::clone(&watcher).watch());
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!signal.is_set());

        std::fs::write(dir.path().join("main.go"), "package main\n// edit").unwrap();
        assert!(wait_for(|| signal.is_set()).await);

        task.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_picks_up_new_directories() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Arc::new(ChangeWatcher::new(dir.path(), "go").unwrap());
        let signal = watcher.signal();
        let task = tokio::spawn(Arc::clone(&watcher).watch());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let nested = dir.path().join("handlers");
        std::fs::create_dir(&nested).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        signal.reset();

        std::fs::write(nested.join("user.go"), "package handlers").unwrap();
        assert!(wait_for(|| signal.is_set()).await);

        task.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_burst_fires_callback_once() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let watcher = Arc::new(
            ChangeWatcher::new(dir.path(), "go")
                .unwrap()
                .with_debounce(Duration::from_millis(300))
                .on_changed(move |_path| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );
        let task = tokio::spawn(Arc::clone(&watcher).watch());
        tokio::time::sleep(Duration::from_millis(200)).await;

        for i in 0..5 {
            std::fs::write(dir.path().join(format!("file{}.go", i)), "package main").unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(watcher.is_changed());

        task.abort();
    }
}

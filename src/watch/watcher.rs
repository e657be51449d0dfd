//! File system watcher feeding the debouncer.
//!
//! Provides cross-platform file watching using notify crate. Raw notifications are
//! translated into [`ChangeEvent`]s and pushed into a bounded queue, so the
//! debouncer never sees the notify callback directly.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::watch::rules::Scope;
use crate::watch::types::{ChangeEvent, ChangeKind};

/// Capacity of the queue between the notify thread and the debouncer.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Translate one notify event into zero or more change events.
///
/// Directory events are dropped; batches carry files only.
pub fn change_events(event: Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Moved,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Access(_) | EventKind::Other | EventKind::Any => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| !path.is_dir())
        .map(|path| ChangeEvent::new(path, kind))
        .collect()
}

/// Owns the notify watcher; dropping it stops the event stream.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    watched_paths: Vec<PathBuf>,
}

impl FileWatcher {
    /// Start watching `targets`, sending translated events into `tx`.
    ///
    /// Targets that do not exist are skipped with a warning.
    pub fn start(targets: &[(PathBuf, Scope)], tx: mpsc::Sender<ChangeEvent>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for change in change_events(event) {
                        // Blocks the notify thread when the debouncer falls behind.
                        if tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("File watcher error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .context("Failed to create file watcher")?;

        let mut watched_paths = Vec::new();
        for (path, scope) in targets {
            if !path.is_dir() {
                warn!("Skipping watch target that is not a directory: {}", path.display());
                continue;
            }
            let mode = match scope {
                Scope::Recursive => RecursiveMode::Recursive,
                Scope::NonRecursive => RecursiveMode::NonRecursive,
            };
            watcher
                .watch(path, mode)
                .with_context(|| format!("Failed to watch {}", path.display()))?;
            debug!(path = %path.display(), ?scope, "Watching");
            watched_paths.push(path.clone());
        }

        info!("Watching {} location(s) for changes", watched_paths.len());

        Ok(Self {
            _watcher: watcher,
            watched_paths,
        })
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched_paths
    }
}

//! Coalesces bursts of filesystem events into classified change batches.
//!
//! Editors tend to emit several raw events for one save (temp write, rename,
//! metadata touch). The debouncer holds events until the window has been quiet
//! for its full length, then flushes everything it saw as one batch.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::watch::rules::RuleSet;
use crate::watch::types::{ChangeBatch, ChangeEvent, Classification};

/// Default debounce window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);

/// Paths collected during one window, plus the most severe classification seen.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    files: BTreeSet<PathBuf>,
    severity: Option<Classification>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an event and keep it if it is relevant.
    ///
    /// Deletions and moves are classified exactly like modifications.
    pub fn push(&mut self, rules: &RuleSet, event: &ChangeEvent) -> Classification {
        let classification = rules.classify(&event.path);
        if classification == Classification::Ignore {
            return classification;
        }
        if let Some(rel) = rules.relativize(&event.path) {
            self.add(rel, classification);
        }
        classification
    }

    /// Record an already classified root-relative path.
    pub fn add(&mut self, rel: PathBuf, classification: Classification) {
        if classification == Classification::Ignore {
            return;
        }
        self.files.insert(rel);
        self.severity = Some(self.severity.map_or(classification, |s| s.max(classification)));
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Drain the window into a batch. Returns `None` when nothing relevant happened.
    pub fn flush(&mut self) -> Option<ChangeBatch> {
        let kind = self.severity.take()?.reload_kind()?;
        let files = std::mem::take(&mut self.files);
        Some(ChangeBatch::new(kind, files))
    }
}

/// Timer-driven debouncer fed by the watcher queue.
pub struct Debouncer {
    rules: Arc<RuleSet>,
    window: Duration,
}

impl Debouncer {
    pub fn new(rules: Arc<RuleSet>, window: Duration) -> Self {
        Self { rules, window }
    }

    pub fn spawn(
        self,
        events: mpsc::Receiver<ChangeEvent>,
        batches: mpsc::Sender<ChangeBatch>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, batches))
    }

    /// Run until the event channel closes or the batch receiver goes away.
    ///
    /// The deadline moves forward on every relevant event. Ignored paths never
    /// delay a pending batch.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ChangeEvent>,
        batches: mpsc::Sender<ChangeBatch>,
    ) {
        let mut pending = BatchAccumulator::new();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = events.recv() => {
                    let Some(event) = received else {
                        if let Some(batch) = pending.flush() {
                            let _ = batches.send(batch).await;
                        }
                        debug!("Event stream closed, debouncer stopping");
                        return;
                    };

                    let classification = pending.push(&self.rules, &event);
                    debug!(path = %event.path.display(), kind = ?event.kind, ?classification, "Change event");
                    if classification != Classification::Ignore {
                        deadline = Some(Instant::now() + self.window);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if let Some(batch) = pending.flush() {
                        info!(kind = %batch.kind(), files = batch.len(), "Change batch ready");
                        if batches.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

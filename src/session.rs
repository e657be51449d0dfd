//! The long-running watch loop.
//!
//! Watcher → bounded queue → debouncer → dispatcher. Batches are dispatched one at
//! a time in the order the debouncer emits them.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::sync::{DispatchReport, Dispatcher};
use crate::watch::{ChangeEvent, Debouncer, FileWatcher, RuleSet, EVENT_QUEUE_CAPACITY};

const BATCH_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub batches: usize,
    /// Batches for which every target failed.
    pub total_failures: usize,
}

pub struct Session {
    rules: Arc<RuleSet>,
    dispatcher: Arc<Dispatcher>,
    window: Duration,
    print_reports: bool,
}

impl Session {
    pub fn new(rules: RuleSet, dispatcher: Dispatcher, window: Duration) -> Self {
        Self {
            rules: Arc::new(rules),
            dispatcher: Arc::new(dispatcher),
            window,
            print_reports: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let rules = config.rule_set()?;
        let dispatcher = Dispatcher::from_config(config)?;
        Ok(Self::new(rules, dispatcher, config.settings.debounce_window()))
    }

    /// Print each report to stdout in addition to logging it.
    pub fn print_reports(mut self, enabled: bool) -> Self {
        self.print_reports = enabled;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Watch the filesystem until Ctrl-C.
    pub async fn run(&self) -> Result<SessionStats> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Watch the filesystem until `shutdown` resolves.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<SessionStats> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let targets = self.rules.watch_targets();
        let watcher = FileWatcher::start(&targets, event_tx).context("Failed to start file watcher")?;
        if watcher.watched_paths().is_empty() {
            warn!("Nothing to watch: configure watched files or folders");
        }

        let stats = self.run_events(event_rx, shutdown).await;
        drop(watcher);
        stats
    }

    /// Drive the debouncer and dispatcher from an arbitrary event stream.
    pub async fn run_events<F: Future<Output = ()>>(
        &self,
        events: mpsc::Receiver<ChangeEvent>,
        shutdown: F,
    ) -> Result<SessionStats> {
        let (batch_tx, mut batch_rx) = mpsc::channel(BATCH_QUEUE_CAPACITY);
        let debouncer = Debouncer::new(Arc::clone(&self.rules), self.window).spawn(events, batch_tx);
        let mut stats = SessionStats::default();

        info!(root = %self.rules.root().display(), window_ms = self.window.as_millis() as u64, "Watching for changes");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                batch = batch_rx.recv() => {
                    let Some(batch) = batch else { break };
                    stats.batches += 1;
                    match self.dispatcher.dispatch(&batch).await {
                        Ok(report) => {
                            if report.is_total_failure() {
                                stats.total_failures += 1;
                            }
                            self.publish(&report);
                        }
                        Err(e) => error!("Dispatch failed: {:#}", e),
                    }
                }
            }
        }

        debouncer.abort();
        Ok(stats)
    }

    fn publish(&self, report: &DispatchReport) {
        if self.print_reports {
            for line in report.render_lines() {
                println!("{}", line);
            }
        }
        if report.is_total_failure() {
            warn!(kind = %report.batch.kind(), "No target accepted the batch");
        } else {
            info!(
                kind = %report.batch.kind(),
                ok = report.succeeded(),
                failed = report.failed(),
                "Batch dispatched"
            );
        }
    }
}

//! Sync dispatcher: one batch in, one attempt per target out.
//!
//! The directive snapshot is built once and shared by reference. Every target is
//! attempted concurrently and each attempt is bounded, so a dispatch returns after
//! the slowest target finishes or times out. Nothing is retried here; the next
//! batch is the retry.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::agent::{from_commands, Agent};
use crate::config::Config;
use crate::device::{DeviceRegistry, TcpTransport, Transport};
use crate::sync::directive::{DirectiveBuilder, DirectiveSnapshot};
use crate::sync::exclude::ExcludePatterns;
use crate::sync::manifest::{plan_push, TreeManifest};
use crate::sync::report::{AttemptOutcome, DispatchReport, SyncAttempt};
use crate::sync::target::{Delivery, LocalTarget, RemoteTarget, Target, Timeouts};
use crate::sync::throttle::BandwidthLimit;
use crate::watch::types::{ChangeBatch, ReloadKind};

pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    builder: DirectiveBuilder,
    local: Option<Arc<dyn Target>>,
    timeouts: Timeouts,
    bandwidth: BandwidthLimit,
    remote_enabled: bool,
    state_file: PathBuf,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, builder: DirectiveBuilder) -> Self {
        let state_file = TreeManifest::state_file_path(builder.root());
        Self {
            state_file,
            registry,
            transport: Arc::new(TcpTransport),
            builder,
            local: None,
            timeouts: Timeouts::default(),
            bandwidth: BandwidthLimit::unlimited(),
            remote_enabled: true,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthLimit) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_local(mut self, local: Arc<dyn Target>) -> Self {
        self.local = Some(local);
        self
    }

    /// Where [`Dispatcher::push_tree`] keeps its manifest.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    /// When disabled only the local target receives directives.
    pub fn with_remote(mut self, enabled: bool) -> Self {
        self.remote_enabled = enabled;
        self
    }

    /// Wire everything up from a loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = &config.settings;

        let registry = Arc::new(DeviceRegistry::new());
        for device in settings.device_list()? {
            registry.register(device)?;
        }

        let excludes = ExcludePatterns::from_patterns(&settings.exclude_from_tree)?.with_ignore_file(&config.root);
        let builder = DirectiveBuilder::new(&config.root)
            .with_payload(settings.full_reload_payload)
            .with_excludes(excludes)
            .with_compression(settings.compression, settings.compression_level());

        let timeouts = Timeouts {
            connect: settings.connect_timeout(),
            cold_connect: settings.cold_connect_timeout(),
            ack: settings.ack_timeout(),
        };

        let mut dispatcher = Self::new(registry, builder)
            .with_timeouts(timeouts)
            .with_bandwidth(settings.bandwidth())
            .with_remote(settings.hot_reload_on_devices);

        let local = &settings.local;
        if local.enabled {
            let target: Arc<dyn Target> = match config.local_mirror() {
                Some(mirror) => {
                    let capability = from_commands(&mirror, local.hot_swap_command.clone(), local.restart_command.clone());
                    Arc::new(LocalTarget::mirrored(Agent::new(mirror, capability), timeouts))
                }
                None => {
                    let capability =
                        from_commands(&config.root, local.hot_swap_command.clone(), local.restart_command.clone());
                    Arc::new(LocalTarget::in_place(Agent::new(&config.root, capability), timeouts))
                }
            };
            dispatcher = dispatcher.with_local(target);
        }

        Ok(dispatcher)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn builder(&self) -> &DirectiveBuilder {
        &self.builder
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Every target the next dispatch will attempt, devices first.
    pub fn targets(&self) -> Vec<Arc<dyn Target>> {
        let mut targets: Vec<Arc<dyn Target>> = Vec::new();
        if self.remote_enabled {
            for device in self.registry.handles() {
                targets.push(Arc::new(RemoteTarget::new(
                    device,
                    Arc::clone(&self.transport),
                    self.timeouts,
                    self.bandwidth,
                )));
            }
        }
        if let Some(local) = &self.local {
            targets.push(Arc::clone(local));
        }
        targets
    }

    pub async fn dispatch(&self, batch: &ChangeBatch) -> Result<DispatchReport> {
        let started_at = Utc::now();
        let snapshot = self
            .builder
            .build(batch)
            .await
            .context("Failed to build reload directive")?;

        let targets = self.targets();
        if targets.is_empty() {
            warn!("No targets to dispatch to");
        }
        info!(
            kind = %snapshot.kind(),
            files = snapshot.file_count(),
            removed = snapshot.removed_count(),
            targets = targets.len(),
            "Dispatching"
        );

        let attempts = join_all(
            targets
                .iter()
                .map(|target| attempt(Arc::clone(target), Arc::clone(&snapshot))),
        )
        .await;

        for attempt in &attempts {
            if attempt.transport.is_some() {
                self.registry.mark_result(&attempt.target, &attempt.outcome);
            }
            if !attempt.outcome.is_ok() {
                warn!(target = %attempt.target, outcome = %attempt.outcome, "Sync attempt failed");
            }
        }

        Ok(DispatchReport {
            batch: snapshot.batch.clone(),
            removed: snapshot.removed_count(),
            raw_bytes: snapshot.raw_bytes,
            started_at,
            attempts,
        })
    }

    /// Push the whole project as a full reload, sending only what changed since
    /// the last push every target accepted.
    ///
    /// With `force_full` every file goes out regardless of the manifest. Returns
    /// `None` when the targets are already up to date.
    pub async fn push_tree(&self, force_full: bool) -> Result<Option<DispatchReport>> {
        let current = TreeManifest::scan(&self.builder).await?;
        let previous = TreeManifest::load(&self.state_file)
            .await
            .with_context(|| format!("Failed to read {}", self.state_file.display()))?;

        let batch = if force_full {
            let removed = previous
                .map(|previous| previous.delta(&current).removed)
                .unwrap_or_default();
            ChangeBatch::new(
                ReloadKind::FullReload,
                current.files.keys().map(PathBuf::from).chain(removed),
            )
        } else {
            match plan_push(previous.as_ref(), &current) {
                Some(batch) => batch,
                None => {
                    info!("Targets are up to date");
                    return Ok(None);
                }
            }
        };

        let report = self.dispatch(&batch).await?;
        if !report.attempts.is_empty() && report.failed() == 0 {
            let manifest = TreeManifest {
                pushed_at: Some(report.started_at.to_rfc3339()),
                ..current
            };
            if let Err(e) = manifest.save(&self.state_file).await {
                warn!("Failed to record {}: {}", self.state_file.display(), e);
            }
        }
        Ok(Some(report))
    }
}

async fn attempt(target: Arc<dyn Target>, snapshot: Arc<DirectiveSnapshot>) -> SyncAttempt {
    let _lane = match target.lane() {
        Some(lane) => Some(lane.lock().await),
        None => None,
    };

    let started = Instant::now();
    let progress = AtomicU64::new(0);
    let delivery = match timeout(
        target.budget(&snapshot),
        target.deliver(Arc::clone(&snapshot), &progress),
    )
    .await
    {
        Ok(delivery) => delivery,
        Err(_) => Delivery::failed(AttemptOutcome::Timeout, progress.load(Ordering::Relaxed)),
    };

    SyncAttempt {
        target: target.name().to_string(),
        transport: target.transport(),
        outcome: delivery.outcome,
        duration: started.elapsed(),
        bytes_sent: delivery.bytes_sent,
    }
}

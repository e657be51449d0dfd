//! Incremental pushes of the whole project.
//!
//! The manifest records the content hash of every tree file the targets last
//! received. It lives beside the project root, not inside it, so it never ends up
//! in a tree payload or wakes the watcher. For a root "app/" the state file is
//! "../.app.livesync-state.json".

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::protocol::hash::ContentHash;
use crate::sync::directive::{wire_path, DirectiveBuilder};
use crate::watch::types::{ChangeBatch, ReloadKind};

/// Above this share of changed files the whole tree is sent instead of a delta.
pub const DELTA_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeManifest {
    /// Time of the push that produced this manifest (RFC 3339)
    #[serde(default)]
    pub pushed_at: Option<String>,
    /// Wire path to hex-encoded content hash
    pub files: BTreeMap<String, String>,
}

/// Files that differ between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDelta {
    /// Added or modified.
    pub changed: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl TreeDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

impl TreeManifest {
    pub fn state_file_path(root: &Path) -> PathBuf {
        let name = root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("project");
        let state_name = format!(".{}.livesync-state.json", name);

        match root.parent() {
            Some(parent) => parent.join(state_name),
            None => PathBuf::from(state_name),
        }
    }

    /// Load a manifest, or `None` if nothing was pushed yet.
    pub async fn load(path: &Path) -> io::Result<Option<Self>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let manifest: Self = serde_json::from_str(&content)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content).await
    }

    /// Hash every file of the tree as the builder sees it.
    pub async fn scan(builder: &DirectiveBuilder) -> Result<Self> {
        let builder = builder.clone();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&builder))
            .await
            .context("Manifest scan task panicked")
    }

    fn scan_blocking(builder: &DirectiveBuilder) -> Self {
        let root = builder.root();
        let files: BTreeMap<String, String> = builder
            .tree_files()
            .par_iter()
            .filter_map(|rel| {
                let path = wire_path(rel)?;
                match std::fs::read(root.join(rel)) {
                    Ok(data) => Some((path, ContentHash::of(&data).to_hex())),
                    Err(e) => {
                        warn!("Skipping {}: {}", rel.display(), e);
                        None
                    }
                }
            })
            .collect();

        debug!(files = files.len(), "Scanned tree manifest");
        Self { pushed_at: None, files }
    }

    /// What changed going from `self` to `current`.
    pub fn delta(&self, current: &TreeManifest) -> TreeDelta {
        let changed = current
            .files
            .iter()
            .filter(|(path, hash)| self.files.get(*path) != Some(*hash))
            .map(|(path, _)| PathBuf::from(path))
            .collect();
        let removed = self
            .files
            .keys()
            .filter(|path| !current.files.contains_key(*path))
            .map(PathBuf::from)
            .collect();

        TreeDelta { changed, removed }
    }
}

/// Decide what a push of the whole project sends.
///
/// Without a previous manifest every file goes out. Otherwise only the delta,
/// unless more than [`DELTA_THRESHOLD`] of the files changed, in which case the
/// whole tree goes out with the removals. Returns `None` when nothing changed.
pub fn plan_push(previous: Option<&TreeManifest>, current: &TreeManifest) -> Option<ChangeBatch> {
    let everything = || current.files.keys().map(PathBuf::from);

    let Some(previous) = previous else {
        return Some(ChangeBatch::new(ReloadKind::FullReload, everything()));
    };

    let delta = previous.delta(current);
    if delta.is_empty() {
        return None;
    }

    let limit = current.files.len() as f64 * DELTA_THRESHOLD;
    let files: Vec<PathBuf> = if delta.changed.len() as f64 > limit {
        debug!(changed = delta.changed.len(), total = current.files.len(), "Delta too large, sending tree");
        everything().chain(delta.removed).collect()
    } else {
        delta.changed.into_iter().chain(delta.removed).collect()
    };
    Some(ChangeBatch::new(ReloadKind::FullReload, files))
}

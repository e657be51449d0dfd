//! Builds the immutable directive snapshot shared by every target of a dispatch.
//!
//! Files are read, hashed and compressed exactly once per batch. Batch paths that no
//! longer exist on disk become removals.

use anyhow::{Context, Result};
use jwalk::WalkDir;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::FullReloadPayload;
use crate::protocol::compression::{compress, CompressionLevel, CompressionType};
use crate::protocol::frame::{WireDirective, WireFile, MAX_FILE_SIZE};
use crate::protocol::hash::ContentHash;
use crate::sync::exclude::ExcludePatterns;
use crate::watch::types::{ChangeBatch, ReloadKind};

/// What every target receives for one batch.
#[derive(Debug)]
pub struct DirectiveSnapshot {
    pub batch: ChangeBatch,
    pub wire: WireDirective,
    /// Total uncompressed size of the files.
    pub raw_bytes: u64,
}

impl DirectiveSnapshot {
    pub fn kind(&self) -> ReloadKind {
        self.wire.kind
    }

    pub fn file_count(&self) -> usize {
        self.wire.files.len()
    }

    pub fn removed_count(&self) -> usize {
        self.wire.removed.len()
    }

    /// Bytes that go over the wire for the file contents.
    pub fn payload_bytes(&self) -> u64 {
        self.wire.content_len()
    }
}

enum Entry {
    File { file: WireFile, raw_len: u64 },
    Removed(String),
    Skipped,
}

/// Turn a relative path into the `/`-separated form used on the wire.
pub fn wire_path(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[derive(Debug, Clone)]
pub struct DirectiveBuilder {
    root: PathBuf,
    payload: FullReloadPayload,
    excludes: Arc<ExcludePatterns>,
    compression: CompressionType,
    level: CompressionLevel,
}

impl DirectiveBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            payload: FullReloadPayload::Changed,
            excludes: Arc::new(ExcludePatterns::new()),
            compression: CompressionType::None,
            level: CompressionLevel::default(),
        }
    }

    pub fn with_payload(mut self, payload: FullReloadPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_excludes(mut self, excludes: ExcludePatterns) -> Self {
        self.excludes = Arc::new(excludes);
        self
    }

    pub fn with_compression(mut self, compression: CompressionType, level: CompressionLevel) -> Self {
        self.compression = compression;
        self.level = level;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every non-excluded regular file under the root, relative and sorted.
    pub fn tree_files(&self) -> Vec<PathBuf> {
        let root = self.root.clone();
        let excludes = Arc::clone(&self.excludes);

        WalkDir::new(&self.root)
            .skip_hidden(false)
            .follow_links(false)
            .process_read_dir(move |_depth, _path, _state, children| {
                children.retain(|entry| match entry {
                    Ok(entry) => match entry.path().strip_prefix(&root) {
                        Ok(rel) => !excludes.is_excluded(rel, entry.file_type().is_dir()),
                        Err(_) => true,
                    },
                    Err(_) => true,
                });
            })
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.path().strip_prefix(&self.root).ok().map(Path::to_path_buf))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn build(&self, batch: &ChangeBatch) -> Result<Arc<DirectiveSnapshot>> {
        let builder = self.clone();
        let batch = batch.clone();
        let snapshot = tokio::task::spawn_blocking(move || builder.build_blocking(batch))
            .await
            .context("Directive builder task panicked")??;
        Ok(Arc::new(snapshot))
    }

    pub fn build_blocking(&self, batch: ChangeBatch) -> Result<DirectiveSnapshot> {
        let kind = batch.kind();
        let mut candidates: BTreeSet<PathBuf> = batch.files().clone();
        if kind == ReloadKind::FullReload && self.payload == FullReloadPayload::Tree {
            candidates.extend(self.tree_files());
        }

        let candidates: Vec<PathBuf> = candidates.into_iter().collect();
        let entries: Vec<Entry> = candidates
            .par_iter()
            .map(|rel| self.read_entry(rel, batch.contains(rel)))
            .collect::<Result<_>>()?;

        let mut files = Vec::new();
        let mut removed = Vec::new();
        let mut raw_bytes = 0;
        for entry in entries {
            match entry {
                Entry::File { file, raw_len } => {
                    raw_bytes += raw_len;
                    files.push(file);
                }
                Entry::Removed(path) => removed.push(path),
                Entry::Skipped => {}
            }
        }

        debug!(
            kind = %kind,
            files = files.len(),
            removed = removed.len(),
            raw_bytes,
            "Built directive snapshot"
        );

        Ok(DirectiveSnapshot {
            batch,
            wire: WireDirective { kind, files, removed },
            raw_bytes,
        })
    }

    fn read_entry(&self, rel: &Path, in_batch: bool) -> Result<Entry> {
        let Some(path) = wire_path(rel) else {
            warn!("Skipping path that cannot be sent: {}", rel.display());
            return Ok(Entry::Skipped);
        };

        let abs = self.root.join(rel);
        let metadata = match std::fs::metadata(&abs) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(if in_batch { Entry::Removed(path) } else { Entry::Skipped });
            }
            Err(e) => {
                warn!("Skipping {}: {}", abs.display(), e);
                return Ok(Entry::Skipped);
            }
        };
        if !metadata.is_file() {
            return Ok(Entry::Skipped);
        }
        if metadata.len() > MAX_FILE_SIZE {
            warn!("Skipping {}: larger than {} bytes", abs.display(), MAX_FILE_SIZE);
            return Ok(Entry::Skipped);
        }

        let data = match std::fs::read(&abs) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(if in_batch { Entry::Removed(path) } else { Entry::Skipped });
            }
            Err(e) => {
                warn!("Skipping {}: {}", abs.display(), e);
                return Ok(Entry::Skipped);
            }
        };

        let hash = ContentHash::of(&data);
        let codec = self.compression.for_path(rel);
        let content = if codec == CompressionType::None {
            data
        } else {
            compress(&data, codec, self.level)
                .with_context(|| format!("Failed to compress {}", abs.display()))?
        };

        Ok(Entry::File {
            raw_len: metadata.len(),
            file: WireFile {
                path,
                codec,
                content,
                hash,
            },
        })
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Outcome of classifying a single changed path.
///
/// Variants are ordered by severity so `max` picks the one that wins a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Ignore,
    HotReload,
    FullReload,
}

impl Classification {
    /// The directive kind this classification produces, if any.
    pub fn reload_kind(self) -> Option<ReloadKind> {
        match self {
            Self::Ignore => None,
            Self::HotReload => Some(ReloadKind::HotReload),
            Self::FullReload => Some(ReloadKind::FullReload),
        }
    }
}

/// What a target must do after receiving a batch of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadKind {
    /// Swap the changed files into the running process.
    HotReload,
    /// Restart the target application after writing the files.
    FullReload,
}

impl ReloadKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HotReload => "hot reload",
            Self::FullReload => "full reload",
        }
    }
}

impl fmt::Display for ReloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<ReloadKind> for Classification {
    fn from(kind: ReloadKind) -> Self {
        match kind {
            ReloadKind::HotReload => Self::HotReload,
            ReloadKind::FullReload => Self::FullReload,
        }
    }
}

/// Raw kind of a filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A single filesystem notification, before debouncing.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub observed_at: DateTime<Utc>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            observed_at: Utc::now(),
            kind,
        }
    }
}

/// One debounced, homogeneous set of root-relative changed files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeBatch {
    kind: ReloadKind,
    files: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    pub fn new(kind: ReloadKind, files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            kind,
            files: files.into_iter().collect(),
        }
    }

    pub fn kind(&self) -> ReloadKind {
        self.kind
    }

    pub fn files(&self) -> &BTreeSet<PathBuf> {
        &self.files
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

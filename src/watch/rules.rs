//! Watch rules and the change classifier.
//!
//! A [`RuleSet`] is built once from configuration and never mutated. Classification
//! evaluates every full-reload rule before any hot-reload rule, so a path matched by
//! both always restarts the target.

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::config::ConfigError;
use crate::watch::types::{Classification, ReloadKind};

/// Patterns that never trigger a hot reload.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &["*.pyc", "**/__pycache__/**"];

/// How far below a watched folder changes are picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Recursive,
    NonRecursive,
}

/// A single configured rule.
///
/// Patterns ending in `/` (or the bare `.`) name folders; anything else is an exact
/// root-relative file path or a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    pub pattern: String,
    pub scope: Scope,
    pub classification: ReloadKind,
}

impl WatchRule {
    pub fn full_reload(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            scope: Scope::NonRecursive,
            classification: ReloadKind::FullReload,
        }
    }

    pub fn hot_file(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            scope: Scope::NonRecursive,
            classification: ReloadKind::HotReload,
        }
    }

    pub fn hot_folder(folder: impl Into<String>, scope: Scope) -> Self {
        let mut pattern = folder.into();
        if pattern != "." && !pattern.ends_with('/') {
            pattern.push('/');
        }
        Self {
            pattern,
            scope,
            classification: ReloadKind::HotReload,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.pattern == "." || self.pattern.ends_with('/')
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(PathBuf),
    Glob(GlobMatcher),
    Folder { dir: PathBuf, scope: Scope },
}

impl Matcher {
    fn compile(rule: &WatchRule) -> Result<Self, ConfigError> {
        if rule.is_folder() {
            return Ok(Self::Folder {
                dir: pattern_path(&rule.pattern),
                scope: rule.scope,
            });
        }

        if is_glob(&rule.pattern) {
            let glob = GlobBuilder::new(rule.pattern.trim_start_matches("./"))
                .literal_separator(true)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    source,
                })?;
            return Ok(Self::Glob(glob.compile_matcher()));
        }

        Ok(Self::Exact(pattern_path(&rule.pattern)))
    }

    fn matches(&self, rel: &Path) -> bool {
        match self {
            Self::Exact(path) => rel == path,
            Self::Glob(glob) => glob.is_match(rel),
            Self::Folder { dir, scope: Scope::Recursive } => rel.starts_with(dir) && rel != dir,
            Self::Folder { dir, scope: Scope::NonRecursive } => rel.parent() == Some(dir.as_path()),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: WatchRule,
    matcher: Matcher,
}

/// Immutable set of watch rules bound to a project root.
#[derive(Debug, Clone)]
pub struct RuleSet {
    root: PathBuf,
    canonical_root: PathBuf,
    full: Vec<CompiledRule>,
    hot: Vec<CompiledRule>,
    ignore: GlobSet,
}

impl RuleSet {
    /// Compile `rules` against `root`. Rule order is preserved within each class.
    pub fn new(
        root: &Path,
        rules: Vec<WatchRule>,
        ignore_patterns: &[String],
    ) -> Result<Self, ConfigError> {
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());

        let mut full = Vec::new();
        let mut hot = Vec::new();
        for rule in rules {
            let matcher = Matcher::compile(&rule)?;
            let compiled = CompiledRule { rule, matcher };
            match compiled.rule.classification {
                ReloadKind::FullReload => full.push(compiled),
                ReloadKind::HotReload => hot.push(compiled),
            }
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_patterns {
            let glob = GlobBuilder::new(pattern)
                .build()
                .map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|source| ConfigError::InvalidPattern {
            pattern: ignore_patterns.join(", "),
            source,
        })?;

        Ok(Self {
            root,
            canonical_root,
            full,
            hot,
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All rules, full-reload rules first.
    pub fn rules(&self) -> impl Iterator<Item = &WatchRule> {
        self.full.iter().chain(self.hot.iter()).map(|c| &c.rule)
    }

    /// Classify a changed path. Paths outside the root are ignored.
    pub fn classify(&self, path: &Path) -> Classification {
        match self.relativize(path) {
            Some(rel) => self.classify_relative(&rel),
            None => Classification::Ignore,
        }
    }

    fn classify_relative(&self, rel: &Path) -> Classification {
        if self.full.iter().any(|c| c.matcher.matches(rel)) {
            return Classification::FullReload;
        }

        if self.is_ignored(rel) {
            return Classification::Ignore;
        }

        if self.hot.iter().any(|c| c.matcher.matches(rel)) {
            Classification::HotReload
        } else {
            Classification::Ignore
        }
    }

    fn is_ignored(&self, rel: &Path) -> bool {
        if self.ignore.is_match(rel) {
            return true;
        }
        rel.file_name()
            .map(|name| self.ignore.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    /// Turn an absolute or relative path into a clean root-relative one.
    ///
    /// Returns `None` for paths outside the root, the root itself, or paths that
    /// climb with `..`.
    pub fn relativize(&self, path: &Path) -> Option<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .or_else(|_| path.strip_prefix(&self.canonical_root))
                .ok()?
        } else {
            path
        };

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }

        if clean.as_os_str().is_empty() {
            None
        } else {
            Some(clean)
        }
    }

    /// Directories the filesystem watcher has to observe to see every rule.
    ///
    /// Exact files are watched through their parent directory so editors that save by
    /// writing a temp file and renaming it over the target are still seen.
    pub fn watch_targets(&self) -> Vec<(PathBuf, Scope)> {
        let mut dirs: BTreeMap<PathBuf, Scope> = BTreeMap::new();

        for compiled in self.full.iter().chain(self.hot.iter()) {
            let (dir, scope) = match &compiled.matcher {
                Matcher::Glob(_) => (PathBuf::new(), Scope::Recursive),
                Matcher::Folder { dir, scope } => (dir.clone(), *scope),
                Matcher::Exact(path) => (
                    path.parent().map(Path::to_path_buf).unwrap_or_default(),
                    Scope::NonRecursive,
                ),
            };
            let entry = dirs.entry(dir).or_insert(scope);
            // Recursive sorts first, so min keeps the wider scope.
            *entry = (*entry).min(scope);
        }

        let recursive: Vec<PathBuf> = dirs
            .iter()
            .filter(|(_, scope)| **scope == Scope::Recursive)
            .map(|(dir, _)| dir.clone())
            .collect();

        dirs.into_iter()
            .filter(|(dir, _)| {
                !recursive
                    .iter()
                    .any(|parent| parent != dir && dir.starts_with(parent))
            })
            .map(|(dir, scope)| {
                let path = if dir.as_os_str().is_empty() {
                    self.root.clone()
                } else {
                    self.root.join(dir)
                };
                (path, scope)
            })
            .collect()
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn pattern_path(pattern: &str) -> PathBuf {
    pattern
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

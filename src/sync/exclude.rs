//! Exclusion rules for full tree payloads.
//!
//! Configured globs are matched against the whole relative path, its file name and
//! each component, so `.git` excludes the folder and everything in it. A
//! `.livesyncignore` file at the root adds gitignore-style rules on top.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path};
use tracing::warn;

use crate::config::ConfigError;

pub const IGNORE_FILE_NAME: &str = ".livesyncignore";

#[derive(Debug, Clone)]
pub struct ExcludePatterns {
    glob_set: GlobSet,
    ignore_file: Option<Gitignore>,
}

impl Default for ExcludePatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl ExcludePatterns {
    /// Excludes nothing.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            ignore_file: None,
        }
    }

    pub fn from_patterns(patterns: &[String]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim().trim_end_matches('/');
            let glob = Glob::new(trimmed).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let glob_set = builder.build().map_err(|source| ConfigError::InvalidPattern {
            pattern: patterns.join(", "),
            source,
        })?;

        Ok(Self {
            glob_set,
            ignore_file: None,
        })
    }

    /// Add the rules of `<root>/.livesyncignore`, if the file exists.
    pub fn with_ignore_file(mut self, root: &Path) -> Self {
        let path = root.join(IGNORE_FILE_NAME);
        if !path.is_file() {
            return self;
        }

        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(&path) {
            warn!("Failed to read {}: {}", path.display(), e);
        }
        match builder.build() {
            Ok(gitignore) => self.ignore_file = Some(gitignore),
            Err(e) => warn!("Ignoring invalid {}: {}", path.display(), e),
        }
        self
    }

    /// Check a root-relative path.
    pub fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        if self.glob_set.is_match(rel) {
            return true;
        }

        let by_component = rel.components().any(|component| match component {
            Component::Normal(name) => self.glob_set.is_match(Path::new(name)),
            _ => false,
        });
        if by_component {
            return true;
        }

        match &self.ignore_file {
            Some(gitignore) => gitignore
                .matched_path_or_any_parents(rel, is_dir)
                .is_ignore(),
            None => false,
        }
    }
}

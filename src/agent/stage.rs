//! All-or-nothing application of verified files under a target root.
//!
//! New content is written into a staging directory inside the root first, so the
//! final step is a rename on the same filesystem. Files being replaced or removed
//! are parked in the staging directory until the commit finishes; any failure moves
//! them back.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::protocol::error::ProtocolError;

pub const STAGE_PREFIX: &str = ".livesync-stage-";

/// Turn a wire path into a safe root-relative path.
///
/// Absolute paths, `..` and anything that is not a plain name are rejected.
pub fn validate_path(path: &str) -> Result<PathBuf, ProtocolError> {
    let rejected = || ProtocolError::PathRejected { path: path.to_string() };

    if path.is_empty() || path.contains('\0') || path.contains('\\') || path.starts_with('/') {
        return Err(rejected());
    }

    let mut clean = PathBuf::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => clean.push(name),
            _ => return Err(rejected()),
        }
    }

    match clean.components().next() {
        None => Err(rejected()),
        Some(Component::Normal(first)) if first.to_string_lossy().starts_with(STAGE_PREFIX) => Err(rejected()),
        _ => Ok(clean),
    }
}

enum Undo {
    /// A new file was created at `dest`.
    Created { dest: PathBuf },
    /// The previous file at `dest` was parked at `backup`.
    Parked { dest: PathBuf, backup: PathBuf },
    /// A missing parent directory was created.
    CreatedDir { dest: PathBuf },
}

fn rollback(journal: Vec<Undo>) {
    for undo in journal.into_iter().rev() {
        let result = match &undo {
            Undo::Created { dest } => fs::remove_file(dest),
            Undo::CreatedDir { dest } => fs::remove_dir(dest),
            Undo::Parked { dest, backup } => {
                let _ = fs::remove_file(dest);
                fs::rename(backup, dest)
            }
        };
        if let Err(e) = result {
            let dest = match &undo {
                Undo::Created { dest } | Undo::Parked { dest, .. } | Undo::CreatedDir { dest } => dest,
            };
            warn!("Rollback failed for {}: {}", dest.display(), e);
        }
    }
}

/// Write `files` and delete `removed` under `root`, or change nothing.
pub fn commit(root: &Path, files: &[(PathBuf, Vec<u8>)], removed: &[PathBuf]) -> Result<(), ProtocolError> {
    fs::create_dir_all(root)?;
    let stage = tempfile::Builder::new().prefix(STAGE_PREFIX).tempdir_in(root)?;
    let incoming = stage.path().join("incoming");
    let parked = stage.path().join("parked");
    fs::create_dir(&incoming)?;
    fs::create_dir(&parked)?;

    for (index, (_, data)) in files.iter().enumerate() {
        fs::write(incoming.join(index.to_string()), data)?;
    }

    let mut journal = Vec::with_capacity(files.len() + removed.len());
    let result = apply(root, files, removed, &incoming, &parked, &mut journal);
    if let Err(e) = result {
        warn!("Commit failed, rolling back {} step(s): {}", journal.len(), e);
        rollback(journal);
        return Err(e.into());
    }

    debug!(files = files.len(), removed = removed.len(), "Committed directive");
    Ok(())
}

/// Create `dir` and any missing ancestors, journaling each one created.
fn create_parents(dir: &Path, journal: &mut Vec<Undo>) -> io::Result<()> {
    let missing: Vec<&Path> = dir.ancestors().take_while(|ancestor| !ancestor.exists()).collect();
    for ancestor in missing.into_iter().rev() {
        fs::create_dir(ancestor)?;
        journal.push(Undo::CreatedDir {
            dest: ancestor.to_path_buf(),
        });
    }
    Ok(())
}

fn apply(
    root: &Path,
    files: &[(PathBuf, Vec<u8>)],
    removed: &[PathBuf],
    incoming: &Path,
    parked: &Path,
    journal: &mut Vec<Undo>,
) -> io::Result<()> {
    let mut park_count = 0usize;
    let mut park = |dest: &Path, journal: &mut Vec<Undo>| -> io::Result<()> {
        let backup = parked.join(park_count.to_string());
        park_count += 1;
        fs::rename(dest, &backup)?;
        journal.push(Undo::Parked {
            dest: dest.to_path_buf(),
            backup,
        });
        Ok(())
    };

    for (index, (rel, _)) in files.iter().enumerate() {
        let dest = root.join(rel);
        let replaced = match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => {
                return Err(io::Error::other(format!("{} is a directory", dest.display())));
            }
            Ok(_) => {
                park(&dest, journal)?;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        if let Some(parent) = dest.parent() {
            create_parents(parent, journal)?;
        }
        fs::rename(incoming.join(index.to_string()), &dest)?;
        if !replaced {
            journal.push(Undo::Created { dest });
        }
    }

    for rel in removed {
        let dest = root.join(rel);
        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => warn!("Not removing directory {}", dest.display()),
            Ok(_) => park(&dest, journal)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

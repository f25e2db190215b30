use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WorkspaceError;

/// Files touched by a transaction, as workspace-relative paths, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub writes: Vec<String>,
    pub deletes: Vec<String>,
}

impl FileManifest {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }

    pub fn contains(&self, file: &str) -> bool {
        self.writes.iter().any(|f| f == file) || self.deletes.iter().any(|f| f == file)
    }

    /// Every touched path, writes and deletes merged, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.writes.iter().chain(&self.deletes).cloned().collect();
        files.sort();
        files.dedup();
        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Staged {
    Write(Vec<u8>),
    Delete,
}

/// Write-behind overlay. Nothing reaches disk until `commit_to`.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    entries: BTreeMap<String, Staged>,
    dry_run: bool,
}

impl Transaction {
    pub(crate) fn new(dry_run: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            dry_run,
        }
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub(crate) fn lookup(&self, key: &str) -> Option<&Staged> {
        self.entries.get(key)
    }

    /// `on_disk` is the file's current disk content. Writes that would leave
    /// the disk unchanged are dropped from the overlay.
    pub(crate) fn stage_write(&mut self, key: &str, bytes: Vec<u8>, on_disk: Option<&[u8]>) {
        if on_disk == Some(bytes.as_slice()) {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), Staged::Write(bytes));
        }
    }

    pub(crate) fn stage_delete(&mut self, key: &str, exists_on_disk: bool) {
        if exists_on_disk {
            self.entries.insert(key.to_string(), Staged::Delete);
        } else {
            self.entries.remove(key);
        }
    }

    pub(crate) fn staged_writes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|(key, staged)| match staged {
            Staged::Write(_) => Some(key.as_str()),
            Staged::Delete => None,
        })
    }

    pub(crate) fn is_deleted(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(Staged::Delete))
    }

    pub(crate) fn manifest(&self) -> FileManifest {
        let mut manifest = FileManifest::default();
        for (key, staged) in &self.entries {
            match staged {
                Staged::Write(_) => manifest.writes.push(key.clone()),
                Staged::Delete => manifest.deletes.push(key.clone()),
            }
        }
        manifest
    }

    /// Flush the overlay under `root`. Every path touched before a failure
    /// is put back to its prior content before the error is returned.
    pub(crate) fn commit_to(self, root: &Path) -> Result<FileManifest> {
        let mut snapshots: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
        let mut manifest = FileManifest::default();

        for (key, staged) in &self.entries {
            let path = root.join(key);
            match apply_entry(&path, staged, &mut snapshots) {
                Ok(true) => match staged {
                    Staged::Write(_) => manifest.writes.push(key.clone()),
                    Staged::Delete => manifest.deletes.push(key.clone()),
                },
                Ok(false) => {}
                Err(err) => {
                    warn!(file = key.as_str(), error = %err, "Commit failed, restoring workspace");
                    restore(&snapshots);
                    return Err(err.context(WorkspaceError::Transaction {
                        message: format!("could not commit '{key}'"),
                    }));
                }
            }
        }

        debug!(
            writes = manifest.writes.len(),
            deletes = manifest.deletes.len(),
            "Transaction committed"
        );
        Ok(manifest)
    }
}

/// Returns whether the disk was changed.
fn apply_entry(
    path: &Path,
    staged: &Staged,
    snapshots: &mut Vec<(PathBuf, Option<Vec<u8>>)>,
) -> Result<bool> {
    let previous = read_optional(path)?;
    match staged {
        Staged::Write(bytes) => {
            snapshots.push((path.to_path_buf(), previous));
            write_atomic(path, bytes)?;
            Ok(true)
        }
        Staged::Delete => {
            let Some(previous) = previous else {
                return Ok(false);
            };
            snapshots.push((path.to_path_buf(), Some(previous)));
            fs::remove_file(path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            Ok(true)
        }
    }
}

fn restore(snapshots: &[(PathBuf, Option<Vec<u8>>)]) {
    for (path, previous) in snapshots.iter().rev() {
        let restored = match previous {
            Some(bytes) => write_atomic(path, bytes),
            None if path.is_file() => fs::remove_file(path).map_err(Into::into),
            None => Ok(()),
        };
        if let Err(err) = restored {
            warn!(file = %path.display(), error = %err, "Failed to restore file");
        }
    }
}

pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read(path)
        .map(Some)
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Write through a sibling temp file and rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("staged");
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.kernelgen-tmp"));
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(())
}

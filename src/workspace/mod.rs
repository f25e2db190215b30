//! Filesystem workspace rooted at a directory, with an optional write-behind
//! transaction. While a transaction is open every write and delete is kept
//! in memory and every read sees those pending changes.

pub mod merge;
pub mod transaction;

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::WorkspaceError;

pub use merge::{LineMerge, MergeOptions, MergeResult, MergeStatus, Resolution, merge_lines};
pub use transaction::FileManifest;

use transaction::{Staged, Transaction, read_optional, write_atomic};

#[derive(Debug, Clone)]
pub struct DryRun<T> {
    pub result: T,
    pub manifest: FileManifest,
}

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    transaction: Mutex<Option<Transaction>>,
}

/// Normalize a workspace-relative path to its forward-slash key. `.`
/// segments are dropped and `..` is resolved lexically; climbing above the
/// root is an error.
pub fn normalize_path(file: &str) -> Result<String, WorkspaceError> {
    let unified = file.replace('\\', "/");
    if unified.starts_with('/') || Path::new(file).is_absolute() {
        return Err(WorkspaceError::OutsideRoot(file.to_string()));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(WorkspaceError::OutsideRoot(file.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace root {}", root.display()))?;
        debug!(root = %root.display(), "Opened workspace");
        Ok(Self {
            root,
            transaction: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Option<Transaction>> {
        self.transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Workspace key for `file`. Absolute paths are accepted when they sit
    /// under the root.
    pub fn key(&self, file: &str) -> Result<String> {
        let path = Path::new(file);
        let key = if path.is_absolute() {
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| WorkspaceError::OutsideRoot(file.to_string()))?;
            let joined = relative
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => part.to_str(),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");
            normalize_path(&joined)?
        } else {
            normalize_path(file)?
        };
        if key.is_empty() {
            bail!("'{file}' does not name a file inside the workspace");
        }
        Ok(key)
    }

    pub fn resolve(&self, file: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.key(file)?))
    }

    pub fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(file)?;
        if let Some(tx) = self.lock().as_ref() {
            match tx.lookup(&key) {
                Some(Staged::Write(bytes)) => return Ok(Some(bytes.clone())),
                Some(Staged::Delete) => return Ok(None),
                None => {}
            }
        }
        read_optional(&self.root.join(&key))
    }

    pub fn read_text(&self, file: &str) -> Result<Option<String>> {
        self.read(file)?
            .map(|bytes| {
                String::from_utf8(bytes).with_context(|| format!("{file} is not valid UTF-8"))
            })
            .transpose()
    }

    pub fn exists(&self, file: &str) -> Result<bool> {
        let key = self.key(file)?;
        if let Some(tx) = self.lock().as_ref() {
            match tx.lookup(&key) {
                Some(Staged::Write(_)) => return Ok(true),
                Some(Staged::Delete) => return Ok(false),
                None => {}
            }
        }
        Ok(self.root.join(&key).is_file())
    }

    pub fn write(&self, file: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let key = self.key(file)?;
        let path = self.root.join(&key);
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(tx) => {
                let on_disk = read_optional(&path)?;
                tx.stage_write(&key, contents.as_ref().to_vec(), on_disk.as_deref());
                Ok(())
            }
            None => write_atomic(&path, contents.as_ref()),
        }
    }

    pub fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let mut json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {file}"))?;
        json.push('\n');
        self.write(file, json)
    }

    /// Remove a file. Removing a missing file is not an error.
    pub fn rm(&self, file: &str) -> Result<()> {
        let key = self.key(file)?;
        let path = self.root.join(&key);
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(tx) => {
                tx.stage_delete(&key, path.is_file());
                Ok(())
            }
            None if path.is_file() => fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display())),
            None => Ok(()),
        }
    }

    /// Workspace-relative files matching `pattern`, sorted. Pending writes
    /// and deletes are reflected.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let normalized = normalize_path(pattern)?;
        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            normalized
        );
        let mut matches = Vec::new();
        for entry in glob::glob(&full).with_context(|| format!("Invalid glob '{pattern}'"))? {
            let path = entry.with_context(|| format!("Failed to expand glob '{pattern}'"))?;
            if !path.is_file() {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&self.root) {
                matches.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }

        if let Some(tx) = self.lock().as_ref() {
            let matcher = glob::Pattern::new(&normalized)
                .with_context(|| format!("Invalid glob '{pattern}'"))?;
            // `*` must stop at `/` like the component-wise expansion above.
            let options = glob::MatchOptions {
                require_literal_separator: true,
                ..glob::MatchOptions::new()
            };
            matches.retain(|file| !tx.is_deleted(file));
            matches.extend(
                tx.staged_writes()
                    .filter(|file| matcher.matches_with(file, options))
                    .map(str::to_string),
            );
        }
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    /// A fresh scratch directory under the system temp dir.
    pub fn tmp_dir(&self, scope: &str) -> Result<PathBuf> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let unique = format!(
            "{scope}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let dir = std::env::temp_dir().join("kernelgen").join(unique);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create temp directory {}", dir.display()))?;
        Ok(dir)
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().is_some()
    }

    pub fn begin(&self) -> Result<(), WorkspaceError> {
        self.begin_with(false)
    }

    fn begin_with(&self, dry_run: bool) -> Result<(), WorkspaceError> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(WorkspaceError::TransactionActive);
        }
        *guard = Some(Transaction::new(dry_run));
        debug!(dry_run, "Transaction started");
        Ok(())
    }

    /// Flush pending changes to disk. On failure every already-touched file
    /// is restored and a `WorkspaceError::Transaction` is returned.
    pub fn commit(&self) -> Result<FileManifest> {
        let tx = {
            let mut guard = self.lock();
            match guard.as_ref() {
                None => return Err(WorkspaceError::NoActiveTransaction.into()),
                Some(tx) if tx.is_dry_run() => {
                    return Err(WorkspaceError::Transaction {
                        message: "a dry run cannot be committed".to_string(),
                    }
                    .into());
                }
                Some(_) => {}
            }
            guard.take()
        };
        match tx {
            Some(tx) => {
                let manifest = tx.commit_to(&self.root)?;
                info!(
                    writes = manifest.writes.len(),
                    deletes = manifest.deletes.len(),
                    "Workspace changes committed"
                );
                Ok(manifest)
            }
            None => Err(WorkspaceError::NoActiveTransaction.into()),
        }
    }

    /// Discard pending changes, returning what would have been touched.
    pub fn rollback(&self) -> Result<FileManifest, WorkspaceError> {
        let tx = self
            .lock()
            .take()
            .ok_or(WorkspaceError::NoActiveTransaction)?;
        let manifest = tx.manifest();
        debug!(pending = manifest.len(), "Transaction rolled back");
        Ok(manifest)
    }

    /// Run `callback` inside a transaction that is always rolled back.
    pub fn dry_run<T, F>(&self, callback: F) -> Result<DryRun<T>>
    where
        F: FnOnce(&Workspace) -> Result<T>,
    {
        self.begin_with(true)?;
        let result = callback(self);
        let manifest = self.rollback()?;
        Ok(DryRun {
            result: result?,
            manifest,
        })
    }

    /// Merge `incoming` into `file` given the `base` both sides started
    /// from. `current` is the file's present content, `None` when missing.
    pub fn three_way_merge(
        &self,
        file: &str,
        base: &str,
        current: Option<&str>,
        incoming: &str,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let Some(current) = current else {
            self.write(file, incoming)?;
            return Ok(clean(Resolution::Created, None));
        };
        if current == incoming {
            return Ok(clean(Resolution::AlreadyApplied, None));
        }
        if current == base {
            let backup = self.backup(file, current, options)?;
            self.write(file, incoming)?;
            return Ok(clean(Resolution::TookIncoming, backup));
        }

        match merge_lines(base, current, incoming) {
            LineMerge::Clean(merged) => {
                let backup = self.backup(file, current, options)?;
                self.write(file, &merged)?;
                Ok(clean(Resolution::Merged, backup))
            }
            LineMerge::Conflict { regions } if options.force => {
                let backup = self.backup(file, current, options)?;
                self.write(file, incoming)?;
                debug!(file, regions, "Conflict overridden by force");
                Ok(MergeResult {
                    status: MergeStatus::Clean,
                    resolution: Resolution::Forced,
                    backup,
                    conflicts: regions,
                })
            }
            LineMerge::Conflict { regions } => Ok(MergeResult {
                status: MergeStatus::Conflict,
                resolution: Resolution::Untouched,
                backup: None,
                conflicts: regions,
            }),
        }
    }

    /// Copy `contents` to `<file><suffix>` when backups are enabled.
    pub fn backup(
        &self,
        file: &str,
        contents: &str,
        options: &MergeOptions,
    ) -> Result<Option<String>> {
        if !options.backup {
            return Ok(None);
        }
        let backup = format!("{}{}", self.key(file)?, options.backup_suffix);
        self.write(&backup, contents)?;
        Ok(Some(backup))
    }
}

fn clean(resolution: Resolution, backup: Option<String>) -> MergeResult {
    MergeResult {
        status: MergeStatus::Clean,
        resolution,
        backup,
        conflicts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots_and_separators() {
        assert_eq!(normalize_path("a/./b/../c.txt").unwrap(), "a/c.txt");
        assert_eq!(normalize_path("a\\b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("./").unwrap(), "");
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert!(matches!(
            normalize_path("../outside.txt"),
            Err(WorkspaceError::OutsideRoot(_))
        ));
        assert!(matches!(
            normalize_path("/etc/passwd"),
            Err(WorkspaceError::OutsideRoot(_))
        ));
    }
}

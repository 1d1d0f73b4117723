//! On-disk snapshot artifacts.
//!
//! Layout under the backup root:
//!
//! ```text
//! <root>/<id>/manifest.json
//! <root>/<id>/data/...           files copied by this snapshot
//! <root>/.staging-<id>/          in-progress copy, renamed into place when complete
//! ```
//!
//! An incremental copies only files whose size or mtime changed since the
//! base snapshot; unchanged files point at the snapshot already holding
//! their bytes.

use crate::backup::manifest::{Manifest, ManifestEntry, MANIFEST_FILE};
use crate::backup::plan::BackupKind;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{ManagerError, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STAGING_PREFIX: &str = ".staging-";
const DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub id: String,
    pub kind: BackupKind,
    pub source: PathBuf,
    /// Snapshot to diff against; required for incrementals
    pub base: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub path: PathBuf,
    pub files_total: u64,
    pub bytes_total: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
}

/// Storage for snapshot artifacts. Calls block and run off the async runtime.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Copy the source into a new complete artifact, or leave nothing behind
    fn create(&self, request: &SnapshotRequest) -> Result<SnapshotOutcome>;

    /// Delete an artifact; a missing artifact is not an error
    fn remove(&self, id: &str) -> Result<()>;

    /// Ids of every complete artifact present
    fn list(&self) -> Result<Vec<String>>;
}

fn copy_error(context: impl std::fmt::Display, err: impl std::fmt::Display) -> ManagerError {
    ManagerError::BackupCopy(format!("{}: {}", context, err))
}

#[derive(Debug, Clone)]
pub struct DirectorySnapshotStore {
    root: PathBuf,
    walk: WalkOptions,
}

impl DirectorySnapshotStore {
    pub fn new(root: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            root: root.into(),
            walk: WalkOptions::excluding(exclude),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn staging_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", STAGING_PREFIX, id))
    }

    pub fn load_manifest(&self, id: &str) -> Result<Manifest> {
        let path = self.snapshot_path(id).join(MANIFEST_FILE);
        let file = File::open(&path).map_err(|e| copy_error(path.display(), e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Delete staging directories left by an interrupted copy
    pub fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "Removing incomplete snapshot");
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rebuild the world as captured by snapshot `id` into an empty `target`
    pub fn restore(&self, id: &str, target: &Path) -> Result<u64> {
        let manifest = self.load_manifest(id)?;

        for snapshot in manifest.referenced_snapshots() {
            if !self.snapshot_path(snapshot).join(DATA_DIR).is_dir() {
                return Err(copy_error(id, format!("depends on missing snapshot {}", snapshot)));
            }
        }

        if target.exists() && fs::read_dir(target)?.next().is_some() {
            return Err(copy_error(target.display(), "restore target is not empty"));
        }
        fs::create_dir_all(target)?;

        let mut restored = 0;
        for (relative, entry) in &manifest.files {
            let source = self.snapshot_path(&entry.stored_in).join(DATA_DIR).join(relative);
            if !source.is_file() {
                return Err(copy_error(
                    relative,
                    format!("missing from snapshot {}", entry.stored_in),
                ));
            }
            let destination = target.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &destination).map_err(|e| copy_error(source.display(), e))?;
            restored += 1;
        }

        info!(snapshot = id, files = restored, target = %target.display(), "Snapshot restored");
        Ok(restored)
    }

    fn write_into(&self, request: &SnapshotRequest, staging: &Path) -> Result<SnapshotOutcome> {
        if !request.source.is_dir() {
            return Err(copy_error(request.source.display(), "source is not a directory"));
        }

        let base = match (request.kind, &request.base) {
            (BackupKind::Full, _) => None,
            (BackupKind::Incremental, Some(base)) => Some(self.load_manifest(base)?),
            (BackupKind::Incremental, None) => {
                return Err(ManagerError::BackupCopy(
                    "incremental snapshot requires a base snapshot".into(),
                ))
            }
        };

        let files = walk_directory(&request.source, &self.walk)
            .map_err(|e| copy_error(request.source.display(), e))?;

        let data = staging.join(DATA_DIR);
        fs::create_dir_all(&data)?;

        let mut manifest = Manifest::new(request.id.clone(), request.kind, request.base.clone());
        let mut outcome = SnapshotOutcome::default();

        for file in files {
            let relative = file.relative_path.to_string_lossy().to_string();
            let reused = base
                .as_ref()
                .and_then(|m| m.unchanged(&relative, file.size, file.mtime, file.mtime_nsec))
                .cloned();

            let entry = match reused {
                Some(entry) => entry,
                None => {
                    let destination = data.join(&file.relative_path);
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let size = fs::copy(&file.path, &destination)
                        .map_err(|e| copy_error(file.path.display(), e))?;
                    outcome.files_copied += 1;
                    outcome.bytes_copied += size;
                    ManifestEntry {
                        size,
                        mtime: file.mtime,
                        mtime_nsec: file.mtime_nsec,
                        stored_in: request.id.clone(),
                    }
                }
            };
            manifest.insert(relative, entry);
        }

        let file = File::create(staging.join(MANIFEST_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        outcome.files_total = manifest.total_files as u64;
        outcome.bytes_total = manifest.total_bytes;
        Ok(outcome)
    }
}

impl SnapshotStore for DirectorySnapshotStore {
    fn create(&self, request: &SnapshotRequest) -> Result<SnapshotOutcome> {
        let final_path = self.snapshot_path(&request.id);
        if final_path.exists() {
            return Err(copy_error(&request.id, "snapshot already exists"));
        }

        let staging = self.staging_path(&request.id);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let written = self
            .write_into(request, &staging)
            .and_then(|outcome| {
                fs::rename(&staging, &final_path)?;
                Ok(outcome)
            });

        match written {
            Ok(mut outcome) => {
                debug!(snapshot = %request.id, path = %final_path.display(), "Snapshot written");
                outcome.path = final_path;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %staging.display(), "Failed to remove staging directory: {}", cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_dir_all(self.snapshot_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(STAGING_PREFIX) && entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

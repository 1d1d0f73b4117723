//! Snapshot manifests.
//!
//! A manifest records every file of the world at snapshot time with its
//! size, mtime and the snapshot that holds its bytes. It is serialized as
//! `manifest.json` in each snapshot directory.

use crate::backup::plan::BackupKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub snapshot_id: String,
    pub kind: BackupKind,
    /// Snapshot this one was diffed against (incrementals only)
    #[serde(default)]
    pub base: Option<String>,
    pub files: BTreeMap<String, ManifestEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime: i64,
    #[serde(default)]
    pub mtime_nsec: u32,
    /// Snapshot id whose `data/` tree holds the bytes
    pub stored_in: String,
}

impl Manifest {
    pub fn new(snapshot_id: String, kind: BackupKind, base: Option<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            snapshot_id,
            kind,
            base,
            files: BTreeMap::new(),
            total_files: 0,
            total_bytes: 0,
        }
    }

    pub fn insert(&mut self, relative_path: String, entry: ManifestEntry) {
        self.total_bytes += entry.size;
        if let Some(previous) = self.files.insert(relative_path, entry) {
            self.total_bytes -= previous.size;
        } else {
            self.total_files += 1;
        }
    }

    /// The entry for `relative_path` if the file still has the recorded size and mtime
    pub fn unchanged(&self, relative_path: &str, size: u64, mtime: i64, mtime_nsec: u32) -> Option<&ManifestEntry> {
        self.files
            .get(relative_path)
            .filter(|e| e.size == size && e.mtime == mtime && e.mtime_nsec == mtime_nsec)
    }

    /// Every snapshot this manifest needs for a restore
    pub fn referenced_snapshots(&self) -> BTreeSet<&str> {
        self.files.values().map(|e| e.stored_in.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: u64, stored_in: &str) -> ManifestEntry {
        ManifestEntry {
            size,
            mtime: 1000,
            mtime_nsec: 5,
            stored_in: stored_in.to_string(),
        }
    }

    #[test]
    fn test_totals_track_replacements() {
        let mut manifest = Manifest::new("b".into(), BackupKind::Incremental, Some("a".into()));
        manifest.insert("level.dat".into(), entry(100, "a"));
        manifest.insert("region/r.0.0.mca".into(), entry(400, "b"));
        manifest.insert("level.dat".into(), entry(120, "b"));

        assert_eq!(manifest.total_files, 2);
        assert_eq!(manifest.total_bytes, 520);
    }

    #[test]
    fn test_unchanged_requires_size_and_mtime() {
        let mut manifest = Manifest::new("a".into(), BackupKind::Full, None);
        manifest.insert("level.dat".into(), entry(100, "a"));

        assert!(manifest.unchanged("level.dat", 100, 1000, 5).is_some());
        assert!(manifest.unchanged("level.dat", 101, 1000, 5).is_none());
        assert!(manifest.unchanged("level.dat", 100, 1000, 6).is_none());
        assert!(manifest.unchanged("missing.dat", 100, 1000, 5).is_none());
    }

    #[test]
    fn test_referenced_snapshots() {
        let mut manifest = Manifest::new("c".into(), BackupKind::Incremental, Some("b".into()));
        manifest.insert("a.dat".into(), entry(1, "a"));
        manifest.insert("b.dat".into(), entry(1, "a"));
        manifest.insert("c.dat".into(), entry(1, "c"));

        let refs: Vec<_> = manifest.referenced_snapshots().into_iter().collect();
        assert_eq!(refs, vec!["a", "c"]);
    }
}

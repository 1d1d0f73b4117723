//! Directory traversal for snapshots.
//!
//! Collects every regular file under a root together with the size and
//! modification time used to decide whether an incremental snapshot must
//! copy it again.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File or directory names to skip (exact match)
    pub exclude: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(exclude: Vec<String>) -> Self {
        Self {
            follow_links: false,
            exclude,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,

    /// Sub-second part of the modification time
    pub mtime_nsec: u32,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved to their target; links to directories and
    /// broken links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            mtime: modified.as_secs() as i64,
            mtime_nsec: modified.subsec_nanos(),
        }))
    }
}

/// Walk a directory tree and collect all files
///
/// # Example
/// ```no_run
/// use server_manager::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("world"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, &options.exclude));

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| *p == file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("region"))?;
        fs::write(temp_dir.path().join("level.dat"), b"level")?;
        fs::write(temp_dir.path().join("region/r.0.0.mca"), b"chunks")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["level.dat", "region/r.0.0.mca"]);
        assert_eq!(files[1].size, 6);
        assert!(files[1].mtime > 0);

        Ok(())
    }

    #[test]
    fn test_exclude_matches_whole_names() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("level.dat"), b"keep")?;
        fs::write(temp_dir.path().join("session.lock"), b"skip")?;
        fs::write(temp_dir.path().join("session.lock.bak"), b"keep")?;

        let options = WalkOptions::excluding(vec!["session.lock".to_string()]);
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 2);
        assert!(files
            .iter()
            .all(|f| f.relative_path.to_str() != Some("session.lock")));

        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("cache"))?;
        fs::write(temp_dir.path().join("cache/blob"), b"skip")?;
        fs::write(temp_dir.path().join("level.dat"), b"keep")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::excluding(vec!["cache".into()]))?;
        assert_eq!(files.len(), 1);

        Ok(())
    }
}

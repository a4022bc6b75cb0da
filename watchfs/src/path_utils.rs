//! Filesystem helpers shared by the monitor backends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

/// The subset of stat information the monitors care about.
#[derive(Clone, Copy, Debug)]
pub struct PathInfo {
    /// The object is a directory.
    pub is_dir: bool,
    /// The object itself is a symbolic link (only meaningful when the
    /// information was gathered without following links).
    pub is_symlink: bool,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Change (status) time, seconds since the Unix epoch.  Falls back to
    /// the modification time on platforms without a ctime.
    pub ctime: i64,
}

impl PathInfo {
    /// Extracts the relevant fields from file metadata.
    pub fn from_metadata(metadata: &fs::Metadata, is_symlink: bool) -> Self {
        PathInfo {
            is_dir: metadata.is_dir(),
            is_symlink,
            mtime: FileTime::from_last_modification_time(metadata).unix_seconds(),
            ctime: ctime_seconds(metadata),
        }
    }
}

#[cfg(unix)]
fn ctime_seconds(metadata: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ctime()
}

#[cfg(not(unix))]
fn ctime_seconds(metadata: &fs::Metadata) -> i64 {
    FileTime::from_last_modification_time(metadata).unix_seconds()
}

/// Stats a path, following symlinks when `follow` is set.
///
/// Failures are logged and reported as `None`; a missing or unreadable path
/// is a transient condition for a running monitor, not an error.
pub fn stat_path(path: &Path, follow: bool) -> Option<PathInfo> {
    let lstat = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            log::warn!("cannot stat {}: {}", path.display(), err);
            return None;
        }
    };

    if follow && lstat.file_type().is_symlink() {
        match fs::metadata(path) {
            Ok(metadata) => return Some(PathInfo::from_metadata(&metadata, true)),
            Err(err) => {
                log::warn!("cannot stat {}: {}", path.display(), err);
                return None;
            }
        }
    }

    let is_symlink = lstat.file_type().is_symlink();
    Some(PathInfo::from_metadata(&lstat, is_symlink))
}

/// Resolves a path to canonical absolute form.
///
/// Paths that do not (yet) exist are returned unchanged, so a monitor can
/// keep a root configured before it appears on disk.
pub fn resolve_symlink(path: &Path) -> PathBuf {
    match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(err) if err.kind() == io::ErrorKind::NotFound => path.to_path_buf(),
        Err(err) => {
            log::warn!("cannot resolve {}: {}", path.display(), err);
            path.to_path_buf()
        }
    }
}

/// Lists the direct children of a directory.  `.` and `..` are never
/// included.  Errors are logged and yield an empty list.
pub fn list_directory_entries(path: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot list {}: {}", path.display(), err);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(err) => {
                log::warn!("error reading {}: {}", path.display(), err);
                None
            }
        })
        .collect()
}

/// Lists the directory children of a directory.
pub fn list_subdirectories(path: &Path) -> Vec<PathBuf> {
    list_directory_entries(path)
        .into_iter()
        .filter(|child| child.is_dir())
        .collect()
}

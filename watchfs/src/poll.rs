//! Monitor implementation based on periodic stat scans.
//!
//! The poll monitor works everywhere: it keeps two generations of
//! `path → {mtime, ctime}` snapshots and diffs them on every scan.  A path
//! present now but not before was created; an mtime that grew means an
//! update; a ctime that grew means an attribute change; a path that
//! disappeared was removed.  This can be expensive for large trees, so the
//! scan interval never drops below one second.

use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use walkdir::WalkDir;

use watchfs_types::{Event, EventFlags};

use crate::config::MonitorConfig;
use crate::factory::MonitorType;
use crate::monitor::{wall_clock_seconds, EventHandler, Monitor, MonitorBase};
use crate::path_utils::{self, PathInfo};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileSnapshot {
    mtime: i64,
    ctime: i64,
}

/// Polling based monitor implementation.
pub struct PollMonitor {
    base: Arc<MonitorBase>,
    previous: HashMap<PathBuf, FileSnapshot>,
    current: HashMap<PathBuf, FileSnapshot>,
    events: Vec<Event>,
    batch_time: i64,
}

pub(crate) fn create(
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    Ok(Box::new(PollMonitor::from_boxed(paths, handler)?))
}

impl PollMonitor {
    /// Creates a poll monitor for the given root paths.
    pub fn new<F: EventHandler>(paths: Vec<PathBuf>, handler: F) -> Result<Self> {
        Self::from_boxed(paths, Box::new(handler))
    }

    fn from_boxed(paths: Vec<PathBuf>, handler: Box<dyn EventHandler>) -> Result<Self> {
        Ok(PollMonitor {
            base: Arc::new(MonitorBase::new(paths, handler)?),
            previous: HashMap::new(),
            current: HashMap::new(),
            events: Vec::new(),
            batch_time: 0,
        })
    }

    fn scan_roots(&mut self, initial: bool) {
        let config = self.base.config();
        for root in self.base.paths() {
            self.scan(&root, &config, initial);
        }
    }

    fn scan(&mut self, root: &Path, config: &MonitorConfig, initial: bool) {
        let root = if config.follow_symlinks() {
            path_utils::resolve_symlink(root)
        } else {
            root.to_path_buf()
        };
        let depth = if config.recursive() { usize::MAX } else { 0 };

        let walker = WalkDir::new(&root)
            .follow_links(config.follow_symlinks())
            .max_depth(depth);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("scan error under {}: {}", root.display(), err);
                    continue;
                }
            };

            // Record the resolved target for followed symlinks, the link
            // itself otherwise.
            let path = if config.follow_symlinks() && entry.path_is_symlink() {
                path_utils::resolve_symlink(entry.path())
            } else {
                entry.path().to_path_buf()
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::warn!("cannot stat {}: {}", path.display(), err);
                    continue;
                }
            };

            if config.directory_only() && !metadata.is_dir() {
                continue;
            }
            if !self.base.accept_path(&path) {
                continue;
            }

            let info = PathInfo::from_metadata(&metadata, entry.path_is_symlink());
            let snapshot = FileSnapshot {
                mtime: info.mtime,
                ctime: info.ctime,
            };

            if initial {
                self.previous.entry(path).or_insert(snapshot);
            } else {
                self.record(path, snapshot);
            }
        }
    }

    fn record(&mut self, path: PathBuf, snapshot: FileSnapshot) {
        if self.current.contains_key(&path) {
            return;
        }

        match self.previous.remove(&path) {
            None => {
                self.events
                    .push(Event::new(&path, self.batch_time, EventFlags::CREATED));
            }
            Some(seen) => {
                let mut flags = EventFlags::empty();
                if snapshot.mtime > seen.mtime {
                    flags |= EventFlags::UPDATED;
                }
                if snapshot.ctime > seen.ctime {
                    flags |= EventFlags::ATTRIBUTE_MODIFIED;
                }
                if !flags.is_empty() {
                    self.events.push(Event::new(&path, self.batch_time, flags));
                }
            }
        }

        self.current.insert(path, snapshot);
    }

    /// Whatever survived the scan in the previous generation is gone.
    fn find_removed(&mut self) {
        for path in self.previous.keys() {
            self.events
                .push(Event::new(path, self.batch_time, EventFlags::REMOVED));
        }
        self.previous.clear();
    }

    fn swap_generations(&mut self) {
        self.previous = mem::take(&mut self.current);
    }
}

impl Monitor for PollMonitor {
    fn base(&self) -> &Arc<MonitorBase> {
        &self.base
    }

    fn kind(&self) -> MonitorType {
        MonitorType::Poll
    }

    fn run(&mut self) -> Result<()> {
        self.scan_roots(true);

        loop {
            if self.base.should_stop() {
                break;
            }

            thread::sleep(self.base.config().poll_interval());

            self.batch_time = wall_clock_seconds();
            self.scan_roots(false);
            self.find_removed();
            self.swap_generations();

            if !self.events.is_empty() {
                let events = mem::take(&mut self.events);
                self.base.notify_events(events);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MonitorFilter;
    use filetime::FileTime;
    use std::sync::mpsc;

    fn canonical(tmpdir: &tempfile::TempDir) -> PathBuf {
        std::fs::canonicalize(tmpdir.path()).unwrap()
    }

    fn monitor_for(root: &Path) -> (PollMonitor, mpsc::Receiver<Vec<Event>>) {
        let (tx, rx) = mpsc::channel();
        let monitor = PollMonitor::new(vec![root.to_path_buf()], tx).unwrap();
        monitor.base().set_recursive(true);
        (monitor, rx)
    }

    fn rescan(monitor: &mut PollMonitor, time: i64) -> Vec<Event> {
        monitor.batch_time = time;
        monitor.scan_roots(false);
        monitor.find_removed();
        monitor.swap_generations();
        mem::take(&mut monitor.events)
    }

    #[test]
    fn detects_created_files() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (mut monitor, _rx) = monitor_for(tmpdir.path());

        monitor.scan_roots(true);

        let path = canonical(&tmpdir).join("a");
        std::fs::write(&path, b"1").unwrap();

        let events = rescan(&mut monitor, 100);
        let created: Vec<_> = events
            .iter()
            .filter(|e| e.flags.contains(EventFlags::CREATED))
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].path, path);
        assert_eq!(created[0].time, 100);
    }

    #[test]
    fn detects_updated_mtime() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = canonical(&tmpdir).join("a");
        std::fs::write(&path, b"1").unwrap();

        let (mut monitor, _rx) = monitor_for(tmpdir.path());
        monitor.scan_roots(true);

        let bumped = FileTime::from_unix_time(FileTime::now().unix_seconds() + 60, 0);
        filetime::set_file_mtime(&path, bumped).unwrap();

        let events = rescan(&mut monitor, 101);
        assert!(
            events
                .iter()
                .any(|e| e.path == path && e.flags.contains(EventFlags::UPDATED)),
            "no update event in {events:?}"
        );
    }

    #[test]
    fn detects_removed_files() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = canonical(&tmpdir).join("a");
        std::fs::write(&path, b"1").unwrap();

        let (mut monitor, _rx) = monitor_for(tmpdir.path());
        monitor.scan_roots(true);

        std::fs::remove_file(&path).unwrap();

        let events = rescan(&mut monitor, 102);
        assert!(
            events
                .iter()
                .any(|e| e.path == path && e.flags == EventFlags::REMOVED),
            "no removal event in {events:?}"
        );
    }

    #[test]
    fn steady_state_is_quiet() {
        let tmpdir = tempfile::tempdir().unwrap();
        std::fs::write(tmpdir.path().join("a"), b"1").unwrap();

        let (mut monitor, _rx) = monitor_for(tmpdir.path());
        monitor.scan_roots(true);

        let events = rescan(&mut monitor, 103);
        assert!(events.is_empty(), "unexpected events: {events:?}");
    }

    #[test]
    fn non_recursive_scan_tracks_only_the_root() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut monitor = PollMonitor::new(vec![tmpdir.path().to_path_buf()], tx).unwrap();

        monitor.scan_roots(true);

        std::fs::write(tmpdir.path().join("a"), b"1").unwrap();

        let events = rescan(&mut monitor, 104);
        // the new child is not tracked, only the root directory update shows
        assert!(events.iter().all(|e| e.path != canonical(&tmpdir).join("a")));
    }

    #[test]
    fn directory_only_skips_files() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (mut monitor, _rx) = monitor_for(tmpdir.path());
        monitor.base().set_directory_only(true);

        monitor.scan_roots(true);

        std::fs::write(tmpdir.path().join("a"), b"1").unwrap();
        std::fs::create_dir(tmpdir.path().join("sub")).unwrap();

        let events = rescan(&mut monitor, 105);
        let root = canonical(&tmpdir);
        assert!(events.iter().all(|e| e.path != root.join("a")));
        assert!(events
            .iter()
            .any(|e| e.path == root.join("sub") && e.flags.contains(EventFlags::CREATED)));
    }

    #[test]
    fn filtered_paths_are_never_tracked() {
        let tmpdir = tempfile::tempdir().unwrap();
        let (mut monitor, _rx) = monitor_for(tmpdir.path());
        monitor
            .base()
            .add_filter(&MonitorFilter::exclude(r"\.tmp$"))
            .unwrap();

        monitor.scan_roots(true);

        std::fs::write(tmpdir.path().join("keep.log"), b"1").unwrap();
        std::fs::write(tmpdir.path().join("drop.tmp"), b"1").unwrap();

        let events = rescan(&mut monitor, 106);
        let root = canonical(&tmpdir);
        assert!(events.iter().any(|e| e.path == root.join("keep.log")));
        assert!(events.iter().all(|e| e.path != root.join("drop.tmp")));
    }
}

//! Monitor implementation for the inotify Linux API.
//!
//! inotify delivers change events for watched files and directories over a
//! kernel file descriptor.  Watching a directory reports events for the
//! directory itself and for its first-level children, so a recursive
//! monitor only needs to place watches on directories; files under a
//! watched directory are reported by the parent watch.  The kernel
//! identifies events by watch descriptor, so the monitor keeps a
//! bidirectional map between descriptors and paths.

use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use inotify::{EventMask, EventOwned, Inotify, WatchDescriptor, WatchMask};
use mio::unix::SourceFd;

use watchfs_types::{Event, EventFlags};

use crate::config::MonitorConfig;
use crate::factory::MonitorType;
use crate::monitor::{wall_clock_seconds, EventHandler, Monitor, MonitorBase};
use crate::path_utils;
use crate::{Error, Result};

const INOTIFY: mio::Token = mio::Token(0);

/// Monitor implementation based on inotify.
pub struct InotifyMonitor {
    base: Arc<MonitorBase>,
    inotify: Inotify,
    poll: mio::Poll,
    wd_to_path: HashMap<WatchDescriptor, PathBuf>,
    path_to_wd: HashMap<PathBuf, WatchDescriptor>,
    /// Kernel watches to drop before the next scan.
    watches_to_remove: HashSet<WatchDescriptor>,
    /// Descriptors whose bookkeeping must be purged; the kernel side is
    /// already gone or queued for removal.
    descriptors_to_remove: HashSet<WatchDescriptor>,
    events: Vec<Event>,
    batch_time: i64,
}

pub(crate) fn create(
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    Ok(Box::new(InotifyMonitor::from_boxed(paths, handler)?))
}

fn watch_mask(config: &MonitorConfig) -> WatchMask {
    let mut mask = WatchMask::ATTRIB
        | WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO;

    if config.watch_access() {
        mask |= WatchMask::ACCESS | WatchMask::OPEN | WatchMask::CLOSE_NOWRITE;
    }

    mask
}

impl InotifyMonitor {
    /// Creates an inotify monitor for the given root paths.
    pub fn new<F: EventHandler>(paths: Vec<PathBuf>, handler: F) -> Result<Self> {
        Self::from_boxed(paths, Box::new(handler))
    }

    fn from_boxed(paths: Vec<PathBuf>, handler: Box<dyn EventHandler>) -> Result<Self> {
        let inotify = Inotify::init().map_err(Error::io)?;
        let poll = mio::Poll::new().map_err(Error::io)?;

        let fd = inotify.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), INOTIFY, mio::Interest::READABLE)
            .map_err(Error::io)?;

        Ok(InotifyMonitor {
            base: Arc::new(MonitorBase::new(paths, handler)?),
            inotify,
            poll,
            wd_to_path: HashMap::new(),
            path_to_wd: HashMap::new(),
            watches_to_remove: HashSet::new(),
            descriptors_to_remove: HashSet::new(),
            events: Vec::new(),
            batch_time: 0,
        })
    }

    fn scan_roots(&mut self) {
        let config = self.base.config();
        for root in self.base.paths() {
            if !self.path_to_wd.contains_key(&root) {
                self.scan(&root, &config, true);
            }
        }
    }

    /// Places watches on `path` and, when recursive, on the directories
    /// below it.  Only a root call may watch a non-directory: files under a
    /// watched directory are reported by the parent watch.
    fn scan(&mut self, path: &Path, config: &MonitorConfig, allow_non_dirs: bool) {
        let Some(info) = path_utils::stat_path(path, false) else {
            return;
        };

        if config.follow_symlinks() && info.is_symlink {
            let target = path_utils::resolve_symlink(path);
            self.scan(&target, config, allow_non_dirs);
            return;
        }

        if !info.is_dir {
            if !allow_non_dirs {
                return;
            }
            if !self.base.accept_path(path) {
                return;
            }
        }

        if !self.add_watch(path, watch_mask(config)) {
            return;
        }

        if config.recursive() && info.is_dir {
            for child in path_utils::list_directory_entries(path) {
                self.scan(&child, config, false);
            }
        }
    }

    /// Returns false when the path is already watched or the kernel refused
    /// the watch.  Serves as the cycle guard for symlinked trees.
    fn add_watch(&mut self, path: &Path, mask: WatchMask) -> bool {
        if self.path_to_wd.contains_key(path) {
            return false;
        }

        match self.inotify.watches().add(path, mask) {
            Ok(wd) => {
                log::trace!("adding inotify watch: {}", path.display());
                self.wd_to_path.insert(wd.clone(), path.to_path_buf());
                self.path_to_wd.insert(path.to_path_buf(), wd);
                true
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOSPC) => {
                // inotify reports its watch limit as "no space left on device"
                log::warn!("inotify watch limit reached at {}", path.display());
                false
            }
            Err(err) => {
                log::warn!("cannot watch {}: {}", path.display(), err);
                false
            }
        }
    }

    fn process_pending(&mut self) {
        for wd in self.watches_to_remove.drain() {
            if let Err(err) = self.inotify.watches().remove(wd) {
                // expected when the kernel already dropped the watch
                log::info!("unable to remove inotify watch: {err}");
            }
        }

        for wd in self.descriptors_to_remove.drain() {
            if let Some(path) = self.wd_to_path.remove(&wd) {
                log::trace!("forgetting inotify watch: {}", path.display());
                self.path_to_wd.remove(&path);
            }
        }
    }

    fn drain_native_events(&mut self, buffer: &mut [u8]) -> Result<()> {
        loop {
            let batch: Vec<EventOwned> = match self.inotify.read_events(buffer) {
                Ok(events) => events.map(|event| event.into_owned()).collect(),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::io(err)),
            };

            if batch.is_empty() {
                break;
            }

            for event in &batch {
                log::trace!("inotify event: {event:?}");
                self.translate(event)?;
            }
        }

        Ok(())
    }

    fn translate(&mut self, event: &EventOwned) -> Result<()> {
        let mask = event.mask;

        if mask.contains(EventMask::Q_OVERFLOW) {
            self.base.notify_overflow(Path::new(""))?;
            return Ok(());
        }

        let Some(watched) = self.wd_to_path.get(&event.wd).cloned() else {
            log::debug!("inotify event with unknown descriptor: {event:?}");
            return Ok(());
        };

        // Events about the watched object itself.
        let mut dir_flags = EventFlags::empty();
        if mask.contains(EventMask::ISDIR) {
            dir_flags |= EventFlags::IS_DIR;
        }
        if mask.contains(EventMask::MOVE_SELF) {
            dir_flags |= EventFlags::UPDATED;
        }
        if mask.contains(EventMask::UNMOUNT) {
            dir_flags |= EventFlags::PLATFORM_SPECIFIC;
        }
        if mask.contains(EventMask::DELETE_SELF) {
            dir_flags |= EventFlags::REMOVED;
        }
        if !dir_flags.is_empty() {
            self.events
                .push(Event::new(&watched, self.batch_time, dir_flags));
        }

        // Events about a child of the watched directory, or the watched
        // file itself.
        let mut flags = EventFlags::empty();
        if mask.contains(EventMask::ACCESS) {
            flags |= EventFlags::PLATFORM_SPECIFIC;
        }
        if mask.contains(EventMask::ATTRIB) {
            flags |= EventFlags::ATTRIBUTE_MODIFIED;
        }
        if mask.contains(EventMask::CLOSE_NOWRITE) {
            flags |= EventFlags::PLATFORM_SPECIFIC;
        }
        if mask.contains(EventMask::CLOSE_WRITE) {
            flags |= EventFlags::UPDATED;
        }
        if mask.contains(EventMask::CREATE) {
            flags |= EventFlags::CREATED;
        }
        if mask.contains(EventMask::DELETE) {
            flags |= EventFlags::REMOVED;
        }
        if mask.contains(EventMask::MODIFY) {
            flags |= EventFlags::UPDATED;
        }
        if mask.contains(EventMask::MOVED_FROM) {
            flags |= EventFlags::REMOVED | EventFlags::MOVED_FROM;
        }
        if mask.contains(EventMask::MOVED_TO) {
            flags |= EventFlags::CREATED | EventFlags::MOVED_TO;
        }
        if mask.contains(EventMask::OPEN) {
            flags |= EventFlags::PLATFORM_SPECIFIC;
        }

        if !flags.is_empty() {
            let path = match &event.name {
                Some(name) if !name.is_empty() => watched.join(name),
                _ => watched.clone(),
            };
            self.events.push(Event::new(path, self.batch_time, flags));
        }

        // The kernel removes the watch of a deleted object on its own and
        // follows up with IGNORED; only the bookkeeping must go.
        if mask.contains(EventMask::IGNORED) {
            self.descriptors_to_remove.insert(event.wd.clone());
        }

        // A moved object keeps its watch but the recorded path is stale.
        // Drop the watch so the next scan can re-establish one if the
        // original path reappears.
        if mask.contains(EventMask::MOVE_SELF) {
            self.watches_to_remove.insert(event.wd.clone());
            self.descriptors_to_remove.insert(event.wd.clone());
        }

        if mask.contains(EventMask::DELETE_SELF) {
            self.descriptors_to_remove.insert(event.wd.clone());
        }

        Ok(())
    }

    fn event_loop(&mut self, buffer: &mut [u8], mio_events: &mut mio::Events) -> Result<()> {
        loop {
            if self.base.should_stop() {
                return Ok(());
            }

            self.process_pending();
            self.scan_roots();

            let latency = self.base.config().latency_duration();

            // Nothing to wait on yet; retry after the latency interval.
            if self.path_to_wd.is_empty() {
                thread::sleep(latency.max(Duration::from_millis(10)));
                continue;
            }

            match self.poll.poll(mio_events, Some(latency)) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::io(err)),
                Ok(()) => {}
            }

            if mio_events.is_empty() {
                continue;
            }

            self.batch_time = wall_clock_seconds();
            self.drain_native_events(buffer)?;

            if !self.events.is_empty() {
                let events = mem::take(&mut self.events);
                self.base.notify_events(events);
            }

            thread::sleep(latency);
        }
    }

    fn remove_all_watches(&mut self) {
        for (wd, path) in self.wd_to_path.drain() {
            log::trace!("removing inotify watch: {}", path.display());
            let _ = self.inotify.watches().remove(wd);
        }
        self.path_to_wd.clear();
        self.watches_to_remove.clear();
        self.descriptors_to_remove.clear();
    }
}

impl Monitor for InotifyMonitor {
    fn base(&self) -> &Arc<MonitorBase> {
        &self.base
    }

    fn kind(&self) -> MonitorType {
        MonitorType::Inotify
    }

    fn run(&mut self) -> Result<()> {
        let mut buffer = [0u8; 4096];
        let mut mio_events = mio::Events::with_capacity(16);

        let result = self.event_loop(&mut buffer, &mut mio_events);
        self.remove_all_watches();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MonitorFilter;
    use std::sync::mpsc;
    use std::time::Instant;

    fn canonical(tmpdir: &tempfile::TempDir) -> PathBuf {
        std::fs::canonicalize(tmpdir.path()).unwrap()
    }

    fn wait_for(
        rx: &mpsc::Receiver<Vec<Event>>,
        pred: impl Fn(&Event) -> bool,
    ) -> Option<Event> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(batch) => {
                    if let Some(event) = batch.into_iter().find(&pred) {
                        return Some(event);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        None
    }

    #[test]
    fn scan_watches_directories_but_not_files() {
        let tmpdir = tempfile::tempdir().unwrap();
        let root = canonical(&tmpdir);
        let subdir = root.join("sub");
        let file = root.join("file");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(&file, b"1").unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![root.clone()], tx).unwrap();
        monitor.base().set_recursive(true);

        monitor.scan_roots();

        assert!(monitor.path_to_wd.contains_key(&root));
        assert!(monitor.path_to_wd.contains_key(&subdir));
        assert!(!monitor.path_to_wd.contains_key(&file));
        assert_eq!(monitor.wd_to_path.len(), monitor.path_to_wd.len());
    }

    #[test]
    fn a_file_root_is_watched_directly() {
        let tmpdir = tempfile::tempdir().unwrap();
        let file = canonical(&tmpdir).join("file");
        std::fs::write(&file, b"1").unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![file.clone()], tx).unwrap();
        monitor.scan_roots();

        assert!(monitor.path_to_wd.contains_key(&file));
    }

    #[test]
    fn filtered_file_roots_are_not_watched() {
        let tmpdir = tempfile::tempdir().unwrap();
        let file = canonical(&tmpdir).join("skip.tmp");
        std::fs::write(&file, b"1").unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![file.clone()], tx).unwrap();
        monitor
            .base()
            .add_filter(&MonitorFilter::exclude(r"\.tmp$"))
            .unwrap();
        monitor.scan_roots();

        assert!(monitor.path_to_wd.is_empty());
    }

    #[test]
    fn create_file_is_reported() {
        let tmpdir = tempfile::tempdir().unwrap();
        let root = canonical(&tmpdir);
        let path = root.join("entry");

        let (tx, rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![root], tx).unwrap();
        monitor.base().set_recursive(true);
        monitor.base().set_latency(0.1).unwrap();
        let handle = monitor.handle();

        let worker = thread::spawn(move || monitor.start());
        thread::sleep(Duration::from_millis(300));

        std::fs::write(&path, b"1").unwrap();

        let event = wait_for(&rx, |e| e.path == path && e.flags.contains(EventFlags::CREATED));
        assert!(event.is_some(), "no create event for {path:?}");

        handle.stop();
        worker.join().unwrap().unwrap();
        assert!(!handle.is_running());
    }

    #[test]
    fn rename_reports_moved_from_and_moved_to() {
        let tmpdir = tempfile::tempdir().unwrap();
        let root = canonical(&tmpdir);
        let old = root.join("old");
        let new = root.join("new");
        std::fs::write(&old, b"1").unwrap();

        let (tx, rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![root], tx).unwrap();
        monitor.base().set_latency(0.1).unwrap();
        let handle = monitor.handle();

        let worker = thread::spawn(move || monitor.start());
        thread::sleep(Duration::from_millis(300));

        std::fs::rename(&old, &new).unwrap();

        // both halves of the rename may arrive in the same batch
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(batch) = rx.recv_timeout(Duration::from_millis(200)) {
                seen.extend(batch);
            }
            let from = seen.iter().any(|e| {
                e.path == old && e.flags.contains(EventFlags::REMOVED | EventFlags::MOVED_FROM)
            });
            let to = seen.iter().any(|e| {
                e.path == new && e.flags.contains(EventFlags::CREATED | EventFlags::MOVED_TO)
            });
            if from && to {
                break;
            }
        }

        assert!(
            seen.iter().any(|e| e.path == old
                && e.flags.contains(EventFlags::REMOVED | EventFlags::MOVED_FROM)),
            "no moved-from event for {old:?} in {seen:?}"
        );
        assert!(
            seen.iter().any(|e| e.path == new
                && e.flags.contains(EventFlags::CREATED | EventFlags::MOVED_TO)),
            "no moved-to event for {new:?} in {seen:?}"
        );

        handle.stop();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn deleting_a_watched_file_reports_removed() {
        let tmpdir = tempfile::tempdir().unwrap();
        let file = canonical(&tmpdir).join("file");
        std::fs::write(&file, b"1").unwrap();

        let (tx, rx) = mpsc::channel();
        let mut monitor = InotifyMonitor::new(vec![file.clone()], tx).unwrap();
        monitor.base().set_latency(0.1).unwrap();
        let handle = monitor.handle();

        let worker = thread::spawn(move || monitor.start());
        thread::sleep(Duration::from_millis(300));

        std::fs::remove_file(&file).unwrap();

        let removed = wait_for(&rx, |e| {
            e.path == file && e.flags.contains(EventFlags::REMOVED)
        });
        assert!(removed.is_some(), "no removal event for {file:?}");

        handle.stop();
        worker.join().unwrap().unwrap();
    }
}

//! Monitor implementation for the kqueue API.
//!
//! kqueue has no directory-level change stream: the monitor opens one
//! event-only descriptor per watched path and subscribes to the vnode
//! filter.  A write on a directory descriptor means its entries changed, so
//! directories are rescanned on writes; renames and revocations invalidate
//! the recorded path and trigger a rescan as well; deletions close the
//! descriptor.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode};

use watchfs_types::{Event, EventFlags};

use crate::config::MonitorConfig;
use crate::factory::MonitorType;
use crate::monitor::{wall_clock_seconds, EventHandler, Monitor, MonitorBase};
use crate::path_utils;
use crate::{Error, Result};

fn vnode_filter_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
        | FilterFlag::NOTE_REVOKE
}

/// Monitor implementation based on kqueue.
pub struct KqueueMonitor {
    base: Arc<MonitorBase>,
    watcher: kqueue::Watcher,
    /// Watched paths and whether each is a directory.
    watched: HashMap<PathBuf, bool>,
    to_remove: HashSet<PathBuf>,
    to_rescan: HashSet<PathBuf>,
    events: Vec<Event>,
    batch_time: i64,
}

pub(crate) fn create(
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    Ok(Box::new(KqueueMonitor::from_boxed(paths, handler)?))
}

impl KqueueMonitor {
    /// Creates a kqueue monitor for the given root paths.
    pub fn new<F: EventHandler>(paths: Vec<PathBuf>, handler: F) -> Result<Self> {
        Self::from_boxed(paths, Box::new(handler))
    }

    fn from_boxed(paths: Vec<PathBuf>, handler: Box<dyn EventHandler>) -> Result<Self> {
        Ok(KqueueMonitor {
            base: Arc::new(MonitorBase::new(paths, handler)?),
            watcher: kqueue::Watcher::new().map_err(Error::io)?,
            watched: HashMap::new(),
            to_remove: HashSet::new(),
            to_rescan: HashSet::new(),
            events: Vec::new(),
            batch_time: 0,
        })
    }

    fn scan_roots(&mut self) {
        let config = self.base.config();
        for root in self.base.paths() {
            if !self.watched.contains_key(&root) {
                self.scan(&root, &config);
            }
        }
    }

    fn scan(&mut self, path: &Path, config: &MonitorConfig) {
        let Some(info) = path_utils::stat_path(path, false) else {
            return;
        };

        if config.follow_symlinks() && info.is_symlink {
            let target = path_utils::resolve_symlink(path);
            self.scan(&target, config);
            return;
        }

        if !info.is_dir && config.directory_only() {
            return;
        }
        if !self.base.accept_path(path) {
            return;
        }
        if !self.add_watch(path, info.is_dir) {
            return;
        }

        if config.recursive() && info.is_dir {
            let children = if config.directory_only() {
                path_utils::list_subdirectories(path)
            } else {
                path_utils::list_directory_entries(path)
            };

            for child in children {
                self.scan(&child, config);
            }
        }
    }

    /// Returns false when the path is already watched or the descriptor
    /// could not be opened.  Serves as the cycle guard for symlinked trees.
    fn add_watch(&mut self, path: &Path, is_dir: bool) -> bool {
        if self.watched.contains_key(path) {
            return false;
        }

        match self
            .watcher
            .add_filename(path, EventFilter::EVFILT_VNODE, vnode_filter_flags())
        {
            Ok(()) => {
                log::trace!("adding kqueue watch: {}", path.display());
                self.watched.insert(path.to_path_buf(), is_dir);
                true
            }
            Err(err) => {
                log::warn!("cannot open {}: {}", path.display(), err);
                false
            }
        }
    }

    fn remove_watch(&mut self, path: &Path) {
        log::trace!("removing kqueue watch: {}", path.display());

        if let Err(err) = self.watcher.remove_filename(path, EventFilter::EVFILT_VNODE) {
            // expected for deleted paths whose descriptor is already gone
            log::debug!("unable to remove kqueue watch for {}: {}", path.display(), err);
        }
        self.watched.remove(path);
    }

    fn remove_pending(&mut self) {
        for path in mem::take(&mut self.to_remove) {
            self.remove_watch(&path);
        }
    }

    fn rescan_pending(&mut self) {
        let config = self.base.config();

        for path in mem::take(&mut self.to_rescan) {
            self.remove_watch(&path);
            self.scan(&path, &config);
        }
    }

    fn translate(&mut self, event: kqueue::Event) {
        let kqueue::Event { ident, data } = event;

        let (EventData::Vnode(vnode), Ident::Filename(_, name)) = (data, ident) else {
            // only EVFILT_VNODE subscriptions exist on this queue
            return;
        };

        let path = PathBuf::from(name);
        let is_dir = self.watched.get(&path).copied().unwrap_or(false);

        // NOTE_DELETE dominates: the descriptor is scheduled for removal,
        // not rescan.
        let flags = match vnode {
            Vnode::Delete => {
                self.to_remove.insert(path.clone());
                EventFlags::REMOVED
            }
            Vnode::Write => {
                if is_dir {
                    self.to_rescan.insert(path.clone());
                }
                EventFlags::UPDATED
            }
            Vnode::Extend | Vnode::Truncate => EventFlags::PLATFORM_SPECIFIC,
            Vnode::Attrib => EventFlags::ATTRIBUTE_MODIFIED,
            Vnode::Link => EventFlags::LINK,
            Vnode::Rename => {
                self.to_rescan.insert(path.clone());
                EventFlags::RENAMED
            }
            Vnode::Revoke => {
                self.to_rescan.insert(path.clone());
                EventFlags::PLATFORM_SPECIFIC
            }
            // BSD variants ship additional vnode notes
            #[allow(unreachable_patterns)]
            _ => EventFlags::PLATFORM_SPECIFIC,
        };

        self.events.push(Event::new(path, self.batch_time, flags));
    }
}

impl Monitor for KqueueMonitor {
    fn base(&self) -> &Arc<MonitorBase> {
        &self.base
    }

    fn kind(&self) -> MonitorType {
        MonitorType::Kqueue
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if self.base.should_stop() {
                break;
            }

            self.remove_pending();
            self.rescan_pending();
            self.scan_roots();

            if self.watched.is_empty() {
                thread::sleep(self.base.config().poll_interval());
                continue;
            }

            // One kevent syscall registers every tracked descriptor.
            self.watcher.watch().map_err(Error::io)?;

            let latency = self.base.config().latency_duration();
            let Some(first) = self.watcher.poll(Some(latency)) else {
                continue;
            };

            self.batch_time = wall_clock_seconds();
            log::trace!("kqueue event: {first:?}");
            self.translate(first);

            while let Some(event) = self.watcher.poll(Some(Duration::ZERO)) {
                log::trace!("kqueue event: {event:?}");
                self.translate(event);
            }

            if !self.events.is_empty() {
                let events = mem::take(&mut self.events);
                self.base.notify_events(events);
            }
        }

        Ok(())
    }
}

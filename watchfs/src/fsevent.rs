//! Monitor implementation for the macOS FSEvents API.
//!
//! FSEvents delivers a coalesced, directory-level change stream: the OS
//! batches changes for up to the configured latency and invokes the stream
//! callback with an array of `(path, flag bitmask)` records.  The monitor
//! schedules the stream on the run loop of the thread that called `start`
//! and runs that loop until a stop is requested, which posts a run-loop
//! stop from the requesting thread.

#![allow(non_upper_case_globals)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::PathBuf;
use std::slice;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;

use watchfs_types::{Event, EventFlags};

use crate::factory::MonitorType;
use crate::monitor::{wall_clock_seconds, EventHandler, Monitor, MonitorBase};
use crate::{Error, Result};

/// Property selecting deferred or no-defer stream mode: `true`, `false`, or
/// `auto` (the default), which uses no-defer mode when stdin is not a TTY.
pub const PROP_NO_DEFER: &str = "stream.no_defer";

/// Property enabling extended data, which carries the inode of the changed
/// item in every event.
pub const PROP_USE_EXTENDED_DATA: &str = "stream.use_extended_data";

const kCFStringEncodingUTF8: u32 = 0x0800_0100;
const kCFNumberSInt64Type: cf::CFIndex = 4;

// Stream-creation flags newer than the fsevent-sys bindings.
const kFSEventStreamCreateFlagUseCFTypes: fs::FSEventStreamCreateFlags = 0x0000_0001;
const kFSEventStreamCreateFlagUseExtendedData: fs::FSEventStreamCreateFlags = 0x0000_0040;

// TODO: add these to fsevent-sys
#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn CFStringCreateWithCString(
        allocator: cf::CFRef,
        string: *const c_char,
        encoding: u32,
    ) -> cf::CFStringRef;
    fn CFStringGetLength(string: cf::CFStringRef) -> cf::CFIndex;
    fn CFStringGetMaximumSizeForEncoding(length: cf::CFIndex, encoding: u32) -> cf::CFIndex;
    fn CFStringGetCString(
        string: cf::CFStringRef,
        buffer: *mut c_char,
        size: cf::CFIndex,
        encoding: u32,
    ) -> u8;
    fn CFDictionaryGetValue(dict: cf::CFRef, key: cf::CFRef) -> cf::CFRef;
    fn CFNumberGetValue(number: cf::CFRef, number_type: cf::CFIndex, value: *mut c_void) -> u8;
    fn CFRunLoopStop(run_loop: cf::CFRunLoopRef);
    fn FSEventStreamInvalidate(stream: fs::FSEventStreamRef);
    fn FSEventStreamRelease(stream: fs::FSEventStreamRef);
    static kFSEventStreamEventExtendedDataPathKey: cf::CFStringRef;
    static kFSEventStreamEventExtendedFileIDKey: cf::CFStringRef;
}

bitflags! {
    /// Native FSEvents stream flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct StreamFlags: u32 {
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        const USER_DROPPED = 0x0000_0002;
        const KERNEL_DROPPED = 0x0000_0004;
        const IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE = 0x0000_0010;
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

fn translate_flags(native: StreamFlags) -> EventFlags {
    let mut flags = EventFlags::empty();

    if native.contains(StreamFlags::ITEM_CREATED) {
        flags |= EventFlags::CREATED;
    }
    if native.contains(StreamFlags::ITEM_REMOVED) {
        flags |= EventFlags::REMOVED;
    }
    if native.contains(StreamFlags::ITEM_MODIFIED) {
        flags |= EventFlags::UPDATED;
    }
    if native.contains(StreamFlags::ITEM_RENAMED) {
        flags |= EventFlags::RENAMED;
    }
    if native.contains(StreamFlags::ITEM_CHANGE_OWNER) {
        flags |= EventFlags::OWNER_MODIFIED;
    }
    if native.contains(StreamFlags::ITEM_XATTR_MOD) {
        flags |= EventFlags::ATTRIBUTE_MODIFIED;
    }
    if native.contains(StreamFlags::ITEM_INODE_META_MOD) {
        flags |= EventFlags::ATTRIBUTE_MODIFIED;
    }
    // FinderInfo carries a dual mapping
    if native.contains(StreamFlags::ITEM_FINDER_INFO_MOD) {
        flags |= EventFlags::ATTRIBUTE_MODIFIED | EventFlags::PLATFORM_SPECIFIC;
    }
    if native.contains(StreamFlags::ITEM_IS_FILE) {
        flags |= EventFlags::IS_FILE;
    }
    if native.contains(StreamFlags::ITEM_IS_DIR) {
        flags |= EventFlags::IS_DIR;
    }
    if native.contains(StreamFlags::ITEM_IS_SYMLINK) {
        flags |= EventFlags::IS_SYM_LINK;
    }
    if native.intersects(StreamFlags::ITEM_IS_HARDLINK | StreamFlags::ITEM_IS_LAST_HARDLINK) {
        flags |= EventFlags::LINK;
    }
    if native.intersects(
        StreamFlags::OWN_EVENT
            | StreamFlags::MUST_SCAN_SUB_DIRS
            | StreamFlags::USER_DROPPED
            | StreamFlags::KERNEL_DROPPED
            | StreamFlags::IDS_WRAPPED
            | StreamFlags::HISTORY_DONE
            | StreamFlags::ROOT_CHANGED
            | StreamFlags::MOUNT
            | StreamFlags::UNMOUNT
            | StreamFlags::ITEM_CLONED,
    ) {
        flags |= EventFlags::PLATFORM_SPECIFIC;
    }

    // a zero bitmask still denotes a change on the path
    if flags.is_empty() {
        flags |= EventFlags::PLATFORM_SPECIFIC;
    }

    flags
}

struct StreamContext {
    base: Arc<MonitorBase>,
    extended_data: bool,
    failure: Mutex<Option<Error>>,
}

/// Monitor implementation based on the FSEvents coalescing stream.
pub struct FseventMonitor {
    base: Arc<MonitorBase>,
}

pub(crate) fn create(
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    Ok(Box::new(FseventMonitor::from_boxed(paths, handler)?))
}

impl FseventMonitor {
    /// Creates an FSEvents monitor for the given root paths.
    pub fn new<F: EventHandler>(paths: Vec<PathBuf>, handler: F) -> Result<Self> {
        Self::from_boxed(paths, Box::new(handler))
    }

    fn from_boxed(paths: Vec<PathBuf>, handler: Box<dyn EventHandler>) -> Result<Self> {
        Ok(FseventMonitor {
            base: Arc::new(MonitorBase::new(paths, handler)?),
        })
    }

    fn no_defer(&self) -> bool {
        match self.base.property(PROP_NO_DEFER).as_deref() {
            Some("true") => true,
            Some("false") => false,
            // "auto" and unset: defer only when driven interactively
            _ => unsafe { libc::isatty(libc::STDIN_FILENO) == 0 },
        }
    }

    fn use_extended_data(&self) -> bool {
        self.base.property(PROP_USE_EXTENDED_DATA).as_deref() == Some("true")
    }
}

impl Monitor for FseventMonitor {
    fn base(&self) -> &Arc<MonitorBase> {
        &self.base
    }

    fn kind(&self) -> MonitorType {
        MonitorType::Fsevents
    }

    fn run(&mut self) -> Result<()> {
        let paths = self.base.paths();
        if paths.is_empty() {
            return Ok(());
        }

        let config = self.base.config();
        let extended_data = self.use_extended_data();

        let context = Box::new(StreamContext {
            base: Arc::clone(&self.base),
            extended_data,
            failure: Mutex::new(None),
        });

        unsafe {
            let cf_paths =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);

            for path in &paths {
                let Some(path) = path.to_str() else {
                    log::warn!("skipping non-UTF-8 root: {}", path.display());
                    continue;
                };
                let c_path = CString::new(path).map_err(|_| Error::generic("path contains NUL"))?;
                let cf_path = CFStringCreateWithCString(
                    cf::kCFAllocatorDefault,
                    c_path.as_ptr(),
                    kCFStringEncodingUTF8,
                );
                cf::CFArrayAppendValue(cf_paths, cf_path);
                cf::CFRelease(cf_path);
            }

            let stream_context = fs::FSEventStreamContext {
                version: 0,
                info: &*context as *const StreamContext as *mut c_void,
                retain: None,
                release: None,
                copy_description: None,
            };

            let mut flags = fs::kFSEventStreamCreateFlagFileEvents;
            if self.no_defer() {
                flags |= fs::kFSEventStreamCreateFlagNoDefer;
            }
            if extended_data {
                flags |= kFSEventStreamCreateFlagUseExtendedData | kFSEventStreamCreateFlagUseCFTypes;
            }

            log::trace!("creating FSEvents stream for {} paths", paths.len());
            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                stream_callback,
                &stream_context,
                cf_paths,
                fs::kFSEventStreamEventIdSinceNow,
                config.latency() as cf::CFTimeInterval,
                flags,
            );
            cf::CFRelease(cf_paths);

            if stream.is_null() {
                return Err(Error::generic("event stream could not be created"));
            }

            let run_loop = cf::CFRunLoopGetCurrent();
            fs::FSEventStreamScheduleWithRunLoop(stream, run_loop, cf::kCFRunLoopDefaultMode);
            fs::FSEventStreamStart(stream);

            // CFRunLoopStop is safe to post from another thread.
            let run_loop_handle = run_loop as usize;
            self.base.install_stop_waker(Box::new(move || unsafe {
                CFRunLoopStop(run_loop_handle as cf::CFRunLoopRef);
            }));

            cf::CFRunLoopRun();

            fs::FSEventStreamStop(stream);
            FSEventStreamInvalidate(stream);
            FSEventStreamRelease(stream);
        }

        match context.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

unsafe fn cfstring_to_string(string: cf::CFStringRef) -> Option<String> {
    let length = CFStringGetLength(string);
    let capacity = CFStringGetMaximumSizeForEncoding(length, kCFStringEncodingUTF8) + 1;
    let mut buffer = vec![0u8; capacity as usize];

    if CFStringGetCString(
        string,
        buffer.as_mut_ptr() as *mut c_char,
        capacity,
        kCFStringEncodingUTF8,
    ) == 0
    {
        return None;
    }

    CStr::from_ptr(buffer.as_ptr() as *const c_char)
        .to_str()
        .ok()
        .map(ToOwned::to_owned)
}

unsafe fn extended_record(event_paths: *mut c_void, index: usize) -> Option<(PathBuf, Option<u64>)> {
    let dict = cf::CFArrayGetValueAtIndex(event_paths as cf::CFMutableArrayRef, index as cf::CFIndex);
    let path_ref = CFDictionaryGetValue(dict, kFSEventStreamEventExtendedDataPathKey);
    let path = cfstring_to_string(path_ref)?;

    let inode_ref = CFDictionaryGetValue(dict, kFSEventStreamEventExtendedFileIDKey);
    let inode = if inode_ref.is_null() {
        None
    } else {
        let mut inode: i64 = 0;
        if CFNumberGetValue(inode_ref, kCFNumberSInt64Type, &mut inode as *mut i64 as *mut c_void)
            != 0
        {
            Some(inode as u64)
        } else {
            None
        }
    };

    Some((PathBuf::from(path), inode))
}

extern "C" fn stream_callback(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let context = unsafe { &*(info as *const StreamContext) };
    let flags = unsafe { slice::from_raw_parts(event_flags, num_events) };
    let time = wall_clock_seconds();

    let mut events = Vec::with_capacity(num_events);

    for (index, native_bits) in flags.iter().enumerate() {
        let native = StreamFlags::from_bits_truncate(*native_bits);

        let (path, inode) = if context.extended_data {
            match unsafe { extended_record(event_paths, index) } {
                Some(record) => record,
                None => {
                    log::warn!("failed to decode extended FSEvents record");
                    continue;
                }
            }
        } else {
            let paths = event_paths as *const *const c_char;
            let path = unsafe { CStr::from_ptr(*paths.add(index)) };
            (PathBuf::from(path.to_string_lossy().into_owned()), None)
        };

        // MustScanSubDirs doubles as the overflow signal.
        if native.contains(StreamFlags::MUST_SCAN_SUB_DIRS) {
            if let Err(err) = context.base.notify_overflow(&path) {
                *context.failure.lock().unwrap() = Some(err);
                context.base.request_stop();
                return;
            }
        }

        let mut event = Event::new(path, time, translate_flags(native));
        if let Some(inode) = inode {
            event = event.with_inode(inode);
        }
        events.push(event);
    }

    if !events.is_empty() {
        context.base.notify_events(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn item_flags_translate_per_table() {
        assert_eq!(
            translate_flags(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_IS_FILE),
            EventFlags::CREATED | EventFlags::IS_FILE
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_RENAMED),
            EventFlags::RENAMED
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_CHANGE_OWNER),
            EventFlags::OWNER_MODIFIED
        );
    }

    #[test]
    fn finder_info_keeps_its_dual_mapping() {
        let flags = translate_flags(StreamFlags::ITEM_FINDER_INFO_MOD);
        assert!(flags.contains(EventFlags::ATTRIBUTE_MODIFIED));
        assert!(flags.contains(EventFlags::PLATFORM_SPECIFIC));
    }

    #[test]
    fn housekeeping_flags_map_to_platform_specific() {
        for native in [
            StreamFlags::MUST_SCAN_SUB_DIRS,
            StreamFlags::USER_DROPPED,
            StreamFlags::KERNEL_DROPPED,
            StreamFlags::ROOT_CHANGED,
            StreamFlags::MOUNT,
            StreamFlags::UNMOUNT,
        ] {
            assert!(translate_flags(native).contains(EventFlags::PLATFORM_SPECIFIC));
        }
    }

    #[test]
    fn empty_bitmask_is_platform_specific() {
        assert_eq!(
            translate_flags(StreamFlags::empty()),
            EventFlags::PLATFORM_SPECIFIC
        );
    }

    #[test]
    fn no_defer_property_is_parsed() {
        let (tx, _rx) = mpsc::channel();
        let monitor = FseventMonitor::new(vec![], tx).unwrap();

        monitor.base().set_property(PROP_NO_DEFER, "true");
        assert!(monitor.no_defer());

        monitor.base().set_property(PROP_NO_DEFER, "false");
        assert!(!monitor.no_defer());

        assert!(!monitor.use_extended_data());
        monitor.base().set_property(PROP_USE_EXTENDED_DATA, "true");
        assert!(monitor.use_extended_data());
    }
}

//! The portable change-event model.
//!
//! Native backends speak very different dialects: inotify bitmasks, kqueue
//! vnode filter flags, FSEvents stream flags, or plain stat diffs.  Whatever
//! the source, a monitor translates each native notification into an
//! [`Event`] carrying a set of [`EventFlags`].  No exact mapping between a
//! native flag and a portable flag is guaranteed to exist: a native flag may
//! map to several portable flags, several native flags may collapse into
//! one, and flags with no portable meaning map to
//! [`EventFlags::PLATFORM_SPECIFIC`].

use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Backend-agnostic change flags.
    ///
    /// Every flag is a distinct bit so that flags can be OR-combined into a
    /// single mask, which is how event-type filters and user-supplied
    /// numeric filters (e.g. `--event 6`) are expressed.  The empty set is
    /// the `NoOp` flag, reserved for synthetic idle events.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EventFlags: u32 {
        /// Platform-specific placeholder for events that cannot be mapped.
        const PLATFORM_SPECIFIC = 1 << 0;
        /// An object was created.
        const CREATED = 1 << 1;
        /// An object was updated.
        const UPDATED = 1 << 2;
        /// An object was removed.
        const REMOVED = 1 << 3;
        /// An object was renamed.
        const RENAMED = 1 << 4;
        /// The owner of an object was modified.
        const OWNER_MODIFIED = 1 << 5;
        /// The attributes of an object were modified.
        const ATTRIBUTE_MODIFIED = 1 << 6;
        /// An object was moved from this location.
        const MOVED_FROM = 1 << 7;
        /// An object was moved to this location.
        const MOVED_TO = 1 << 8;
        /// The object is a file.
        const IS_FILE = 1 << 9;
        /// The object is a directory.
        const IS_DIR = 1 << 10;
        /// The object is a symbolic link.
        const IS_SYM_LINK = 1 << 11;
        /// The link count of an object has changed.
        const LINK = 1 << 12;
        /// The event queue has overflowed.
        const OVERFLOW = 1 << 13;
        /// A file opened for writing was closed.
        const CLOSE_WRITE = 1 << 14;
    }
}

impl EventFlags {
    /// No event has occurred.  The empty flag set.
    pub const NO_OP: EventFlags = EventFlags::empty();

    /// The complete name table, including `NoOp`, in declaration order.
    ///
    /// Exposed so callers can take a combined numeric mask apart and render
    /// or parse each member flag.
    pub const ALL_NAMED: [(EventFlags, &'static str); 16] = [
        (EventFlags::NO_OP, "NoOp"),
        (EventFlags::PLATFORM_SPECIFIC, "PlatformSpecific"),
        (EventFlags::CREATED, "Created"),
        (EventFlags::UPDATED, "Updated"),
        (EventFlags::REMOVED, "Removed"),
        (EventFlags::RENAMED, "Renamed"),
        (EventFlags::OWNER_MODIFIED, "OwnerModified"),
        (EventFlags::ATTRIBUTE_MODIFIED, "AttributeModified"),
        (EventFlags::MOVED_FROM, "MovedFrom"),
        (EventFlags::MOVED_TO, "MovedTo"),
        (EventFlags::IS_FILE, "IsFile"),
        (EventFlags::IS_DIR, "IsDir"),
        (EventFlags::IS_SYM_LINK, "IsSymLink"),
        (EventFlags::LINK, "Link"),
        (EventFlags::OVERFLOW, "Overflow"),
        (EventFlags::CLOSE_WRITE, "CloseWrite"),
    ];

    /// Looks up a flag by its canonical name.
    pub fn from_canonical_name(name: &str) -> Option<EventFlags> {
        Self::ALL_NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| *f)
    }

    /// Returns the canonical name of this flag.
    ///
    /// Returns `None` unless `self` is exactly one entry of the name table
    /// (a single flag, or the empty `NoOp` set).
    pub fn name(self) -> Option<&'static str> {
        Self::ALL_NAMED
            .iter()
            .find(|(f, _)| *f == self)
            .map(|(_, n)| *n)
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NoOp");
        }

        let mut first = true;
        for (flag, name) in Self::ALL_NAMED.iter().skip(1) {
            if self.contains(*flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for EventFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for EventFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = <u32 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(EventFlags::from_bits_truncate(bits))
    }
}

/// A single filesystem change notification.
///
/// Events are immutable once constructed.  All events of a batch share one
/// wall-clock timestamp sampled when the batch was read from the backend,
/// and paths are absolute (monitors canonicalize their root paths before
/// scanning).  `inode` is populated only by backends that report it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// The absolute path the event refers to.
    pub path: PathBuf,
    /// Wall-clock time of the batch, in seconds since the Unix epoch.
    pub time: i64,
    /// The set of change flags describing the event.
    pub flags: EventFlags,
    /// The inode of the changed object, when the backend provides it.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub inode: Option<u64>,
}

impl Event {
    /// Creates an event without inode information.
    pub fn new(path: impl Into<PathBuf>, time: i64, flags: EventFlags) -> Self {
        Event {
            path: path.into(),
            time,
            flags,
            inode: None,
        }
    }

    /// Attaches the inode reported by the backend.
    pub fn with_inode(mut self, inode: u64) -> Self {
        self.inode = Some(inode);
        self
    }
}

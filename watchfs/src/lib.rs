//! Cross-platform filesystem change-notification engine
//!
//! `watchfs` watches a set of root paths and produces a stream of typed
//! change events describing mutations observed beneath them.  Four
//! detection strategies are abstracted behind one monitor model:
//!
//! - [`PollMonitor`]: periodic stat scans, works everywhere
//! - [`InotifyMonitor`]: Linux, kernel event descriptor
//! - [`KqueueMonitor`]: BSD (and macOS with the `macos_kqueue` feature),
//!   per-file vnode filters
//! - [`FseventMonitor`]: macOS, coalesced FSEvents stream
//!
//! A monitor runs its loop on the thread that calls [`Monitor::start`],
//! which blocks; use a [`MonitorHandle`] to stop it from another thread.
//! The [`factory`] constructs monitors by type tag or name and selects the
//! platform default, and the [`session`] module exposes the same
//! functionality behind opaque integer handles with flat status codes.
//!
//! ## Features
//!
//! - `macos_fsevent` (default) for the FSEvents backend on macOS
//! - `macos_kqueue` for the kqueue backend on macOS
//! - `crossbeam-channel` (default) allows a `crossbeam_channel::Sender`
//!   to be used directly as an event callback
//! - `serde` for serialization of the event model
//!
//! ## Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::thread;
//! use std::time::Duration;
//! use watchfs::{default_monitor, Event, Monitor};
//!
//! fn main() -> watchfs::Result<()> {
//!     let mut monitor = default_monitor(
//!         vec![PathBuf::from("/tmp")],
//!         |events: &[Event]| {
//!             for event in events {
//!                 println!("{} {}", event.path.display(), event.flags);
//!             }
//!         },
//!     )?;
//!     monitor.base().set_recursive(true);
//!
//!     let handle = monitor.handle();
//!     thread::spawn(move || {
//!         thread::sleep(Duration::from_secs(30));
//!         handle.stop();
//!     });
//!
//!     // blocks until the handle stops the monitor
//!     monitor.start()
//! }
//! ```

pub use watchfs_types::{Event, EventFlags};

pub use config::MonitorConfig;
pub use error::{Error, ErrorKind, Result};
pub use factory::MonitorType;
pub use filter::{FilterChain, FilterKind, MonitorFilter};
pub use monitor::{EventHandler, Monitor, MonitorBase, MonitorHandle};
pub use poll::PollMonitor;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub use fsevent::FseventMonitor;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use inotify::InotifyMonitor;
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub use kqueue::KqueueMonitor;

pub mod config;
pub mod error;
pub mod factory;
pub mod filter;
pub mod monitor;
pub mod path_utils;
pub mod poll;
pub mod session;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub mod fsevent;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub mod kqueue;

use std::path::PathBuf;

/// Convenience method constructing the default monitor of this platform.
///
/// Equivalent to [`factory::create_monitor`] with
/// [`MonitorType::SystemDefault`].
pub fn default_monitor<F>(paths: Vec<PathBuf>, handler: F) -> Result<Box<dyn Monitor>>
where
    F: EventHandler,
{
    factory::create_monitor(MonitorType::SystemDefault, paths, Box::new(handler))
}

/// Looks up an event flag by its canonical name.
///
/// Used when parsing user-supplied event filters such as `--event Created`.
pub fn event_flag_by_name(name: &str) -> Result<EventFlags> {
    EventFlags::from_canonical_name(name)
        .ok_or_else(|| Error::new(ErrorKind::UnknownValue(name.to_string())))
}

/// Returns the canonical name of a single event flag.
pub fn event_flag_name(flag: EventFlags) -> Result<&'static str> {
    flag.name()
        .ok_or_else(|| Error::new(ErrorKind::UnknownValue(format!("{:#x}", flag.bits()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_trait_is_object_safe() {
        fn assert_boxable(_monitor: &dyn Monitor) {}
        let monitor = PollMonitor::new(vec![], |_: &[Event]| {}).unwrap();
        assert_boxable(&monitor);
    }

    #[test]
    fn default_monitor_matches_the_platform_default() {
        let monitor = default_monitor(vec![], |_: &[Event]| {}).unwrap();
        assert_eq!(monitor.kind(), factory::default_type());
    }

    #[test]
    fn channel_senders_are_event_handlers() {
        fn check<T: EventHandler>() {}
        check::<std::sync::mpsc::Sender<Vec<Event>>>();
        #[cfg(feature = "crossbeam-channel")]
        check::<crossbeam_channel::Sender<Vec<Event>>>();
    }

    #[test]
    fn flag_lookup_round_trips() {
        for (flag, _) in EventFlags::ALL_NAMED {
            let name = event_flag_name(flag).unwrap();
            assert_eq!(event_flag_by_name(name).unwrap(), flag);
        }
    }

    #[test]
    fn unknown_flag_lookups_fail() {
        let err = event_flag_by_name("NotAFlag").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownValue(_)));

        let err = event_flag_name(EventFlags::CREATED | EventFlags::REMOVED).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownValue(_)));
    }
}

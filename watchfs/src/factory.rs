//! Monitor construction and the backend registry.
//!
//! Backends register themselves in a process-wide table built on first use;
//! registration is central (rather than scattered static initializers) so
//! the registry is queryable before any monitor is started.  Lookup works
//! both by [`MonitorType`] tag and by canonical name string.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::monitor::{EventHandler, Monitor};
use crate::{Error, ErrorKind, Result};

/// The available monitor backends.
///
/// `SystemDefault` refers to the platform-specific default backend and is
/// resolved at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MonitorType {
    /// The platform default, resolved by [`default_type`].
    SystemDefault,
    /// The coalescing-stream monitor (macOS FSEvents).
    Fsevents,
    /// The BSD `kqueue` monitor (also macOS with the `macos_kqueue`
    /// feature).
    Kqueue,
    /// The Linux `inotify` monitor.
    Inotify,
    /// The `stat()`-based poll monitor, available everywhere.
    Poll,
}

impl MonitorType {
    /// The canonical name of this monitor type.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorType::SystemDefault => "system_default_monitor",
            MonitorType::Fsevents => "fsevents_monitor",
            MonitorType::Kqueue => "kqueue_monitor",
            MonitorType::Inotify => "inotify_monitor",
            MonitorType::Poll => "poll_monitor",
        }
    }

    /// Looks a monitor type up by canonical name.
    pub fn from_name(name: &str) -> Option<MonitorType> {
        match name {
            "system_default_monitor" => Some(MonitorType::SystemDefault),
            "fsevents_monitor" => Some(MonitorType::Fsevents),
            "kqueue_monitor" => Some(MonitorType::Kqueue),
            "inotify_monitor" => Some(MonitorType::Inotify),
            "poll_monitor" => Some(MonitorType::Poll),
            _ => None,
        }
    }
}

/// Constructor signature registered by each backend.
pub type MonitorCreator = fn(Vec<PathBuf>, Box<dyn EventHandler>) -> Result<Box<dyn Monitor>>;

fn creators() -> &'static BTreeMap<MonitorType, MonitorCreator> {
    static CREATORS: OnceLock<BTreeMap<MonitorType, MonitorCreator>> = OnceLock::new();

    CREATORS.get_or_init(|| {
        let mut map: BTreeMap<MonitorType, MonitorCreator> = BTreeMap::new();

        #[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
        map.insert(MonitorType::Fsevents, crate::fsevent::create);

        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            all(target_os = "macos", feature = "macos_kqueue")
        ))]
        map.insert(MonitorType::Kqueue, crate::kqueue::create);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        map.insert(MonitorType::Inotify, crate::inotify::create);

        map.insert(MonitorType::Poll, crate::poll::create);

        map
    })
}

/// Builds the backend registry.  Idempotent; construction functions call
/// this implicitly.
pub fn init_registry() {
    let _ = creators();
}

/// The default monitor type of this host, in priority order
/// stream → kqueue → inotify → poll.
pub fn default_type() -> MonitorType {
    const PRIORITY: [MonitorType; 4] = [
        MonitorType::Fsevents,
        MonitorType::Kqueue,
        MonitorType::Inotify,
        MonitorType::Poll,
    ];

    PRIORITY
        .iter()
        .copied()
        .find(|monitor_type| creators().contains_key(monitor_type))
        // the poll monitor is registered unconditionally
        .unwrap_or(MonitorType::Poll)
}

/// Constructs a monitor of the given type.
///
/// `SystemDefault` resolves to [`default_type`]; a type whose backend is
/// not available on this host yields `UnknownMonitorType`.
pub fn create_monitor(
    monitor_type: MonitorType,
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    let concrete = match monitor_type {
        MonitorType::SystemDefault => default_type(),
        other => other,
    };

    let creator = creators()
        .get(&concrete)
        .ok_or_else(|| Error::new(ErrorKind::UnknownMonitorType(concrete.name().to_string())))?;

    creator(paths, handler)
}

/// Constructs a monitor looked up by canonical name.
pub fn create_monitor_by_name(
    name: &str,
    paths: Vec<PathBuf>,
    handler: Box<dyn EventHandler>,
) -> Result<Box<dyn Monitor>> {
    let monitor_type = MonitorType::from_name(name)
        .ok_or_else(|| Error::new(ErrorKind::UnknownMonitorType(name.to_string())))?;

    create_monitor(monitor_type, paths, handler)
}

/// True when the given type is constructible on this host.
pub fn exists_type(monitor_type: MonitorType) -> bool {
    monitor_type == MonitorType::SystemDefault || creators().contains_key(&monitor_type)
}

/// True when the given name denotes a constructible monitor.
pub fn exists_name(name: &str) -> bool {
    MonitorType::from_name(name).is_some_and(exists_type)
}

/// The canonical names of the backends available on this host.
pub fn types() -> Vec<&'static str> {
    creators().keys().map(MonitorType::name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_monitor_is_always_registered() {
        assert!(exists_type(MonitorType::Poll));
        assert!(exists_name("poll_monitor"));
        assert!(types().contains(&"poll_monitor"));
    }

    #[test]
    fn system_default_always_exists() {
        assert!(exists_type(MonitorType::SystemDefault));
        assert!(exists_name("system_default_monitor"));
    }

    #[test]
    fn default_type_is_registered() {
        let default = default_type();
        assert_ne!(default, MonitorType::SystemDefault);
        assert!(exists_type(default));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_prefers_inotify() {
        assert_eq!(default_type(), MonitorType::Inotify);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(!exists_name("fen_monitor"));

        match create_monitor_by_name("fen_monitor", vec![], Box::new(|_: &[watchfs_types::Event]| {})) {
            Err(err) => assert!(matches!(err.kind, ErrorKind::UnknownMonitorType(_))),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn create_by_name_builds_the_requested_kind() {
        let monitor =
            create_monitor_by_name("poll_monitor", vec![], Box::new(|_: &[watchfs_types::Event]| {}))
                .unwrap();
        assert_eq!(monitor.kind(), MonitorType::Poll);
    }

    #[test]
    fn system_default_resolves_to_a_concrete_kind() {
        let monitor = create_monitor(
            MonitorType::SystemDefault,
            vec![],
            Box::new(|_: &[watchfs_types::Event]| {}),
        )
        .unwrap();
        assert_eq!(monitor.kind(), default_type());
    }

    #[test]
    fn type_names_round_trip() {
        for monitor_type in [
            MonitorType::SystemDefault,
            MonitorType::Fsevents,
            MonitorType::Kqueue,
            MonitorType::Inotify,
            MonitorType::Poll,
        ] {
            assert_eq!(MonitorType::from_name(monitor_type.name()), Some(monitor_type));
        }
    }
}

//! Handle-based session facade.
//!
//! The facade wraps the factory and monitor objects behind opaque integer
//! handles with flat status codes, for callers that cannot hold the native
//! monitor types: bindings, embedders, and the command-line front-end.  A
//! session accumulates configuration; the monitor itself is constructed
//! when [`start_monitor`] is called and runs on the calling thread until
//! stopped.
//!
//! Every operation records its status in a thread-local slot readable
//! through [`last_error`].

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use watchfs_types::{Event, EventFlags};

use crate::config::MonitorConfig;
use crate::factory::{self, MonitorType};
use crate::filter::{FilterChain, MonitorFilter};
use crate::monitor::{EventHandler, Monitor, MonitorHandle};
use crate::ErrorKind;

/// Opaque session identifier.
pub type SessionHandle = u32;

/// Flat status codes of the session facade.
///
/// `Ok` is zero; every failure code is a distinct bit position so that
/// codes can be OR-combined in diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    /// The operation succeeded.
    Ok = 0,
    /// An unspecified error occurred.
    UnknownError = 1 << 0,
    /// The session handle is not known.
    SessionUnknown = 1 << 1,
    /// A monitor already exists for this session.
    MonitorAlreadyExists = 1 << 2,
    /// Out of memory.
    Memory = 1 << 3,
    /// The monitor type is unknown or unavailable on this host.
    UnknownMonitorType = 1 << 4,
    /// No callback was installed before starting.
    CallbackNotSet = 1 << 5,
    /// No root path was added before starting.
    PathsNotSet = 1 << 6,
    /// The callback context is missing.
    MissingContext = 1 << 8,
    /// An invalid path was supplied.
    InvalidPath = 1 << 9,
    /// An invalid callback was supplied.
    InvalidCallback = 1 << 10,
    /// A negative latency was supplied.
    InvalidLatency = 1 << 11,
    /// A filter pattern failed to compile.
    InvalidRegex = 1 << 12,
    /// The monitor is already running.
    MonitorAlreadyRunning = 1 << 13,
    /// A name lookup found nothing.
    UnknownValue = 1 << 14,
    /// An invalid property was supplied.
    InvalidProperty = 1 << 15,
}

impl Status {
    /// The numeric code of this status.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// True for `Status::Ok`.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<&ErrorKind> for Status {
    fn from(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::CallbackNotSet => Status::CallbackNotSet,
            ErrorKind::PathsNotSet => Status::PathsNotSet,
            ErrorKind::InvalidLatency => Status::InvalidLatency,
            ErrorKind::InvalidRegex(_) => Status::InvalidRegex,
            ErrorKind::InvalidProperty(_) => Status::InvalidProperty,
            ErrorKind::UnknownMonitorType(_) => Status::UnknownMonitorType,
            ErrorKind::UnknownValue(_) => Status::UnknownValue,
            ErrorKind::MonitorAlreadyRunning => Status::MonitorAlreadyRunning,
            _ => Status::UnknownError,
        }
    }
}

type SharedCallback = Arc<Mutex<Box<dyn EventHandler>>>;

struct SessionState {
    monitor_type: MonitorType,
    paths: Vec<PathBuf>,
    callback: Option<SharedCallback>,
    config: MonitorConfig,
    filters: Vec<MonitorFilter>,
    permitted: EventFlags,
    properties: Vec<(String, String)>,
    /// Set for the duration of `start_monitor`.
    monitor: Option<MonitorHandle>,
    starting: bool,
}

impl SessionState {
    fn new(monitor_type: MonitorType) -> Self {
        SessionState {
            monitor_type,
            paths: Vec::new(),
            callback: None,
            config: MonitorConfig::default(),
            filters: Vec::new(),
            permitted: EventFlags::empty(),
            properties: Vec::new(),
            monitor: None,
            starting: false,
        }
    }
}

/// Forwards monitor batches to the callback stored in the session, so the
/// session keeps ownership across restarts.
struct SessionForwarder {
    callback: SharedCallback,
}

impl EventHandler for SessionForwarder {
    fn handle_events(&mut self, events: &[Event]) {
        self.callback.lock().unwrap().handle_events(events);
    }
}

fn sessions() -> &'static Mutex<HashMap<SessionHandle, Arc<Mutex<SessionState>>>> {
    static SESSIONS: OnceLock<Mutex<HashMap<SessionHandle, Arc<Mutex<SessionState>>>>> =
        OnceLock::new();
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

thread_local! {
    static LAST_ERROR: Cell<Status> = const { Cell::new(Status::Ok) };
}

fn record(status: Status) -> Status {
    LAST_ERROR.with(|last| last.set(status));
    status
}

fn session(handle: SessionHandle) -> Option<Arc<Mutex<SessionState>>> {
    sessions().lock().unwrap().get(&handle).cloned()
}

fn with_session(
    handle: SessionHandle,
    op: impl FnOnce(&mut SessionState) -> Status,
) -> Status {
    match session(handle) {
        Some(state) => {
            let mut state = state.lock().unwrap();
            record(op(&mut state))
        }
        None => record(Status::SessionUnknown),
    }
}

/// Initializes the library.  Idempotent; builds the backend registry so the
/// factory is queryable before any monitor is started.
pub fn init_library() {
    factory::init_registry();
    record(Status::Ok);
}

/// Creates a session bound to the given monitor type and returns its
/// handle.
pub fn init_session(monitor_type: MonitorType) -> Result<SessionHandle, Status> {
    static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

    init_library();

    if !factory::exists_type(monitor_type) {
        return Err(record(Status::UnknownMonitorType));
    }

    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let state = Arc::new(Mutex::new(SessionState::new(monitor_type)));
    sessions().lock().unwrap().insert(handle, state);

    record(Status::Ok);
    Ok(handle)
}

/// Appends a root path to the session.
pub fn add_path(handle: SessionHandle, path: &Path) -> Status {
    if path.as_os_str().is_empty() {
        return record(Status::InvalidPath);
    }

    with_session(handle, |state| {
        state.paths.push(path.to_path_buf());
        Status::Ok
    })
}

/// Installs the event callback.
pub fn set_callback<F: EventHandler>(handle: SessionHandle, callback: F) -> Status {
    with_session(handle, |state| {
        state.callback = Some(Arc::new(Mutex::new(Box::new(callback))));
        Status::Ok
    })
}

/// Sets the latency in seconds.  Must not be negative.
pub fn set_latency(handle: SessionHandle, latency: f64) -> Status {
    if latency < 0.0 {
        return record(Status::InvalidLatency);
    }

    with_session(handle, |state| {
        state.config = state.config.with_latency(latency);
        Status::Ok
    })
}

/// Sets the recursive flag.
pub fn set_recursive(handle: SessionHandle, recursive: bool) -> Status {
    with_session(handle, |state| {
        state.config = state.config.with_recursive(recursive);
        Status::Ok
    })
}

/// Sets the follow-symlinks flag.
pub fn set_follow_symlinks(handle: SessionHandle, follow_symlinks: bool) -> Status {
    with_session(handle, |state| {
        state.config = state.config.with_follow_symlinks(follow_symlinks);
        Status::Ok
    })
}

/// Sets the directory-only flag.
pub fn set_directory_only(handle: SessionHandle, directory_only: bool) -> Status {
    with_session(handle, |state| {
        state.config = state.config.with_directory_only(directory_only);
        Status::Ok
    })
}

/// Sets the allow-overflow flag.
pub fn set_allow_overflow(handle: SessionHandle, allow_overflow: bool) -> Status {
    with_session(handle, |state| {
        state.config = state.config.with_allow_overflow(allow_overflow);
        Status::Ok
    })
}

/// Appends a path filter.  The pattern is compiled eagerly so invalid
/// patterns are rejected here.
pub fn add_filter(handle: SessionHandle, filter: MonitorFilter) -> Status {
    let mut probe = FilterChain::new();
    if probe.add(&filter).is_err() {
        return record(Status::InvalidRegex);
    }

    with_session(handle, |state| {
        state.filters.push(filter);
        Status::Ok
    })
}

/// Permits an event type.
pub fn add_event_type_filter(handle: SessionHandle, flag: EventFlags) -> Status {
    if flag.name().is_none() {
        return record(Status::UnknownValue);
    }

    with_session(handle, |state| {
        state.permitted |= flag;
        Status::Ok
    })
}

/// Sets a backend-specific property.
pub fn set_property(handle: SessionHandle, name: &str, value: &str) -> Status {
    if name.is_empty() {
        return record(Status::InvalidProperty);
    }

    with_session(handle, |state| {
        state.properties.push((name.to_string(), value.to_string()));
        Status::Ok
    })
}

/// Constructs and starts the session's monitor.
///
/// Blocks the calling thread until the monitor stops.  A concurrent second
/// start on the same session fails with `MonitorAlreadyRunning`.
pub fn start_monitor(handle: SessionHandle) -> Status {
    let Some(state) = session(handle) else {
        return record(Status::SessionUnknown);
    };

    let mut monitor = {
        let mut state = state.lock().unwrap();

        if state.starting {
            return record(Status::MonitorAlreadyRunning);
        }
        if state.paths.is_empty() {
            return record(Status::PathsNotSet);
        }
        let Some(callback) = state.callback.clone() else {
            return record(Status::CallbackNotSet);
        };

        let forwarder = SessionForwarder { callback };
        let monitor = match factory::create_monitor(
            state.monitor_type,
            state.paths.clone(),
            Box::new(forwarder),
        ) {
            Ok(monitor) => monitor,
            Err(err) => return record(Status::from(&err.kind)),
        };

        if monitor.base().set_config(state.config).is_err() {
            return record(Status::InvalidLatency);
        }
        for filter in &state.filters {
            if monitor.base().add_filter(filter).is_err() {
                return record(Status::InvalidRegex);
            }
        }
        monitor.base().set_event_type_filters(state.permitted);
        for (name, value) in &state.properties {
            monitor.base().set_property(name, value);
        }

        state.monitor = Some(monitor.handle());
        state.starting = true;
        monitor
    };

    let result = monitor.start();

    {
        let mut state = state.lock().unwrap();
        state.monitor = None;
        state.starting = false;
    }

    match result {
        Ok(()) => record(Status::Ok),
        Err(err) => record(Status::from(&err.kind)),
    }
}

/// Requests a cooperative stop of the session's monitor.  Returns
/// immediately; stopping an idle session is a no-op.
pub fn stop_monitor(handle: SessionHandle) -> Status {
    with_session(handle, |state| {
        if let Some(monitor) = &state.monitor {
            monitor.stop();
        }
        Status::Ok
    })
}

/// True while the session's monitor loop is executing.
pub fn is_running(handle: SessionHandle) -> bool {
    match session(handle) {
        Some(state) => {
            let state = state.lock().unwrap();
            state.monitor.as_ref().is_some_and(MonitorHandle::is_running)
        }
        None => false,
    }
}

/// Destroys a session.  Destroying an unknown (or already destroyed)
/// session reports `SessionUnknown`.
pub fn destroy_session(handle: SessionHandle) -> Status {
    match sessions().lock().unwrap().remove(&handle) {
        Some(_) => record(Status::Ok),
        None => record(Status::SessionUnknown),
    }
}

/// The status recorded by the most recent facade call on this thread.
pub fn last_error() -> Status {
    LAST_ERROR.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn fresh_session() -> SessionHandle {
        init_session(MonitorType::Poll).unwrap()
    }

    #[test]
    fn init_and_destroy() {
        let handle = fresh_session();
        assert_eq!(destroy_session(handle), Status::Ok);
        assert_eq!(destroy_session(handle), Status::SessionUnknown);
        assert_eq!(last_error(), Status::SessionUnknown);
    }

    #[test]
    fn handles_are_unique() {
        let a = fresh_session();
        let b = fresh_session();
        assert_ne!(a, b);
        destroy_session(a);
        destroy_session(b);
    }

    #[test]
    fn operations_on_unknown_sessions_fail() {
        assert_eq!(add_path(u32::MAX, Path::new("/tmp")), Status::SessionUnknown);
        assert_eq!(set_latency(u32::MAX, 1.0), Status::SessionUnknown);
        assert_eq!(stop_monitor(u32::MAX), Status::SessionUnknown);
        assert!(!is_running(u32::MAX));
    }

    #[test]
    fn empty_path_is_invalid() {
        let handle = fresh_session();
        assert_eq!(add_path(handle, Path::new("")), Status::InvalidPath);
        destroy_session(handle);
    }

    #[test]
    fn negative_latency_is_invalid() {
        let handle = fresh_session();
        assert_eq!(set_latency(handle, -1.0), Status::InvalidLatency);
        assert_eq!(last_error(), Status::InvalidLatency);
        assert_eq!(set_latency(handle, 0.5), Status::Ok);
        destroy_session(handle);
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let handle = fresh_session();
        assert_eq!(
            add_filter(handle, MonitorFilter::include("(")),
            Status::InvalidRegex
        );
        assert_eq!(
            add_filter(handle, MonitorFilter::include(r"\.log$")),
            Status::Ok
        );
        destroy_session(handle);
    }

    #[test]
    fn unknown_event_type_filter_is_rejected() {
        let handle = fresh_session();
        assert_eq!(
            add_event_type_filter(handle, EventFlags::CREATED | EventFlags::UPDATED),
            Status::UnknownValue
        );
        assert_eq!(add_event_type_filter(handle, EventFlags::CREATED), Status::Ok);
        destroy_session(handle);
    }

    #[test]
    fn empty_property_name_is_invalid() {
        let handle = fresh_session();
        assert_eq!(set_property(handle, "", "x"), Status::InvalidProperty);
        assert_eq!(set_property(handle, "stream.no_defer", "true"), Status::Ok);
        destroy_session(handle);
    }

    #[test]
    fn start_requires_paths_and_callback() {
        let handle = fresh_session();
        assert_eq!(start_monitor(handle), Status::PathsNotSet);

        assert_eq!(add_path(handle, Path::new("/tmp")), Status::Ok);
        assert_eq!(start_monitor(handle), Status::CallbackNotSet);

        destroy_session(handle);
    }

    #[test]
    fn start_stop_round_trip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let handle = fresh_session();
        let (tx, _rx) = mpsc::channel::<Vec<Event>>();

        assert_eq!(add_path(handle, tmpdir.path()), Status::Ok);
        assert_eq!(set_callback(handle, tx), Status::Ok);
        assert_eq!(set_latency(handle, 0.0), Status::Ok);
        assert_eq!(set_recursive(handle, true), Status::Ok);

        let worker = thread::spawn(move || start_monitor(handle));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_running(handle) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(is_running(handle));

        assert_eq!(stop_monitor(handle), Status::Ok);
        assert_eq!(worker.join().unwrap(), Status::Ok);
        assert!(!is_running(handle));

        destroy_session(handle);
    }

    #[test]
    fn second_concurrent_start_fails() {
        let tmpdir = tempfile::tempdir().unwrap();
        let handle = fresh_session();
        let (tx, _rx) = mpsc::channel::<Vec<Event>>();

        add_path(handle, tmpdir.path());
        set_callback(handle, tx);
        set_latency(handle, 0.0);

        let worker = thread::spawn(move || start_monitor(handle));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_running(handle) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(start_monitor(handle), Status::MonitorAlreadyRunning);

        stop_monitor(handle);
        assert_eq!(worker.join().unwrap(), Status::Ok);
        destroy_session(handle);
    }

    #[test]
    fn status_codes_are_distinct_bits() {
        let codes = [
            Status::UnknownError,
            Status::SessionUnknown,
            Status::MonitorAlreadyExists,
            Status::Memory,
            Status::UnknownMonitorType,
            Status::CallbackNotSet,
            Status::PathsNotSet,
            Status::MissingContext,
            Status::InvalidPath,
            Status::InvalidCallback,
            Status::InvalidLatency,
            Status::InvalidRegex,
            Status::MonitorAlreadyRunning,
            Status::UnknownValue,
            Status::InvalidProperty,
        ];

        let mut seen = 0u32;
        for status in codes {
            assert_eq!(status.code().count_ones(), 1, "{status:?}");
            assert_eq!(seen & status.code(), 0, "{status:?} overlaps");
            seen |= status.code();
        }
        assert_eq!(Status::Ok.code(), 0);
    }
}

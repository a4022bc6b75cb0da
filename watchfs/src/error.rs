//! Error types

use std::path::PathBuf;
use std::{fmt, io};

/// Type alias to use this library's `Error` type in a Result
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this
    /// type, or for opaque internal errors.
    Generic(String),

    /// I/O errors, with the error source
    Io(io::Error),

    /// A path does not exist
    PathNotFound,

    /// Attempted to remove a watch that does not exist
    WatchNotFound,

    /// The monitor callback was not set before starting
    CallbackNotSet,

    /// No root path was configured
    PathsNotSet,

    /// A negative latency was supplied
    InvalidLatency,

    /// A path filter failed to compile, with the offending pattern
    InvalidRegex(String),

    /// An unknown or malformed monitor property, with its name
    InvalidProperty(String),

    /// The requested monitor type is not available on this platform
    UnknownMonitorType(String),

    /// A name lookup (event flag, monitor name) found nothing
    UnknownValue(String),

    /// `start()` was called on a monitor that is already running
    MonitorAlreadyRunning,

    /// The backend event queue overflowed and overflow events are not allowed
    Overflow,

    /// OS-level limit on watched objects was reached
    MaxFilesWatch,
}

/// Notification error type
#[derive(Debug)]
pub struct Error {
    /// The kind of the error
    pub kind: ErrorKind,
    /// Relevant paths, if any
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Create a new error of the given kind
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new `Error` with `ErrorKind::Generic`
    pub fn generic(msg: &str) -> Self {
        Error::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o `Error` from a `std::io::Error` source
    pub fn io(source: io::Error) -> Self {
        Error::new(ErrorKind::Io(source))
    }

    /// Creates a new i/o `Error`, mapping `NotFound` to `PathNotFound`
    pub fn io_watch(source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::new(ErrorKind::PathNotFound)
        } else {
            Error::io(source)
        }
    }

    /// Creates a new `Error` with `ErrorKind::WatchNotFound`
    pub fn watch_not_found() -> Self {
        Error::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new `Error` with `ErrorKind::InvalidLatency`
    pub fn invalid_latency() -> Self {
        Error::new(ErrorKind::InvalidLatency)
    }

    /// Adds a path to the error
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Sets the paths of the error
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::Generic(err) => err.clone(),
            ErrorKind::Io(err) => err.to_string(),
            ErrorKind::PathNotFound => "no such path".into(),
            ErrorKind::WatchNotFound => "watch not found".into(),
            ErrorKind::CallbackNotSet => "callback cannot be null".into(),
            ErrorKind::PathsNotSet => "no path to watch was given".into(),
            ErrorKind::InvalidLatency => "latency cannot be negative".into(),
            ErrorKind::InvalidRegex(pattern) => {
                format!("filter pattern failed to compile: {pattern}")
            }
            ErrorKind::InvalidProperty(name) => format!("invalid monitor property: {name}"),
            ErrorKind::UnknownMonitorType(name) => format!("unknown monitor type: {name}"),
            ErrorKind::UnknownValue(name) => format!("unknown value: {name}"),
            ErrorKind::MonitorAlreadyRunning => "monitor is already running".into(),
            ErrorKind::Overflow => "backend event queue overflowed".into(),
            ErrorKind::MaxFilesWatch => "OS file watch limit reached".into(),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{error} about {:?}", self.paths)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::io(source)
    }
}

impl From<walkdir::Error> for Error {
    fn from(source: walkdir::Error) -> Self {
        match source.io_error() {
            // safe to unwrap, this branch implies an io error is present
            Some(_) => Error::io(source.into_io_error().unwrap()),
            None => Error::generic(&source.to_string()),
        }
    }
}

//! Monitor configuration types

use std::time::Duration;

/// The smallest interval the poll monitor will sleep between scans, in
/// seconds.  Sub-second latencies are honored by the event-driven backends
/// only.
pub const MIN_POLL_LATENCY: f64 = 1.0;

/// Shared monitor configuration.
///
/// Every backend reads the same configuration record; settings that a
/// backend cannot honor are ignored by it.  Latency is expressed in seconds
/// and must not be negative; validation happens when the configuration is
/// applied to a monitor.
///
/// ```rust
/// # use watchfs::MonitorConfig;
/// let config = MonitorConfig::default()
///     .with_latency(0.25)
///     .with_recursive(true)
///     .with_follow_symlinks(true);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorConfig {
    latency: f64,
    recursive: bool,
    follow_symlinks: bool,
    directory_only: bool,
    watch_access: bool,
    allow_overflow: bool,
    fire_idle_event: bool,
    bubble_events: bool,
}

impl MonitorConfig {
    /// Interval, in seconds, the monitor may wait between observing a change
    /// and delivering the batch containing it.
    ///
    /// Zero means "no intentional wait between scans"; the poll monitor
    /// still enforces [`MIN_POLL_LATENCY`].
    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    /// Returns current setting
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// The latency as a `Duration`, clamping negatives to zero.
    pub fn latency_duration(&self) -> Duration {
        Duration::from_secs_f64(self.latency.max(0.0))
    }

    /// The sleep interval of the poll monitor: the latency, floored at
    /// [`MIN_POLL_LATENCY`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.latency.max(MIN_POLL_LATENCY))
    }

    /// Recursively observe the contents of directories.  Off by default.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Returns current setting
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Follow symbolic links instead of observing the links themselves.
    /// Off by default.
    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    /// Returns current setting
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// Watch directories only during recursive scans.
    ///
    /// Only meaningful for backends that report change events on a directory
    /// when one of its children changes.  Off by default.
    pub fn with_directory_only(mut self, directory_only: bool) -> Self {
        self.directory_only = directory_only;
        self
    }

    /// Returns current setting
    pub fn directory_only(&self) -> bool {
        self.directory_only
    }

    /// Report file access (open, close-without-write) where the backend can.
    /// Off by default.
    pub fn with_watch_access(mut self, watch_access: bool) -> Self {
        self.watch_access = watch_access;
        self
    }

    /// Returns current setting
    pub fn watch_access(&self) -> bool {
        self.watch_access
    }

    /// Report a backend queue overflow as a change event carrying the
    /// `Overflow` flag instead of terminating the monitor.  Off by default.
    pub fn with_allow_overflow(mut self, allow_overflow: bool) -> Self {
        self.allow_overflow = allow_overflow;
        self
    }

    /// Returns current setting
    pub fn allow_overflow(&self) -> bool {
        self.allow_overflow
    }

    /// Emit a synthetic `NoOp` event after an idle cycle, that is a period
    /// of 110% of the latency in which no change event was delivered.
    /// Off by default.
    pub fn with_fire_idle_event(mut self, fire_idle_event: bool) -> Self {
        self.fire_idle_event = fire_idle_event;
        self
    }

    /// Returns current setting
    pub fn fire_idle_event(&self) -> bool {
        self.fire_idle_event
    }

    /// Consolidate the flags of events sharing the same time and path within
    /// a batch into a single event.  Off by default.
    pub fn with_bubble_events(mut self, bubble_events: bool) -> Self {
        self.bubble_events = bubble_events;
        self
    }

    /// Returns current setting
    pub fn bubble_events(&self) -> bool {
        self.bubble_events
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency: 1.0,
            recursive: false,
            follow_symlinks: false,
            directory_only: false,
            watch_access: false,
            allow_overflow: false,
            fire_idle_event: false,
            bubble_events: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_latency_is_one_second() {
        let config = MonitorConfig::default();
        assert_eq!(config.latency(), 1.0);
        assert!(!config.recursive());
        assert!(!config.follow_symlinks());
    }

    #[test]
    fn poll_interval_enforces_minimum() {
        let config = MonitorConfig::default().with_latency(0.0);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));

        let config = MonitorConfig::default().with_latency(2.5);
        assert_eq!(config.poll_interval(), Duration::from_secs_f64(2.5));
    }

    #[test]
    fn latency_duration_clamps_negatives() {
        let config = MonitorConfig::default().with_latency(-3.0);
        assert_eq!(config.latency_duration(), Duration::ZERO);
    }

    #[test]
    fn builders_compose() {
        let config = MonitorConfig::default()
            .with_recursive(true)
            .with_directory_only(true)
            .with_bubble_events(true);
        assert!(config.recursive());
        assert!(config.directory_only());
        assert!(config.bubble_events());
        assert!(!config.allow_overflow());
    }
}

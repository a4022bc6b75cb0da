//! The monitor base: configuration, lifecycle, and event dispatch.
//!
//! Every backend owns a [`MonitorBase`] holding the state common to all
//! monitors and implements the [`Monitor`] trait around it.  A monitor's
//! loop executes on the thread that calls [`Monitor::start`], which blocks
//! until another thread requests a stop through a [`MonitorHandle`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use watchfs_types::{Event, EventFlags};

use crate::config::MonitorConfig;
use crate::factory::MonitorType;
use crate::filter::{FilterChain, MonitorFilter};
use crate::path_utils;
use crate::{Error, ErrorKind, Result};

/// An idle cycle is this much of the configured latency.
const IDLE_FACTOR: f64 = 1.1;

/// The set of requirements for monitor callback implementations.
///
/// The callback is invoked synchronously from the thread running the
/// monitor loop, holding the notify lock, so concurrent backend threads
/// never interleave invocations.  The event slice is owned by the monitor
/// and valid only for the duration of the call.
///
/// # Example implementation
///
/// ```no_run
/// use watchfs::{Event, EventHandler};
///
/// /// Prints received batches
/// struct EventPrinter;
///
/// impl EventHandler for EventPrinter {
///     fn handle_events(&mut self, events: &[Event]) {
///         for event in events {
///             println!("{} {}", event.path.display(), event.flags);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + 'static {
    /// Handles one batch of events.
    fn handle_events(&mut self, events: &[Event]);
}

impl<F> EventHandler for F
where
    F: FnMut(&[Event]) + Send + 'static,
{
    fn handle_events(&mut self, events: &[Event]) {
        (self)(events);
    }
}

impl EventHandler for std::sync::mpsc::Sender<Vec<Event>> {
    fn handle_events(&mut self, events: &[Event]) {
        let _ = self.send(events.to_vec());
    }
}

#[cfg(feature = "crossbeam-channel")]
impl EventHandler for crossbeam_channel::Sender<Vec<Event>> {
    fn handle_events(&mut self, events: &[Event]) {
        let _ = self.send(events.to_vec());
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    should_stop: bool,
}

type StopWaker = Box<dyn Fn() + Send>;

/// State shared by every monitor implementation.
///
/// The run lock guards lifecycle state and the cooperative stop flag; the
/// notify lock serializes callback invocation.  Configuration is read by
/// the loop once per iteration, so mutators called while running take
/// effect at the next iteration.
pub struct MonitorBase {
    paths: RwLock<Vec<PathBuf>>,
    config: RwLock<MonitorConfig>,
    filters: RwLock<FilterChain>,
    permitted: RwLock<EventFlags>,
    properties: RwLock<HashMap<String, String>>,
    handler: Mutex<Box<dyn EventHandler>>,
    run: Mutex<RunState>,
    stop_waker: Mutex<Option<StopWaker>>,
    /// Milliseconds since the epoch of the last delivered batch.
    last_notification: AtomicU64,
}

impl MonitorBase {
    /// Creates the shared state for a monitor watching `paths`.
    ///
    /// Root paths are canonicalized before being stored.
    pub fn new(paths: Vec<PathBuf>, handler: Box<dyn EventHandler>) -> Result<Self> {
        let paths = paths
            .iter()
            .map(|path| path_utils::resolve_symlink(path))
            .collect();

        Ok(MonitorBase {
            paths: RwLock::new(paths),
            config: RwLock::new(MonitorConfig::default()),
            filters: RwLock::new(FilterChain::new()),
            permitted: RwLock::new(EventFlags::empty()),
            properties: RwLock::new(HashMap::new()),
            handler: Mutex::new(handler),
            run: Mutex::new(RunState::default()),
            stop_waker: Mutex::new(None),
            last_notification: AtomicU64::new(0),
        })
    }

    /// The canonicalized root paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.read().unwrap().clone()
    }

    /// Appends a root path.  Monitors pick new roots up at the next loop
    /// iteration; whether events are produced for it while running is
    /// backend-defined.
    pub fn add_path(&self, path: &Path) {
        self.paths
            .write()
            .unwrap()
            .push(path_utils::resolve_symlink(path));
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> MonitorConfig {
        *self.config.read().unwrap()
    }

    /// Replaces the configuration, rejecting negative latencies.
    pub fn set_config(&self, config: MonitorConfig) -> Result<()> {
        if config.latency() < 0.0 {
            return Err(Error::invalid_latency());
        }
        *self.config.write().unwrap() = config;
        Ok(())
    }

    /// Sets the latency in seconds.  Negative values are rejected and leave
    /// the monitor unchanged.
    pub fn set_latency(&self, latency: f64) -> Result<()> {
        if latency < 0.0 {
            return Err(Error::invalid_latency());
        }
        let mut config = self.config.write().unwrap();
        *config = config.with_latency(latency);
        Ok(())
    }

    /// Sets the recursive flag.
    pub fn set_recursive(&self, recursive: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_recursive(recursive);
    }

    /// Sets the follow-symlinks flag.
    pub fn set_follow_symlinks(&self, follow: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_follow_symlinks(follow);
    }

    /// Sets the directory-only flag.
    pub fn set_directory_only(&self, directory_only: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_directory_only(directory_only);
    }

    /// Sets the watch-access flag.
    pub fn set_watch_access(&self, watch_access: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_watch_access(watch_access);
    }

    /// Sets the allow-overflow flag.
    pub fn set_allow_overflow(&self, allow_overflow: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_allow_overflow(allow_overflow);
    }

    /// Sets the fire-idle-event flag.
    pub fn set_fire_idle_event(&self, fire_idle_event: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_fire_idle_event(fire_idle_event);
    }

    /// Sets the bubble-events flag.
    pub fn set_bubble_events(&self, bubble_events: bool) {
        let mut config = self.config.write().unwrap();
        *config = config.with_bubble_events(bubble_events);
    }

    /// Compiles and appends a path filter.
    pub fn add_filter(&self, filter: &MonitorFilter) -> Result<()> {
        self.filters.write().unwrap().add(filter)
    }

    /// Replaces the path filters.
    pub fn set_filters(&self, filters: &[MonitorFilter]) -> Result<()> {
        self.filters.write().unwrap().set(filters)
    }

    /// Permits an event type.  Once any type is permitted, events carrying
    /// none of the permitted flags are discarded.
    pub fn add_event_type_filter(&self, flag: EventFlags) {
        self.permitted.write().unwrap().insert(flag);
    }

    /// Replaces the permitted event-type mask.  The empty mask permits
    /// everything.
    pub fn set_event_type_filters(&self, permitted: EventFlags) {
        *self.permitted.write().unwrap() = permitted;
    }

    /// Sets a backend-specific property.
    pub fn set_property(&self, name: &str, value: &str) {
        self.properties
            .write()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    /// Reads a backend-specific property.
    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.read().unwrap().get(name).cloned()
    }

    /// Runs a path through the filter chain.
    pub fn accept_path(&self, path: &Path) -> bool {
        self.filters.read().unwrap().accept(path)
    }

    /// True while the monitor loop is executing.
    pub fn is_running(&self) -> bool {
        self.run.lock().unwrap().running
    }

    /// True once a stop has been requested.  Loops consult this at the top
    /// of every iteration.
    pub fn should_stop(&self) -> bool {
        self.run.lock().unwrap().should_stop
    }

    /// Requests a cooperative stop and fires the installed stop waker, if
    /// any.
    pub fn request_stop(&self) {
        let mut run = self.run.lock().unwrap();
        run.should_stop = true;

        if let Some(waker) = self.stop_waker.lock().unwrap().as_ref() {
            waker();
        }
    }

    /// Installs the hook fired by [`request_stop`](Self::request_stop).
    ///
    /// Backends whose loop cannot observe the stop flag cooperatively (the
    /// run-loop execution mode of the stream monitor) install a waker when
    /// entering their loop.  The waker is dropped when the run ends.
    pub fn install_stop_waker(&self, waker: StopWaker) {
        *self.stop_waker.lock().unwrap() = Some(waker);
    }

    pub(crate) fn begin_run(&self) -> Result<()> {
        let mut run = self.run.lock().unwrap();
        if run.running {
            return Err(Error::new(ErrorKind::MonitorAlreadyRunning));
        }
        run.running = true;
        run.should_stop = false;
        self.touch_last_notification();
        Ok(())
    }

    pub(crate) fn end_run(&self) {
        let mut run = self.run.lock().unwrap();
        run.running = false;
        run.should_stop = false;
        *self.stop_waker.lock().unwrap() = None;
    }

    /// Filters, bubbles, and delivers a batch of events.
    ///
    /// Order of operations: path filters, event-type mask (events keep only
    /// permitted flags and are dropped when none survive), optional
    /// bubbling, then callback invocation under the notify lock.  The
    /// last-notification timestamp advances only when something is
    /// delivered.
    pub fn notify_events(&self, events: Vec<Event>) {
        let config = self.config();
        let permitted = *self.permitted.read().unwrap();

        let mut events: Vec<Event> = {
            let filters = self.filters.read().unwrap();
            events
                .into_iter()
                .filter(|event| filters.accept(&event.path))
                .collect()
        };

        if !permitted.is_empty() {
            events = events
                .into_iter()
                .filter_map(|mut event| {
                    let kept = event.flags & permitted;
                    if kept.is_empty() {
                        return None;
                    }
                    event.flags = kept;
                    Some(event)
                })
                .collect();
        }

        if config.bubble_events() {
            events = bubble_events(events);
        }

        if events.is_empty() {
            return;
        }

        self.touch_last_notification();

        let mut handler = self.handler.lock().unwrap();
        handler.handle_events(&events);
    }

    /// Reports a backend queue overflow.
    ///
    /// With `allow_overflow` set, one event carrying the `Overflow` flag is
    /// delivered (bypassing filters) and the loop may continue; otherwise
    /// the overflow is fatal to the run.
    pub fn notify_overflow(&self, path: &Path) -> Result<()> {
        if !self.config().allow_overflow() {
            return Err(Error::new(ErrorKind::Overflow).add_path(path.to_path_buf()));
        }

        let event = Event::new(path, wall_clock_seconds(), EventFlags::OVERFLOW);
        self.touch_last_notification();
        self.handler.lock().unwrap().handle_events(&[event]);
        Ok(())
    }

    fn notify_idle(&self) {
        let event = Event::new("", wall_clock_seconds(), EventFlags::NO_OP);
        self.touch_last_notification();
        self.handler.lock().unwrap().handle_events(&[event]);
    }

    fn touch_last_notification(&self) {
        self.last_notification
            .store(wall_clock_millis(), Ordering::Relaxed);
    }

    fn millis_since_last_notification(&self) -> u64 {
        wall_clock_millis().saturating_sub(self.last_notification.load(Ordering::Relaxed))
    }
}

/// Merges contiguous events sharing the same `(time, path)` pair by
/// unioning their flags.
fn bubble_events(events: Vec<Event>) -> Vec<Event> {
    let mut merged: Vec<Event> = Vec::with_capacity(events.len());

    for event in events {
        match merged.last_mut() {
            Some(last) if last.time == event.time && last.path == event.path => {
                last.flags |= event.flags;
                if last.inode.is_none() {
                    last.inode = event.inode;
                }
            }
            _ => merged.push(event),
        }
    }

    merged
}

pub(crate) fn wall_clock_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A cloneable handle for controlling a monitor from other threads.
#[derive(Clone)]
pub struct MonitorHandle {
    base: Arc<MonitorBase>,
}

impl MonitorHandle {
    /// Requests a cooperative stop.  Returns immediately; the monitor
    /// leaves its loop within one latency interval.
    pub fn stop(&self) {
        self.base.request_stop();
    }

    /// True while the monitor loop is executing.
    pub fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// Type that continuously produces filesystem change notifications.
///
/// Implementations provide [`run`](Monitor::run), the backend loop; the
/// provided [`start`](Monitor::start) wraps it with lifecycle bookkeeping.
/// `start` blocks the calling thread until [`MonitorHandle::stop`] is
/// invoked from elsewhere, the loop faults, or, for backends that exhaust
/// their input, the loop ends on its own.
pub trait Monitor: Send {
    /// The shared monitor state.
    fn base(&self) -> &Arc<MonitorBase>;

    /// The backend kind of this monitor.
    fn kind(&self) -> MonitorType;

    /// Executes the monitoring loop.  Called from [`start`](Monitor::start)
    /// on its thread; must observe [`MonitorBase::should_stop`] at the top
    /// of every iteration or install a stop waker.
    fn run(&mut self) -> Result<()>;

    /// Marks the monitor running and executes the loop on this thread.
    ///
    /// Fails with `MonitorAlreadyRunning` when the monitor is already in
    /// the running state.  On return, every native resource acquired by the
    /// loop has been released.
    fn start(&mut self) -> Result<()> {
        self.base().begin_run()?;

        let idle_waiter = if self.base().config().fire_idle_event() {
            Some(IdleWaiter::spawn(Arc::clone(self.base())))
        } else {
            None
        };

        let result = self.run();
        self.base().end_run();

        if let Some(waiter) = idle_waiter {
            waiter.join();
        }

        result
    }

    /// A handle for stopping this monitor from another thread.
    fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            base: Arc::clone(self.base()),
        }
    }
}

/// Emits a synthetic `NoOp` event whenever an idle cycle elapses without a
/// notification.
struct IdleWaiter {
    thread: thread::JoinHandle<()>,
}

impl IdleWaiter {
    fn spawn(base: Arc<MonitorBase>) -> Self {
        let thread = thread::Builder::new()
            .name("watchfs idle waiter".to_string())
            .spawn(move || loop {
                let latency = base.config().latency().max(0.1);
                let idle_millis = (latency * IDLE_FACTOR * 1000.0) as u64;
                thread::sleep(Duration::from_millis(idle_millis));

                if !base.is_running() {
                    break;
                }

                if base.millis_since_last_notification() >= idle_millis {
                    base.notify_idle();
                }
            })
            // thread spawning only fails when the process is out of resources
            .expect("failed to spawn the idle waiter thread");

        IdleWaiter { thread }
    }

    fn join(self) {
        let _ = self.thread.join();
    }
}

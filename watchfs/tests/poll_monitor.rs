//! End-to-end scenarios driving the poll monitor through its public API.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use watchfs::{factory, Event, EventFlags, Monitor, MonitorFilter, MonitorHandle, MonitorType};

fn start_poll_monitor(
    root: PathBuf,
    filters: Vec<MonitorFilter>,
) -> (
    MonitorHandle,
    mpsc::Receiver<Vec<Event>>,
    thread::JoinHandle<watchfs::Result<()>>,
) {
    let (tx, rx) = mpsc::channel();
    let mut monitor = factory::create_monitor(MonitorType::Poll, vec![root], Box::new(tx)).unwrap();

    monitor.base().set_recursive(true);
    monitor.base().set_latency(1.0).unwrap();
    for filter in &filters {
        monitor.base().add_filter(filter).unwrap();
    }

    let handle = monitor.handle();
    let worker = thread::spawn(move || monitor.start());

    // give the initial scan time to settle
    thread::sleep(Duration::from_millis(500));

    (handle, rx, worker)
}

fn wait_for(
    rx: &mpsc::Receiver<Vec<Event>>,
    deadline: Duration,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        match rx.recv_timeout(Duration::from_millis(250)) {
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
fn poll_reports_create_then_delete() {
    let tmpdir = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(tmpdir.path()).unwrap();
    let (handle, rx, worker) = start_poll_monitor(root.clone(), vec![]);

    let path = root.join("a");
    std::fs::write(&path, b"1").unwrap();

    let created = wait_for(&rx, Duration::from_secs(10), |e| {
        e.path == path && e.flags.contains(EventFlags::CREATED)
    });
    assert!(created.is_some(), "no create event for {path:?}");

    std::fs::remove_file(&path).unwrap();

    let removed = wait_for(&rx, Duration::from_secs(10), |e| {
        e.path == path && e.flags.contains(EventFlags::REMOVED)
    });
    assert!(removed.is_some(), "no removal event for {path:?}");

    // batches are monotonic in time
    assert!(removed.unwrap().time >= created.unwrap().time);

    handle.stop();
    worker.join().unwrap().unwrap();
    assert!(!handle.is_running());
}

#[test]
fn include_filter_limits_reported_paths() {
    let tmpdir = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(tmpdir.path()).unwrap();

    let filters = vec![
        MonitorFilter::include(r"\.log$"),
        MonitorFilter::exclude(".*"),
    ];
    let (handle, rx, worker) = start_poll_monitor(root.clone(), filters);

    let log_file = root.join("a.log");
    let txt_file = root.join("a.txt");
    std::fs::write(&log_file, b"1").unwrap();
    std::fs::write(&txt_file, b"1").unwrap();

    let log_event = wait_for(&rx, Duration::from_secs(10), |e| {
        e.path == log_file && e.flags.contains(EventFlags::CREATED)
    });
    assert!(log_event.is_some(), "no event for {log_file:?}");

    // nothing for the excluded file in the following scans
    let txt_event = wait_for(&rx, Duration::from_millis(2500), |e| e.path == txt_file);
    assert!(txt_event.is_none(), "unexpected event: {txt_event:?}");

    handle.stop();
    worker.join().unwrap().unwrap();
}

//! Linux `/sys/class/gpio` line driver.
//!
//! Each open line gets a dedicated watcher thread. When the line exposes an
//! `edge` attribute the driver sets it to `both` and the thread sleeps until
//! the kernel flags `value` with a priority event. Without interrupt support
//! (or when the `value` file cannot be registered with epoll) the thread falls
//! back to reading `value` at a fixed interval. Handlers run on the watcher
//! thread, never under the subscription lock, so `cancel` can be called from
//! anywhere without deadlocking.
//!
//! The sysfs root is configurable so tests can point the driver at a
//! temporary directory laid out like `/sys/class/gpio`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use pulsebridge_types::{BridgeError, EdgeEvent, EdgeKind, LineId};
use tracing::{debug, warn};

use crate::line::{EdgeHandler, LineDriver, LineHandle, LineMode, SubscriptionHandle};

/// Default sysfs GPIO root on Linux.
pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// Default interval between two reads of `value` when edge interrupts are
/// unavailable.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

// How long to wait for udev to create `gpioN/` after an export.
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(10);

// Upper bound on how long an interrupt-driven watcher takes to notice `stop`.
const STOP_CHECK: Duration = Duration::from_millis(50);

struct Subscription {
    line: LineId,
    kind: EdgeKind,
    handler: EdgeHandler,
}

type Subscriptions = Arc<Mutex<HashMap<u64, Subscription>>>;

struct OpenLine {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    exported_by_us: bool,
}

/// Edge-reporting driver over the sysfs GPIO interface.
pub struct SysfsLineDriver {
    root: PathBuf,
    poll_interval: Duration,
    lines: Mutex<HashMap<LineId, OpenLine>>,
    subscriptions: Subscriptions,
    next_subscription: AtomicU64,
}

impl SysfsLineDriver {
    /// Create a driver rooted at [`DEFAULT_GPIO_ROOT`].
    pub fn new() -> Self {
        Self::with_root(DEFAULT_GPIO_ROOT)
    }

    /// Create a driver rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lines: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Override the fallback polling interval (builder-style).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn line_dir(&self, line: LineId) -> PathBuf {
        self.root.join(format!("gpio{line}"))
    }

    fn export(&self, line: LineId) -> Result<(), BridgeError> {
        write_attr(&self.root.join("export"), &line.to_string()).map_err(|details| {
            BridgeError::ResourceUnavailable { line, details }
        })?;
        let dir = self.line_dir(line);
        for _ in 0..EXPORT_SETTLE_ATTEMPTS {
            if dir.join("value").exists() {
                return Ok(());
            }
            thread::sleep(EXPORT_SETTLE_DELAY);
        }
        self.unexport(line);
        Err(BridgeError::ResourceUnavailable {
            line,
            details: format!("{} did not appear after export", dir.display()),
        })
    }

    fn unexport(&self, line: LineId) {
        if let Err(e) = write_attr(&self.root.join("unexport"), &line.to_string()) {
            warn!(line, error = %e, "failed to unexport gpio line");
        }
    }

    /// Configure an exported line as an input and start its watcher.
    fn watch(&self, line: LineId, exported_by_us: bool) -> Result<OpenLine, BridgeError> {
        let dir = self.line_dir(line);
        let direction = dir.join("direction");
        if direction.exists() {
            write_attr(&direction, "in")
                .map_err(|details| BridgeError::ResourceUnavailable { line, details })?;
        }

        let edge = dir.join("edge");
        let interrupts = edge.exists()
            && match write_attr(&edge, "both") {
                Ok(()) => true,
                Err(e) => {
                    warn!(line, error = %e, "edge interrupts unavailable, polling value");
                    false
                }
            };

        let value_path = dir.join("value");
        let initial = read_level(&value_path).ok_or_else(|| BridgeError::ResourceUnavailable {
            line,
            details: format!("cannot read {}", value_path.display()),
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = Watcher {
            line,
            value_path,
            interval: self.poll_interval,
            stop: Arc::clone(&stop),
            subscriptions: Arc::clone(&self.subscriptions),
            level: initial,
        };
        let worker = thread::Builder::new()
            .name(format!("gpio{line}-watch"))
            .spawn(move || watcher.run(interrupts))
            .map_err(|e| BridgeError::ResourceUnavailable {
                line,
                details: format!("cannot spawn watcher thread: {e}"),
            })?;

        debug!(line, initial, interrupts, "gpio line opened");
        Ok(OpenLine {
            stop,
            worker: Some(worker),
            exported_by_us,
        })
    }

    fn release(&self, line: LineId, mut open: OpenLine) {
        open.stop.store(true, Ordering::Release);
        // Joining lets a callback that is already running finish first.
        if let Some(worker) = open.worker.take()
            && worker.join().is_err()
        {
            warn!(line, "gpio watcher thread panicked");
        }
        self.subscriptions.lock().retain(|_, s| s.line != line);
        if open.exported_by_us {
            self.unexport(line);
        }
        debug!(line, "gpio line closed");
    }
}

impl Default for SysfsLineDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDriver for SysfsLineDriver {
    fn open_line(&self, line: LineId, mode: LineMode) -> Result<LineHandle, BridgeError> {
        if mode != LineMode::Input {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: format!("{mode:?} is not supported by sysfs (no bias control)"),
            });
        }

        let mut lines = self.lines.lock();
        if lines.contains_key(&line) {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: "line is already claimed".to_string(),
            });
        }

        let exported_by_us = if self.line_dir(line).join("value").exists() {
            false
        } else {
            self.export(line)?;
            true
        };

        match self.watch(line, exported_by_us) {
            Ok(open) => {
                lines.insert(line, open);
                Ok(LineHandle::new(line))
            }
            Err(e) => {
                if exported_by_us {
                    self.unexport(line);
                }
                Err(e)
            }
        }
    }

    fn on_edge(
        &self,
        handle: &LineHandle,
        kind: EdgeKind,
        handler: EdgeHandler,
    ) -> Result<SubscriptionHandle, BridgeError> {
        let line = handle.line();
        if !self.lines.lock().contains_key(&line) {
            return Err(BridgeError::ResourceUnavailable {
                line,
                details: "line is not open".to_string(),
            });
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscriptions
            .lock()
            .insert(id, Subscription { line, kind, handler });
        Ok(SubscriptionHandle::new(id))
    }

    fn cancel(&self, subscription: SubscriptionHandle) -> Result<(), BridgeError> {
        self.subscriptions.lock().remove(&subscription.id());
        Ok(())
    }

    fn close_line(&self, handle: LineHandle) -> Result<(), BridgeError> {
        let line = handle.line();
        let open = self.lines.lock().remove(&line);
        if let Some(open) = open {
            self.release(line, open);
        }
        Ok(())
    }
}

impl Drop for SysfsLineDriver {
    fn drop(&mut self) {
        let lines: Vec<(LineId, OpenLine)> = self.lines.get_mut().drain().collect();
        for (line, open) in lines {
            self.release(line, open);
        }
    }
}

/// Per-line watcher, owned by its thread.
struct Watcher {
    line: LineId,
    value_path: PathBuf,
    interval: Duration,
    stop: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    level: bool,
}

impl Watcher {
    fn run(mut self, interrupts: bool) {
        if interrupts {
            match self.wait_for_interrupts() {
                Ok(()) => return,
                Err(e) => {
                    debug!(line = self.line, error = %e, "edge interrupts unavailable, polling value");
                }
            }
        }
        self.poll();
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn poll(&mut self) {
        while !self.stopped() {
            // A partially written or unreadable value counts as "no change".
            if let Some(now) = read_level(&self.value_path) {
                self.observe(now, false);
            }
            thread::sleep(self.interval);
        }
    }

    /// Sleep on `POLLPRI` for `value`; sysfs raises it on every configured
    /// edge.
    #[cfg(target_os = "linux")]
    fn wait_for_interrupts(&mut self) -> io::Result<()> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let value = AsyncFd::with_interest(File::open(&self.value_path)?, Interest::PRIORITY)?;
            while !self.stopped() {
                let Ok(ready) = tokio::time::timeout(STOP_CHECK, value.ready(Interest::PRIORITY)).await
                else {
                    continue;
                };
                ready?.clear_ready();
                if let Some(now) = read_level_at(value.get_ref()) {
                    self.observe(now, true);
                }
            }
            Ok::<(), io::Error>(())
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_for_interrupts(&mut self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Deliver the edges implied by reading `now`. A notified read that finds
    /// the old level means a whole pulse passed between two reads.
    fn observe(&mut self, now: bool, notified: bool) {
        if now != self.level {
            self.level = now;
            self.deliver(edge_to(now));
        } else if notified {
            self.deliver(edge_to(!now));
            self.deliver(edge_to(now));
        }
    }

    fn deliver(&self, kind: EdgeKind) {
        let event = EdgeEvent {
            line: self.line,
            kind,
        };
        let handlers: Vec<EdgeHandler> = self
            .subscriptions
            .lock()
            .values()
            .filter(|s| s.line == event.line && s.kind == event.kind)
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

fn edge_to(level: bool) -> EdgeKind {
    if level { EdgeKind::Rising } else { EdgeKind::Falling }
}

fn parse_level(raw: &str) -> Option<bool> {
    match raw.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

fn read_level(path: &Path) -> Option<bool> {
    parse_level(&fs::read_to_string(path).ok()?)
}

// sysfs attributes must be re-read from offset 0 after each notification.
fn read_level_at(file: &File) -> Option<bool> {
    let mut buf = [0u8; 8];
    let n = file.read_at(&mut buf, 0).ok()?;
    parse_level(std::str::from_utf8(&buf[..n]).ok()?)
}

fn write_attr(path: &Path, value: &str) -> Result<(), String> {
    fs::write(path, value).map_err(|e| format!("write {} to {}: {e}", value, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn fake_gpio(line: LineId, level: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tmp dir");
        let gpio = dir.path().join(format!("gpio{line}"));
        fs::create_dir_all(&gpio).unwrap();
        fs::write(gpio.join("value"), level).unwrap();
        fs::write(gpio.join("direction"), "out").unwrap();
        dir
    }

    /// Emulate udev: create `gpio<line>/value` once the driver writes `export`.
    fn export_on_demand(root: &Path, line: LineId, level: &'static str) -> thread::JoinHandle<()> {
        let root = root.to_path_buf();
        thread::spawn(move || {
            for _ in 0..200 {
                if root.join("export").exists() {
                    let gpio = root.join(format!("gpio{line}"));
                    fs::create_dir_all(&gpio).unwrap();
                    fs::write(gpio.join("value.tmp"), level).unwrap();
                    fs::rename(gpio.join("value.tmp"), gpio.join("value")).unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    }

    fn driver(root: &Path) -> SysfsLineDriver {
        SysfsLineDriver::with_root(root).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn open_sets_direction_to_input() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();
        let direction = fs::read_to_string(dir.path().join("gpio18/direction")).unwrap();
        assert_eq!(direction, "in");
        driver.close_line(handle).unwrap();
    }

    #[test]
    fn open_missing_line_is_resource_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // No `export` attribute either: writing it creates a plain file but no
        // gpio directory ever appears.
        let driver = driver(dir.path());
        let result = driver.open_line(5, LineMode::Input);
        assert!(matches!(
            result,
            Err(BridgeError::ResourceUnavailable { line: 5, .. })
        ));
    }

    #[test]
    fn open_twice_is_rejected() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();
        assert!(driver.open_line(18, LineMode::Input).is_err());
        driver.close_line(handle).unwrap();
    }

    #[test]
    fn pull_modes_are_rejected() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        assert!(driver.open_line(18, LineMode::InputPullUp).is_err());
        assert!(driver.open_line(18, LineMode::InputPullDown).is_err());
    }

    #[test]
    fn level_changes_are_delivered_as_edges() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();

        let (tx, rx) = mpsc::channel();
        let rising_tx = tx.clone();
        driver
            .on_edge(
                &handle,
                EdgeKind::Rising,
                Arc::new(move |e: EdgeEvent| {
                    let _ = rising_tx.send(e);
                }),
            )
            .unwrap();
        driver
            .on_edge(
                &handle,
                EdgeKind::Falling,
                Arc::new(move |e: EdgeEvent| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();

        let value = dir.path().join("gpio18/value");
        fs::write(&value, "1").unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).expect("rising edge");
        assert_eq!(first, EdgeEvent::rising(18));

        fs::write(&value, "0").unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("falling edge");
        assert_eq!(second, EdgeEvent::falling(18));

        driver.close_line(handle).unwrap();
    }

    #[test]
    fn cancelled_handler_is_not_invoked() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();

        let (tx, rx) = mpsc::channel();
        let sub = driver
            .on_edge(
                &handle,
                EdgeKind::Rising,
                Arc::new(move |e: EdgeEvent| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        driver.cancel(sub).unwrap();
        driver.cancel(sub).unwrap();

        fs::write(dir.path().join("gpio18/value"), "1").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        driver.close_line(handle).unwrap();
    }

    #[test]
    fn close_does_not_unexport_preexisting_line() {
        let dir = fake_gpio(18, "0");
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();
        driver.close_line(handle).unwrap();
        assert!(!dir.path().join("unexport").exists());
        // Line can be claimed again after release.
        let handle = driver.open_line(18, LineMode::Input).unwrap();
        driver.close_line(handle).unwrap();
    }

    #[test]
    fn failed_open_unexports_line_it_exported() {
        let dir = tempfile::tempdir().unwrap();
        let udev = export_on_demand(dir.path(), 6, "garbage");
        let driver = driver(dir.path());

        let result = driver.open_line(6, LineMode::Input);
        udev.join().unwrap();

        assert!(matches!(
            result,
            Err(BridgeError::ResourceUnavailable { line: 6, .. })
        ));
        let unexported = fs::read_to_string(dir.path().join("unexport")).unwrap();
        assert_eq!(unexported, "6");
        // The failed open did not leave the line claimed.
        assert!(driver.lines.lock().is_empty());
    }

    #[test]
    fn drop_unexports_lines_it_exported() {
        let dir = tempfile::tempdir().unwrap();
        let udev = export_on_demand(dir.path(), 7, "0");
        let driver = driver(dir.path());

        let _handle = driver.open_line(7, LineMode::Input).unwrap();
        udev.join().unwrap();
        assert!(!dir.path().join("unexport").exists());

        drop(driver);
        let unexported = fs::read_to_string(dir.path().join("unexport")).unwrap();
        assert_eq!(unexported, "7");
    }

    #[test]
    fn open_requests_both_edges_and_still_reports_levels() {
        let dir = fake_gpio(18, "0");
        fs::write(dir.path().join("gpio18/edge"), "none").unwrap();
        let driver = driver(dir.path());
        let handle = driver.open_line(18, LineMode::Input).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("gpio18/edge")).unwrap(),
            "both"
        );

        // A plain file cannot be registered with epoll, so the watcher polls.
        let (tx, rx) = mpsc::channel();
        driver
            .on_edge(
                &handle,
                EdgeKind::Rising,
                Arc::new(move |e: EdgeEvent| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        fs::write(dir.path().join("gpio18/value"), "1").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("rising edge"),
            EdgeEvent::rising(18)
        );
        driver.close_line(handle).unwrap();
    }

    #[test]
    fn notification_without_level_change_is_a_whole_pulse() {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (id, kind) in [(1, EdgeKind::Rising), (2, EdgeKind::Falling)] {
            let seen = Arc::clone(&seen);
            subscriptions.lock().insert(
                id,
                Subscription {
                    line: 4,
                    kind,
                    handler: Arc::new(move |e: EdgeEvent| seen.lock().push(e.kind)),
                },
            );
        }
        let mut watcher = Watcher {
            line: 4,
            value_path: PathBuf::from("unused"),
            interval: Duration::from_millis(1),
            stop: Arc::new(AtomicBool::new(false)),
            subscriptions,
            level: false,
        };

        // Polled reads only report changes.
        watcher.observe(false, false);
        assert!(seen.lock().is_empty());

        watcher.observe(false, true);
        watcher.observe(true, true);
        assert_eq!(
            *seen.lock(),
            vec![EdgeKind::Rising, EdgeKind::Falling, EdgeKind::Rising]
        );
    }
}

//! Progress estimation for a device imaging run.
//!
//! The rootfs transfer dominates the run time. While it is in flight a
//! [`ProgressWatch`] polls the device for the stream offset of the process
//! writing the target partition and logs it as a `RootFS progress:` marker.
//! Other stages log their own markers. A front-end that wants a progress bar
//! installs a [`ProgressLayer`] into its `tracing` subscriber, which feeds
//! every log message to a [`ProgressReporter`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;
use regex::Regex;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::Layer;

use crate::device::{Device, Input};

/// Prefix of the marker carrying the estimated rootfs transfer fraction.
pub const ROOTFS_PROGRESS_MARKER: &str = "RootFS progress:";
/// Logged once the postinst program finished on the new root.
pub const POSTINSTALL_MARKER: &str = "Postinstall completed";
/// Logged for every unsuccessful poll while waiting for a reboot.
pub const REBOOT_WAIT_MARKER: &str = "Unable to get new boot_id";
/// Logged once the whole run succeeded.
pub const COMPLETED_MARKER: &str = "DeviceImager completed.";

/// Number of ticks of the rendered progress bar.
const BAR_TICKS: u64 = 1000;
/// How long we keep asking which process writes the target partition.
const PID_DISCOVERY_ATTEMPTS: u32 = 120;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Translates log markers into a monotonically non-decreasing fraction in `[0, 1]`.
///
/// There is a single writer (whatever feeds [`ProgressReporter::observe`]);
/// readers only load the value.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    // f64 bits
    fraction: AtomicU64,
}

fn rootfs_progress_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"RootFS progress: (\d+(?:\.\d+)?)").unwrap())
}

impl ProgressReporter {
    /// A reporter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current estimate.
    pub fn fraction(&self) -> f64 {
        f64::from_bits(self.fraction.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut prev = self.fraction.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(prev)).clamp(0.0, 1.0);
            let next = next.max(f64::from_bits(prev));
            match self.fraction.compare_exchange_weak(
                prev,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Update the estimate from one log message, returning the new value.
    pub fn observe(&self, message: &str) -> f64 {
        if let Some(m) = rootfs_progress_regex().captures(message) {
            if let Ok(v) = m[1].parse::<f64>() {
                self.update(|cur| cur.max(v));
            }
        }
        // Each of these moves half of the remaining distance.
        if message.contains(POSTINSTALL_MARKER) || message.contains(REBOOT_WAIT_MARKER) {
            self.update(|cur| cur + (1.0 - cur) / 2.0);
        }
        if message.contains(COMPLETED_MARKER) {
            self.update(|_| 1.0);
        }
        self.fraction()
    }
}

/// A [`tracing_subscriber::Layer`] that renders imaging progress as a bar.
#[derive(Clone)]
pub struct ProgressLayer {
    reporter: Arc<ProgressReporter>,
    bar: ProgressBar,
}

impl fmt::Debug for ProgressLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressLayer")
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

impl ProgressLayer {
    /// Render into a new bar on stderr.
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(BAR_TICKS))
    }

    /// Render into `bar`, which is resized to our tick count.
    pub fn with_bar(bar: ProgressBar) -> Self {
        bar.set_length(BAR_TICKS);
        Self {
            reporter: Arc::new(ProgressReporter::new()),
            bar,
        }
    }

    /// The reporter backing this layer.
    pub fn reporter(&self) -> Arc<ProgressReporter> {
        Arc::clone(&self.reporter)
    }
}

impl Default for ProgressLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for ProgressLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.0.is_empty() {
            return;
        }
        let f = self.reporter.observe(&visitor.0);
        self.bar.set_position((f * BAR_TICKS as f64) as u64);
        if f >= 1.0 {
            self.bar.finish();
        }
    }
}

/// Parse the `pos:` field of a `/proc/<pid>/fdinfo/<fd>` file.
pub(crate) fn parse_fdinfo_pos(fdinfo: &str) -> Option<u64> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"(?m)^pos:\s*(\d+)$").unwrap());
    regex.captures(fdinfo)?[1].parse().ok()
}

/// Polls the device for the progress of a write to a block device.
struct ProgressMonitor {
    device: Arc<dyn Device>,
    target: Utf8PathBuf,
    interval: Duration,
    stop: mpsc::Receiver<()>,
}

impl ProgressMonitor {
    /// Sleep for one interval; returns true if we were asked to stop.
    fn should_exit(&self) -> bool {
        !matches!(
            self.stop.recv_timeout(self.interval),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn run_cmd(&self, argv: &[&str]) -> Result<String> {
        Ok(self.device.run(argv, Input::Null)?.trim().to_string())
    }

    fn run(self) -> Result<()> {
        let target = self.target.as_str();
        let size: u64 = self
            .run_cmd(&["blockdev", "--getsize64", target])?
            .parse()
            .with_context(|| format!("Parsing block device size of {target}"))?;
        anyhow::ensure!(size > 0, "Block device {target} has zero size");

        let mut pid = None;
        for _ in 0..PID_DISCOVERY_ATTEMPTS {
            match self.run_cmd(&["lsof", "-t", target]) {
                Ok(out) => {
                    pid = out.lines().next().map(str::to_string);
                    if pid.is_some() {
                        break;
                    }
                }
                // lsof fails until something has the device open
                Err(e) => tracing::trace!("lsof: {e:#}"),
            }
            if self.should_exit() {
                return Ok(());
            }
        }
        let Some(pid) = pid else {
            tracing::debug!("No process writing to {target} found");
            return Ok(());
        };

        // The writer never seeks, so the offset of its stdout is the
        // number of bytes written.
        let fdinfo = format!("/proc/{pid}/fdinfo/1");
        loop {
            match self.run_cmd(&["cat", &fdinfo]) {
                Ok(out) => {
                    if let Some(pos) = parse_fdinfo_pos(&out) {
                        let fraction = (pos as f64 / size as f64).min(1.0);
                        tracing::info!("{ROOTFS_PROGRESS_MARKER} {fraction:.6}");
                    }
                }
                Err(e) => tracing::trace!("reading {fdinfo}: {e:#}"),
            }
            if self.should_exit() {
                return Ok(());
            }
        }
    }
}

/// Keeps a [`ProgressMonitor`] running on a background thread while alive.
///
/// Dropping the watch signals the monitor to stop and joins it.
#[derive(Debug)]
pub(crate) struct ProgressWatch {
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl ProgressWatch {
    pub(crate) fn start(device: Arc<dyn Device>, target: &Utf8Path) -> Result<Self> {
        Self::start_with_interval(device, target, POLL_INTERVAL)
    }

    pub(crate) fn start_with_interval(
        device: Arc<dyn Device>,
        target: &Utf8Path,
        interval: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let monitor = ProgressMonitor {
            device,
            target: target.to_owned(),
            interval,
            stop: rx,
        };
        let worker = std::thread::Builder::new()
            .name("progress-monitor".into())
            .spawn(move || monitor.run())
            .context("Spawning progress monitor")?;
        Ok(Self {
            stop: Some(tx),
            worker: Some(worker),
        })
    }
}

impl Drop for ProgressWatch {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join() {
            Ok(Ok(())) => {}
            // Progress is informational only
            Ok(Err(e)) => tracing::debug!("Progress monitor failed: {e:#}"),
            Err(_) => tracing::warn!("Progress monitor panicked"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::FakeDevice;

    #[test]
    fn test_reporter_postinstall() {
        let r = ProgressReporter::new();
        r.observe("RootFS progress: 0.50");
        r.observe("Postinstall completed.");
        assert_eq!(r.fraction(), 0.75);
    }

    #[test]
    fn test_reporter_monotonic() {
        let r = ProgressReporter::new();
        assert_eq!(r.observe("RootFS progress: 0.400000"), 0.4);
        assert_eq!(r.observe("RootFS progress: 0.2"), 0.4);
        assert_eq!(r.observe("something unrelated"), 0.4);
        assert_eq!(r.observe("RootFS progress: 1"), 1.0);
        let r = ProgressReporter::new();
        r.observe("Unable to get new boot_id, still waiting for reboot");
        assert_eq!(r.fraction(), 0.5);
        r.observe("Unable to get new boot_id, still waiting for reboot");
        assert_eq!(r.fraction(), 0.75);
        r.observe("DeviceImager completed.");
        assert_eq!(r.fraction(), 1.0);
        r.observe("RootFS progress: 0.1");
        assert_eq!(r.fraction(), 1.0);
    }

    #[test]
    fn test_layer() {
        use tracing_subscriber::layer::SubscriberExt;

        let layer = ProgressLayer::with_bar(ProgressBar::hidden());
        let reporter = layer.reporter();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("{ROOTFS_PROGRESS_MARKER} {:.6}", 0.5);
            tracing::info!("{POSTINSTALL_MARKER}.");
        });
        assert_eq!(reporter.fraction(), 0.75);
    }

    #[test]
    fn test_parse_fdinfo() {
        let fdinfo = indoc::indoc! { "
            pos:\t104857600
            flags:\t0100001
            mnt_id:\t25
            ino:\t1035
        " };
        assert_eq!(parse_fdinfo_pos(fdinfo), Some(104857600));
        assert_eq!(parse_fdinfo_pos("flags: 01\n"), None);
    }

    #[test]
    fn test_monitor() {
        let device = Arc::new(FakeDevice::new("/dev/sda3"));
        device.respond("blockdev --getsize64 /dev/sda5", "1000\n");
        device.respond("lsof -t /dev/sda5", "4242\n");
        device.respond("cat /proc/4242/fdinfo/1", "pos:\t500\nflags:\t01\n");
        let watch = ProgressWatch::start_with_interval(
            device.clone(),
            Utf8Path::new("/dev/sda5"),
            Duration::from_millis(5),
        )
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while device.count("cat /proc/4242/fdinfo/1") < 2 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(watch);
        let n = device.count("cat /proc/4242/fdinfo/1");
        std::thread::sleep(Duration::from_millis(50));
        // Stopped means stopped
        assert_eq!(device.count("cat /proc/4242/fdinfo/1"), n);
    }

    #[test]
    fn test_monitor_failure_is_contained() {
        let device = Arc::new(FakeDevice::new("/dev/sda3"));
        device.fail_matching("blockdev", usize::MAX);
        let watch = ProgressWatch::start_with_interval(
            device.clone(),
            Utf8Path::new("/dev/sda5"),
            Duration::from_millis(5),
        )
        .unwrap();
        drop(watch);
        assert_eq!(device.count("lsof"), 0);
    }
}

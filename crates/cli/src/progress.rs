//! Cargo-style progress output for tagsync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!   Connecting wt-abc123def456
//!      Planned 2 files from wt-abc123def456
//!  Downloading /data/wt-abc123def456/b.bin
//!       Synced wt-abc123def456: 2 files (1.20 MiB) in 3.21s
//! ```
//!
//! Everything written to the terminal, including tracing output, goes through
//! one [`MultiProgress`] so status lines never tear a progress bar.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tagsync_core::{EngineError, PlannedFile, SyncObserver, SyncReport, TransferPlan};
use tracing_subscriber::fmt::MakeWriter;

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SEARCHING: &str = "Searching";
    const FOUND: &str = "Found";
    const CONNECTING: &str = "Connecting";
    const UNREACHABLE: &str = "Unreachable";
    const FAILED: &str = "Failed";
    const CANCELLED: &str = "Cancelled";
    const PLANNED: &str = "Planned";
    const FRESH: &str = "Fresh";
    const DOWNLOADING: &str = "Downloading";
    const SYNCED: &str = "Synced";
    const FINISHED: &str = "Finished";
    const REFUSED: &str = "Refused";
    const ERASING: &str = "Erasing";
    const ERASED: &str = "Erased";
}

/// Print a cargo-style status line in `style`
fn print_styled(style: &console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

fn print_warning(status: &str, message: &str) {
    print_styled(&console::Style::new().yellow().bold(), status, message);
}

fn print_error(status: &str, message: &str) {
    print_styled(&console::Style::new().red().bold(), status, message);
}

/// Announce a LAN scan
pub fn searching(range: &impl std::fmt::Display) {
    print_status(Status::SEARCHING, &format!("for tags on LAN {range}"));
}

/// Announce the tags a scan turned up
pub fn found<S: AsRef<str>>(names: &[S]) {
    let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    print_status(Status::FOUND, &format!("{names:?}"));
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

fn file_bar(total: u64) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg:>12} [{bar:25.cyan/dim}] {pos}/{len} {prefix:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let pb = MULTI.add(ProgressBar::new(total));
    pb.set_style(style);
    pb.set_message("Syncing");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

struct DeviceProgress {
    start: Instant,
    bar: Option<ProgressBar>,
}

impl DeviceProgress {
    fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Renders engine progress on stderr
#[derive(Default)]
pub struct ConsoleObserver {
    devices: Mutex<HashMap<String, DeviceProgress>>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_device(&self, host: &str, f: impl FnOnce(&mut DeviceProgress)) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = devices.get_mut(host) {
            f(device);
        }
    }

    fn take_device(&self, host: &str) -> Option<DeviceProgress> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host)
    }
}

impl SyncObserver for ConsoleObserver {
    fn connecting(&self, host: &str) {
        print_status(Status::CONNECTING, host);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                host.to_string(),
                DeviceProgress {
                    start: Instant::now(),
                    bar: None,
                },
            );
    }

    fn failed(&self, host: &str, error: &EngineError) {
        if let Some(device) = self.take_device(host) {
            device.finish();
        }
        match error {
            EngineError::Cancelled => print_warning(Status::CANCELLED, host),
            EngineError::Connect { source, .. } => print_error(
                Status::UNREACHABLE,
                &format!("{host}: could not connect to host ({source})"),
            ),
            other => print_error(Status::FAILED, &other.to_string()),
        }
    }

    fn planned(&self, host: &str, plan: &TransferPlan) {
        if plan.is_empty() {
            print_status(Status::FRESH, &format!("{host}: nothing to download"));
            return;
        }
        print_status(
            Status::PLANNED,
            &format!("{} files from {host}", plan.len()),
        );
        self.with_device(host, |device| {
            device.bar = Some(file_bar(plan.len() as u64));
        });
    }

    fn downloading(&self, host: &str, file: &PlannedFile) {
        print_status(Status::DOWNLOADING, &file.remote_path);
        self.with_device(host, |device| {
            if let Some(bar) = &device.bar {
                bar.set_prefix(file.name.clone());
            }
        });
    }

    fn downloaded(&self, host: &str, _file: &PlannedFile, _bytes: u64) {
        self.with_device(host, |device| {
            if let Some(bar) = &device.bar {
                bar.inc(1);
            }
        });
    }

    fn download_failed(&self, host: &str, file: &PlannedFile, error: &str) {
        print_error(Status::FAILED, &format!("{}: {error}", file.remote_path));
        self.with_device(host, |device| {
            if let Some(bar) = &device.bar {
                bar.inc(1);
            }
        });
    }

    fn synced(&self, report: &SyncReport) {
        let elapsed = self
            .take_device(&report.host)
            .map(|device| {
                let elapsed = device.start.elapsed();
                device.finish();
                elapsed
            })
            .unwrap_or_default();
        let size = humansize::format_size(report.bytes(), humansize::BINARY);
        let elapsed = format_elapsed(elapsed);

        if report.is_complete() {
            print_status(
                Status::SYNCED,
                &format!(
                    "{}: {} files ({size}) in {elapsed}",
                    report.host,
                    report.downloaded.len()
                ),
            );
        } else {
            print_warning(
                Status::FINISHED,
                &format!(
                    "{}: {} downloaded, {} failed ({size}) in {elapsed}",
                    report.host,
                    report.downloaded.len(),
                    report.failed.len()
                ),
            );
        }
    }

    fn refused(&self, host: &str, pending: &TransferPlan) {
        self.take_device(host);
        print_warning(
            Status::REFUSED,
            &format!(
                "{host}: not all data have been downloaded ({} files pending), not erasing",
                pending.len()
            ),
        );
    }

    fn erasing(&self, host: &str) {
        print_warning(
            Status::ERASING,
            &format!("all collected data from tag {host}"),
        );
    }

    fn erased(&self, host: &str) {
        self.take_device(host);
        print_status(Status::ERASED, host);
    }
}

/// Tracing writer that prints above any active progress bars
pub struct ProgressWriter;

/// One formatted event, written out when dropped
pub struct SuspendedStderr(Vec<u8>);

impl std::io::Write for SuspendedStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SuspendedStderr {
    fn drop(&mut self) {
        if self.0.is_empty() {
            return;
        }
        MULTI.suspend(|| {
            let _ = std::io::stderr().write_all(&self.0);
        });
    }
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = SuspendedStderr;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendedStderr(Vec::new())
    }
}

//! Best-effort disk utilization monitor.
//!
//! Samples the io-ticks column of `/proc/diskstats` for the block device
//! backing the database directory and compares utilization over the sampling
//! window against the configured busy rate. The compactor consults
//! [`DiskIo::is_free`] before acting on a lower-threshold signal; an
//! upper-threshold signal ignores the monitor entirely.
//!
//! Where sampling is impossible (non-Linux hosts, missing permissions) the
//! monitor never starts and `is_free` stays `true`. Sampling errors stop the
//! monitor but never the database.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{Error, Result};

pub(crate) struct DiskIo {
    target_path: PathBuf,
    sampling_interval: Duration,
    busy_rate: f32,
    free: AtomicBool,
}

impl DiskIo {
    pub fn new(target_path: PathBuf, sampling_interval: Duration, busy_rate: f32) -> Self {
        Self {
            target_path,
            sampling_interval,
            busy_rate,
            free: AtomicBool::new(true),
        }
    }

    /// Whether the device currently has idle headroom. Defaults to `true`
    /// when sampling is unavailable.
    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::SeqCst)
    }

    /// Whether this host can be sampled at all.
    pub fn supported() -> bool {
        cfg!(target_os = "linux")
    }

    /// Sampling loop. Exits on shutdown, or on the first sampling error
    /// (fatal to the monitor only; `is_free` reverts to its permissive
    /// default).
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut last = match self.sample() {
            Ok(ticks) => ticks,
            Err(e) => {
                tracing::warn!(error = %e, "disk io monitor unavailable");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sampling_interval) => {}
                _ = shutdown.recv() => return,
            }

            match self.sample() {
                Ok(ticks) => {
                    let busy_ms = ticks.saturating_sub(last);
                    last = ticks;
                    let window_ms = self.sampling_interval.as_millis().max(1) as f32;
                    let utilization = busy_ms as f32 / window_ms;
                    let free = utilization < self.busy_rate;
                    if free != self.free.swap(free, Ordering::SeqCst) {
                        tracing::debug!(utilization, free, "disk io state changed");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "disk io sampling failed, monitor stopped");
                    self.free.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Milliseconds the backing device has spent doing IO since boot.
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Result<u64> {
        let (major, minor) = device_of(&self.target_path)?;
        let stats = std::fs::read_to_string("/proc/diskstats")?;
        parse_io_ticks(&stats, major, minor).ok_or_else(|| {
            Error::InvalidData(format!(
                "device {major}:{minor} not present in /proc/diskstats"
            ))
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Result<u64> {
        Err(Error::InvalidData(
            "disk io sampling is only supported on linux".to_string(),
        ))
    }
}

/// Major/minor numbers of the device holding `path`.
#[cfg(target_os = "linux")]
fn device_of(path: &std::path::Path) -> Result<(u32, u32)> {
    use std::os::linux::fs::MetadataExt;

    let meta = std::fs::metadata(path)?;
    let dev = meta.st_dev();
    Ok((libc::major(dev), libc::minor(dev)))
}

/// Extracts the io-ticks field (ms spent doing IO, the 13th column) for the
/// given device from `/proc/diskstats` content.
fn parse_io_ticks(stats: &str, major: u32, minor: u32) -> Option<u64> {
    for line in stats.lines() {
        let mut fields = line.split_whitespace();
        let line_major: u32 = fields.next()?.parse().ok()?;
        let line_minor: u32 = fields.next()?.parse().ok()?;
        if line_major != major || line_minor != minor {
            continue;
        }
        // Skip the device name and nine stat columns to reach io_ticks.
        return fields.nth(10).and_then(|f| f.parse().ok());
    }
    None
}

//! Periodic VRAM and RAM usage reporting.
//!
//! The monitor runs as a background tokio task and logs one line per interval. It only reads
//! the GPU probe and host memory counters; it never touches the cache.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::CacheConfig;
use crate::gpu::{GpuMemoryInfo, GpuMemoryProbe, bytes_to_mb};

/// Errors returned when starting or stopping the monitor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// `start` was called while the monitor task is alive.
    #[error("Resource monitor is already running")]
    AlreadyRunning,

    /// `stop` was called while no monitor task is alive.
    #[error("Resource monitor is not running")]
    NotRunning,

    /// The reporting interval is zero.
    #[error("Invalid monitor interval: must be greater than 0")]
    InvalidInterval,
}

/// System-wide memory, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemMemory {
    /// Installed memory.
    pub total: u64,
    /// Memory not available to new allocations.
    pub used: u64,
}

/// One monitor reading. Fields are `None` when the source could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSample {
    /// GPU memory.
    pub vram: Option<GpuMemoryInfo>,
    /// Resident set size of this process.
    pub process_rss: Option<u64>,
    /// System memory.
    pub system: Option<SystemMemory>,
}

impl ResourceSample {
    /// Reads the probe and refreshes the process and system memory counters in `host`.
    #[must_use]
    pub fn collect(probe: &dyn GpuMemoryProbe, host: &mut System) -> Self {
        let vram = match probe.memory_info() {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(error = %e, "Monitor VRAM query failed");
                None
            }
        };
        Self {
            vram,
            process_rss: process_rss(host),
            system: system_memory(host),
        }
    }
}

impl fmt::Display for ResourceSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[monitor] VRAM: ")?;
        match self.vram {
            Some(info) => write!(f, "{:.0}/{:.0}MB", info.used_mb(), info.total_mb())?,
            None => f.write_str("n/a")?,
        }
        f.write_str(" | RAM (process): ")?;
        match self.process_rss {
            Some(rss) => write!(f, "{:.0}MB", bytes_to_mb(rss))?,
            None => f.write_str("n/a")?,
        }
        f.write_str(" | RAM (system): ")?;
        match self.system {
            Some(mem) => write!(
                f,
                "{:.0}/{:.0}MB",
                bytes_to_mb(mem.used),
                bytes_to_mb(mem.total)
            ),
            None => f.write_str("n/a"),
        }
    }
}

/// Background task that logs resource usage every interval.
pub struct ResourceMonitor {
    probe: Arc<dyn GpuMemoryProbe>,
    interval: Duration,
    /// Shutdown signal sender.
    shutdown_tx: Option<watch::Sender<()>>,
    task: Option<JoinHandle<()>>,
    reports: Arc<AtomicU64>,
    latest: Arc<Mutex<Option<ResourceSample>>>,
}

impl ResourceMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new(probe: Arc<dyn GpuMemoryProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            shutdown_tx: None,
            task: None,
            reports: Arc::new(AtomicU64::new(0)),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a stopped monitor reporting at the configured interval.
    #[must_use]
    pub fn from_config(probe: Arc<dyn GpuMemoryProbe>, config: &CacheConfig) -> Self {
        Self::new(probe, config.monitor_interval())
    }

    /// Starts reporting in a background task. Must be called within a tokio runtime.
    ///
    /// The first report is made one interval after start.
    ///
    /// # Errors
    /// Returns `MonitorError::AlreadyRunning` if the task is alive, or
    /// `MonitorError::InvalidInterval` for a zero interval.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.is_running() {
            warn!("Resource monitor already running");
            return Err(MonitorError::AlreadyRunning);
        }
        if self.interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        self.shutdown_tx = Some(shutdown_tx);

        let probe = Arc::clone(&self.probe);
        let period = self.interval;
        let reports = Arc::clone(&self.reports);
        let latest = Arc::clone(&self.latest);

        self.task = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut host = System::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Resource monitor shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        let sample = ResourceSample::collect(probe.as_ref(), &mut host);
                        info!("{sample}");
                        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
                        reports.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));

        info!(
            interval_secs = period.as_secs_f64(),
            "Resource monitor started"
        );
        Ok(())
    }

    /// Signals the task to stop and waits for it to exit.
    ///
    /// # Errors
    /// Returns `MonitorError::NotRunning` if the monitor was not started.
    pub async fn stop(&mut self) -> Result<(), MonitorError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(MonitorError::NotRunning);
        };
        let _ = shutdown_tx.send(());

        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Resource monitor task ended abnormally");
        }
        info!("Resource monitor stopped");
        Ok(())
    }

    /// Whether the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Number of reports logged since creation.
    #[must_use]
    pub fn report_count(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    /// The most recent reading, if any report has been made.
    #[must_use]
    pub fn latest(&self) -> Option<ResourceSample> {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("probe", &self.probe.name())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("reports", &self.report_count())
            .finish()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn process_rss(host: &mut System) -> Option<u64> {
    let pid: Pid = sysinfo::get_current_pid().ok()?;
    host.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    host.process(pid).map(sysinfo::Process::memory)
}

fn system_memory(host: &mut System) -> Option<SystemMemory> {
    host.refresh_memory();
    let total = host.total_memory();
    if total == 0 {
        return None;
    }
    Some(SystemMemory {
        total,
        used: total.saturating_sub(host.available_memory()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedGpu;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_collect_reads_host_memory() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let gpu = SimulatedGpu::with_mib(1024);
        let mut host = System::new();

        let sample = ResourceSample::collect(&gpu, &mut host);

        assert_eq!(sample.vram.unwrap().total, 1024 * MIB);
        assert!(sample.process_rss.is_some_and(|rss| rss > 0));
        let system = sample.system.unwrap();
        assert!(system.total > 0);
        assert!(system.used <= system.total);
    }

    #[test]
    fn test_sample_display() {
        let sample = ResourceSample {
            vram: Some(GpuMemoryInfo {
                total: 8192 * MIB,
                used: 1024 * MIB,
                free: 7168 * MIB,
            }),
            process_rss: Some(300 * MIB),
            system: Some(SystemMemory {
                total: 16000 * MIB,
                used: 4000 * MIB,
            }),
        };
        assert_eq!(
            sample.to_string(),
            "[monitor] VRAM: 1024/8192MB | RAM (process): 300MB | RAM (system): 4000/16000MB"
        );

        let empty = ResourceSample {
            vram: None,
            process_rss: None,
            system: None,
        };
        assert_eq!(
            empty.to_string(),
            "[monitor] VRAM: n/a | RAM (process): n/a | RAM (system): n/a"
        );
    }

    #[test]
    fn test_collect_tolerates_probe_failure() {
        let gpu = SimulatedGpu::with_mib(1024);
        gpu.set_failing(true);
        let sample = ResourceSample::collect(&gpu, &mut System::new());
        assert!(sample.vram.is_none());
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let gpu = Arc::new(SimulatedGpu::with_mib(4096));
        let mut monitor = ResourceMonitor::new(gpu, Duration::from_millis(10));
        assert!(!monitor.is_running());

        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.start(), Err(MonitorError::AlreadyRunning));

        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await.unwrap();

        assert!(!monitor.is_running());
        assert!(monitor.report_count() >= 1);
        let latest = monitor.latest().unwrap();
        assert_eq!(latest.vram.unwrap().total, 4096 * MIB);

        assert_eq!(monitor.stop().await, Err(MonitorError::NotRunning));
    }

    #[test]
    fn test_monitor_interval_from_config() {
        let config = CacheConfig {
            monitor_interval_secs: 5,
            ..CacheConfig::default()
        };
        let gpu = Arc::new(SimulatedGpu::with_mib(1));
        let monitor = ResourceMonitor::from_config(gpu, &config);
        assert_eq!(monitor.interval, Duration::from_secs(5));
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_monitor_rejects_zero_interval() {
        let gpu = Arc::new(SimulatedGpu::with_mib(1));
        let mut monitor = ResourceMonitor::new(gpu, Duration::ZERO);
        assert_eq!(monitor.start(), Err(MonitorError::InvalidInterval));
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_monitor_restart() {
        let gpu = Arc::new(SimulatedGpu::with_mib(64));
        let mut monitor = ResourceMonitor::new(gpu, Duration::from_millis(5));
        monitor.start().unwrap();
        monitor.stop().await.unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop().await.unwrap();
    }
}

//! # System Telemetry Probe
//!
//! Samples CPU and memory usage on a background interval and keeps a short
//! history for the observability endpoints. Strictly read-only with respect
//! to the recognition pipeline: nothing on the data path consults it.
//!
//! CPU usage comes from the delta between two `/proc/stat` readings; memory
//! from `/proc/meminfo` and the process RSS from `/proc/self/status`. On
//! non-Linux hosts every reading reports as unavailable rather than failing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const HISTORY_LEN: usize = 60;

/// Aggregate CPU jiffies from one `/proc/stat` reading.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    cpu_percent: f32,
    cpu_history: VecDeque<f32>,
    last_cpu: Option<CpuTimes>,
    total_memory_bytes: u64,
    used_memory_bytes: u64,
    process_rss_bytes: u64,
}

/// Point-in-time view handed to the health endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorSnapshot {
    pub cpu_percent: f32,
    pub cpu_history: Vec<f32>,
    pub memory_percent: f32,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub process_rss_bytes: u64,
    /// No portable GPU probe is wired in; reported for operator clarity.
    pub gpu_available: bool,
}

/// CPU/memory sampler with a bounded usage history.
pub struct SystemMonitor {
    inner: Mutex<MonitorState>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorState::default()),
        }
    }

    /// Take one sample. Called by the background task; also safe to call
    /// directly (the health endpoint does so when no sample exists yet).
    pub fn sample(&self) {
        let cpu = read_cpu_times();
        let memory = read_memory();
        let rss = read_process_rss();

        let mut state = self.inner.lock().unwrap();

        if let Some(current) = cpu {
            if let Some(previous) = state.last_cpu {
                let busy = current.busy.saturating_sub(previous.busy);
                let total = current.total.saturating_sub(previous.total);
                if total > 0 {
                    state.cpu_percent = (busy as f32 / total as f32) * 100.0;
                    if state.cpu_history.len() >= HISTORY_LEN {
                        state.cpu_history.pop_front();
                    }
                    let percent = state.cpu_percent;
                    state.cpu_history.push_back(percent);
                }
            }
            state.last_cpu = Some(current);
        }

        if let Some((total, used)) = memory {
            state.total_memory_bytes = total;
            state.used_memory_bytes = used;
        }
        if let Some(rss) = rss {
            state.process_rss_bytes = rss;
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.inner.lock().unwrap();
        let memory_percent = if state.total_memory_bytes > 0 {
            (state.used_memory_bytes as f32 / state.total_memory_bytes as f32) * 100.0
        } else {
            0.0
        };
        MonitorSnapshot {
            cpu_percent: state.cpu_percent,
            cpu_history: state.cpu_history.iter().copied().collect(),
            memory_percent,
            total_memory_bytes: state.total_memory_bytes,
            used_memory_bytes: state.used_memory_bytes,
            process_rss_bytes: state.process_rss_bytes,
            gpu_available: false,
        }
    }

    /// Spawn the periodic sampler.
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.sample();
                debug!(
                    cpu_percent = monitor.snapshot().cpu_percent,
                    "telemetry sample"
                );
            }
        });
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_proc_stat(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
fn read_memory() -> Option<(u64, u64)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

#[cfg(not(target_os = "linux"))]
fn read_memory() -> Option<(u64, u64)> {
    None
}

#[cfg(target_os = "linux")]
fn read_process_rss() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn read_process_rss() -> Option<u64> {
    None
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Busy time excludes `idle` and `iowait`; total is the sum of all fields.
fn parse_proc_stat(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Extract (total, used) bytes from `/proc/meminfo`.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }
    let total = total_kb? * 1024;
    let available = available_kb.unwrap_or(0) * 1024;
    Some((total, total.saturating_sub(available)))
}

/// Extract the resident set size in bytes from `/proc/self/status`.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_proc_stat(stat).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 150);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        let (total, used) = parse_meminfo(meminfo).unwrap();
        assert_eq!(total, 16_384_000 * 1024);
        assert_eq!(used, (16_384_000 - 8_192_000) * 1024);
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tvoicebridge\nVmSize:\t  200000 kB\nVmRSS:\t   50000 kB\n";
        assert_eq!(parse_vm_rss(status), Some(50_000 * 1024));
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        let monitor = SystemMonitor::new();
        {
            let mut state = monitor.inner.lock().unwrap();
            state.last_cpu = Some(CpuTimes {
                busy: 100,
                total: 1000,
            });
        }
        // A second reading is folded against the stored one when sampling on
        // Linux; emulate the arithmetic directly for portability.
        let current = CpuTimes {
            busy: 200,
            total: 1200,
        };
        let previous = CpuTimes {
            busy: 100,
            total: 1000,
        };
        let percent =
            (current.busy - previous.busy) as f32 / (current.total - previous.total) as f32 * 100.0;
        assert!((percent - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_snapshot_without_samples() {
        let monitor = SystemMonitor::new();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.cpu_percent, 0.0);
        assert_eq!(snapshot.memory_percent, 0.0);
        assert!(!snapshot.gpu_available);
    }
}

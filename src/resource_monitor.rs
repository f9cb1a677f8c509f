// =============================================================================
// Resource Monitor — process resource sampling and pressure flags
// =============================================================================
//
// Samples CPU, memory, thread count, and open file descriptors from /proc
// every ~5 seconds. Two pressure levels:
//
//   * over budget (CPU > 80%, memory > 85%, or threads > 50) — the engine
//     runs an optimization pass (cache clearing, history truncation) at most
//     once per `optimization_interval`.
//   * hard cap (CPU > 90% or memory > 95%) — the engine skips the cycle.
//
// On platforms without /proc the sampler degrades to zeros and never flags
// pressure.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Budget thresholds.
const CPU_BUDGET_PCT: f64 = 80.0;
const MEMORY_BUDGET_PCT: f64 = 85.0;
const THREAD_BUDGET: u64 = 50;

/// Hard caps that skip a trading cycle outright.
const CPU_HARD_CAP_PCT: f64 = 90.0;
const MEMORY_HARD_CAP_PCT: f64 = 95.0;

/// Sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// One resource sample.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub threads: u64,
    pub open_files: u64,
    pub ts_ms: i64,
}

impl ResourceSample {
    pub fn over_budget(&self) -> bool {
        self.cpu_pct > CPU_BUDGET_PCT
            || self.memory_pct > MEMORY_BUDGET_PCT
            || self.threads > THREAD_BUDGET
    }

    pub fn over_hard_cap(&self) -> bool {
        self.cpu_pct > CPU_HARD_CAP_PCT || self.memory_pct > MEMORY_HARD_CAP_PCT
    }
}

/// Shared latest-sample holder plus the background sampling loop.
pub struct ResourceMonitor {
    latest: RwLock<ResourceSample>,
    /// CPU accounting state from the previous sample.
    last_cpu: RwLock<Option<(u64, std::time::Instant)>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(ResourceSample::default()),
            last_cpu: RwLock::new(None),
        }
    }

    pub fn latest(&self) -> ResourceSample {
        *self.latest.read()
    }

    /// Whether the hard safety cap says to skip this trading cycle.
    pub fn should_skip_cycle(&self) -> bool {
        self.latest.read().over_hard_cap()
    }

    pub fn over_budget(&self) -> bool {
        self.latest.read().over_budget()
    }

    /// Take one sample now.
    pub fn sample(&self) -> ResourceSample {
        let sample = ResourceSample {
            cpu_pct: self.sample_cpu_pct().unwrap_or(0.0),
            memory_pct: sample_memory_pct().unwrap_or(0.0),
            threads: sample_threads().unwrap_or(0),
            open_files: sample_open_files().unwrap_or(0),
            ts_ms: crate::types::now_ms(),
        };
        *self.latest.write() = sample;
        sample
    }

    /// Background loop: sample until `stop` fires.
    pub async fn run(self: Arc<Self>, stop: Arc<Notify>) {
        info!("resource monitor started");
        loop {
            let sample = self.sample();
            if sample.over_hard_cap() {
                warn!(
                    cpu = sample.cpu_pct,
                    memory = sample.memory_pct,
                    "resource hard cap exceeded"
                );
            } else if sample.over_budget() {
                debug!(
                    cpu = sample.cpu_pct,
                    memory = sample.memory_pct,
                    threads = sample.threads,
                    "resource budget exceeded"
                );
            }

            tokio::select! {
                _ = stop.notified() => break,
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            }
        }
        info!("resource monitor stopped");
    }

    /// Process CPU usage since the previous call, as a percentage of one
    /// core.
    fn sample_cpu_pct(&self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Fields 14 and 15 (1-based, after the parenthesised comm) are
        // utime/stime in clock ticks.
        let after_comm = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let total_ticks = utime + stime;
        let now = std::time::Instant::now();

        let mut last = self.last_cpu.write();
        let pct = match *last {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let tick_hz = 100.0;
                    let used = (total_ticks.saturating_sub(prev_ticks)) as f64 / tick_hz;
                    (used / elapsed * 100.0).min(100.0 * num_cpus::get() as f64)
                }
            }
            None => 0.0,
        };
        *last = Some((total_ticks, now));
        Some(pct)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_memory_pct() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let rss_kb: f64 = field_kb(&status, "VmRSS:")?;

    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total_kb: f64 = field_kb(&meminfo, "MemTotal:")?;

    if total_kb > 0.0 {
        Some(rss_kb / total_kb * 100.0)
    } else {
        None
    }
}

fn sample_threads() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("Threads:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn sample_open_files() -> Option<u64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count() as u64)
}

fn field_kb(haystack: &str, field: &str) -> Option<f64> {
    haystack
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_flags_follow_thresholds() {
        let calm = ResourceSample {
            cpu_pct: 10.0,
            memory_pct: 20.0,
            threads: 12,
            open_files: 30,
            ts_ms: 0,
        };
        assert!(!calm.over_budget());
        assert!(!calm.over_hard_cap());

        let busy = ResourceSample {
            cpu_pct: 85.0,
            ..calm
        };
        assert!(busy.over_budget());
        assert!(!busy.over_hard_cap());

        let critical = ResourceSample {
            cpu_pct: 95.0,
            ..calm
        };
        assert!(critical.over_hard_cap());

        let thready = ResourceSample {
            threads: 80,
            ..calm
        };
        assert!(thready.over_budget());
        assert!(!thready.over_hard_cap());
    }

    #[test]
    fn sampling_populates_latest() {
        let monitor = ResourceMonitor::new();
        let sample = monitor.sample();
        // On Linux these are live readings; elsewhere they degrade to zero.
        assert!(sample.memory_pct >= 0.0);
        assert!(sample.cpu_pct >= 0.0);
        assert_eq!(monitor.latest().ts_ms, sample.ts_ms);
    }

    #[test]
    fn first_cpu_sample_is_zero() {
        let monitor = ResourceMonitor::new();
        let first = monitor.sample();
        assert_eq!(first.cpu_pct, 0.0);
    }
}

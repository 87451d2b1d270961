//! Host system sampler: CPU, memory, and network counters from `/proc`.
//!
//! Rates and percentages are deltas against the previous sample; the first
//! sample after startup reports zero rates.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::proto::SystemMetric;

/// Cumulative CPU jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn busy(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }
}

#[derive(Debug, Clone, Copy)]
struct RawSample {
    cpu: CpuTimes,
    rx_bytes: u64,
    tx_bytes: u64,
    taken_at: Instant,
}

/// Stateful sampler; keep one instance per agent and call
/// [`SystemSampler::sample`] on the metrics cadence.
#[derive(Debug, Default)]
pub struct SystemSampler {
    prev: Option<RawSample>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one sample and compute deltas against the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error when `/proc` files are unreadable or malformed.
    pub fn sample(&mut self) -> Result<SystemMetric> {
        let stat = std::fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        let net_dev = std::fs::read_to_string("/proc/net/dev").context("reading /proc/net/dev")?;
        self.sample_from(&stat, &meminfo, &net_dev)
    }

    /// Pure computation over pre-read `/proc` contents (unit-testable).
    fn sample_from(&mut self, stat: &str, meminfo: &str, net_dev: &str) -> Result<SystemMetric> {
        let cpu = parse_proc_stat(stat).context("parsing /proc/stat")?;
        let (mem_total, mem_available) = parse_meminfo(meminfo).context("parsing /proc/meminfo")?;
        let (rx_bytes, tx_bytes) = parse_net_dev(net_dev);

        let now = Instant::now();
        let mut metric = SystemMetric {
            ts_unix: Utc::now().timestamp(),
            mem_total,
            mem_used: mem_total.saturating_sub(mem_available),
            rx_bytes,
            tx_bytes,
            ..SystemMetric::default()
        };
        if mem_total > 0 {
            metric.mem_pct = metric.mem_used as f64 / mem_total as f64 * 100.0;
        }

        if let Some(prev) = self.prev {
            let total_delta = cpu.total().saturating_sub(prev.cpu.total());
            if total_delta > 0 {
                let pct = |delta: u64| delta as f64 / total_delta as f64 * 100.0;
                metric.cpu_pct = pct(cpu.busy().saturating_sub(prev.cpu.busy()));
                metric.cpu_user =
                    pct((cpu.user + cpu.nice).saturating_sub(prev.cpu.user + prev.cpu.nice));
                metric.cpu_sys = pct(cpu.system.saturating_sub(prev.cpu.system));
                metric.cpu_iowait = pct(cpu.iowait.saturating_sub(prev.cpu.iowait));
            }

            let elapsed = now.duration_since(prev.taken_at).as_secs_f64();
            if elapsed > 0.0 {
                metric.rx_rate = rx_bytes.saturating_sub(prev.rx_bytes) as f64 / elapsed;
                metric.tx_rate = tx_bytes.saturating_sub(prev.tx_bytes) as f64 / elapsed;
            }
        }

        self.prev = Some(RawSample {
            cpu,
            rx_bytes,
            tx_bytes,
            taken_at: now,
        });
        Ok(metric)
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
fn parse_proc_stat(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("no aggregate cpu line")?;
    let mut fields = line.split_whitespace().skip(1);
    let mut next = || -> u64 {
        fields
            .next()
            .and_then(|f| f.parse().ok())
            .unwrap_or_default()
    };
    Ok(CpuTimes {
        user: next(),
        nice: next(),
        system: next(),
        idle: next(),
        iowait: next(),
        irq: next(),
        softirq: next(),
        steal: next(),
    })
}

/// Extract `MemTotal` and `MemAvailable` (bytes) from `/proc/meminfo`.
fn parse_meminfo(meminfo: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    let total = total.context("no MemTotal")? * 1024;
    let available = available.context("no MemAvailable")? * 1024;
    Ok((total, available))
}

/// Sum rx/tx byte counters across non-loopback interfaces.
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in net_dev.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // Receive bytes is field 0, transmit bytes is field 8.
        if fields.len() >= 9 {
            rx += fields[0].parse::<u64>().unwrap_or(0);
            tx += fields[8].parse::<u64>().unwrap_or(0);
        }
    }
    (rx, tx)
}

//! Best-effort CPU pacing and the hard RSS ceiling.
//!
//! Writers call [`ResourceMonitor::tick`] after every chunk; every K chunks
//! the monitor samples process CPU time and resident set size. A CPU ratio
//! above the target earns a proportional sleep, bounded by one progress
//! interval. An RSS observation above the configured limit is fatal.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::guard;
use crate::Error;

/// Chunks between samples.
const SAMPLE_EVERY: u32 = 32;

#[derive(Debug)]
pub(crate) struct ResourceMonitor {
    cpu: Option<CpuThrottle>,
    ram_limit: Option<u64>,
    ticks: u32,
    rss_unavailable_warned: bool,
}

impl ResourceMonitor {
    /// `shares` divides the CPU sleep between concurrent writers so the
    /// process-wide pause stays proportional.
    pub(crate) fn new(
        cpu_percent: Option<u8>,
        ram_limit: Option<u64>,
        max_pause: Duration,
        shares: u32,
    ) -> Self {
        Self {
            cpu: cpu_percent.map(|percent| CpuThrottle::new(percent, max_pause, shares)),
            ram_limit,
            ticks: 0,
            rss_unavailable_warned: false,
        }
    }

    /// Account one chunk; sample and pace every [`SAMPLE_EVERY`] chunks.
    pub(crate) async fn tick(&mut self) -> Result<(), Error> {
        self.ticks += 1;
        if self.ticks % SAMPLE_EVERY != 0 {
            return Ok(());
        }

        if let Some(limit) = self.ram_limit {
            match guard::rss_bytes() {
                Some(observed) if observed > limit => {
                    return Err(Error::RamLimit { observed, limit });
                }
                Some(_) => {}
                None if !self.rss_unavailable_warned => {
                    self.rss_unavailable_warned = true;
                    warn!("RSS reporting unavailable; RAM limit not enforced");
                }
                None => {}
            }
        }

        if let Some(cpu) = &mut self.cpu {
            cpu.pace().await;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CpuThrottle {
    /// Target busy ratio in (0, 1).
    target: f64,
    max_pause: Duration,
    shares: u32,
    last_wall: Instant,
    last_cpu: Duration,
}

impl CpuThrottle {
    fn new(percent: u8, max_pause: Duration, shares: u32) -> Self {
        Self {
            target: f64::from(percent) / 100.0,
            max_pause,
            shares: shares.max(1),
            last_wall: Instant::now(),
            last_cpu: process_cpu_time().unwrap_or_default(),
        }
    }

    async fn pace(&mut self) {
        let Some(cpu_now) = process_cpu_time() else {
            return;
        };
        let wall = self.last_wall.elapsed();
        if wall < Duration::from_millis(50) {
            return;
        }
        let busy = cpu_now.saturating_sub(self.last_cpu);
        let ratio = busy.as_secs_f64() / wall.as_secs_f64();
        if ratio > self.target {
            // Sleep until the observed window would land on the target ratio.
            let wanted_wall = busy.as_secs_f64() / self.target;
            let pause = Duration::from_secs_f64(
                ((wanted_wall - wall.as_secs_f64()) / f64::from(self.shares))
                    .min(self.max_pause.as_secs_f64()),
            );
            if pause > Duration::from_millis(1) {
                debug!(ratio, pause_ms = pause.as_millis() as u64, "cpu throttle pausing");
                sleep(pause).await;
            }
        }
        self.last_wall = Instant::now();
        self.last_cpu = cpu_now;
    }
}

/// User plus system CPU time of this process.
#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    use nix::sys::resource::{getrusage, UsageWho};
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let user = usage.user_time();
    let system = usage.system_time();
    let micros = u64::try_from(user.tv_sec()).ok()? * 1_000_000
        + u64::try_from(user.tv_usec()).ok()?
        + u64::try_from(system.tv_sec()).ok()? * 1_000_000
        + u64::try_from(system.tv_usec()).ok()?;
    Some(Duration::from_micros(micros))
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_monitor_never_errors() {
        let mut monitor = ResourceMonitor::new(None, None, Duration::from_secs(1), 1);
        for _ in 0..256 {
            monitor.tick().await.unwrap();
        }
    }

    #[tokio::test]
    async fn generous_ram_limit_passes() {
        let mut monitor =
            ResourceMonitor::new(None, Some(u64::MAX), Duration::from_secs(1), 1);
        for _ in 0..SAMPLE_EVERY + 1 {
            monitor.tick().await.unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn tiny_ram_limit_trips() {
        let mut monitor = ResourceMonitor::new(None, Some(1), Duration::from_secs(1), 1);
        let mut tripped = false;
        for _ in 0..SAMPLE_EVERY + 1 {
            if monitor.tick().await.is_err() {
                tripped = true;
                break;
            }
        }
        assert!(tripped);
    }

    #[cfg(unix)]
    #[test]
    fn cpu_time_is_readable() {
        assert!(process_cpu_time().is_some());
    }
}

//! Byte-counted rate limiting for bytepump writers.
//!
//! The throttle is a token bucket over a one second window anchored on a
//! monotonic clock. Capacity refills at window rollover; requests larger than
//! the capacity drain across consecutive windows. All state is interior and
//! atomic so a single bucket may be shared by any number of writer tasks
//! through an `Arc`.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

/// Configuration of a [`Throttle`].
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Config {
    /// A stable rate: the configured capacity per second, no bursting beyond
    /// one window's worth of bytes.
    #[default]
    Stable,
    /// No limiting whatsoever.
    AllOut,
}

#[derive(Debug)]
enum Mode {
    AllOut,
    Stable(Stable),
}

/// A byte-counted throttle shared by the writers of one job.
#[derive(Debug)]
pub struct Throttle {
    mode: Mode,
}

impl Throttle {
    /// Create a new [`Throttle`] with `maximum_capacity` bytes available per
    /// one second window.
    #[must_use]
    pub fn new_with_config(config: Config, maximum_capacity: NonZeroU32) -> Self {
        let mode = match config {
            Config::AllOut => Mode::AllOut,
            Config::Stable => Mode::Stable(Stable {
                capacity: u64::from(maximum_capacity.get()),
                anchor: Instant::now(),
                window: AtomicU64::new(0),
                spent: AtomicU64::new(0),
            }),
        };
        Self { mode }
    }

    /// A throttle that admits everything immediately.
    #[must_use]
    pub fn all_out() -> Self {
        Self { mode: Mode::AllOut }
    }

    /// Wait until `request` bytes of budget are available, then consume them.
    ///
    /// Requests beyond the per-second capacity are satisfied over multiple
    /// windows rather than rejected.
    pub async fn wait_for(&self, request: NonZeroU32) {
        match &self.mode {
            Mode::AllOut => {}
            Mode::Stable(stable) => stable.acquire(u64::from(request.get())).await,
        }
    }
}

#[derive(Debug)]
struct Stable {
    capacity: u64,
    anchor: Instant,
    /// Index of the one second window that `spent` refers to.
    window: AtomicU64,
    /// Bytes consumed from the current window.
    spent: AtomicU64,
}

impl Stable {
    async fn acquire(&self, mut remaining: u64) {
        loop {
            let elapsed = self.anchor.elapsed();
            let window = elapsed.as_secs();

            let current = self.window.load(Ordering::Acquire);
            if window > current {
                // The window rolled over. Whichever task wins the exchange
                // resets the spend counter; everyone re-reads.
                if self
                    .window
                    .compare_exchange(current, window, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.spent.store(0, Ordering::Release);
                }
                continue;
            }

            let spent = self.spent.load(Ordering::Acquire);
            let available = self.capacity.saturating_sub(spent);
            if available == 0 {
                // Starved until the next window boundary.
                let boundary = Duration::from_secs(window + 1);
                let pause = boundary.saturating_sub(elapsed);
                trace!(pause_ms = pause.as_millis() as u64, "throttle starved");
                sleep(pause.max(Duration::from_millis(5))).await;
                continue;
            }

            let take = remaining.min(available);
            if self
                .spent
                .compare_exchange(spent, spent + take, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                remaining -= take;
                if remaining == 0 {
                    return;
                }
            } else {
                // Lost the race against a sibling writer.
                tokio::task::yield_now().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(val: u32) -> NonZeroU32 {
        NonZeroU32::new(val).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn within_capacity_is_immediate() {
        let throttle = Throttle::new_with_config(Config::Stable, nz(1_000));
        let begin = Instant::now();
        throttle.wait_for(nz(999)).await;
        assert_eq!(begin.elapsed().as_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_drains_across_windows() {
        let throttle = Throttle::new_with_config(Config::Stable, nz(100));
        let begin = Instant::now();
        // 250 bytes at 100 B/s: window 0 gives 100, window 1 gives 100,
        // window 2 gives the final 50.
        throttle.wait_for(nz(250)).await;
        assert!(begin.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_requests_respect_the_window() {
        let throttle = Throttle::new_with_config(Config::Stable, nz(100));
        let begin = Instant::now();
        throttle.wait_for(nz(60)).await;
        throttle.wait_for(nz(60)).await;
        // The second request does not fit window 0.
        assert!(begin.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn all_out_never_waits() {
        let throttle = Throttle::new_with_config(Config::AllOut, nz(1));
        let begin = Instant::now();
        for _ in 0..64 {
            throttle.wait_for(nz(u32::MAX)).await;
        }
        assert_eq!(begin.elapsed().as_secs(), 0);
    }
}

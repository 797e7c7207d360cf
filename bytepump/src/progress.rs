//! Out-of-band progress reporting.
//!
//! One reporter task per target wakes on a timer, reads the shared byte
//! counter and emits a line on standard error with bytes, percent against
//! the ceiling, the rate over the last interval and an ETA.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byte_unit::Byte;
use tokio::time::sleep;
use tracing::info;

use crate::signals::Shutdown;

#[derive(Debug)]
pub(crate) struct Progress {
    label: String,
    bytes: Arc<AtomicU64>,
    ceiling: Option<u64>,
    interval: Duration,
}

impl Progress {
    pub(crate) fn new(
        label: String,
        bytes: Arc<AtomicU64>,
        ceiling: Option<u64>,
        interval: Duration,
    ) -> Self {
        Self {
            label,
            bytes,
            ceiling,
            interval,
        }
    }
}

/// Run the reporter until `done` fires.
pub(crate) async fn report(progress: Progress, mut done: Shutdown) {
    let mut last_bytes = 0u64;
    loop {
        tokio::select! {
            () = sleep(progress.interval) => {
                let written = progress.bytes.load(Ordering::Relaxed);
                let rate = (written - last_bytes) as f64 / progress.interval.as_secs_f64();
                last_bytes = written;
                match progress.ceiling {
                    Some(ceiling) if ceiling > 0 => {
                        let percent = written as f64 / ceiling as f64 * 100.0;
                        let eta_secs = if rate > 0.0 {
                            (ceiling.saturating_sub(written)) as f64 / rate
                        } else {
                            f64::INFINITY
                        };
                        info!(
                            "{}: {} ({:.1}%) at {}/s, ETA {:.0}s",
                            progress.label,
                            human(written),
                            percent,
                            human(rate as u64),
                            eta_secs
                        );
                    }
                    _ => {
                        info!(
                            "{}: {} at {}/s",
                            progress.label,
                            human(written),
                            human(rate as u64)
                        );
                    }
                }
            }
            () = done.recv() => return,
        }
    }
}

fn human(bytes: u64) -> String {
    Byte::from_bytes(u128::from(bytes))
        .get_appropriate_unit(true)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_signal() {
        let done = Shutdown::new();
        let progress = Progress::new(
            "test".to_string(),
            Arc::new(AtomicU64::new(0)),
            Some(100),
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(report(progress, done.clone()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        done.signal();
        handle.await.unwrap();
    }

    #[test]
    fn human_sizes_use_binary_units() {
        assert_eq!(human(1024 * 1024), "1.00 MiB");
    }
}

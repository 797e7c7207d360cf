//! The RAM buffer backend: fill one contiguous buffer, dump it in a single
//! sequential write. Hashing happens during the fill; the fsync interval is
//! suspended in favor of one sync at close. Always single-threaded.

use std::sync::Arc;

use bytepump_throttle::Throttle;
use tracing::{debug, info};

use crate::monitor::ResourceMonitor;
use crate::signals::Shutdown;
use crate::writer::{throttle_portion, GenState, Outcome, RetryState, WriteHead};
use crate::Error;

pub(crate) async fn run(
    mut gen: GenState,
    mut head: WriteHead,
    estimate: u64,
    throttle: Arc<Throttle>,
    mut monitor: ResourceMonitor,
    retry: RetryState,
    shutdown: Shutdown,
) -> Result<Outcome, Error> {
    head.suspend_fsync_interval();
    let ceiling = head.remaining();
    let capacity = ceiling
        .map_or(estimate, |ceiling| ceiling.min(estimate))
        .min(isize::MAX as u64);
    let mut buf: Vec<u8> = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0));
    let mut tokens = 0u64;
    let mut interrupted = false;
    debug!(capacity, "RAM buffer filling");

    loop {
        if shutdown.is_signaled() {
            info!("shutdown signal received");
            interrupted = true;
            break;
        }
        let Some(chunk) = gen.next() else { break };
        let take = match ceiling {
            Some(ceiling) => {
                let remaining = usize::try_from(ceiling - buf.len() as u64).unwrap_or(usize::MAX);
                chunk.bytes.len().min(remaining)
            }
            None => chunk.bytes.len(),
        };
        head.hash_only(&chunk.bytes[..take]);
        buf.extend_from_slice(&chunk.bytes[..take]);
        tokens += chunk.tokens;
        monitor.tick().await?;
        if ceiling.is_some_and(|ceiling| buf.len() as u64 >= ceiling) {
            break;
        }
    }

    if !buf.is_empty() {
        throttle.wait_for(throttle_portion(buf.len())).await;
        head.push_prehashed(&buf, tokens, &retry).await?;
    }
    gen.budget.mark_done();

    let closed = head.close(&retry).await?;
    Ok(Outcome::from_closed(closed, interrupted))
}

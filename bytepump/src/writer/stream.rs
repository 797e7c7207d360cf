//! The single streaming writer: one task generates, throttles and writes.

use std::sync::Arc;

use bytepump_throttle::Throttle;
use tracing::{debug, info};

use crate::monitor::ResourceMonitor;
use crate::signals::Shutdown;
use crate::writer::{throttle_portion, GenState, Outcome, Pushed, RetryState, WriteHead};
use crate::Error;

pub(crate) async fn run(
    mut gen: GenState,
    mut head: WriteHead,
    throttle: Arc<Throttle>,
    mut monitor: ResourceMonitor,
    retry: RetryState,
    mut shutdown: Shutdown,
) -> Result<Outcome, Error> {
    let mut interrupted = false;
    debug!("streaming writer running");

    while let Some(chunk) = gen.next() {
        let portion = throttle_portion(chunk.bytes.len());
        tokio::select! {
            () = throttle.wait_for(portion) => {
                if head.push(&chunk, &retry).await? == Pushed::CeilingReached {
                    gen.budget.mark_done();
                    break;
                }
            }
            () = shutdown.recv() => {
                info!("shutdown signal received");
                interrupted = true;
                break;
            }
        }
        monitor.tick().await?;
    }

    let closed = head.close(&retry).await?;
    Ok(Outcome::from_closed(closed, interrupted))
}

//! The multi-writer backend: W workers share one open handle behind a
//! coarse mutex. Seek, write, hash update and counter updates form one
//! critical section, so the final byte sequence is a legal interleaving of
//! whole chunks. The rate bucket and the error budget are shared; token
//! reservations keep count-bound totals exact.

use std::sync::Arc;

use bytepump_throttle::Throttle;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::monitor::ResourceMonitor;
use crate::signals::Shutdown;
use crate::writer::{throttle_portion, GenState, Outcome, Pushed, RetryState, WriteHead};
use crate::Error;

pub(crate) async fn run(
    gens: Vec<(GenState, ResourceMonitor)>,
    head: WriteHead,
    throttle: Arc<Throttle>,
    retry: RetryState,
    shutdown: Shutdown,
) -> Result<Outcome, Error> {
    debug!(workers = gens.len(), "multi-writer running");
    let head = Arc::new(Mutex::new(head));

    let mut handles = Vec::with_capacity(gens.len());
    for (index, (gen, monitor)) in gens.into_iter().enumerate() {
        handles.push(tokio::spawn(worker(
            index,
            gen,
            Arc::clone(&head),
            Arc::clone(&throttle),
            monitor,
            retry.clone(),
            shutdown.clone(),
        )));
    }

    let mut interrupted = false;
    let mut first_error: Option<Error> = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(worker_interrupted)) => interrupted |= worker_interrupted,
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(error = %err, "additional worker failure");
                }
            }
            Err(join) => {
                if first_error.is_none() {
                    first_error = Some(Error::Join(join));
                }
            }
        }
    }

    let head = Arc::try_unwrap(head)
        .expect("all workers joined before the head is reclaimed")
        .into_inner();
    if let Some(err) = first_error {
        // Close anyway so the handle, hole state and sync are settled; the
        // partial file is kept.
        let _ = head.close(&retry).await;
        return Err(err);
    }
    let closed = head.close(&retry).await?;
    Ok(Outcome::from_closed(closed, interrupted))
}

async fn worker(
    index: usize,
    mut gen: GenState,
    head: Arc<Mutex<WriteHead>>,
    throttle: Arc<Throttle>,
    mut monitor: ResourceMonitor,
    retry: RetryState,
    mut shutdown: Shutdown,
) -> Result<bool, Error> {
    debug!(index, "writer worker running");
    while let Some(chunk) = gen.next() {
        let portion = throttle_portion(chunk.bytes.len());
        tokio::select! {
            () = throttle.wait_for(portion) => {
                let mut head = head.lock().await;
                match head.push(&chunk, &retry).await {
                    Ok(Pushed::CeilingReached) => {
                        gen.budget.mark_done();
                        return Ok(false);
                    }
                    Ok(Pushed::Continue) => {}
                    Err(err) => {
                        // First fatal error cancels the siblings.
                        shutdown.signal();
                        return Err(err.into());
                    }
                }
            }
            () = shutdown.recv() => {
                info!(index, "shutdown signal received");
                return Ok(true);
            }
        }
        if let Err(err) = monitor.tick().await {
            shutdown.signal();
            return Err(err);
        }
    }
    Ok(false)
}

//! The pipeline backend: G generator tasks feed a bounded queue; one writer
//! drains it in arrival order and owns every write-side policy decision.
//! Preferred when generation is CPU-bound and writing is I/O-bound.

use std::sync::Arc;

use bytepump_throttle::Throttle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use bytepump_payload::Chunk;

use crate::common::PeekableReceiver;
use crate::monitor::ResourceMonitor;
use crate::signals::Shutdown;
use crate::writer::{throttle_portion, Budget, GenState, Outcome, Pushed, RetryState, WriteHead};
use crate::Error;

/// Queue depth per generator; bounds memory while masking generator jitter.
const QUEUE_DEPTH_PER_GEN: usize = 4;

pub(crate) async fn run(
    gens: Vec<GenState>,
    budget: Arc<Budget>,
    mut head: WriteHead,
    throttle: Arc<Throttle>,
    mut monitor: ResourceMonitor,
    retry: RetryState,
    mut shutdown: Shutdown,
) -> Result<Outcome, Error> {
    debug!(generators = gens.len(), "pipeline running");
    let (sender, receiver) = mpsc::channel::<Chunk>(QUEUE_DEPTH_PER_GEN * gens.len());
    let mut receiver = PeekableReceiver::new(receiver);

    let mut producers = Vec::with_capacity(gens.len());
    for (index, gen) in gens.into_iter().enumerate() {
        producers.push(tokio::spawn(produce(
            index,
            gen,
            sender.clone(),
            shutdown.clone(),
        )));
    }
    drop(sender);

    let mut interrupted = false;
    let mut error: Option<Error> = None;
    loop {
        let Some(queued) = receiver.peek().await else {
            break;
        };
        let portion = throttle_portion(queued.bytes.len());
        tokio::select! {
            () = throttle.wait_for(portion) => {
                let chunk = receiver.next().await.expect("peeked chunk is present");
                match head.push(&chunk, &retry).await {
                    Ok(Pushed::CeilingReached) => {
                        budget.mark_done();
                        break;
                    }
                    Ok(Pushed::Continue) => {}
                    Err(err) => {
                        shutdown.signal();
                        error = Some(err.into());
                        break;
                    }
                }
            }
            () = shutdown.recv() => {
                info!("shutdown signal received");
                interrupted = true;
                break;
            }
        }
        if let Err(err) = monitor.tick().await {
            shutdown.signal();
            error = Some(err);
            break;
        }
    }

    // Dropping the receiver unblocks producers stuck on a full queue.
    drop(receiver);
    for producer in producers {
        let _ = producer.await;
    }

    if let Some(err) = error {
        let _ = head.close(&retry).await;
        return Err(err);
    }
    let closed = head.close(&retry).await?;
    Ok(Outcome::from_closed(closed, interrupted))
}

async fn produce(index: usize, mut gen: GenState, sender: mpsc::Sender<Chunk>, shutdown: Shutdown) {
    debug!(index, "generator running");
    while !shutdown.is_signaled() {
        let Some(chunk) = gen.next() else { break };
        // Backpressure on a full queue; an error means the writer is gone.
        if sender.send(chunk).await.is_err() {
            break;
        }
    }
}

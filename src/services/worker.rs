//! Bounded worker pool for initial site generations.
//!
//! DESIGN
//! ======
//! A fixed-capacity `mpsc` queue feeds one dispatcher task. The dispatcher
//! takes a `Semaphore` permit before pulling each job, so at most
//! `max_concurrency` generations call the model at once and the queue fills
//! up (rather than the task count growing) when the model is slow. Enqueueing
//! never waits: a full queue hands the job back to the caller, which refunds
//! it.
//!
//! Shutdown closes the queue, settles every job still waiting in it as
//! interrupted (refund + `failed`) and waits for the running ones to finish,
//! so no reservation outlives the process.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use super::generation::{self, GenerationContext, GenerationError};
use super::ledger::Reservation;

/// One reserved initial generation waiting for a worker.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub reservation: Reservation,
    pub prompt: String,
}

/// Sending half of the generation queue.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::Sender<GenerationJob>,
}

impl GenerationQueue {
    /// Non-blocking enqueue. Returns the job when the queue is full or closed.
    ///
    /// # Errors
    ///
    /// Hands back the rejected job so the caller can settle its reservation.
    pub fn submit(&self, job: GenerationJob) -> Result<(), GenerationJob> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!(project_id = %job.reservation.project_id, "generation queue full; rejecting job");
                Err(job)
            }
            Err(TrySendError::Closed(job)) => {
                warn!(project_id = %job.reservation.project_id, "generation queue closed; rejecting job");
                Err(job)
            }
        }
    }

    /// Queue with no dispatcher; tests drain or ignore the receiver.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<GenerationJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Handle on the running dispatcher. Dropping it also stops the pool.
pub struct GenerationWorkers {
    shutdown: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl GenerationWorkers {
    /// Stop taking jobs, settle the queued ones and wait for running ones.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "generation dispatcher ended abnormally");
        }
    }
}

/// Spawn the generation dispatcher and return its queue.
#[must_use]
pub fn spawn_generation_workers(ctx: GenerationContext) -> (GenerationQueue, GenerationWorkers) {
    let queue_capacity = ctx.config.queue_capacity;
    let max_concurrency = ctx.config.max_concurrency;
    let (tx, mut rx) = mpsc::channel::<GenerationJob>(queue_capacity);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let permits = Arc::new(Semaphore::new(max_concurrency));

    info!(queue_capacity, max_concurrency, "generation workers configured");

    let dispatcher = tokio::spawn(async move {
        let mut running = JoinSet::new();
        loop {
            let next = tokio::select! {
                _ = &mut shutdown_rx => None,
                next = next_job(&permits, &mut rx) => next,
            };
            let Some((permit, job)) = next else {
                break;
            };
            let ctx = ctx.clone();
            running.spawn(async move {
                let _permit = permit;
                run_job(&ctx, job).await;
            });
            while running.try_join_next().is_some() {}
        }

        rx.close();
        let mut interrupted = 0usize;
        while let Some(job) = rx.recv().await {
            generation::abandon(ctx.store.as_ref(), &job.reservation, GenerationError::Interrupted).await;
            interrupted += 1;
        }
        info!(running = running.len(), interrupted, "generation queue closed; waiting for running jobs");
        while running.join_next().await.is_some() {}
        info!("generation dispatcher exited");
    });

    (GenerationQueue { tx }, GenerationWorkers { shutdown: shutdown_tx, dispatcher })
}

/// A permit, then a job. `None` once the queue is closed and drained.
async fn next_job(
    permits: &Arc<Semaphore>,
    rx: &mut mpsc::Receiver<GenerationJob>,
) -> Option<(OwnedSemaphorePermit, GenerationJob)> {
    let permit = Arc::clone(permits).acquire_owned().await.ok()?;
    let job = rx.recv().await?;
    Some((permit, job))
}

async fn run_job(ctx: &GenerationContext, job: GenerationJob) {
    let project_id = job.reservation.project_id;
    match generation::run_initial(ctx, &job.reservation, &job.prompt).await {
        Ok(version) => info!(%project_id, version_id = %version.id, "initial generation complete"),
        // Failure details were logged when the attempt was abandoned.
        Err(_) => info!(%project_id, "initial generation ended without a version"),
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod tests;

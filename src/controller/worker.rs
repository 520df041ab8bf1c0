//! Worker pool draining the work queue
//!
//! Each worker loops `get` → reconcile → `done` until the queue shuts down.
//! A reconciler panic is caught at the worker boundary and handled like any
//! other retryable failure, so one bad key cannot take a worker down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use super::keys::ReconciliationKey;
use super::reconciler::Reconcile;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::Error;

/// Fixed-size set of worker loops sharing one queue and reconciler
pub struct WorkerPool<R: ?Sized> {
    queue: WorkQueue<ReconciliationKey>,
    reconciler: Arc<R>,
    workers: usize,
}

impl<R> WorkerPool<R>
where
    R: Reconcile + ?Sized + 'static,
{
    /// Create a pool of `workers` loops (at least one)
    pub fn new(queue: WorkQueue<ReconciliationKey>, reconciler: Arc<R>, workers: usize) -> Self {
        Self {
            queue,
            reconciler,
            workers: workers.max(1),
        }
    }

    /// Run every worker until the queue shuts down
    pub async fn run(self) {
        debug!(workers = self.workers, "starting worker pool");

        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                let queue = self.queue.clone();
                let reconciler = Arc::clone(&self.reconciler);
                tokio::spawn(async move {
                    trace!(worker, "worker started");
                    while process_next_item(&queue, reconciler.as_ref()).await {}
                    trace!(worker, "worker stopped");
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }

        debug!("worker pool stopped");
    }
}

/// Take one key from the queue and reconcile it
///
/// Returns `false` once the queue is shutting down.
pub async fn process_next_item<R>(queue: &WorkQueue<ReconciliationKey>, reconciler: &R) -> bool
where
    R: Reconcile + ?Sized,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(Error::internal(format!(
                "reconciler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            metrics::record_reconcile(elapsed, None);
            trace!(key = %key, ?outcome, "reconciled");
            queue.forget(&key);
        }
        Err(e) if e.is_permanent() => {
            metrics::record_reconcile(elapsed, Some(e.class()));
            error!(key = %key, error = %e, "dropping key that can never be reconciled");
            queue.forget(&key);
        }
        Err(e) => {
            metrics::record_reconcile(elapsed, Some(e.class()));
            warn!(
                key = %key,
                error = %e,
                error_class = e.class(),
                retries = queue.num_requeues(&key),
                "reconciliation failed, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

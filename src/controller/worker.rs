//! # Worker Pool
//!
//! Worker loops that drain the work queue and run the reconciler. A
//! reconcile failure is never fatal to a worker: it is logged and the key
//! is requeued with backoff. Workers exit only when the queue reports
//! shutdown.

use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::Reconciler;
use crate::key::WorkKey;
use crate::service::ServiceWriter;
use crate::watch::DeploymentCache;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared controller state handed to every worker.
pub struct Context<C, S> {
    pub queue: Arc<WorkQueue>,
    pub reconciler: Reconciler<C, S>,
}

impl<C, S> std::fmt::Debug for Context<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Releases a checked-out key on every exit path, like `defer queue.Done`.
struct DoneGuard<'a> {
    queue: &'a WorkQueue,
    key: &'a WorkKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Run one worker until the queue shuts down.
pub async fn run_worker<C, S>(ctx: Arc<Context<C, S>>, worker: usize)
where
    C: DeploymentCache,
    S: ServiceWriter,
{
    debug!(worker, "worker started");
    while process_item(&ctx).await {}
    debug!(worker, "worker stopped");
}

/// Process a single work item. Returns `false` once the queue shuts down.
async fn process_item<C, S>(ctx: &Context<C, S>) -> bool
where
    C: DeploymentCache,
    S: ServiceWriter,
{
    let Some(key) = ctx.queue.get().await else {
        return false;
    };
    let _done = DoneGuard {
        queue: &ctx.queue,
        key: &key,
    };

    match ctx.reconciler.reconcile(&key).await {
        Ok(outcome) => {
            ctx.queue.forget(&key);
            debug!(%key, ?outcome, "reconciled");
        }
        Err(err) => {
            // Transient by assumption; backoff bounds the retry rate.
            warn!(%key, error = %err, "reconcile failed, requeueing with backoff");
            Arc::clone(&ctx.queue).add_rate_limited(key.clone());
        }
    }

    true
}

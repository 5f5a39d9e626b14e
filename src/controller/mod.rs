//! # Controller
//!
//! The event-to-convergence pipeline: watch notifications are translated
//! into deduplicated work keys, a rate-limited queue feeds a pool of
//! workers, and each worker runs the idempotent reconciler. Failures are
//! retried with per-key backoff until the cluster converges.
//!
//! [`Controller::run`] owns startup ordering (cache-sync barrier before any
//! work is dispatched) and cooperative shutdown (stop dispatch, drain the
//! queue's shutdown path, let in-flight reconciles finish).

pub mod backoff;
pub mod events;
pub mod queue;
pub mod reconciler;
pub mod worker;

use crate::controller::events::EventTranslator;
use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::Reconciler;
use crate::controller::worker::{run_worker, Context};
use crate::service::ServiceWriter;
use crate::watch::{DeploymentCache, DeploymentEvent};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default time allowed for the initial cache sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the sync barrier polls the cache.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fatal controller run failure.
///
/// The only fatal condition: dispatching work against an unsynchronized
/// cache would reconcile from incomplete state, so a sync timeout stops the
/// controller instead of being retried.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("deployment cache did not sync within {0:?}")]
    CacheSyncTimeout(Duration),
}

/// The controller: queue, reconciler and worker pool behind one `run`.
pub struct Controller<C, S> {
    ctx: Arc<Context<C, S>>,
    workers: usize,
    sync_timeout: Duration,
}

impl<C, S> std::fmt::Debug for Controller<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.workers)
            .field("sync_timeout", &self.sync_timeout)
            .finish_non_exhaustive()
    }
}

impl<C, S> Controller<C, S>
where
    C: DeploymentCache,
    S: ServiceWriter,
{
    #[must_use]
    pub fn new(cache: C, services: S) -> Self {
        Self {
            ctx: Arc::new(Context {
                queue: Arc::new(WorkQueue::default()),
                reconciler: Reconciler::new(cache, services),
            }),
            workers: DEFAULT_WORKERS,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Shared state handed to workers; exposed for tests.
    #[must_use]
    pub fn context(&self) -> &Arc<Context<C, S>> {
        &self.ctx
    }

    /// Run the controller until `shutdown` fires or the event stream ends.
    ///
    /// Blocks on the cache-sync barrier first; a barrier timeout is fatal.
    /// Events observed during the barrier are translated and queued, but no
    /// worker starts until the cache has synced. On shutdown, notification
    /// dispatch stops, queued keys drain, and in-flight reconciles complete
    /// before this returns.
    pub async fn run<E>(
        &self,
        events: E,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), RunError>
    where
        E: Stream<Item = DeploymentEvent>,
    {
        tokio::pin!(events);
        tokio::pin!(shutdown);
        let mut translator = EventTranslator::new(Arc::clone(&self.ctx.queue));

        info!("waiting for deployment cache to sync");
        tokio::select! {
            synced = self.wait_for_cache_sync(events.as_mut(), &mut translator) => synced?,
            () = shutdown.as_mut() => {
                info!("shutdown before cache sync, exiting");
                return Ok(());
            }
        }
        info!("deployment cache synced");

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            workers.spawn(run_worker(Arc::clone(&self.ctx), worker));
        }
        info!(workers = self.workers, "workers started");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => translator.observe(event),
                    None => {
                        warn!("watch event stream ended, shutting down");
                        break;
                    }
                },
                () = shutdown.as_mut() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.ctx.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker task failed to join");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    /// Cache-sync barrier.
    ///
    /// Keeps pumping watch events through the translator while polling the
    /// synced predicate: the watch pipeline only makes progress while its
    /// stream is polled, and initial-list objects must still become queued
    /// work. Workers are not running yet, so nothing is reconciled before
    /// the barrier lifts.
    async fn wait_for_cache_sync<E>(
        &self,
        mut events: Pin<&mut E>,
        translator: &mut EventTranslator,
    ) -> Result<(), RunError>
    where
        E: Stream<Item = DeploymentEvent>,
    {
        let deadline = tokio::time::Instant::now() + self.sync_timeout;
        let mut poll = tokio::time::interval(SYNC_POLL_INTERVAL);
        let mut stream_ended = false;

        loop {
            if self.ctx.reconciler.cache().has_synced() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RunError::CacheSyncTimeout(self.sync_timeout));
            }
            tokio::select! {
                event = events.next(), if !stream_ended => {
                    match event {
                        Some(event) => translator.observe(event),
                        None => stream_ended = true,
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }
}

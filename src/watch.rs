//! # Deployment Watch Source
//!
//! The watch/cache boundary the controller consumes. Production wiring uses
//! `kube_runtime`'s watcher + reflector: the reflector maintains the local
//! Deployment store, and the event stream is flattened into
//! [`DeploymentEvent`]s for the translator. Initial-list pages drive the
//! synced flag, giving the lifecycle its cache-sync barrier.
//!
//! The reconciler only sees the [`DeploymentCache`] trait, so tests run
//! against an in-memory cache instead of a cluster.

use crate::key::WorkKey;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube_runtime::reflector::{reflector, store, ObjectRef, Store};
use kube_runtime::watcher::{self, watcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Change notification for a watched Deployment.
///
/// The watch stream does not carry the previous object state, so upserts
/// are not split into add/update here; the event translator does that with
/// its own last-seen bookkeeping.
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Upserted(Deployment),
    Deleted(Deployment),
}

/// Read access to the locally cached Deployments.
pub trait DeploymentCache: Send + Sync + 'static {
    /// Point-in-time cached read; `None` means the Deployment is gone (or
    /// was never observed).
    fn get(&self, key: &WorkKey) -> Option<Arc<Deployment>>;

    /// Whether the initial snapshot has been fully ingested. Workers must
    /// not run before this turns true.
    fn has_synced(&self) -> bool;
}

/// [`DeploymentCache`] backed by a reflector store.
#[derive(Clone)]
pub struct ReflectorCache {
    store: Store<Deployment>,
    synced: Arc<AtomicBool>,
}

impl std::fmt::Debug for ReflectorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectorCache")
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl DeploymentCache for ReflectorCache {
    fn get(&self, key: &WorkKey) -> Option<Arc<Deployment>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Start watching Deployments through the given API handle.
///
/// Returns the cache and the flattened event stream. The reflector applies
/// every event to the store before it reaches the stream, so a consumer
/// reacting to an event always sees a cache at least as fresh as the event.
/// Watch errors are logged and swallowed; the watcher re-lists internally.
pub fn deployment_watch(
    api: Api<Deployment>,
) -> (ReflectorCache, impl Stream<Item = DeploymentEvent>) {
    let (reader, writer) = store();
    let synced = Arc::new(AtomicBool::new(false));
    let cache = ReflectorCache {
        store: reader,
        synced: Arc::clone(&synced),
    };

    let events = reflector(writer, watcher(api, watcher::Config::default())).filter_map(
        move |event| {
            let translated = match event {
                Ok(watcher::Event::Apply(dep) | watcher::Event::InitApply(dep)) => {
                    Some(DeploymentEvent::Upserted(dep))
                }
                Ok(watcher::Event::Delete(dep)) => Some(DeploymentEvent::Deleted(dep)),
                Ok(watcher::Event::Init) => None,
                Ok(watcher::Event::InitDone) => {
                    synced.store(true, Ordering::SeqCst);
                    None
                }
                Err(err) => {
                    warn!(error = %err, "deployment watch error, watcher will re-list");
                    None
                }
            };
            std::future::ready(translated)
        },
    );

    (cache, events)
}

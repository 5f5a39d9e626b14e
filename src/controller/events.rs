//! # Event Translation
//!
//! Turns raw watch notifications into work queue entries. This is the only
//! code that runs on the notification path, and it does nothing beyond key
//! derivation and a label diff, so the watch stream is never blocked behind
//! business logic.
//!
//! The watch stream delivers upserts without the previous object state, so
//! the translator keeps a map of the last-seen pod-template labels per key
//! to tell adds from updates and to decide update relevance:
//!
//! - first sight of a key always enqueues (a newly observed Deployment must
//!   be reconciled at least once);
//! - a later upsert enqueues only when the template labels changed, since
//!   those labels are the only Deployment input to the derived Service;
//! - a delete enqueues the key and drops it from the map, leaving any
//!   cleanup policy to the reconciler.

use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::template_labels;
use crate::key::WorkKey;
use crate::watch::DeploymentEvent;
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps watch notifications onto work queue operations.
pub struct EventTranslator {
    queue: Arc<WorkQueue>,
    /// Last-seen pod-template labels per key, used to classify upserts and
    /// filter irrelevant updates.
    seen: HashMap<WorkKey, BTreeMap<String, String>>,
}

impl std::fmt::Debug for EventTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTranslator")
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl EventTranslator {
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            queue,
            seen: HashMap::new(),
        }
    }

    /// Handle one watch notification.
    ///
    /// Objects whose metadata cannot produce a key are dropped with a
    /// warning; that failure is permanent, so queueing would never help.
    pub fn observe(&mut self, event: DeploymentEvent) {
        match event {
            DeploymentEvent::Upserted(deployment) => {
                let Some(key) = self.derive_key(&deployment) else {
                    return;
                };
                let labels = template_labels(&deployment);
                match self.seen.insert(key.clone(), labels.clone()) {
                    None => self.on_add(key),
                    Some(old_labels) => self.on_update(key, &old_labels, &labels),
                }
            }
            DeploymentEvent::Deleted(deployment) => {
                let Some(key) = self.derive_key(&deployment) else {
                    return;
                };
                self.seen.remove(&key);
                self.on_delete(key);
            }
        }
    }

    fn derive_key(&self, deployment: &Deployment) -> Option<WorkKey> {
        match WorkKey::try_from(deployment) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "dropping watch event for unkeyable object");
                None
            }
        }
    }

    fn on_add(&self, key: WorkKey) {
        debug!(%key, "deployment added");
        self.queue.add(key);
    }

    fn on_update(
        &self,
        key: WorkKey,
        old_labels: &BTreeMap<String, String>,
        new_labels: &BTreeMap<String, String>,
    ) {
        if old_labels == new_labels {
            debug!(%key, "deployment update does not affect the derived service, skipping");
            return;
        }
        debug!(%key, "deployment template labels changed");
        self.queue.add(key);
    }

    fn on_delete(&self, key: WorkKey) {
        debug!(%key, "deployment deleted");
        self.queue.add(key);
    }
}

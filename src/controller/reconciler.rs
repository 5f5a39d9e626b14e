//! # Reconciler
//!
//! Converges one Service per Deployment. Given a work key, the reconciler
//! reads the Deployment from the watch cache, derives the desired Service
//! (same name and namespace, selector equal to the pod-template labels, one
//! `80/http` port) and writes it through the cluster API.
//!
//! The write path is an idempotent upsert: a plain create is attempted
//! first, and "already exists" is reclassified from failure into "converge
//! the existing object" via server-side apply. Retrying the same key with
//! unchanged primary state therefore produces no additional side effects
//! and no errors.
//!
//! A Deployment absent from the cache is a no-op, not an error: absence
//! means the Deployment was deleted, and this controller does not clean up
//! the derived Service (garbage collection of Services is out of scope, so
//! requeueing could never make progress).

use crate::key::WorkKey;
use crate::service::{ServiceWriter, WriteError};
use crate::watch::DeploymentCache;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Port exposed on every derived Service.
pub const SERVICE_PORT: i32 = 80;

/// Name of the port exposed on every derived Service.
pub const SERVICE_PORT_NAME: &str = "http";

/// What a successful reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Service did not exist and was created.
    Created,
    /// The Service already existed and was converged onto the desired spec.
    Converged,
    /// The Deployment is gone from the cache; nothing to do.
    PrimaryMissing,
}

/// Unrecoverable failure of a single reconcile attempt.
///
/// The worker loop decides retry policy: these errors are requeued with
/// backoff, never propagated further.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to write service for {key}: {source}")]
    ServiceWrite {
        key: WorkKey,
        #[source]
        source: WriteError,
    },
}

/// Pod-template labels of a Deployment, the selector of the derived Service.
#[must_use]
pub fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|metadata| metadata.labels.clone())
        .unwrap_or_default()
}

/// Desired Service for a Deployment: pure derivation, no side effects.
#[must_use]
pub fn desired_service(key: &WorkKey, deployment: &Deployment) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(template_labels(deployment)),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                name: Some(SERVICE_PORT_NAME.to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// Converges the derived Service for one work key at a time.
///
/// Holds the injected read (cache) and write (API) dependencies; safe to
/// share across workers since both sides are internally synchronized.
pub struct Reconciler<C, S> {
    cache: C,
    services: S,
}

impl<C, S> std::fmt::Debug for Reconciler<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl<C, S> Reconciler<C, S>
where
    C: DeploymentCache,
    S: ServiceWriter,
{
    #[must_use]
    pub fn new(cache: C, services: S) -> Self {
        Self { cache, services }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Converge the Service for `key` onto the current Deployment state.
    ///
    /// Safe to re-enter: a repeat call with unchanged primary state is a
    /// no-op apart from an idempotent apply.
    pub async fn reconcile(&self, key: &WorkKey) -> Result<Outcome, ReconcileError> {
        let Some(deployment) = self.cache.get(key) else {
            debug!(%key, "deployment not in cache, skipping (service cleanup not performed)");
            return Ok(Outcome::PrimaryMissing);
        };

        let desired = desired_service(key, &deployment);
        match self.services.create(&key.namespace, &desired).await {
            Ok(()) => {
                info!(%key, "service created");
                Ok(Outcome::Created)
            }
            Err(WriteError::AlreadyExists) => {
                // Not a failure: an earlier (possibly partially failed)
                // reconcile already created the Service. Converge it.
                self.services
                    .apply(&key.namespace, &key.name, &desired)
                    .await
                    .map_err(|source| ReconcileError::ServiceWrite {
                        key: key.clone(),
                        source,
                    })?;
                debug!(%key, "service already existed, converged onto desired spec");
                Ok(Outcome::Converged)
            }
            Err(source) => Err(ReconcileError::ServiceWrite {
                key: key.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn deployment(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Deployment {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[derive(Default)]
    struct StaticCache {
        deployments: HashMap<WorkKey, Arc<Deployment>>,
    }

    impl StaticCache {
        fn with(deployments: &[Deployment]) -> Self {
            let deployments = deployments
                .iter()
                .map(|dep| (WorkKey::try_from(dep).unwrap(), Arc::new(dep.clone())))
                .collect();
            Self { deployments }
        }
    }

    impl DeploymentCache for StaticCache {
        fn get(&self, key: &WorkKey) -> Option<Arc<Deployment>> {
            self.deployments.get(key).cloned()
        }

        fn has_synced(&self) -> bool {
            true
        }
    }

    /// In-memory Service store with create/apply semantics.
    #[derive(Default, Clone)]
    struct FakeServices {
        services: Arc<Mutex<HashMap<(String, String), Service>>>,
        fail_creates: Arc<Mutex<u32>>,
    }

    impl FakeServices {
        fn get(&self, namespace: &str, name: &str) -> Option<Service> {
            self.services
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        fn count(&self) -> usize {
            self.services.lock().unwrap().len()
        }

        fn fail_next_creates(&self, n: u32) {
            *self.fail_creates.lock().unwrap() = n;
        }
    }

    #[async_trait]
    impl ServiceWriter for FakeServices {
        async fn create(&self, namespace: &str, service: &Service) -> Result<(), WriteError> {
            {
                let mut failures = self.fail_creates.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(WriteError::Api(kube::Error::Api(
                        kube::core::ErrorResponse {
                            status: "Failure".to_string(),
                            message: "injected".to_string(),
                            reason: "InternalError".to_string(),
                            code: 500,
                        },
                    )));
                }
            }
            let name = service.metadata.name.clone().unwrap();
            let mut services = self.services.lock().unwrap();
            let slot = (namespace.to_string(), name);
            if services.contains_key(&slot) {
                return Err(WriteError::AlreadyExists);
            }
            services.insert(slot, service.clone());
            Ok(())
        }

        async fn apply(
            &self,
            namespace: &str,
            name: &str,
            service: &Service,
        ) -> Result<(), WriteError> {
            self.services
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), service.clone());
            Ok(())
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn converges_a_deployment_to_a_service() {
        let dep = deployment("default", "web", &[("app", "foo")]);
        let services = FakeServices::default();
        let reconciler = Reconciler::new(StaticCache::with(&[dep]), services.clone());

        let outcome = reconciler
            .reconcile(&WorkKey::new("default", "web"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Created);

        let service = services.get("default", "web").unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector, Some(labels(&[("app", "foo")])));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[tokio::test]
    async fn repeat_reconciles_are_idempotent() {
        let dep = deployment("default", "web", &[("app", "foo")]);
        let services = FakeServices::default();
        let reconciler = Reconciler::new(StaticCache::with(&[dep]), services.clone());
        let key = WorkKey::new("default", "web");

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Created);
        for _ in 0..5 {
            assert_eq!(
                reconciler.reconcile(&key).await.unwrap(),
                Outcome::Converged
            );
        }

        assert_eq!(services.count(), 1);
        let spec = services.get("default", "web").unwrap().spec.unwrap();
        assert_eq!(spec.selector, Some(labels(&[("app", "foo")])));
    }

    #[tokio::test]
    async fn already_exists_converges_selector() {
        let services = FakeServices::default();

        // First reconcile against the old labels.
        let old = deployment("default", "web", &[("app", "foo")]);
        let reconciler = Reconciler::new(StaticCache::with(&[old]), services.clone());
        let key = WorkKey::new("default", "web");
        reconciler.reconcile(&key).await.unwrap();

        // Relabeled deployment: create hits "already exists", apply must
        // converge the selector.
        let relabeled = deployment("default", "web", &[("app", "bar")]);
        let reconciler = Reconciler::new(StaticCache::with(&[relabeled]), services.clone());
        assert_eq!(
            reconciler.reconcile(&key).await.unwrap(),
            Outcome::Converged
        );

        let spec = services.get("default", "web").unwrap().spec.unwrap();
        assert_eq!(spec.selector, Some(labels(&[("app", "bar")])));
        assert_eq!(services.count(), 1);
    }

    #[tokio::test]
    async fn missing_deployment_is_a_no_op() {
        let services = FakeServices::default();
        let reconciler = Reconciler::new(StaticCache::default(), services.clone());

        let outcome = reconciler
            .reconcile(&WorkKey::new("default", "gone"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::PrimaryMissing);
        assert_eq!(services.count(), 0);
    }

    #[tokio::test]
    async fn write_failure_is_classified() {
        let dep = deployment("default", "web", &[("app", "foo")]);
        let services = FakeServices::default();
        services.fail_next_creates(1);
        let reconciler = Reconciler::new(StaticCache::with(&[dep]), services.clone());
        let key = WorkKey::new("default", "web");

        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::ServiceWrite {
                source: WriteError::Api(_),
                ..
            }
        ));

        // The failure is transient: the retry converges.
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Created);
        assert_eq!(services.count(), 1);
    }
}

//! # Service Write Path
//!
//! The cluster API boundary the reconciler writes through. The controller
//! only needs two operations on `core/v1 Service`: create, and a
//! server-side apply that converges an existing Service onto the desired
//! spec. Both are behind [`ServiceWriter`] so tests can substitute an
//! in-memory implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;

/// Field manager recorded on server-side apply patches.
pub const FIELD_MANAGER: &str = "service-exposer-controller";

/// Failure writing a Service to the cluster.
///
/// "Already exists" is split out from other API failures because the
/// reconciler reclassifies it: a create racing with an earlier retry is not
/// an error, it is the signal to converge the existing object instead.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("service already exists")]
    AlreadyExists,
    #[error("kubernetes api error: {0}")]
    Api(#[source] kube::Error),
    #[error("failed to serialize service: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write access to `core/v1 Service` objects.
#[async_trait]
pub trait ServiceWriter: Send + Sync + 'static {
    /// Create the Service; fails with [`WriteError::AlreadyExists`] if a
    /// Service of that name already exists in the namespace.
    async fn create(&self, namespace: &str, service: &Service) -> Result<(), WriteError>;

    /// Converge an existing Service onto the desired state (server-side
    /// apply semantics: unmanaged fields are left alone).
    async fn apply(&self, namespace: &str, name: &str, service: &Service)
        -> Result<(), WriteError>;
}

/// [`ServiceWriter`] backed by the real cluster API.
#[derive(Clone)]
pub struct KubeServiceWriter {
    client: Client,
}

impl std::fmt::Debug for KubeServiceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeServiceWriter").finish_non_exhaustive()
    }
}

impl KubeServiceWriter {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ServiceWriter for KubeServiceWriter {
    async fn create(&self, namespace: &str, service: &Service) -> Result<(), WriteError> {
        match self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                Err(WriteError::AlreadyExists)
            }
            Err(err) => Err(WriteError::Api(err)),
        }
    }

    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> Result<(), WriteError> {
        // Server-side apply requires apiVersion/kind in the patch body,
        // which the typed object does not serialize.
        let mut desired = serde_json::to_value(service)?;
        desired["apiVersion"] = serde_json::Value::from("v1");
        desired["kind"] = serde_json::Value::from("Service");

        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.services(namespace)
            .patch(name, &params, &Patch::Apply(&desired))
            .await
            .map(|_| ())
            .map_err(WriteError::Api)
    }
}

//! # Work Keys
//!
//! A [`WorkKey`] identifies one unit of reconciliation work: the
//! `namespace/name` pair of a watched Deployment. Keys are the unit of
//! deduplication in the work queue, so they are cheap to clone, hashable,
//! and immutable once derived.

use k8s_openapi::api::apps::v1::Deployment;
use std::fmt;
use thiserror::Error;

/// Stable identity of a reconciliation target.
///
/// Rendered as `namespace/name` in logs, matching the conventional
/// Kubernetes cache key format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub namespace: String,
    pub name: String,
}

impl WorkKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A key could not be derived from an object's metadata.
///
/// This is a permanent failure: retrying derivation on the same object can
/// never succeed, so callers drop the object with a logged warning instead
/// of queueing it.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object has no metadata.namespace")]
    MissingNamespace,
}

impl TryFrom<&Deployment> for WorkKey {
    type Error = KeyError;

    fn try_from(deployment: &Deployment) -> Result<Self, Self::Error> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or(KeyError::MissingName)?;
        let namespace = deployment
            .metadata
            .namespace
            .as_deref()
            .ok_or(KeyError::MissingNamespace)?;
        Ok(Self::new(namespace, name))
    }
}

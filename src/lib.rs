//! # Service Exposer Controller
//!
//! A level-triggered Kubernetes controller that watches `apps/v1`
//! Deployments and converges a matching `core/v1` Service per Deployment:
//! same name and namespace, selector equal to the Deployment's pod-template
//! labels, a single `80/http` port.
//!
//! The pipeline: watch notifications are translated into deduplicated work
//! keys, a rate-limited retry queue feeds a pool of workers, and each
//! worker runs an idempotent reconcile that converges the Service. A
//! failing key is retried with exponential per-key backoff until it
//! succeeds; work is only dispatched after the local cache has completed
//! its initial sync.
//!
//! Entry points: [`watch::deployment_watch`] for the cluster-backed watch
//! source and [`controller::Controller`] for the pipeline itself. Both
//! sides of the reconciler are traits ([`watch::DeploymentCache`],
//! [`service::ServiceWriter`]), so the whole pipeline runs in-memory in
//! tests.

pub mod controller;
pub mod key;
pub mod server;
pub mod service;
pub mod watch;

//! Profile state controller - derived feature labels for Kubeflow profiles
//!
//! Watches Profiles, Namespaces, Pods, RoleBindings and
//! PersistentVolumeClaims and keeps a fixed set of boolean feature labels on
//! each Profile and its Namespace in line with what the namespace contains:
//! restricted workload images, external users outside the exception lists,
//! and protected storage claims.
//!
//! # Modules
//!
//! - [`crd`] - Kubeflow Profile resource type
//! - [`config`] - Policy tunables and exception lists
//! - [`policy`] - Pure policy evaluation into a feature label set
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`cache`] - Reflector-backed resource cache and watch consumers
//! - [`controller`] - Key translation, reconciler, worker pool and startup
//! - [`metrics`] - OpenTelemetry instruments
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default number of concurrent reconciliation workers
pub const DEFAULT_WORKERS: usize = 2;

//! Resource types watched and written by the controller
//!
//! Namespaces, Pods, RoleBindings and PersistentVolumeClaims come from
//! `k8s-openapi`; only the Kubeflow `Profile` needs a local declaration.

mod profile;

pub use profile::{Profile, ProfileSpec};

//! Kubeflow Profile resource
//!
//! Profiles are owned by the Kubeflow profile controller. This crate only
//! reads them and patches their labels, so the schema is not generated and
//! the spec models just the fields the controller reads. The typed value is
//! never written back.

use k8s_openapi::api::rbac::v1::Subject;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Specification for a Kubeflow Profile
///
/// A Profile and the Namespace it provisions share the same name.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "Profile",
    plural = "profiles",
    namespaced = false,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Subject that owns the profile namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Subject>,

    /// Resource quota applied to the namespace, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quota_spec: Option<serde_json::Value>,
}

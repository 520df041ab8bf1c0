//! Policy engine
//!
//! Computes the [`FeatureLabelSet`] for one namespace from a snapshot of its
//! Pods, RoleBindings and PersistentVolumeClaims. Evaluation is a pure
//! function of its arguments: configuration and exceptions are passed in,
//! never read from ambient state, and the snapshot is never mutated.
//!
//! Every rule is existential ("true iff at least one matching item
//! exists"), so the order of items in the snapshot does not affect the
//! result and an empty snapshot evaluates to all-false.

mod labels;
mod rules;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::RoleBinding;

use crate::config::{ExceptionList, PolicyConfig};

pub use labels::{
    FeatureLabelSet, NON_EXEMPT_NOTEBOOK_USER_LABEL, NON_EXEMPT_STORAGE_USER_LABEL,
    PROTECTED_STORAGE_LABEL, RESTRICTED_IMAGE_LABEL,
};
pub use rules::{
    has_non_exempt_subject, has_protected_storage, has_restricted_image, is_internal_user,
};

/// Policy domain whose subjects are checked against its own exception list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyDomain {
    /// Restricted notebook workloads
    Notebook,
    /// Internal storage tier
    StorageTier,
}

impl PolicyDomain {
    /// Identifier used as the key in the exception list file
    pub fn id(&self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::StorageTier => "storage-tier",
        }
    }
}

impl std::fmt::Display for PolicyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Point-in-time view of the resources in one namespace
#[derive(Clone, Debug, Default)]
pub struct NamespaceSnapshot {
    /// Pods in the namespace
    pub pods: Vec<Arc<Pod>>,
    /// RoleBindings in the namespace
    pub role_bindings: Vec<Arc<RoleBinding>>,
    /// PersistentVolumeClaims in the namespace
    pub persistent_volume_claims: Vec<Arc<PersistentVolumeClaim>>,
}

/// Evaluate every policy rule against a namespace snapshot
pub fn evaluate(
    snapshot: &NamespaceSnapshot,
    config: &PolicyConfig,
    exceptions: &ExceptionList,
) -> FeatureLabelSet {
    FeatureLabelSet {
        restricted_image: has_restricted_image(&snapshot.pods, &config.restricted_image_prefixes),
        non_exempt_notebook_user: has_non_exempt_subject(
            &snapshot.role_bindings,
            PolicyDomain::Notebook,
            &config.internal_domains,
            exceptions,
        ),
        non_exempt_storage_user: has_non_exempt_subject(
            &snapshot.role_bindings,
            PolicyDomain::StorageTier,
            &config.internal_domains,
            exceptions,
        ),
        protected_storage: has_protected_storage(
            &snapshot.persistent_volume_claims,
            &config.protected_storage_markers,
        ),
    }
}

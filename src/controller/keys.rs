//! Key translation
//!
//! Maps a change to any watched resource onto the reconciliation key that
//! must be re-evaluated. Watch events are first normalised into
//! [`ResourceEvent`] by the informer, so translation sees one stable shape
//! regardless of the resource kind or whether the object was recovered from
//! a relist tombstone.

use std::fmt;

use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::{Resource, ResourceExt};

use crate::crd::Profile;
use crate::{Error, Result};

/// Maximum length of a namespace name (DNS-1123 label)
const MAX_NAMESPACE_LEN: usize = 63;

/// Unit of reconciliation work: the shared name of a Profile and its Namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconciliationKey(String);

impl ReconciliationKey {
    /// Wrap a profile/namespace name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the namespace name if the key is a valid DNS-1123 label
    ///
    /// A key that fails validation can never resolve to a namespace and is
    /// dropped rather than retried.
    pub fn namespace(&self) -> Result<&str> {
        let name = self.0.as_str();
        let valid = !name.is_empty()
            && name.len() <= MAX_NAMESPACE_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !name.starts_with('-')
            && !name.ends_with('-');

        if valid {
            Ok(name)
        } else {
            Err(Error::invalid_key(format!(
                "{name:?} is not a valid namespace name"
            )))
        }
    }
}

impl fmt::Display for ReconciliationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of resource the controller watches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Kubeflow Profile (cluster-scoped)
    Profile,
    /// Namespace (cluster-scoped)
    Namespace,
    /// Pod
    Pod,
    /// RoleBinding
    RoleBinding,
    /// PersistentVolumeClaim
    PersistentVolumeClaim,
}

impl ResourceKind {
    /// Kind name as used by the API server
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "Profile",
            Self::Namespace => "Namespace",
            Self::Pod => "Pod",
            Self::RoleBinding => "RoleBinding",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource type fed through an informer
pub trait Watched:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind tag carried by events for this type
    const KIND: ResourceKind;
}

impl Watched for Profile {
    const KIND: ResourceKind = ResourceKind::Profile;
}

impl Watched for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;
}

impl Watched for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;
}

impl Watched for RoleBinding {
    const KIND: ResourceKind = ResourceKind::RoleBinding;
}

impl Watched for PersistentVolumeClaim {
    const KIND: ResourceKind = ResourceKind::PersistentVolumeClaim;
}

/// Identity of one object as seen in a watch event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHandle {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace, for namespaced kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
    /// Opaque optimistic-concurrency token
    pub resource_version: Option<String>,
}

impl ObjectHandle {
    /// Capture the identity of a watched object
    pub fn of<K: Watched>(obj: &K) -> Self {
        Self {
            kind: K::KIND,
            namespace: obj.namespace(),
            name: obj.name_any(),
            resource_version: obj.resource_version(),
        }
    }
}

/// A normalised change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Object created or updated; `old` is the previously cached state
    Applied {
        /// Previously cached state, absent on create
        old: Option<ObjectHandle>,
        /// State after the change
        new: ObjectHandle,
    },
    /// Object deleted
    Deleted {
        /// Last state known to the cache
        last_known: ObjectHandle,
        /// The delete was inferred from a relist rather than observed
        tombstone: bool,
    },
}

/// Map a change onto the key that must be reconciled
///
/// Returns `None` when the change needs no work: an update whose resource
/// version did not move (a resync replay), or a namespaced object that
/// somehow arrived without a namespace.
pub fn translate(event: &ResourceEvent) -> Option<ReconciliationKey> {
    let handle = match event {
        ResourceEvent::Applied { old: Some(old), new }
            if old.resource_version.is_some() && old.resource_version == new.resource_version =>
        {
            return None;
        }
        ResourceEvent::Applied { new, .. } => new,
        ResourceEvent::Deleted { last_known, .. } => last_known,
    };

    match handle.kind {
        ResourceKind::Profile | ResourceKind::Namespace => {
            Some(ReconciliationKey::new(handle.name.clone()))
        }
        ResourceKind::Pod | ResourceKind::RoleBinding | ResourceKind::PersistentVolumeClaim => {
            handle.namespace.clone().map(ReconciliationKey::new)
        }
    }
}

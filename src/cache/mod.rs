//! Resource cache
//!
//! Current-state reads for the reconciler are served from in-memory
//! reflector stores kept up to date by one [`Informer`] per watched kind.
//! The reconciler only sees the [`ResourceCache`] trait, so tests can swap
//! in fixed snapshots.

mod informer;

use std::hash::Hash;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
#[cfg(test)]
use mockall::automock;

use crate::crd::Profile;
use crate::{Error, Result};

pub use informer::Informer;

/// Read-only view of the watched resources
///
/// Lookups never block and are safe to call from every worker at once.
#[cfg_attr(test, automock)]
pub trait ResourceCache: Send + Sync {
    /// Profile by name
    fn get_profile(&self, name: &str) -> Option<Arc<Profile>>;

    /// Namespace by name
    fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>>;

    /// Pods in `namespace`
    fn list_pods(&self, namespace: &str) -> Vec<Arc<Pod>>;

    /// RoleBindings in `namespace`
    fn list_role_bindings(&self, namespace: &str) -> Vec<Arc<RoleBinding>>;

    /// PersistentVolumeClaims in `namespace`
    fn list_persistent_volume_claims(&self, namespace: &str) -> Vec<Arc<PersistentVolumeClaim>>;
}

/// [`ResourceCache`] backed by kube reflector stores
#[derive(Clone)]
pub struct KubeResourceCache {
    profiles: Store<Profile>,
    namespaces: Store<Namespace>,
    pods: Store<Pod>,
    role_bindings: Store<RoleBinding>,
    claims: Store<PersistentVolumeClaim>,
}

impl KubeResourceCache {
    /// Wrap the reader halves of the informer stores
    pub fn new(
        profiles: Store<Profile>,
        namespaces: Store<Namespace>,
        pods: Store<Pod>,
        role_bindings: Store<RoleBinding>,
        claims: Store<PersistentVolumeClaim>,
    ) -> Self {
        Self {
            profiles,
            namespaces,
            pods,
            role_bindings,
            claims,
        }
    }

    /// Resolve once every store has completed its initial list
    pub async fn wait_until_synced(&self) -> Result<()> {
        let dropped = |kind: &str| Error::internal(format!("{kind} informer stopped before sync"));
        self.profiles
            .wait_until_ready()
            .await
            .map_err(|_| dropped("Profile"))?;
        self.namespaces
            .wait_until_ready()
            .await
            .map_err(|_| dropped("Namespace"))?;
        self.pods
            .wait_until_ready()
            .await
            .map_err(|_| dropped("Pod"))?;
        self.role_bindings
            .wait_until_ready()
            .await
            .map_err(|_| dropped("RoleBinding"))?;
        self.claims
            .wait_until_ready()
            .await
            .map_err(|_| dropped("PersistentVolumeClaim"))?;
        Ok(())
    }
}

fn in_namespace<K>(store: &Store<K>, namespace: &str) -> Vec<Arc<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Hash + Eq + Clone,
{
    store
        .state()
        .into_iter()
        .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
        .collect()
}

impl ResourceCache for KubeResourceCache {
    fn get_profile(&self, name: &str) -> Option<Arc<Profile>> {
        self.profiles.get(&ObjectRef::new(name))
    }

    fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(&ObjectRef::new(name))
    }

    fn list_pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        in_namespace(&self.pods, namespace)
    }

    fn list_role_bindings(&self, namespace: &str) -> Vec<Arc<RoleBinding>> {
        in_namespace(&self.role_bindings, namespace)
    }

    fn list_persistent_volume_claims(&self, namespace: &str) -> Vec<Arc<PersistentVolumeClaim>> {
        in_namespace(&self.claims, namespace)
    }
}

//! Label reconciliation for one Profile and its Namespace
//!
//! The reconciler is level-triggered: every run re-reads the current state
//! from the cache, evaluates the policy rules and writes only the records
//! whose tracked labels differ. A write is a merge patch holding the full
//! tracked label set and the cached resource version: the API server
//! rejects it with a conflict after a concurrent edit, and the key is
//! retried against fresh state. Nothing outside `metadata.labels` is sent.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::keys::{ReconciliationKey, ResourceKind};
use super::FIELD_MANAGER;
use crate::cache::ResourceCache;
use crate::config::{ExceptionList, PolicyConfig};
use crate::crd::Profile;
use crate::metrics;
use crate::policy::{self, FeatureLabelSet, NamespaceSnapshot};
use crate::{Error, Result};

/// Tracked labels to write on one record
///
/// Carries every tracked key, so applying it sets the whole tracked set.
/// Labels outside the tracked keys are not part of the patch and stay as
/// they are on the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelPatch {
    /// Name of the target record
    pub name: String,
    /// Resource version the labels were computed against
    pub resource_version: Option<String>,
    /// Tracked label keys with their new values
    pub labels: BTreeMap<String, String>,
}

impl LabelPatch {
    /// Patch bringing `obj` to `features`, or `None` when it already matches
    pub fn for_object<K: Resource>(obj: &K, features: &FeatureLabelSet) -> Option<Self> {
        if features.matches(obj.meta().labels.as_ref()) {
            return None;
        }
        Some(Self {
            name: obj.name_any(),
            resource_version: obj.meta().resource_version.clone(),
            labels: features
                .to_labels()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        })
    }

    /// JSON merge patch body
    ///
    /// `metadata.resourceVersion` makes the patch conditional.
    pub fn to_merge_patch(&self) -> Value {
        let mut metadata = Map::new();
        metadata.insert("labels".to_string(), json!(self.labels));
        if let Some(version) = &self.resource_version {
            metadata.insert("resourceVersion".to_string(), json!(version));
        }
        json!({ "metadata": metadata })
    }
}

/// Writes label changes back to the API server
///
/// Implementations must apply the patch conditionally on its resource
/// version and touch nothing but the tracked labels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LabelWriter: Send + Sync {
    /// Patch the labels of a Profile
    async fn patch_profile(&self, patch: &LabelPatch) -> Result<()>;

    /// Patch the labels of a Namespace
    async fn patch_namespace(&self, patch: &LabelPatch) -> Result<()>;
}

/// [`LabelWriter`] backed by the Kubernetes API
pub struct KubeLabelWriter {
    client: Client,
}

impl KubeLabelWriter {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_labels<K>(&self, patch: &LabelPatch) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&patch.name, &params, &Patch::Merge(patch.to_merge_patch()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LabelWriter for KubeLabelWriter {
    async fn patch_profile(&self, patch: &LabelPatch) -> Result<()> {
        self.patch_labels::<Profile>(patch).await
    }

    async fn patch_namespace(&self, patch: &LabelPatch) -> Result<()> {
        self.patch_labels::<Namespace>(patch).await
    }
}

/// What a successful reconciliation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The Profile no longer exists; nothing to do
    ProfileGone,
    /// Both records already carried the computed labels
    Unchanged,
    /// At least one record was written
    Updated {
        /// The Profile was written
        profile: bool,
        /// The Namespace was written
        namespace: bool,
    },
}

/// One reconciliation attempt for a key
///
/// The worker pool only depends on this trait; the error returned decides
/// between forgetting the key and a rate-limited retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Bring the labels of the records behind `key` up to date
    async fn reconcile(&self, key: &ReconciliationKey) -> Result<ReconcileOutcome>;
}

/// Reconciler computing feature labels from cached namespace contents
pub struct LabelReconciler {
    cache: Arc<dyn ResourceCache>,
    writer: Arc<dyn LabelWriter>,
    policy: Arc<PolicyConfig>,
    exceptions: Arc<ExceptionList>,
}

impl LabelReconciler {
    /// Create a reconciler over the given cache and writer
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        writer: Arc<dyn LabelWriter>,
        policy: Arc<PolicyConfig>,
        exceptions: Arc<ExceptionList>,
    ) -> Self {
        Self {
            cache,
            writer,
            policy,
            exceptions,
        }
    }

    fn snapshot(&self, namespace: &str) -> NamespaceSnapshot {
        NamespaceSnapshot {
            pods: self.cache.list_pods(namespace),
            role_bindings: self.cache.list_role_bindings(namespace),
            persistent_volume_claims: self.cache.list_persistent_volume_claims(namespace),
        }
    }
}

#[async_trait]
impl Reconcile for LabelReconciler {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn reconcile(&self, key: &ReconciliationKey) -> Result<ReconcileOutcome> {
        let name = key.namespace()?;

        let Some(profile) = self.cache.get_profile(name) else {
            debug!("profile no longer exists, nothing to do");
            return Ok(ReconcileOutcome::ProfileGone);
        };

        let features = policy::evaluate(&self.snapshot(name), &self.policy, &self.exceptions);
        debug!(?features, "evaluated policy");

        // resolved before any write so a retry never starts from a half-applied state
        let namespace = self
            .cache
            .get_namespace(name)
            .ok_or_else(|| Error::NamespaceMissing(name.to_string()))?;

        let profile_written = match LabelPatch::for_object(profile.as_ref(), &features) {
            Some(patch) => record_write(
                ResourceKind::Profile,
                self.writer.patch_profile(&patch).await,
            )?,
            None => false,
        };

        let namespace_written = match LabelPatch::for_object(namespace.as_ref(), &features) {
            Some(patch) => record_write(
                ResourceKind::Namespace,
                self.writer.patch_namespace(&patch).await,
            )?,
            None => false,
        };

        if !profile_written && !namespace_written {
            debug!("labels already up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        info!(
            profile = profile_written,
            namespace = namespace_written,
            "updated feature labels"
        );
        Ok(ReconcileOutcome::Updated {
            profile: profile_written,
            namespace: namespace_written,
        })
    }
}

/// Map a write result: deleted targets are skipped, anything else propagates
fn record_write(kind: ResourceKind, result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => {
            metrics::record_label_write(kind.as_str());
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            debug!(%kind, "target deleted before write, skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockResourceCache;
    use crate::error::api_error;
    use crate::policy::fixtures::{pod, pvc, user_binding};
    use crate::policy::{
        NON_EXEMPT_NOTEBOOK_USER_LABEL, NON_EXEMPT_STORAGE_USER_LABEL, PROTECTED_STORAGE_LABEL,
        RESTRICTED_IMAGE_LABEL,
    };
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use k8s_openapi::api::rbac::v1::RoleBinding;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const SAS_IMAGE: &str = "k8scc01covidacr.azurecr.io/sas:9.4";

    fn profile(name: &str, labels: &[(&str, &str)]) -> Profile {
        let mut profile = Profile::new(name, Default::default());
        profile.metadata.resource_version = Some("10".to_string());
        profile.metadata.labels = label_map(labels);
        profile
    }

    fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("20".to_string()),
                labels: label_map(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn label_map(labels: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        if labels.is_empty() {
            return None;
        }
        Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn all_false() -> Vec<(&'static str, &'static str)> {
        FeatureLabelSet::KEYS.iter().map(|k| (*k, "false")).collect()
    }

    #[derive(Default)]
    struct Contents {
        profile: Option<Profile>,
        namespace: Option<Namespace>,
        pods: Vec<Arc<Pod>>,
        role_bindings: Vec<Arc<RoleBinding>>,
        claims: Vec<Arc<PersistentVolumeClaim>>,
    }

    fn cache(contents: Contents) -> MockResourceCache {
        let mut cache = MockResourceCache::new();
        let profile = contents.profile.map(Arc::new);
        let namespace = contents.namespace.map(Arc::new);
        cache
            .expect_get_profile()
            .returning(move |_| profile.clone());
        cache
            .expect_get_namespace()
            .returning(move |_| namespace.clone());
        let pods = contents.pods;
        cache.expect_list_pods().returning(move |_| pods.clone());
        let role_bindings = contents.role_bindings;
        cache
            .expect_list_role_bindings()
            .returning(move |_| role_bindings.clone());
        let claims = contents.claims;
        cache
            .expect_list_persistent_volume_claims()
            .returning(move |_| claims.clone());
        cache
    }

    fn reconciler(cache: MockResourceCache, writer: MockLabelWriter) -> LabelReconciler {
        LabelReconciler::new(
            Arc::new(cache),
            Arc::new(writer),
            Arc::new(PolicyConfig::default()),
            Arc::new(ExceptionList::empty()),
        )
    }

    fn key(name: &str) -> ReconciliationKey {
        ReconciliationKey::new(name)
    }

    #[tokio::test]
    async fn missing_profile_is_success_without_writes() {
        let mut writer = MockLabelWriter::new();
        writer.expect_patch_profile().never();
        writer.expect_patch_namespace().never();

        let outcome = reconciler(cache(Contents::default()), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::ProfileGone);
    }

    #[tokio::test]
    async fn writes_computed_labels_to_profile_and_namespace() {
        let mut writer = MockLabelWriter::new();
        writer
            .expect_patch_profile()
            .withf(|p: &LabelPatch| {
                p.name == "team-a"
                    && p.labels[RESTRICTED_IMAGE_LABEL] == "true"
                    && p.labels[NON_EXEMPT_NOTEBOOK_USER_LABEL] == "true"
                    && p.labels[PROTECTED_STORAGE_LABEL] == "true"
                    && p.resource_version.as_deref() == Some("10")
            })
            .times(1)
            .returning(|_| Ok(()));
        writer
            .expect_patch_namespace()
            .withf(|p: &LabelPatch| {
                p.labels[RESTRICTED_IMAGE_LABEL] == "true"
                    && p.resource_version.as_deref() == Some("20")
            })
            .times(1)
            .returning(|_| Ok(()));

        let contents = Contents {
            profile: Some(profile("team-a", &[])),
            namespace: Some(namespace("team-a", &[])),
            pods: vec![pod("team-a", &[SAS_IMAGE])],
            role_bindings: vec![user_binding("team-a", "bob@external.com")],
            claims: vec![pvc("team-a", "data-iprotb-0")],
        };

        let outcome = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                profile: true,
                namespace: true
            }
        );
    }

    #[tokio::test]
    async fn unchanged_labels_skip_the_write() {
        let mut writer = MockLabelWriter::new();
        writer.expect_patch_profile().never();
        writer.expect_patch_namespace().never();

        let labels = all_false();
        let contents = Contents {
            profile: Some(profile("team-a", &labels)),
            namespace: Some(namespace("team-a", &labels)),
            ..Default::default()
        };

        let outcome = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn only_the_stale_record_is_written() {
        let mut writer = MockLabelWriter::new();
        writer.expect_patch_profile().never();
        writer
            .expect_patch_namespace()
            .times(1)
            .returning(|_| Ok(()));

        let contents = Contents {
            profile: Some(profile("team-a", &all_false())),
            namespace: Some(namespace("team-a", &[])),
            ..Default::default()
        };

        let outcome = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                profile: false,
                namespace: true
            }
        );
    }

    #[tokio::test]
    async fn patch_carries_only_tracked_labels_and_version() {
        let mut writer = MockLabelWriter::new();
        writer
            .expect_patch_profile()
            .withf(|p: &LabelPatch| {
                p.to_merge_patch()
                    == serde_json::json!({
                        "metadata": {
                            "labels": {
                                RESTRICTED_IMAGE_LABEL: "false",
                                NON_EXEMPT_NOTEBOOK_USER_LABEL: "false",
                                NON_EXEMPT_STORAGE_USER_LABEL: "false",
                                PROTECTED_STORAGE_LABEL: "false",
                            },
                            "resourceVersion": "10",
                        }
                    })
            })
            .times(1)
            .returning(|_| Ok(()));
        writer
            .expect_patch_namespace()
            .withf(|p: &LabelPatch| {
                !p.labels.contains_key("istio-injection") && p.labels.len() == 4
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut with_quota = profile("team-a", &[("team", "analytics")]);
        with_quota.spec.resource_quota_spec = Some(serde_json::json!({ "hard": { "cpu": "4" } }));
        let contents = Contents {
            profile: Some(with_quota),
            namespace: Some(namespace("team-a", &[("istio-injection", "enabled")])),
            ..Default::default()
        };

        reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflict_is_returned_for_retry() {
        let mut writer = MockLabelWriter::new();
        writer
            .expect_patch_profile()
            .times(1)
            .returning(|_| Err(api_error(409, "Conflict")));
        writer.expect_patch_namespace().never();

        let contents = Contents {
            profile: Some(profile("team-a", &[])),
            namespace: Some(namespace("team-a", &[])),
            ..Default::default()
        };

        let err = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn not_found_on_write_is_not_an_error() {
        let mut writer = MockLabelWriter::new();
        writer
            .expect_patch_profile()
            .times(1)
            .returning(|_| Err(api_error(404, "NotFound")));
        writer
            .expect_patch_namespace()
            .times(1)
            .returning(|_| Err(api_error(404, "NotFound")));

        let contents = Contents {
            profile: Some(profile("team-a", &[])),
            namespace: Some(namespace("team-a", &[])),
            ..Default::default()
        };

        let outcome = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn missing_namespace_fails_before_any_write() {
        let mut writer = MockLabelWriter::new();
        writer.expect_patch_profile().never();
        writer.expect_patch_namespace().never();

        let contents = Contents {
            profile: Some(profile("team-a", &[])),
            ..Default::default()
        };

        let err = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NamespaceMissing(ref ns) if ns == "team-a"));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn other_api_errors_propagate() {
        let mut writer = MockLabelWriter::new();
        writer
            .expect_patch_profile()
            .returning(|_| Err(api_error(500, "InternalError")));

        let contents = Contents {
            profile: Some(profile("team-a", &[])),
            namespace: Some(namespace("team-a", &[])),
            ..Default::default()
        };

        let err = reconciler(cache(contents), writer)
            .reconcile(&key("team-a"))
            .await
            .unwrap_err();

        assert_eq!(err.class(), "kube");
    }

    #[tokio::test]
    async fn malformed_key_is_permanent() {
        let mut cache = MockResourceCache::new();
        cache.expect_get_profile().never();

        let err = reconciler(cache, MockLabelWriter::new())
            .reconcile(&key("Not/A/Namespace"))
            .await
            .unwrap_err();

        assert!(err.is_permanent());
    }

    #[test]
    fn patch_sets_every_tracked_key_on_an_unlabelled_record() {
        let ns = namespace("team-a", &[]);
        let patch = LabelPatch::for_object(&ns, &FeatureLabelSet::default()).unwrap();
        assert_eq!(patch.name, "team-a");
        assert_eq!(patch.labels.len(), 4);
        assert!(patch.labels.values().all(|v| v == "false"));
    }

    #[test]
    fn patch_is_none_when_tracked_labels_match() {
        let ns = namespace("team-a", &[("istio-injection", "enabled")]);
        let mut labels = ns.metadata.labels.clone().unwrap();
        FeatureLabelSet::default().merge_into(&mut labels);
        let converged = Namespace {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..ns.metadata
            },
            ..Default::default()
        };
        assert!(LabelPatch::for_object(&converged, &FeatureLabelSet::default()).is_none());
    }

    #[test]
    fn merge_patch_omits_unknown_resource_version() {
        let mut ns = namespace("team-a", &[]);
        ns.metadata.resource_version = None;
        let body = LabelPatch::for_object(&ns, &FeatureLabelSet::default())
            .unwrap()
            .to_merge_patch();
        assert!(body["metadata"].get("resourceVersion").is_none());
        assert_eq!(body.as_object().unwrap().len(), 1, "only metadata is sent");
    }
}

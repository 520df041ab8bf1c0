//! Derived label set and its mapping onto Kubernetes labels

use std::collections::BTreeMap;

/// Label set when any workload runs a restricted image
pub const RESTRICTED_IMAGE_LABEL: &str = "state.aaw.statcan.gc.ca/has-sas-notebook-feature";

/// Label set when an external, non-excepted user is bound (notebook policy)
pub const NON_EXEMPT_NOTEBOOK_USER_LABEL: &str =
    "state.aaw.statcan.gc.ca/exists-non-sas-notebook-user";

/// Label set when an external, non-excepted user is bound (storage-tier policy)
pub const NON_EXEMPT_STORAGE_USER_LABEL: &str =
    "state.aaw.statcan.gc.ca/exists-non-cloud-main-user";

/// Label set when a protected storage claim exists
pub const PROTECTED_STORAGE_LABEL: &str = "state.aaw.statcan.gc.ca/has-iprotb-storage";

/// Outcome of policy evaluation for one namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureLabelSet {
    /// A container image matches a restricted prefix
    pub restricted_image: bool,
    /// An external user not excepted from the notebook policy is bound
    pub non_exempt_notebook_user: bool,
    /// An external user not excepted from the storage-tier policy is bound
    pub non_exempt_storage_user: bool,
    /// A PVC name carries a protected storage marker
    pub protected_storage: bool,
}

impl FeatureLabelSet {
    /// The label keys owned by this controller
    pub const KEYS: [&'static str; 4] = [
        RESTRICTED_IMAGE_LABEL,
        NON_EXEMPT_NOTEBOOK_USER_LABEL,
        NON_EXEMPT_STORAGE_USER_LABEL,
        PROTECTED_STORAGE_LABEL,
    ];

    /// Key/value pairs in label form (`"true"` / `"false"`)
    pub fn to_labels(&self) -> [(&'static str, String); 4] {
        [
            (RESTRICTED_IMAGE_LABEL, self.restricted_image.to_string()),
            (
                NON_EXEMPT_NOTEBOOK_USER_LABEL,
                self.non_exempt_notebook_user.to_string(),
            ),
            (
                NON_EXEMPT_STORAGE_USER_LABEL,
                self.non_exempt_storage_user.to_string(),
            ),
            (PROTECTED_STORAGE_LABEL, self.protected_storage.to_string()),
        ]
    }

    /// Overwrite the tracked keys in `labels`, leaving every other key alone
    ///
    /// Returns whether the mapping changed.
    pub fn merge_into(&self, labels: &mut BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for (key, value) in self.to_labels() {
            if labels.get(key) != Some(&value) {
                labels.insert(key.to_string(), value);
                changed = true;
            }
        }
        changed
    }

    /// Whether `labels` already carries exactly this set
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else {
            return false;
        };
        self.to_labels()
            .iter()
            .all(|(key, value)| labels.get(*key) == Some(value))
    }
}

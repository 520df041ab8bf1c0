//! Static controller configuration
//!
//! Two pieces of configuration feed the policy engine:
//!
//! - [`PolicyConfig`]: the comparison lists (image prefixes, organisational
//!   domains, protected storage markers), set from CLI flags
//! - [`ExceptionList`]: per-policy excepted subjects, loaded once from a YAML
//!   file at startup
//!
//! Both are immutable after load and shared behind `Arc` without locking.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{info, warn};

use crate::{Error, Result};

/// Default prefix of restricted (employee-only) workload images
pub const DEFAULT_RESTRICTED_IMAGE_PREFIX: &str = "k8scc01covidacr.azurecr.io/sas:";

/// Default organisational email domains treated as internal
pub const DEFAULT_INTERNAL_DOMAINS: &[&str] = &["statcan.gc.ca", "cloud.statcan.ca"];

/// Default PVC name marker for protected storage classes
pub const DEFAULT_PROTECTED_STORAGE_MARKER: &str = "iprotb";

/// Tunable comparison lists used by the policy rules
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Image reference prefixes that mark a restricted workload
    pub restricted_image_prefixes: Vec<String>,
    /// Email domains whose users are organisation-internal
    pub internal_domains: Vec<String>,
    /// Substrings of PVC names that denote protected storage
    pub protected_storage_markers: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            restricted_image_prefixes: vec![DEFAULT_RESTRICTED_IMAGE_PREFIX.to_string()],
            internal_domains: DEFAULT_INTERNAL_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            protected_storage_markers: vec![DEFAULT_PROTECTED_STORAGE_MARKER.to_string()],
        }
    }
}

impl PolicyConfig {
    /// Build a config, keeping defaults for any list left empty
    pub fn from_overrides(
        restricted_image_prefixes: Vec<String>,
        internal_domains: Vec<String>,
        protected_storage_markers: Vec<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            restricted_image_prefixes: non_empty_or(
                restricted_image_prefixes,
                defaults.restricted_image_prefixes,
            ),
            internal_domains: non_empty_or(
                internal_domains
                    .into_iter()
                    .map(|d| d.trim_start_matches('@').to_ascii_lowercase())
                    .collect(),
                defaults.internal_domains,
            ),
            protected_storage_markers: non_empty_or(
                protected_storage_markers,
                defaults.protected_storage_markers,
            ),
        }
    }
}

fn non_empty_or(values: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    let values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        fallback
    } else {
        values
    }
}

/// Subjects allowed to bypass a policy rule, keyed by policy identifier
///
/// File format:
///
/// ```yaml
/// notebook:
///   - bob@external.com
/// storage-tier:
///   - carol@partner.org
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionList {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ExceptionList {
    /// An exception list with no entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse an exception list from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::empty());
        }
        let raw: BTreeMap<String, Option<Vec<String>>> = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid exception list: {e}")))?;
        let entries = raw
            .into_iter()
            .map(|(policy, names)| (policy, names.unwrap_or_default().into_iter().collect()))
            .collect();
        Ok(Self { entries })
    }

    /// Load the exception list from disk, degrading to empty on any failure
    ///
    /// A broken file never stops the controller; it logs a warning and every
    /// external subject counts against its rule until the file is fixed.
    pub fn load_or_empty(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("no exception list configured, using empty list");
            return Self::empty();
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read exception list, using empty list");
                return Self::empty();
            }
        };

        match Self::from_yaml(&content) {
            Ok(list) => {
                info!(
                    path = %path.display(),
                    policies = list.entries.len(),
                    subjects = list.subject_count(),
                    "loaded exception list"
                );
                list
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed exception list, using empty list");
                Self::empty()
            }
        }
    }

    /// Add an excepted subject for a policy
    pub fn with_exception(mut self, policy: impl Into<String>, subject: impl Into<String>) -> Self {
        self.entries
            .entry(policy.into())
            .or_default()
            .insert(subject.into());
        self
    }

    /// Whether `subject` is excepted from `policy` (exact name match)
    pub fn is_excepted(&self, policy: &str, subject: &str) -> bool {
        self.entries
            .get(policy)
            .is_some_and(|subjects| subjects.contains(subject))
    }

    /// Total number of excepted subjects across all policies
    pub fn subject_count(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// True when no policy has any exception
    pub fn is_empty(&self) -> bool {
        self.subject_count() == 0
    }
}

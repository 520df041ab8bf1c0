//! Individual policy rules
//!
//! Each rule short-circuits on the first match; that is an optimisation only.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::{RoleBinding, Subject};

use super::PolicyDomain;
use crate::config::ExceptionList;

/// RBAC subject kind for human users
const USER_KIND: &str = "User";

/// True iff any container of any pod runs an image with a restricted prefix
///
/// All containers are scanned, not just the first one of each pod.
pub fn has_restricted_image(pods: &[Arc<Pod>], prefixes: &[String]) -> bool {
    pods.iter()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|container| container.image.as_deref())
        .any(|image| prefixes.iter().any(|prefix| image.starts_with(prefix.as_str())))
}

/// Whether an email-like user name belongs to an organisational domain
///
/// The domain part (after the last `@`) must equal one of `domains` or be
/// a subdomain of it. Both sides compare case-insensitively, and a leading
/// `@` on a configured domain is ignored.
pub fn is_internal_user(name: &str, domains: &[String]) -> bool {
    let Some((_, domain)) = name.rsplit_once('@') else {
        return false;
    };
    let domain = domain.to_ascii_lowercase();
    domains.iter().any(|internal| {
        let internal = internal.trim_start_matches('@').to_ascii_lowercase();
        domain == internal
            || domain
                .strip_suffix(internal.as_str())
                .is_some_and(|rest| rest.ends_with('.'))
    })
}

/// True iff some RoleBinding grants access to an external user who is not
/// excepted from `domain`
///
/// Only `User` subjects with an `@` in their name are considered; groups,
/// service accounts and bare user names never set the rule.
pub fn has_non_exempt_subject(
    bindings: &[Arc<RoleBinding>],
    domain: PolicyDomain,
    internal_domains: &[String],
    exceptions: &ExceptionList,
) -> bool {
    bindings
        .iter()
        .filter_map(|binding| binding.subjects.as_ref())
        .flatten()
        .any(|subject| counts_against(subject, domain, internal_domains, exceptions))
}

fn counts_against(
    subject: &Subject,
    domain: PolicyDomain,
    internal_domains: &[String],
    exceptions: &ExceptionList,
) -> bool {
    subject.kind == USER_KIND
        && subject.name.contains('@')
        && !is_internal_user(&subject.name, internal_domains)
        && !exceptions.is_excepted(domain.id(), &subject.name)
}

/// True iff any PVC name contains a protected storage marker
pub fn has_protected_storage(claims: &[Arc<PersistentVolumeClaim>], markers: &[String]) -> bool {
    claims
        .iter()
        .filter_map(|claim| claim.metadata.name.as_deref())
        .any(|name| markers.iter().any(|marker| name.contains(marker.as_str())))
}

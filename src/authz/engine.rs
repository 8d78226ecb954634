use std::borrow::Cow;

use crate::authz::types::{AccessDecision, ClauseKind, PolicyDocument, RequirementClause, DEFAULT_MESSAGE};
use crate::identity::Identity;

/// Directory requests resolve to their index page before matching.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    if path.is_empty() || path.ends_with('/') {
        Cow::Owned(format!("{path}index.html"))
    } else {
        Cow::Borrowed(path)
    }
}

/// Decide whether `identity` may read `path`.
///
/// Rules are scanned in declaration order and the first prefix match decides;
/// a later, more specific prefix never overrides an earlier one.
pub fn evaluate(policy: &PolicyDocument, path: &str, identity: Option<&Identity>) -> AccessDecision {
    let path = normalize_path(path);

    let Some(rule) = policy
        .paths
        .iter()
        .find(|rule| path.starts_with(rule.path_prefix.as_str()))
    else {
        tracing::debug!(%path, "No rule matched, authentication required");
        return AccessDecision {
            allowed: identity.is_some(),
            message: DEFAULT_MESSAGE.to_string(),
        };
    };

    let allowed = match identity {
        None => rule.open_access,
        Some(id) => rule.requirements.iter().all(|c| clause_passes(c, id)),
    };

    tracing::debug!(
        %path,
        prefix = %rule.path_prefix,
        authenticated = identity.is_some(),
        allowed,
        "Access decision"
    );

    AccessDecision {
        allowed,
        message: rule.message.clone(),
    }
}

/// ALL: roles ⊇ clause roles (so an empty ALL clause passes).
/// ANY: roles ∩ clause roles ≠ ∅ (so an empty ANY clause fails).
pub fn clause_passes(clause: &RequirementClause, identity: &Identity) -> bool {
    match clause.kind {
        ClauseKind::All => clause.roles.is_subset(&identity.roles),
        ClauseKind::Any => !clause.roles.is_disjoint(&identity.roles),
    }
}

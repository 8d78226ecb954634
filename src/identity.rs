use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// An authenticated principal. Anonymous requests carry no `Identity` at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub subject: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Build an identity from a claims object (ID token, userinfo or edge token payload).
    /// Returns `None` when there is no `sub` claim.
    pub fn from_claims(claims: &Map<String, Value>) -> Option<Self> {
        let subject = claims.get("sub")?.as_str()?.to_string();
        let name = string_claim(claims, "name").or_else(|| string_claim(claims, "preferred_username"));
        Some(Self {
            subject,
            name,
            email: string_claim(claims, "email"),
            roles: roles_from_claims(claims),
        })
    }

    /// Name shown in the login status fragment.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.subject)
    }
}

fn string_claim(claims: &Map<String, Value>, key: &str) -> Option<String> {
    claims
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Collect roles from a top-level `roles` array and from `realm_access.roles`.
/// Missing or malformed claims yield an empty set.
pub fn roles_from_claims(claims: &Map<String, Value>) -> BTreeSet<String> {
    let mut roles = BTreeSet::new();
    let sources = [
        claims.get("roles"),
        claims.get("realm_access").and_then(|r| r.get("roles")),
    ];
    for value in sources.into_iter().flatten() {
        if let Some(items) = value.as_array() {
            roles.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }
    roles
}

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_MESSAGE: &str = "You need to authenticate.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseKind {
    /// Identity must hold every listed role.
    All,
    /// Identity must hold at least one listed role.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementClause {
    #[serde(rename = "type")]
    pub kind: ClauseKind,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl RequirementClause {
    pub fn all<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Self {
        Self {
            kind: ClauseKind::All,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn any<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Self {
        Self {
            kind: ClauseKind::Any,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// One `paths` entry of the access-control document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub path_prefix: String,
    pub open_access: bool,
    pub message: String,
    pub requirements: Vec<RequirementClause>,
}

impl PathRule {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            open_access: false,
            message: DEFAULT_MESSAGE.to_string(),
            requirements: Vec::new(),
        }
    }

    pub fn open(mut self) -> Self {
        self.open_access = true;
        self
    }

    pub fn requiring(mut self, clause: RequirementClause) -> Self {
        self.requirements.push(clause);
        self
    }
}

/// Rule body as written in JSON; the prefix is the map key.
#[derive(Debug, Deserialize)]
struct RuleBody {
    #[serde(default)]
    open_access: bool,
    message: Option<String>,
    #[serde(default)]
    role_requirements: Vec<RequirementClause>,
}

/// Ordered rule list. Declaration order is evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct PolicyDocument {
    #[serde(default, deserialize_with = "ordered_rules")]
    pub paths: Vec<PathRule>,
}

impl PolicyDocument {
    pub fn new(paths: Vec<PathRule>) -> Self {
        Self { paths }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// serde_json's default Map sorts keys; walk the object directly so rule order survives.
fn ordered_rules<'de, D>(deserializer: D) -> Result<Vec<PathRule>, D::Error>
where
    D: Deserializer<'de>,
{
    struct RulesVisitor;

    impl<'de> Visitor<'de> for RulesVisitor {
        type Value = Vec<PathRule>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object mapping path prefixes to rules")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((prefix, body)) = map.next_entry::<String, RuleBody>()? {
                rules.push(PathRule {
                    path_prefix: prefix,
                    open_access: body.open_access,
                    message: body.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
                    requirements: body.role_requirements,
                });
            }
            Ok(rules)
        }
    }

    deserializer.deserialize_map(RulesVisitor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub message: String,
}

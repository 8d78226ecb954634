use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(sitegate::authz::policy_load),
        help("Check that the access-control file is readable")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(sitegate::authz::invalid_policy),
        help("Expected {{\"paths\": {{\"/prefix\": {{\"open_access\": bool, \"message\": str, \"role_requirements\": [{{\"type\": \"all\"|\"any\", \"roles\": [...]}}]}}}}}}")
    )]
    InvalidPolicy(String),
}

impl AuthzError {
    /// True when the policy file simply does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            AuthzError::PolicyLoadError { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

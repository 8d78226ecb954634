use std::path::Path;

use crate::authz::errors::AuthzError;
use crate::authz::types::PolicyDocument;

/// Parse an access-control document from its JSON source.
pub fn load(source: &str) -> Result<PolicyDocument, AuthzError> {
    serde_json::from_str(source).map_err(|e| AuthzError::InvalidPolicy(e.to_string()))
}

/// Read and parse the access-control file at `path`.
pub fn load_file(path: &Path) -> Result<PolicyDocument, AuthzError> {
    let contents = std::fs::read_to_string(path).map_err(|source| AuthzError::PolicyLoadError {
        path: path.display().to_string(),
        source,
    })?;
    let doc = load(&contents)?;

    tracing::info!(
        path = %path.display(),
        rules = doc.paths.len(),
        "Loaded access-control policy"
    );

    Ok(doc)
}

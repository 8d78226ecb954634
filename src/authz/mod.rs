pub mod engine;
pub mod errors;
pub mod loader;
pub mod types;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use types::PolicyDocument;

/// Process-wide cache of the access-control document.
///
/// The document is loaded from disk on first use and shared afterwards. A
/// missing or malformed file degrades to the empty policy, which leaves every
/// path requiring authentication.
#[derive(Debug)]
pub struct PolicyStore {
    source: PathBuf,
    cached: RwLock<Option<Arc<PolicyDocument>>>,
    init: Mutex<()>,
}

impl PolicyStore {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            cached: RwLock::new(None),
            init: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Arc<PolicyDocument> {
        if let Some(doc) = self.read_cached() {
            return doc;
        }

        // Serialise first loads so concurrent requests parse the file once.
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(doc) = self.read_cached() {
            return doc;
        }

        let doc = match loader::load_file(&self.source) {
            Ok(doc) => doc,
            Err(e) if e.is_missing() => {
                tracing::info!(path = %self.source.display(), "No access-control file, using empty policy");
                PolicyDocument::empty()
            }
            Err(e) => {
                tracing::warn!(path = %self.source.display(), error = %e, "Failed to load access-control file, using empty policy");
                PolicyDocument::empty()
            }
        };
        let doc = Arc::new(doc);
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(doc.clone());
        doc
    }

    /// Replace the cached document. `None` forces a reload on the next `get`.
    pub fn reset(&self, doc: Option<PolicyDocument>) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = doc.map(Arc::new);
    }

    fn read_cached(&self) -> Option<Arc<PolicyDocument>> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

use crate::errors::GateError;
use std::path::{Component, Path, PathBuf};

pub const INDEX_PAGE: &str = "/index.html";

/// Read access to the static site. `read` fails with `GateError::NotFound`
/// for anything that does not resolve to a file.
pub trait ContentSource: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, GateError>;
}

/// Site content served from a directory on disk.
#[derive(Debug, Clone)]
pub struct FsContent {
    root: PathBuf,
}

impl FsContent {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto the site root. Directory paths resolve to
    /// their `index.html`; `..` segments are refused.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if path.ends_with('/') || resolved.is_dir() {
            resolved.push("index.html");
        }
        Some(resolved)
    }
}

impl ContentSource for FsContent {
    fn read(&self, path: &str) -> Result<Vec<u8>, GateError> {
        let resolved = self
            .resolve(path)
            .ok_or_else(|| GateError::NotFound(path.to_string()))?;
        match std::fs::read(&resolved) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GateError::NotFound(path.to_string())),
            Err(e) => Err(GateError::Io(e)),
        }
    }
}

//! The directory job files live in.
//!
//! Every path a caller hands in must resolve inside it.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadPathError {
    #[error("path must not be empty")]
    Empty,

    #[error("path must not contain '..': {}", .0.display())]
    ParentComponent(PathBuf),

    #[error("path is outside the upload directory: {}", .0.display())]
    OutsideRoot(PathBuf),

    #[error("cannot resolve path {}: {message}", .path.display())]
    Unresolvable { path: PathBuf, message: String },
}

/// Canonical upload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    /// Create the directory if needed and pin its canonical form.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        Ok(Self {
            root: fs::canonicalize(path)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to a canonical path inside the root.
    ///
    /// Relative paths are taken relative to the root. The file itself may not
    /// exist yet; its closest existing ancestor is canonicalized so symlinks
    /// cannot point outside.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, UploadPathError> {
        if path.as_os_str().is_empty() {
            return Err(UploadPathError::Empty);
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(UploadPathError::ParentComponent(path.to_path_buf()));
        }

        let joined = self.root.join(path);
        let resolved = canonicalize_existing_prefix(&joined).map_err(|e| UploadPathError::Unresolvable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(UploadPathError::OutsideRoot(path.to_path_buf()));
        }
        Ok(resolved)
    }
}

/// Canonicalize the longest existing ancestor and re-attach the rest.
fn canonicalize_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        match fs::canonicalize(existing) {
            Ok(mut base) => {
                for part in rest.iter().rev() {
                    base.push(part);
                }
                return Ok(base);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                rest.push(name.to_os_string());
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

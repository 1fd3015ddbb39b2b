//! Shared upload directory with collision-free, token-prefixed filenames.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const ANNOTATED_PREFIX: &str = "annotated_";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("missing file name")]
    EmptyName,
    #[error("unsupported file type: {0:?} (allowed: jpg, jpeg, png)")]
    UnsupportedExtension(String),
    #[error("upload directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A stored (or reserved) upload: `<token>_<original-name>` in the upload dir.
#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub token: String,
    pub original_name: String,
    pub path: PathBuf,
}

impl StoredUpload {
    /// `<token>_<original-name>`
    pub fn unique_name(&self) -> String {
        format!("{}_{}", self.token, self.original_name)
    }

    /// Sibling output path: `annotated_<token>_<original-name>`.
    pub fn annotated_path(&self) -> PathBuf {
        let name = format!("{ANNOTATED_PREFIX}{}", self.unique_name());
        self.path.with_file_name(name)
    }
}

#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory (and parents) if absent.
    pub fn ensure(&self) -> Result<(), UploadError> {
        std::fs::create_dir_all(&self.root).map_err(|source| UploadError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Pick a fresh token-prefixed path for `original_name` without writing anything.
    pub fn reserve(&self, original_name: &str) -> Result<StoredUpload, UploadError> {
        let original_name = sanitize_name(original_name)?;
        let token = Uuid::new_v4().simple().to_string();
        let path = self.root.join(format!("{token}_{original_name}"));
        Ok(StoredUpload {
            token,
            original_name,
            path,
        })
    }

    /// Write `bytes` under a fresh token-prefixed name.
    pub fn store(&self, original_name: &str, bytes: &[u8]) -> Result<StoredUpload, UploadError> {
        let upload = self.reserve(original_name)?;
        std::fs::write(&upload.path, bytes).map_err(|source| UploadError::Io {
            path: upload.path.clone(),
            source,
        })?;
        tracing::info!(path = %upload.path.display(), bytes = bytes.len(), "upload stored");
        Ok(upload)
    }
}

/// Keep only the final path component and require an allowed image extension.
fn sanitize_name(original: &str) -> Result<String, UploadError> {
    let name = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::EmptyName);
    }
    if !is_allowed(name) {
        return Err(UploadError::UnsupportedExtension(name.to_string()));
    }
    Ok(name.to_string())
}

/// `true` when the name has a `jpg`/`jpeg`/`png` extension (any case).
pub fn is_allowed(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty() && ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
    })
}

//! Object storage for user media (avatars, cover images).
//!
//! The server only needs to upload a blob and, when registration fails
//! afterwards, delete it again. `LocalMediaStore` keeps files on disk and
//! serves them from a configured public base URL.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use url::Url;

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    /// Identifier used to delete the object later
    pub public_id: String,
    /// Publicly reachable URL
    pub url: String,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store `bytes` and return where they can be found.
    async fn upload(&self, bytes: &[u8], file_name: &str) -> Result<StoredMedia, MediaError>;

    /// Delete a previously uploaded object. Deleting a missing object is not an error.
    async fn delete(&self, public_id: &str) -> Result<(), MediaError>;
}

/// Filesystem-backed media store.
pub struct LocalMediaStore {
    root: PathBuf,
    base_url: Url,
}

impl LocalMediaStore {
    /// Create the store, creating `root` if needed.
    pub async fn open(root: impl AsRef<Path>, base_url: &str) -> Result<Self, MediaError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(MediaError::Io)?;

        // Url::join drops the last path segment unless the base ends with '/'
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&base).map_err(|e| MediaError::InvalidUrl(e.to_string()))?;

        Ok(Self { root, base_url })
    }

    fn path_for(&self, public_id: &str) -> Result<PathBuf, MediaError> {
        if public_id.is_empty()
            || !public_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            || public_id.starts_with('.')
        {
            return Err(MediaError::InvalidId);
        }
        Ok(self.root.join(public_id))
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn upload(&self, bytes: &[u8], file_name: &str) -> Result<StoredMedia, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }

        let public_id = match extension_of(file_name) {
            Some(ext) => format!("{}.{}", uuid::Uuid::new_v4(), ext),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let path = self.path_for(&public_id)?;
        tokio::fs::write(&path, bytes).await.map_err(MediaError::Io)?;

        let url = self
            .base_url
            .join(&public_id)
            .map_err(|e| MediaError::InvalidUrl(e.to_string()))?;

        Ok(StoredMedia {
            public_id,
            url: url.to_string(),
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), MediaError> {
        let path = self.path_for(public_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MediaError::Io(e)),
        }
    }
}

/// Lower-cased alphanumeric extension of a client-supplied file name.
fn extension_of(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Debug)]
pub enum MediaError {
    Io(std::io::Error),
    InvalidUrl(String),
    InvalidId,
    Empty,
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::Io(e) => write!(f, "Media I/O error: {}", e),
            MediaError::InvalidUrl(e) => write!(f, "Invalid media URL: {}", e),
            MediaError::InvalidId => write!(f, "Invalid media identifier"),
            MediaError::Empty => write!(f, "Empty upload"),
        }
    }
}

impl std::error::Error for MediaError {}

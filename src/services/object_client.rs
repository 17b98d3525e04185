//! Object store capability used by uploads, public links and the sweeper.
//!
//! Two backends implement it: [`LocalObjectStore`](super::local_store::LocalObjectStore)
//! keeps payloads on disk, [`RemoteObjectStore`](super::remote_store::RemoteObjectStore)
//! delegates to any `object_store` backend (S3 in production, in-memory in tests).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::{fmt, future::Future, io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object store call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backend(#[from] object_store::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    /// Backend-native location of the object (`file://…`, `s3://…`).
    pub location: String,
}

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a prefix listing, ordered by key.
///
/// `next_token` is `Some` while more pages remain; pass it back verbatim to
/// fetch the next page. Listings resume strictly after the token key.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

/// Object payload opened for streaming out.
pub struct ObjectBody {
    pub size_bytes: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, replacing any previous payload.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> ObjectStoreResult<StoredObject>;

    /// Fetch one page of keys starting with `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectStoreResult<ListPage>;

    /// Open an object for reading.
    async fn get(&self, key: &str) -> ObjectStoreResult<ObjectBody>;

    /// Delete an object. Returns [`ObjectStoreError::NotFound`] when nothing was there.
    async fn delete(&self, key: &str) -> ObjectStoreResult<()>;
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Backend(object_store::Error::NotFound { .. }) => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Bound an object store call; an elapsed timer becomes [`ObjectStoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> ObjectStoreResult<T>
where
    F: Future<Output = ObjectStoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ObjectStoreError::Timeout(limit)),
    }
}

/// Basic key validation shared by the backends.
///
/// Rejects empty or overlong keys, absolute paths, `..` segments and control
/// characters, so a key can always be mapped onto a relative filesystem path.
pub fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
    const MAX_OBJECT_KEY_LEN: usize = 1024;

    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');

    if invalid {
        Err(ObjectStoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

//! Metadata for one uploaded object.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A stored file's metadata row.
///
/// The record is the authority on whether its object may live: once the
/// record is gone (expired by the metadata store) the object with the same
/// `store_key` is garbage. Records are written once and never updated.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Identifier assigned by the metadata store on insert.
    pub id: Uuid,

    /// Key of the object in the object store namespace. Unique.
    pub store_key: String,

    /// Filename supplied by the uploader.
    pub original_name: String,

    /// Content type (MIME type) supplied by the uploader.
    pub mime_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Shareable address derived from `store_key` at write time.
    pub public_url: String,

    /// Insert time; the only anchor for expiry.
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// When the record stops being reachable for the given retention window.
    pub fn expires_at(&self, retention: TimeDelta) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Everything needed to insert a [`FileRecord`]; the store assigns `id`.
#[derive(Clone, Debug)]
pub struct NewFileRecord {
    pub store_key: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub public_url: String,
    pub created_at: DateTime<Utc>,
}

impl NewFileRecord {
    pub fn into_record(self, id: Uuid) -> FileRecord {
        FileRecord {
            id,
            store_key: self.store_key,
            original_name: self.original_name,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes,
            public_url: self.public_url,
            created_at: self.created_at,
        }
    }
}

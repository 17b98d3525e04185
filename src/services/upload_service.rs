//! Upload flow: write the object, then register its record.

use super::{
    metadata_store::MetadataError,
    object_client::{ObjectStore, ObjectStoreError, with_timeout},
    registrar::{RecordRegistrar, UploadedObject},
};
use crate::{clock::Clock, models::file_record::FileRecord};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to store object: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("failed to register upload: {0}")]
    Registration(#[from] MetadataError),
}

/// A file received from a client, fully buffered.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub mime_type: String,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct UploadService {
    objects: Arc<dyn ObjectStore>,
    registrar: RecordRegistrar,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    public_base_url: String,
    call_timeout: Duration,
}

impl UploadService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        registrar: RecordRegistrar,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        public_base_url: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            objects,
            registrar,
            clock,
            key_prefix: key_prefix.into(),
            public_base_url: public_base_url.into(),
            call_timeout,
        }
    }

    /// Store `file` under a fresh key and register it.
    ///
    /// If registration fails the object is deleted again (best effort); an
    /// object left behind is picked up by the reconciler once it sweeps.
    pub async fn upload(&self, file: IncomingFile) -> Result<FileRecord, UploadError> {
        let key = generate_key(&self.key_prefix, &file.original_name, self.clock.now());
        let size_bytes = i64::try_from(file.body.len()).unwrap_or(i64::MAX);

        let stored = with_timeout(
            self.call_timeout,
            self.objects.put(&key, file.body, Some(&file.mime_type)),
        )
        .await?;
        info!(key = %stored.key, location = %stored.location, size_bytes, "stored object");

        let registered = self
            .registrar
            .register_upload(UploadedObject {
                public_url: public_url(&self.public_base_url, &key),
                store_key: key.clone(),
                original_name: file.original_name,
                mime_type: file.mime_type,
                size_bytes,
            })
            .await;

        match registered {
            Ok(record) => Ok(record),
            // The key belongs to the record that already exists; leave its object alone.
            Err(err @ MetadataError::DuplicateKey(_)) => Err(err.into()),
            Err(err) => {
                self.roll_back(&key).await;
                Err(err.into())
            }
        }
    }

    async fn roll_back(&self, key: &str) {
        match with_timeout(self.call_timeout, self.objects.delete(key)).await {
            Ok(()) => info!(key, "removed object after failed registration"),
            Err(err) => warn!(
                key,
                error = %err,
                "could not remove object after failed registration; leaving it to the reconciler"
            ),
        }
    }
}

/// `{prefix}{unix_millis}-{uuid}{.ext}`. The extension is kept only when it
/// is short and alphanumeric.
pub fn generate_key(prefix: &str, original_name: &str, now: DateTime<Utc>) -> String {
    let extension = Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();

    format!(
        "{prefix}{}-{}{extension}",
        now.timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

pub fn public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

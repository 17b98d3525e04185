//! Record registrar: the only writer of file records.

use super::metadata_store::{MetadataResult, MetadataStore, with_timeout};
use crate::{
    clock::Clock,
    models::file_record::{FileRecord, NewFileRecord},
};
use std::{sync::Arc, time::Duration};
use tracing::info;
use uuid::Uuid;

/// Attributes of an object that was just written to the object store.
#[derive(Clone, Debug)]
pub struct UploadedObject {
    pub store_key: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub public_url: String,
}

/// Creates one [`FileRecord`] per stored object and serves lookups.
///
/// `created_at` is taken from the same clock the metadata store expires
/// rows against, so the advertised expiry and the actual one agree. No
/// retries happen here; a failed call is reported to the caller as-is.
#[derive(Clone)]
pub struct RecordRegistrar {
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl RecordRegistrar {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            clock,
            call_timeout,
        }
    }

    /// Register a stored object. Starts the record's expiry clock.
    ///
    /// On error the object exists without metadata; the caller decides
    /// whether to remove it or leave it to the reconciler.
    pub async fn register_upload(&self, upload: UploadedObject) -> MetadataResult<FileRecord> {
        let record = NewFileRecord {
            store_key: upload.store_key,
            original_name: upload.original_name,
            mime_type: upload.mime_type,
            size_bytes: upload.size_bytes,
            public_url: upload.public_url,
            created_at: self.clock.now(),
        };

        let record = with_timeout(self.call_timeout, self.metadata.insert(record)).await?;
        info!(id = %record.id, store_key = %record.store_key, "registered upload");
        Ok(record)
    }

    /// Live record by id. Expired and unknown ids both yield `None`.
    pub async fn get_record(&self, id: Uuid) -> MetadataResult<Option<FileRecord>> {
        with_timeout(self.call_timeout, self.metadata.find_by_id(id)).await
    }

    /// Live record by object key.
    pub async fn find_by_key(&self, store_key: &str) -> MetadataResult<Option<FileRecord>> {
        with_timeout(self.call_timeout, self.metadata.find_by_key(store_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        services::metadata_store::{MetadataError, SqliteMetadataStore, memory_pool},
    };
    use chrono::{TimeDelta, TimeZone, Utc};

    async fn registrar() -> (Arc<ManualClock>, RecordRegistrar) {
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap(),
        ));
        let store = SqliteMetadataStore::new(
            memory_pool().await,
            Duration::from_secs(600),
            clock.clone(),
        );
        let registrar = RecordRegistrar::new(Arc::new(store), clock.clone(), Duration::from_secs(5));
        (clock, registrar)
    }

    fn upload(key: &str) -> UploadedObject {
        UploadedObject {
            store_key: key.to_string(),
            original_name: "abc.png".into(),
            mime_type: "image/png".into(),
            size_bytes: 1024,
            public_url: format!("https://cdn.example.com/{key}"),
        }
    }

    #[tokio::test]
    async fn record_is_found_until_retention_elapses() {
        let (clock, registrar) = registrar().await;
        let t0 = clock.now();
        let record = registrar
            .register_upload(upload("uploads/1000-abc.png"))
            .await
            .unwrap();
        assert_eq!(record.created_at, t0);
        assert_eq!(
            registrar.get_record(record.id).await.unwrap().as_ref(),
            Some(&record)
        );

        clock.advance(TimeDelta::seconds(601));
        assert!(registrar.get_record(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_and_unknown_ids_look_the_same() {
        let (clock, registrar) = registrar().await;
        let record = registrar
            .register_upload(upload("uploads/1000-abc.png"))
            .await
            .unwrap();
        clock.advance(TimeDelta::seconds(600));

        let expired = registrar.get_record(record.id).await.unwrap();
        let unknown = registrar.get_record(Uuid::new_v4()).await.unwrap();
        assert_eq!(expired, unknown);
    }

    #[tokio::test]
    async fn second_registration_of_a_key_fails() {
        let (_clock, registrar) = registrar().await;
        let first = registrar
            .register_upload(upload("uploads/dup.png"))
            .await
            .unwrap();
        let err = registrar
            .register_upload(upload("uploads/dup.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateKey(_)));
        assert_eq!(
            registrar.find_by_key("uploads/dup.png").await.unwrap(),
            Some(first)
        );
    }
}

//! Adapter from the `object_store` crate to [`ObjectStore`].
//!
//! Used for the S3 backend in production; tests run it over
//! `object_store::memory::InMemory`.

use super::object_client::{
    ListPage, ObjectBody, ObjectEntry, ObjectStore, ObjectStoreError, ObjectStoreResult,
    StoredObject, ensure_key_safe,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    Attribute, Attributes, PutOptions, PutPayload, aws::AmazonS3Builder, path::Path as ObjectPath,
};
use std::{io, sync::Arc};

#[derive(Clone)]
pub struct RemoteObjectStore {
    inner: Arc<dyn object_store::ObjectStore>,
    /// Prefix used to build `StoredObject::location`, e.g. `s3://bucket`.
    location_base: String,
}

impl RemoteObjectStore {
    pub fn new(inner: Arc<dyn object_store::ObjectStore>, location_base: impl Into<String>) -> Self {
        Self {
            inner,
            location_base: location_base.into(),
        }
    }

    /// Build an S3 client for `bucket`. Credentials and endpoint overrides
    /// come from the usual `AWS_*` environment variables.
    pub fn s3(bucket: &str, region: &str) -> Result<Self> {
        let s3 = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()
            .with_context(|| format!("building S3 client for bucket `{bucket}`"))?;
        Ok(Self::new(Arc::new(s3), format!("s3://{bucket}")))
    }

    fn path_for(key: &str) -> ObjectStoreResult<ObjectPath> {
        ensure_key_safe(key)?;
        ObjectPath::parse(key).map_err(|_| ObjectStoreError::InvalidKey(key.to_string()))
    }
}

fn map_not_found(key: &str, err: object_store::Error) -> ObjectStoreError {
    match err {
        object_store::Error::NotFound { .. } => ObjectStoreError::NotFound(key.to_string()),
        other => ObjectStoreError::Backend(other),
    }
}

#[async_trait]
impl ObjectStore for RemoteObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> ObjectStoreResult<StoredObject> {
        let path = Self::path_for(key)?;
        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type {
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.inner
            .put_opts(&path, PutPayload::from(body), options)
            .await?;

        Ok(StoredObject {
            key: key.to_string(),
            location: format!("{}/{}", self.location_base.trim_end_matches('/'), key),
        })
    }

    /// `object_store` lists by path segment, so the segment-aligned part of
    /// `prefix` is pushed down and the remainder is filtered here.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectStoreResult<ListPage> {
        let max_keys = max_keys.max(1);
        let dir_prefix = prefix.rfind('/').map(|idx| ObjectPath::from(&prefix[..idx]));

        let mut stream = match continuation {
            Some(token) => self
                .inner
                .list_with_offset(dir_prefix.as_ref(), &ObjectPath::from(token)),
            None => self.inner.list(dir_prefix.as_ref()),
        };

        let mut entries = Vec::with_capacity(max_keys + 1);
        while let Some(meta) = stream.try_next().await? {
            let key = meta.location.to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            entries.push(ObjectEntry {
                key,
                size_bytes: meta.size as u64,
                last_modified: meta.last_modified,
            });
            if entries.len() > max_keys {
                break;
            }
        }

        // S3 and InMemory list in key order; offset continuation relies on it.
        let next_token = if entries.len() > max_keys {
            entries.truncate(max_keys);
            entries.last().map(|entry| entry.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<ObjectBody> {
        let path = Self::path_for(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|err| map_not_found(key, err))?;
        let size_bytes = result.meta.size as u64;
        let stream = result.into_stream().map_err(io::Error::other).boxed();

        Ok(ObjectBody { size_bytes, stream })
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        let path = Self::path_for(key)?;
        // S3 deletes are unconditional, so probe first to report NotFound.
        self.inner
            .head(&path)
            .await
            .map_err(|err| map_not_found(key, err))?;
        self.inner
            .delete(&path)
            .await
            .map_err(|err| map_not_found(key, err))
    }
}

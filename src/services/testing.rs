//! Failure-injecting store doubles for sweep tests.
//!
//! "Stalled" calls never complete; callers are expected to bound them with
//! a timeout.

use super::{
    metadata_store::{MetadataError, MetadataResult, MetadataStore},
    object_client::{
        ListPage, ObjectBody, ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject,
    },
};
use crate::models::file_record::{FileRecord, NewFileRecord};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashSet,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

/// Wraps a real store; can fail one listing page, fail or stall deletes for
/// chosen keys, stall listings or reads, or ignore the requested prefix.
pub struct FlakyObjectStore {
    inner: Arc<dyn ObjectStore>,
    fail_page: Mutex<Option<usize>>,
    failing_deletes: HashSet<String>,
    stalled_deletes: HashSet<String>,
    stall_listing: bool,
    stall_gets: bool,
    ignore_prefix: bool,
    current_page: AtomicUsize,
    first_page_requests: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_page: Mutex::new(None),
            failing_deletes: HashSet::new(),
            stalled_deletes: HashSet::new(),
            stall_listing: false,
            stall_gets: false,
            ignore_prefix: false,
            current_page: AtomicUsize::new(0),
            first_page_requests: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next request for page `page` (1-based) once.
    pub fn fail_listing_on_page(self, page: usize) -> Self {
        *self.fail_page.lock().unwrap() = Some(page);
        self
    }

    pub fn fail_deleting(mut self, key: &str) -> Self {
        self.failing_deletes.insert(key.to_string());
        self
    }

    pub fn stall_deleting(mut self, key: &str) -> Self {
        self.stalled_deletes.insert(key.to_string());
        self
    }

    pub fn stall_listing(mut self) -> Self {
        self.stall_listing = true;
        self
    }

    pub fn stall_gets(mut self) -> Self {
        self.stall_gets = true;
        self
    }

    pub fn ignore_prefix(mut self) -> Self {
        self.ignore_prefix = true;
        self
    }

    pub fn first_page_requests(&self) -> usize {
        self.first_page_requests.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> ObjectStoreResult<StoredObject> {
        self.inner.put(key, body, content_type).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectStoreResult<ListPage> {
        let page = if continuation.is_none() {
            self.first_page_requests.fetch_add(1, Ordering::SeqCst);
            self.current_page.store(1, Ordering::SeqCst);
            1
        } else {
            self.current_page.fetch_add(1, Ordering::SeqCst) + 1
        };

        if self.stall_listing {
            std::future::pending::<()>().await;
        }

        {
            let mut fail_page = self.fail_page.lock().unwrap();
            if *fail_page == Some(page) {
                *fail_page = None;
                return Err(ObjectStoreError::Io(io::Error::other("injected listing failure")));
            }
        }

        let prefix = if self.ignore_prefix { "" } else { prefix };
        self.inner.list_page(prefix, continuation, max_keys).await
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<ObjectBody> {
        if self.stall_gets {
            std::future::pending::<()>().await;
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled_deletes.contains(key) {
            std::future::pending::<()>().await;
        }
        if self.failing_deletes.contains(key) {
            return Err(ObjectStoreError::Io(io::Error::other("injected delete failure")));
        }
        self.inner.delete(key).await
    }
}

/// Listing-only store whose continuation tokens go backwards: `m`, then `c`,
/// then `m` again, forever.
pub struct RewindingListing;

#[async_trait]
impl ObjectStore for RewindingListing {
    async fn put(
        &self,
        _key: &str,
        _body: Bytes,
        _content_type: Option<&str>,
    ) -> ObjectStoreResult<StoredObject> {
        Err(ObjectStoreError::Io(io::Error::other("listing-only store")))
    }

    async fn list_page(
        &self,
        _prefix: &str,
        continuation: Option<&str>,
        _max_keys: usize,
    ) -> ObjectStoreResult<ListPage> {
        let next = match continuation {
            Some("uploads/m") => "uploads/c",
            _ => "uploads/m",
        };
        Ok(ListPage {
            entries: Vec::new(),
            next_token: Some(next.to_string()),
        })
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<ObjectBody> {
        Err(ObjectStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        Err(ObjectStoreError::NotFound(key.to_string()))
    }
}

/// Wraps a real store; liveness lookups touching chosen keys fail or stall.
pub struct FlakyMetadataStore {
    inner: Arc<dyn MetadataStore>,
    unavailable: HashSet<String>,
    stalled: HashSet<String>,
    stall_ping: bool,
}

impl FlakyMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            unavailable: HashSet::new(),
            stalled: HashSet::new(),
            stall_ping: false,
        }
    }

    pub fn unavailable_for(mut self, key: &str) -> Self {
        self.unavailable.insert(key.to_string());
        self
    }

    pub fn stalled_for(mut self, key: &str) -> Self {
        self.stalled.insert(key.to_string());
        self
    }

    pub fn stall_ping(mut self) -> Self {
        self.stall_ping = true;
        self
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadataStore {
    async fn insert(&self, record: NewFileRecord) -> MetadataResult<FileRecord> {
        self.inner.insert(record).await
    }

    async fn find_by_key(&self, store_key: &str) -> MetadataResult<Option<FileRecord>> {
        if self.unavailable.contains(store_key) {
            return Err(MetadataError::Persistence(sqlx::Error::PoolTimedOut));
        }
        self.inner.find_by_key(store_key).await
    }

    async fn find_by_id(&self, id: Uuid) -> MetadataResult<Option<FileRecord>> {
        self.inner.find_by_id(id).await
    }

    async fn live_keys(&self, store_keys: &[String]) -> MetadataResult<HashSet<String>> {
        if store_keys.iter().any(|key| self.unavailable.contains(key)) {
            return Err(MetadataError::Persistence(sqlx::Error::PoolTimedOut));
        }
        if store_keys.iter().any(|key| self.stalled.contains(key)) {
            std::future::pending::<()>().await;
        }
        self.inner.live_keys(store_keys).await
    }

    async fn ping(&self) -> MetadataResult<()> {
        if self.stall_ping {
            std::future::pending::<()>().await;
        }
        self.inner.ping().await
    }
}

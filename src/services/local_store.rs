//! src/services/local_store.rs
//!
//! LocalObjectStore: object payloads on local disk, sharded beneath
//! `base_path/{shard}/{shard}/{key}`. Content types are not persisted here;
//! the file record carries them.

use super::object_client::{
    ListPage, ObjectBody, ObjectEntry, ObjectStore, ObjectStoreError, ObjectStoreResult,
    StoredObject, ensure_key_safe,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const TMP_PREFIX: &str = ".tmp-";
const CREATE_ATTEMPTS: usize = 5;

/// Sorted entries from the last first-page walk, served to continuation calls.
#[derive(Debug)]
struct ListingSnapshot {
    prefix: String,
    entries: Arc<Vec<ObjectEntry>>,
}

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
    snapshot: Arc<Mutex<Option<ListingSnapshot>>>,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            snapshot: Arc::new(Mutex::new(None)),
        }
    }

    /// Two-level shard identifiers for an object key: the first two bytes of
    /// MD5(key) as lowercase hex. Keeps per-directory file counts small.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Inverse of [`object_path`](Self::object_path). Files whose shard
    /// directories do not match their key were not written by this store and
    /// are ignored.
    fn key_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let mut parts = relative.components().map(|c| c.as_os_str().to_str());
        let shard_a = parts.next()??;
        let shard_b = parts.next()??;
        let rest = parts.collect::<Option<Vec<&str>>>()?;
        if rest.is_empty() {
            return None;
        }
        let key = rest.join("/");
        let (expected_a, expected_b) = Self::object_shards(&key);
        (expected_a == shard_a && expected_b == shard_b).then_some(key)
    }

    /// Walk the whole tree and return every object under `prefix`, sorted by key.
    async fn collect_entries(&self, prefix: &str) -> ObjectStoreResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = read_dir.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file()
                    || entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
                {
                    continue;
                }
                let Some(key) = self.key_for_path(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }

                let meta = entry.metadata().await?;
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                entries.push(ObjectEntry {
                    key,
                    size_bytes: meta.len(),
                    last_modified,
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Entries for one listing. The first page walks the tree and snapshots
    /// the result; continuation pages for the same prefix reuse it.
    async fn listing(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> ObjectStoreResult<Arc<Vec<ObjectEntry>>> {
        let mut snapshot = self.snapshot.lock().await;
        if continuation.is_some() {
            if let Some(cached) = snapshot.as_ref().filter(|s| s.prefix == prefix) {
                return Ok(cached.entries.clone());
            }
        }

        let entries = Arc::new(self.collect_entries(prefix).await?);
        *snapshot = Some(ListingSnapshot {
            prefix: prefix.to_string(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Write to a temporary file, fsync, then rename into place so readers
    /// and listings never observe a partial payload.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        _content_type: Option<&str>,
    ) -> ObjectStoreResult<StoredObject> {
        ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        let tmp_path = parent.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = create_in_dir(&parent, &tmp_path).await?;

        let written = async {
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }

        Ok(StoredObject {
            key: key.to_string(),
            location: format!("file://{}", file_path.display()),
        })
    }

    /// The tree is walked once per listing, on its first page; later pages
    /// come from that snapshot. Continuation is "strictly after this key".
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectStoreResult<ListPage> {
        let max_keys = max_keys.max(1);
        let all = self.listing(prefix, continuation).await?;
        let start = match continuation {
            Some(token) => all.partition_point(|entry| entry.key.as_str() <= token),
            None => 0,
        };

        let mut entries: Vec<ObjectEntry> =
            all.iter().skip(start).take(max_keys + 1).cloned().collect();
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
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let size_bytes = file.metadata().await?.len();

        Ok(ObjectBody {
            size_bytes,
            stream: ReaderStream::new(file).boxed(),
        })
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }
}

/// Create `path` inside `parent`, recreating `parent` when a concurrent
/// delete prunes it between `create_dir_all` and the create.
async fn create_in_dir(parent: &Path, path: &Path) -> io::Result<File> {
    let mut attempt = 1;
    loop {
        let created = match fs::create_dir_all(parent).await {
            Ok(()) => File::create(path).await,
            Err(err) => Err(err),
        };
        match created {
            Err(err) if err.kind() == ErrorKind::NotFound && attempt < CREATE_ATTEMPTS => {
                debug!("{} vanished before create; retrying", parent.display());
                attempt += 1;
            }
            result => return result,
        }
    }
}

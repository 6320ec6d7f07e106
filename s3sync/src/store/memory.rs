//! In-process store used by tests and dry runs of embedding applications

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use md5::{Digest, Md5};

use super::{
    GetObject, ListPage, ListRequest, ObjectEntry, ObjectMetadata, PutObject, RemoteStore,
    StoreConnection, StoreError, StoreResult,
};

const BODY_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Connect,
    List,
    Get,
    Head,
    Put,
    Delete,
}

/// Calls seen by a [`MemoryStore`], failed attempts included
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub connects: usize,
    pub lists: usize,
    pub gets: usize,
    pub heads: usize,
    pub puts: usize,
    pub deletes: usize,
}

impl StoreStats {
    pub fn network_calls(&self) -> usize {
        self.connects + self.lists + self.gets + self.heads + self.puts + self.deletes
    }

    pub fn mutations(&self) -> usize {
        self.puts + self.deletes
    }

    fn record(&mut self, operation: StoreOperation) {
        match operation {
            StoreOperation::Connect => self.connects += 1,
            StoreOperation::List => self.lists += 1,
            StoreOperation::Get => self.gets += 1,
            StoreOperation::Head => self.heads += 1,
            StoreOperation::Put => self.puts += 1,
            StoreOperation::Delete => self.deletes += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    /// Quoted, the way S3 reports it
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
}

impl StoredObject {
    fn new(data: Bytes, metadata: HashMap<String, String>) -> Self {
        let etag = format!("\"{}\"", hex::encode(Md5::digest(&data)));
        Self {
            data,
            etag,
            last_modified: Utc::now(),
            metadata,
            headers: Vec::new(),
        }
    }

    fn head(&self) -> ObjectMetadata {
        ObjectMetadata {
            size: self.data.len() as u64,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            user: self.metadata.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    faults: VecDeque<(StoreOperation, StoreError)>,
    stats: StoreStats,
    journal: Vec<(StoreOperation, String)>,
    hosts: Vec<Option<String>>,
}

impl State {
    /// Count the call and hand back a scripted failure if one is queued for it
    fn begin(&mut self, operation: StoreOperation, subject: &str) -> StoreResult<()> {
        self.stats.record(operation);
        self.journal.push((operation, subject.to_string()));
        match self.faults.iter().position(|(op, _)| *op == operation) {
            Some(index) => match self.faults.remove(index) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn bucket(&mut self, bucket: &str) -> StoreResult<&mut BTreeMap<String, StoredObject>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::status(404, format!("NoSuchBucket: {}", bucket)))
    }
}

/// Bucket store kept entirely in memory.
///
/// Besides holding objects it counts every call, keeps a journal of
/// operations in the order they were issued and replays scripted
/// failures, which makes it the stub of choice for exercising the
/// retry controller.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one empty bucket
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::new();
        store.create_bucket(bucket);
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Place an object directly, bypassing stats and faults
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) {
        let object = StoredObject::new(data.into(), metadata);
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn set_last_modified(&self, bucket: &str, key: &str, when: DateTime<Utc>) {
        if let Some(object) = self
            .lock()
            .buckets
            .get_mut(bucket)
            .and_then(|objects| objects.get_mut(key))
        {
            object.last_modified = when;
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue failures for the next calls of `operation`, consumed in order
    pub fn fail_next(&self, operation: StoreOperation, errors: impl IntoIterator<Item = StoreError>) {
        let mut state = self.lock();
        for error in errors {
            state.faults.push_back((operation, error));
        }
    }

    pub fn pending_faults(&self) -> usize {
        self.lock().faults.len()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats.clone()
    }

    /// Every call in issue order, with its key, prefix or bucket
    pub fn journal(&self) -> Vec<(StoreOperation, String)> {
        self.lock().journal.clone()
    }

    /// Host argument of every `connect` call
    pub fn connected_hosts(&self) -> Vec<Option<String>> {
        self.lock().hosts.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn connect(&self, bucket: &str, host: Option<&str>) -> StoreResult<Arc<dyn StoreConnection>> {
        let mut state = self.lock();
        state.hosts.push(host.map(str::to_string));
        state.begin(StoreOperation::Connect, bucket)?;
        Ok(Arc::new(MemoryConnection {
            bucket: bucket.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn list(&self, request: &ListRequest) -> StoreResult<ListPage> {
        let mut state = self.lock();
        state.begin(StoreOperation::List, &request.prefix)?;
        let objects = state.bucket(&self.bucket)?;

        let mut page = ListPage::default();
        let mut count = 0u32;
        let mut last = None;

        for (key, object) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if request.marker.as_deref().is_some_and(|marker| key.as_str() <= marker) {
                continue;
            }

            let rest = &key[request.prefix.len()..];
            let common_prefix = request.delimiter.as_deref().and_then(|delimiter| {
                rest.find(delimiter)
                    .map(|pos| key[..request.prefix.len() + pos + delimiter.len()].to_string())
            });

            if let Some(common_prefix) = common_prefix {
                if page.common_prefixes.last() == Some(&common_prefix)
                    || request
                        .marker
                        .as_deref()
                        .is_some_and(|marker| marker >= common_prefix.as_str())
                {
                    continue;
                }
                if count == request.max_keys {
                    page.is_truncated = true;
                    break;
                }
                last = Some(common_prefix.clone());
                page.common_prefixes.push(common_prefix);
            } else {
                if count == request.max_keys {
                    page.is_truncated = true;
                    break;
                }
                last = Some(key.clone());
                page.entries.push(ObjectEntry {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    etag: object.etag.clone(),
                    last_modified: object.last_modified,
                });
            }
            count += 1;
        }

        if page.is_truncated {
            page.next_marker = last;
        }
        Ok(page)
    }

    async fn get(&self, key: &str) -> StoreResult<GetObject> {
        let mut state = self.lock();
        state.begin(StoreOperation::Get, key)?;
        let object = state
            .bucket(&self.bucket)?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::status(404, format!("NoSuchKey: {}", key)))?;

        let chunks: Vec<std::io::Result<Bytes>> = object
            .data
            .chunks(BODY_CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        Ok(GetObject {
            metadata: object.head(),
            body: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata> {
        let mut state = self.lock();
        state.begin(StoreOperation::Head, key)?;
        state
            .bucket(&self.bucket)?
            .get(key)
            .map(StoredObject::head)
            .ok_or_else(|| StoreError::status(404, format!("NoSuchKey: {}", key)))
    }

    async fn put(&self, key: &str, object: PutObject) -> StoreResult<()> {
        {
            let mut state = self.lock();
            state.begin(StoreOperation::Put, key)?;
            state.bucket(&self.bucket)?;
        }

        // Buffer the whole body first so a failed upload never replaces the old object
        let chunks: Vec<Bytes> = object.body.try_collect().await?;
        let data: Bytes = chunks.concat().into();
        if data.len() as u64 != object.content_length {
            return Err(StoreError::status(
                400,
                format!(
                    "IncompleteBody: expected {} bytes, got {}",
                    object.content_length,
                    data.len()
                ),
            ));
        }

        let mut stored = StoredObject::new(data, object.metadata);
        stored.headers = object.headers;
        self.lock().bucket(&self.bucket)?.insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.begin(StoreOperation::Delete, key)?;
        state.bucket(&self.bucket)?.remove(key);
        Ok(())
    }
}

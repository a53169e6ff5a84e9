//! Document store abstraction plus in-memory and file-backed implementations.
//!
//! Keys within a collection are ordered lexicographically, which is what the
//! geohash range scans rely on.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Upper bound on writes per committed batch.
pub const MAX_BATCH_WRITES: usize = 400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch of {size} writes exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// One document write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub key: String,
    pub document: Value,
    pub merge: bool,
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Documents with `start <= key <= end`, ordered by key.
    fn query_range(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Apply all writes of one batch. Implementations reject batches above
    /// [`MAX_BATCH_WRITES`].
    fn batch_write(&self, collection: &str, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Every document of a collection, ordered by key.
    fn scan(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        // '~' sorts after every geohash character
        self.query_range(collection, "", "~")
    }
}

/// Merge-write: objects merge recursively, everything else is replaced.
pub fn merge_document(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_document(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

fn apply_writes(collection: &mut BTreeMap<String, Value>, writes: Vec<Write>) {
    for write in writes {
        match collection.get_mut(&write.key) {
            Some(existing) if write.merge => merge_document(existing, write.document),
            _ => {
                collection.insert(write.key, write.document);
            }
        }
    }
}

fn check_batch(writes: &[Write]) -> Result<(), StoreError> {
    if writes.len() > MAX_BATCH_WRITES {
        return Err(StoreError::BatchTooLarge {
            size: writes.len(),
            limit: MAX_BATCH_WRITES,
        });
    }
    Ok(())
}

fn range_of(
    collection: Option<&BTreeMap<String, Value>>,
    start: &str,
    end: &str,
) -> Vec<(String, Value)> {
    let Some(collection) = collection else {
        return Vec::new();
    };
    if start > end {
        return Vec::new();
    }
    collection
        .range(start.to_string()..=end.to_string())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Ordered in-memory collections.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Collections>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.lock()?;
        Ok(collections.get(collection).and_then(|c| c.get(key)).cloned())
    }

    fn query_range(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let collections = self.lock()?;
        Ok(range_of(collections.get(collection), start, end))
    }

    fn batch_write(&self, collection: &str, writes: Vec<Write>) -> Result<(), StoreError> {
        check_batch(&writes)?;
        let mut collections = self.lock()?;
        apply_writes(collections.entry(collection.to_string()).or_default(), writes);
        Ok(())
    }
}

/// One JSON file per collection under a directory. Each batch rewrites the
/// collection file through a temp file + rename, so a batch lands whole or not at all.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            guard: Mutex::new(()),
        })
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }

    fn read_collection(&self, collection: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)?;
        let docs: Map<String, Value> = serde_json::from_str(&content)?;
        Ok(docs.into_iter().collect())
    }

    fn write_collection(
        &self,
        collection: &str,
        docs: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let path = self.path_for(collection);
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string(docs)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.guard
            .lock()
            .map_err(|_| StoreError::Backend("file store lock poisoned".to_string()))
    }
}

impl DocumentStore for FileStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock()?;
        Ok(self.read_collection(collection)?.remove(key))
    }

    fn query_range(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let _guard = self.lock()?;
        let docs = self.read_collection(collection)?;
        Ok(range_of(Some(&docs), start, end))
    }

    fn batch_write(&self, collection: &str, writes: Vec<Write>) -> Result<(), StoreError> {
        check_batch(&writes)?;
        let _guard = self.lock()?;
        let mut docs = self.read_collection(collection)?;
        apply_writes(&mut docs, writes);
        self.write_collection(collection, &docs)
    }
}

//! Thread-safe handles. One lock per handle serializes every mutation; the
//! in-memory handle lets queries share a read lock, the durable handle takes
//! the exclusive lock for everything because it owns the open log file.

use std::path::Path;

use parking_lot::{Mutex, RwLock};
use schema::{NewRecord, QueryHit, QueryOptions};

use crate::{CheckpointStats, DurableOptions, DurableStore, RecordStore, StoreError};

#[derive(Debug)]
pub struct SharedRecordStore {
    inner: RwLock<RecordStore>,
}

impl SharedRecordStore {
    pub fn new(dimension: usize) -> Result<Self, StoreError> {
        RecordStore::new(dimension).map(Self::from)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        RecordStore::load(path).map(Self::from)
    }

    pub fn dimension(&self) -> usize {
        self.inner.read().dimension()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn insert(
        &self,
        task_id: impl Into<String>,
        embedding: Vec<f32>,
        reward: f32,
    ) -> Result<(), StoreError> {
        self.inner.write().insert(task_id, embedding, reward)
    }

    pub fn insert_batch(&self, items: Vec<NewRecord>) -> Result<(), StoreError> {
        self.inner.write().insert_batch(items)
    }

    pub fn query(
        &self,
        query_embedding: &[f32],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.inner.read().query(query_embedding, min_reward, top_k)
    }

    pub fn query_with_options(
        &self,
        query_embedding: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.inner.read().query_with_options(query_embedding, opts)
    }

    pub fn prune_older_than(&self, cutoff_ms: i64) -> usize {
        self.inner.write().prune_older_than(cutoff_ms)
    }

    pub fn prune_keep_newest(&self, n: usize) -> usize {
        self.inner.write().prune_keep_newest(n)
    }

    pub fn prune_keep_highest_reward(&self, n: usize) -> usize {
        self.inner.write().prune_keep_highest_reward(n)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        self.inner.read().save(path)
    }

    /// Run `f` against a consistent view of the store.
    pub fn with_read<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        f(&self.inner.read())
    }
}

impl From<RecordStore> for SharedRecordStore {
    fn from(store: RecordStore) -> Self {
        Self {
            inner: RwLock::new(store),
        }
    }
}

#[derive(Debug)]
pub struct SharedDurableStore {
    inner: Mutex<DurableStore>,
}

impl SharedDurableStore {
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StoreError> {
        DurableStore::open(path, dimension).map(Self::from)
    }

    pub fn open_exact_with_checkpoint(
        path: impl AsRef<Path>,
        dimension: usize,
    ) -> Result<Self, StoreError> {
        DurableStore::open_exact_with_checkpoint(path, dimension).map(Self::from)
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        dimension: usize,
        options: DurableOptions,
    ) -> Result<Self, StoreError> {
        DurableStore::open_with_options(path, dimension, options).map(Self::from)
    }

    pub fn dimension(&self) -> usize {
        self.inner.lock().dimension()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn insert(
        &self,
        task_id: impl Into<String>,
        embedding: Vec<f32>,
        reward: f32,
    ) -> Result<(), StoreError> {
        self.inner.lock().insert(task_id, embedding, reward)
    }

    pub fn insert_batch(&self, items: Vec<NewRecord>) -> Result<(), StoreError> {
        self.inner.lock().insert_batch(items)
    }

    pub fn query(
        &self,
        query_embedding: &[f32],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.inner.lock().query(query_embedding, min_reward, top_k)
    }

    pub fn query_with_options(
        &self,
        query_embedding: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.inner.lock().query_with_options(query_embedding, opts)
    }

    pub fn prune_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        self.inner.lock().prune_older_than(cutoff_ms)
    }

    pub fn prune_keep_newest(&self, n: usize) -> Result<usize, StoreError> {
        self.inner.lock().prune_keep_newest(n)
    }

    pub fn prune_keep_highest_reward(&self, n: usize) -> Result<usize, StoreError> {
        self.inner.lock().prune_keep_highest_reward(n)
    }

    pub fn checkpoint(&self) -> Result<CheckpointStats, StoreError> {
        self.inner.lock().checkpoint()
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut DurableStore) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl From<DurableStore> for SharedDurableStore {
    fn from(store: DurableStore) -> Self {
        Self {
            inner: Mutex::new(store),
        }
    }
}

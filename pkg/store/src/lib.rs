use std::{path::Path, sync::Arc};

use ranking::rank_records;
use schema::{
    Clock, NewRecord, QueryHit, QueryOptions, Record, SystemClock, ValidationError,
    validate_dimension, validate_embedding, validate_new_record,
};
use thiserror::Error;
use tracing::debug;

mod codec;
pub mod config;
pub mod durable;
pub mod pruning;
pub mod shared;
pub mod snapshot;
pub mod wal;

pub use durable::{
    CHECKPOINT_FILE, CheckpointPolicy, CheckpointStats, DurableOptions, DurableStore,
    RecoveryStats, WAL_FILE,
};
pub use pruning::PrunePolicy;
pub use shared::{SharedDurableStore, SharedRecordStore};
pub use snapshot::{SnapshotContents, decode_snapshot, encode_snapshot};
pub use wal::{FileWal, WalContents, WalEntry};

/// Stable discriminant of [`StoreError`] for callers that map failures to
/// codes rather than messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidDimension,
    DimensionMismatch,
    InvalidReward,
    InvalidTaskId,
    CorruptSnapshot,
    PersistenceError,
    NotFound,
    InternalError,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid dimension {0}: must be greater than zero")]
    InvalidDimension(usize),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid reward {0}: must be finite")]
    InvalidReward(f32),
    #[error("invalid task_id: cannot be empty")]
    InvalidTaskId,
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("persistence error: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDimension(_) => ErrorKind::InvalidDimension,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::InvalidReward(_) => ErrorKind::InvalidReward,
            Self::InvalidTaskId => ErrorKind::InvalidTaskId,
            Self::CorruptSnapshot(_) => ErrorKind::CorruptSnapshot,
            Self::Persistence { .. } => ErrorKind::PersistenceError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        match value {
            ValidationError::InvalidDimension(dimension) => Self::InvalidDimension(dimension),
            ValidationError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            ValidationError::InvalidReward(reward) => Self::InvalidReward(reward),
            ValidationError::EmptyTaskId => Self::InvalidTaskId,
        }
    }
}

pub(crate) fn io_error(context: impl Into<String>, source: std::io::Error) -> StoreError {
    StoreError::Persistence {
        context: context.into(),
        source,
    }
}

/// In-memory record index: a fixed embedding dimension and the records in
/// insertion order. No I/O except explicit [`RecordStore::save`] /
/// [`RecordStore::load`].
#[derive(Debug, Clone)]
pub struct RecordStore {
    dimension: usize,
    records: Vec<Record>,
    clock: Arc<dyn Clock>,
    last_timestamp: i64,
}

impl RecordStore {
    pub fn new(dimension: usize) -> Result<Self, StoreError> {
        Self::with_clock(dimension, Arc::new(SystemClock))
    }

    pub fn with_clock(dimension: usize, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        validate_dimension(dimension)?;
        Ok(Self {
            dimension,
            records: Vec::new(),
            clock,
            last_timestamp: i64::MIN,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Read-only view in insertion order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn insert(
        &mut self,
        task_id: impl Into<String>,
        embedding: Vec<f32>,
        reward: f32,
    ) -> Result<(), StoreError> {
        self.insert_batch(vec![NewRecord::new(task_id, embedding, reward)])
    }

    /// All-or-nothing: every item is validated before any is appended.
    pub fn insert_batch(&mut self, items: Vec<NewRecord>) -> Result<(), StoreError> {
        for item in &items {
            validate_new_record(item, self.dimension)?;
        }
        let timestamp = self.next_timestamp();
        for item in items {
            self.apply_record(item.into_record(timestamp));
        }
        Ok(())
    }

    pub fn query(
        &self,
        query_embedding: &[f32],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.query_with_options(query_embedding, &QueryOptions::new(min_reward, top_k))
    }

    pub fn query_with_options(
        &self,
        query_embedding: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<QueryHit>, StoreError> {
        validate_embedding(query_embedding, self.dimension)?;
        Ok(rank_records(&self.records, query_embedding, opts))
    }

    pub fn query_batch(
        &self,
        queries: &[Vec<f32>],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<Vec<QueryHit>>, StoreError> {
        let opts = QueryOptions::new(min_reward, top_k);
        queries
            .iter()
            .map(|query| self.query_with_options(query, &opts))
            .collect()
    }

    pub fn prune_older_than(&mut self, cutoff_ms: i64) -> usize {
        self.apply_prune(PrunePolicy::OlderThan(cutoff_ms))
    }

    pub fn prune_keep_newest(&mut self, n: usize) -> usize {
        self.apply_prune(PrunePolicy::KeepNewest(n))
    }

    pub fn prune_keep_highest_reward(&mut self, n: usize) -> usize {
        self.apply_prune(PrunePolicy::KeepHighestReward(n))
    }

    pub fn to_snapshot_bytes(&self) -> Vec<u8> {
        encode_snapshot(self.dimension, &self.records)
    }

    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Self::from_snapshot_bytes_with_clock(bytes, Arc::new(SystemClock))
    }

    pub fn from_snapshot_bytes_with_clock(
        bytes: &[u8],
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let contents = decode_snapshot(bytes)?;
        let mut store = Self::with_clock(contents.dimension, clock)?;
        for record in contents.records {
            store.apply_record(record);
        }
        Ok(store)
    }

    /// Write a snapshot to `path` (temporary sibling + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        snapshot::write_atomic(path.as_ref(), &self.to_snapshot_bytes())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::load_with_clock(path, Arc::new(SystemClock))
    }

    pub fn load_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let bytes = snapshot::read_required(path.as_ref())?;
        Self::from_snapshot_bytes_with_clock(&bytes, clock)
    }

    /// Never earlier than any timestamp already handed out, whatever the
    /// clock reports.
    pub(crate) fn next_timestamp(&self) -> i64 {
        self.clock.now_millis().max(self.last_timestamp)
    }

    /// Append an already-validated record, keeping its timestamp.
    pub(crate) fn apply_record(&mut self, record: Record) {
        self.last_timestamp = self.last_timestamp.max(record.timestamp);
        self.records.push(record);
    }

    pub(crate) fn apply_prune(&mut self, policy: PrunePolicy) -> usize {
        let removed = match policy.removal_mask(&self.records) {
            Some(mask) => self.apply_removal_mask(&mask),
            None => 0,
        };
        debug!(policy = policy.name(), removed, remaining = self.len(), "pruned records");
        removed
    }

    pub(crate) fn apply_removal_mask(&mut self, mask: &[bool]) -> usize {
        self.remove_by_predicate(|position, _| mask.get(position).copied().unwrap_or(false))
    }

    /// Shared removal path for every pruning policy; survivors keep their
    /// relative order.
    pub(crate) fn remove_by_predicate<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(usize, &Record) -> bool,
    {
        let before = self.records.len();
        let mut position = 0usize;
        self.records.retain(|record| {
            let remove = predicate(position, record);
            position += 1;
            !remove
        });
        before - self.records.len()
    }
}

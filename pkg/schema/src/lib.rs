use std::{
    fmt::Debug,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

// ---------------------------------------------------------------------------
// Core domain types
// ---------------------------------------------------------------------------

/// One stored task experience. Never mutated after insertion; pruning only
/// removes whole records.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub task_id: String,
    pub embedding: Vec<f32>,
    pub reward: f32,
    /// Epoch-millis assigned by the store at insertion.
    pub timestamp: i64,
}

/// Caller-supplied half of a record; the store assigns the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub task_id: String,
    pub embedding: Vec<f32>,
    pub reward: f32,
}

impl NewRecord {
    pub fn new(task_id: impl Into<String>, embedding: Vec<f32>, reward: f32) -> Self {
        Self {
            task_id: task_id.into(),
            embedding,
            reward,
        }
    }

    pub fn into_record(self, timestamp: i64) -> Record {
        Record {
            task_id: self.task_id,
            embedding: self.embedding,
            reward: self.reward,
            timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Query request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Inclusive reward floor.
    pub min_reward: f32,
    pub top_k: usize,
    pub task_id_prefix: Option<String>,
    /// Inclusive lower timestamp bound (epoch-millis).
    pub time_after: Option<i64>,
    /// Inclusive upper timestamp bound (epoch-millis).
    pub time_before: Option<i64>,
    /// Copy the matched embedding into each hit. Off by default.
    pub include_embedding: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            min_reward: f32::NEG_INFINITY,
            top_k: 10,
            task_id_prefix: None,
            time_after: None,
            time_before: None,
            include_embedding: false,
        }
    }
}

impl QueryOptions {
    pub fn new(min_reward: f32, top_k: usize) -> Self {
        Self {
            min_reward,
            top_k,
            ..Self::default()
        }
    }

    pub fn task_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.task_id_prefix = Some(prefix.into());
        self
    }

    pub fn time_after(mut self, timestamp: i64) -> Self {
        self.time_after = Some(timestamp);
        self
    }

    pub fn time_before(mut self, timestamp: i64) -> Self {
        self.time_before = Some(timestamp);
        self
    }

    pub fn with_embeddings(mut self) -> Self {
        self.include_embedding = true;
        self
    }

    /// Filter half of a query: does `record` qualify for scoring at all.
    pub fn matches(&self, record: &Record) -> bool {
        if !(record.reward >= self.min_reward) {
            return false;
        }
        if let Some(prefix) = &self.task_id_prefix
            && !record.task_id.starts_with(prefix.as_str())
        {
            return false;
        }
        if self.time_after.is_some_and(|after| record.timestamp < after) {
            return false;
        }
        if self
            .time_before
            .is_some_and(|before| record.timestamp > before)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub task_id: String,
    pub reward: f32,
    pub timestamp: i64,
    pub score: f32,
    /// Present only when `QueryOptions::include_embedding` was set.
    pub embedding: Option<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("dimension must be greater than zero, got {0}")]
    InvalidDimension(usize),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("reward must be finite, got {0}")]
    InvalidReward(f32),
    #[error("task_id cannot be empty")]
    EmptyTaskId,
}

pub fn validate_dimension(dimension: usize) -> Result<(), ValidationError> {
    if dimension == 0 {
        return Err(ValidationError::InvalidDimension(dimension));
    }
    Ok(())
}

pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<(), ValidationError> {
    if embedding.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            actual: embedding.len(),
        });
    }
    Ok(())
}

pub fn validate_reward(reward: f32) -> Result<(), ValidationError> {
    if !reward.is_finite() {
        return Err(ValidationError::InvalidReward(reward));
    }
    Ok(())
}

pub fn validate_new_record(record: &NewRecord, dimension: usize) -> Result<(), ValidationError> {
    if record.task_id.is_empty() {
        return Err(ValidationError::EmptyTaskId);
    }
    validate_embedding(&record.embedding, dimension)?;
    validate_reward(record.reward)
}

/// Same checks as [`validate_new_record`], for records that already carry a
/// timestamp (snapshot and log replay).
pub fn validate_record(record: &Record, dimension: usize) -> Result<(), ValidationError> {
    if record.task_id.is_empty() {
        return Err(ValidationError::EmptyTaskId);
    }
    validate_embedding(&record.embedding, dimension)?;
    validate_reward(record.reward)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of insertion timestamps. The store layers monotonicity on top, so
/// implementations may step backwards.
pub trait Clock: Debug + Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for deterministic tests and benchmarks.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> i64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

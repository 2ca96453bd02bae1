use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    sync::Arc,
};

use schema::{
    Clock, NewRecord, QueryHit, QueryOptions, Record, SystemClock, validate_dimension,
    validate_new_record, validate_record,
};
use tracing::{debug, info, warn};

use crate::{
    PrunePolicy, RecordStore, StoreError,
    codec::{generation_line, parse_generation_line},
    io_error,
    snapshot::{SnapshotContents, decode_snapshot, encode_snapshot, read_required, write_atomic},
    wal::{FileWal, WalEntry},
};

pub const CHECKPOINT_FILE: &str = "checkpoint.snap";
pub const WAL_FILE: &str = "wal.log";
pub const CHECKPOINT_TAG: &str = "EXPCKPT";

/// Automatic checkpoint thresholds, checked after every successful mutation.
/// Both disabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointPolicy {
    pub max_wal_records: Option<usize>,
    pub max_wal_bytes: Option<u64>,
}

impl CheckpointPolicy {
    pub fn is_due(&self, wal: &FileWal) -> bool {
        let record_threshold_met = match self.max_wal_records {
            Some(threshold) if threshold > 0 => wal.entry_count() >= threshold,
            _ => false,
        };
        let byte_threshold_met = match self.max_wal_bytes {
            Some(threshold) if threshold > 0 => wal.size_bytes() >= threshold,
            _ => false,
        };
        record_threshold_met || byte_threshold_met
    }
}

#[derive(Debug, Clone)]
pub struct DurableOptions {
    pub checkpoint: CheckpointPolicy,
    /// fsync every log append before acknowledging it.
    pub sync_writes: bool,
    pub clock: Arc<dyn Clock>,
    /// Checkpoint immediately after recovery so the directory holds one
    /// exact snapshot and an empty log.
    pub compact_on_open: bool,
}

impl Default for DurableOptions {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointPolicy::default(),
            sync_writes: true,
            clock: Arc::new(SystemClock),
            compact_on_open: false,
        }
    }
}

impl DurableOptions {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_checkpoint_policy(mut self, checkpoint: CheckpointPolicy) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn compact_on_open(mut self, compact: bool) -> Self {
        self.compact_on_open = compact;
        self
    }
}

/// What the last open reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStats {
    pub checkpoint_records: usize,
    pub replayed_entries: usize,
    /// Entries of a log left behind by a checkpoint that crashed after its
    /// rename; their effect is already in the checkpoint.
    pub discarded_stale_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub snapshot_records: usize,
    pub truncated_wal_entries: usize,
    pub generation: u64,
}

/// A [`RecordStore`] bound to a directory holding `checkpoint.snap` and
/// `wal.log`. Every mutation is appended to the log before it is applied in
/// memory.
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
    store: RecordStore,
    wal: FileWal,
    generation: u64,
    options: DurableOptions,
    recovery: RecoveryStats,
}

impl DurableStore {
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StoreError> {
        Self::open_with_options(path, dimension, DurableOptions::default())
    }

    pub fn open_exact_with_checkpoint(
        path: impl AsRef<Path>,
        dimension: usize,
    ) -> Result<Self, StoreError> {
        Self::open_with_options(
            path,
            dimension,
            DurableOptions::default().compact_on_open(true),
        )
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        dimension: usize,
        options: DurableOptions,
    ) -> Result<Self, StoreError> {
        let compact = options.compact_on_open;
        let mut store = Self::recover(path.as_ref(), dimension, options)?;
        if compact {
            store.checkpoint()?;
        }
        info!(
            path = %store.dir.display(),
            dimension,
            records = store.len(),
            checkpoint_records = store.recovery.checkpoint_records,
            replayed_entries = store.recovery.replayed_entries,
            discarded_stale_entries = store.recovery.discarded_stale_entries,
            generation = store.generation,
            "opened durable store"
        );
        Ok(store)
    }

    fn recover(dir: &Path, dimension: usize, options: DurableOptions) -> Result<Self, StoreError> {
        validate_dimension(dimension)?;
        create_dir_all(dir)
            .map_err(|err| io_error(format!("create directory {}", dir.display()), err))?;
        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        let wal_path = dir.join(WAL_FILE);

        let checkpoint = read_checkpoint(&checkpoint_path)?;
        let log = FileWal::read(&wal_path)?;
        let mut store = RecordStore::with_clock(dimension, options.clock.clone())?;
        let mut recovery = RecoveryStats::default();

        let Some((generation, contents)) = checkpoint else {
            if !log.entries.is_empty() {
                return Err(StoreError::CorruptSnapshot(format!(
                    "{} holds {} entries but {} is missing",
                    wal_path.display(),
                    log.entries.len(),
                    checkpoint_path.display()
                )));
            }
            write_checkpoint(&checkpoint_path, 0, &store)?;
            let wal = FileWal::create(&wal_path, 0, options.sync_writes)?;
            return Ok(Self {
                dir: dir.to_path_buf(),
                store,
                wal,
                generation: 0,
                options,
                recovery,
            });
        };

        if contents.dimension != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: contents.dimension,
            });
        }
        recovery.checkpoint_records = contents.records.len();
        for record in contents.records {
            store.apply_record(record);
        }

        let wal = match log.generation {
            Some(wal_generation) if wal_generation == generation => {
                recovery.replayed_entries = log.entries.len();
                for (index, entry) in log.entries.into_iter().enumerate() {
                    replay_entry(&mut store, entry).map_err(|message| {
                        StoreError::CorruptSnapshot(format!("log entry {index}: {message}"))
                    })?;
                }
                FileWal::open_append(
                    &wal_path,
                    generation,
                    recovery.replayed_entries,
                    options.sync_writes,
                )?
            }
            Some(wal_generation) if wal_generation > generation => {
                return Err(StoreError::CorruptSnapshot(format!(
                    "log generation {wal_generation} is ahead of checkpoint generation {generation}"
                )));
            }
            stale => {
                if let Some(wal_generation) = stale {
                    recovery.discarded_stale_entries = log.entries.len();
                    warn!(
                        path = %wal_path.display(),
                        wal_generation,
                        checkpoint_generation = generation,
                        discarded = recovery.discarded_stale_entries,
                        "discarding log already covered by checkpoint"
                    );
                }
                FileWal::create(&wal_path, generation, options.sync_writes)?
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            wal,
            generation,
            options,
            recovery,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        self.store.records()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn wal_entry_count(&self) -> usize {
        self.wal.entry_count()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    pub fn options(&self) -> &DurableOptions {
        &self.options
    }

    pub fn insert(
        &mut self,
        task_id: impl Into<String>,
        embedding: Vec<f32>,
        reward: f32,
    ) -> Result<(), StoreError> {
        self.insert_batch(vec![NewRecord::new(task_id, embedding, reward)])
    }

    /// All items are validated, logged in a single durable append, then
    /// applied. Nothing is applied if the append fails.
    pub fn insert_batch(&mut self, items: Vec<NewRecord>) -> Result<(), StoreError> {
        let dimension = self.store.dimension();
        for item in &items {
            validate_new_record(item, dimension)?;
        }
        let timestamp = self.store.next_timestamp();
        let records: Vec<Record> = items
            .into_iter()
            .map(|item| item.into_record(timestamp))
            .collect();
        let entries: Vec<WalEntry> = records.iter().cloned().map(WalEntry::Store).collect();
        self.append(&entries)?;
        for record in records {
            self.store.apply_record(record);
        }
        self.checkpoint_after_mutation();
        Ok(())
    }

    pub fn query(
        &self,
        query_embedding: &[f32],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.store.query(query_embedding, min_reward, top_k)
    }

    pub fn query_with_options(
        &self,
        query_embedding: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<QueryHit>, StoreError> {
        self.store.query_with_options(query_embedding, opts)
    }

    pub fn query_batch(
        &self,
        queries: &[Vec<f32>],
        min_reward: f32,
        top_k: usize,
    ) -> Result<Vec<Vec<QueryHit>>, StoreError> {
        self.store.query_batch(queries, min_reward, top_k)
    }

    pub fn prune_older_than(&mut self, cutoff_ms: i64) -> Result<usize, StoreError> {
        self.prune(PrunePolicy::OlderThan(cutoff_ms))
    }

    pub fn prune_keep_newest(&mut self, n: usize) -> Result<usize, StoreError> {
        self.prune(PrunePolicy::KeepNewest(n))
    }

    pub fn prune_keep_highest_reward(&mut self, n: usize) -> Result<usize, StoreError> {
        self.prune(PrunePolicy::KeepHighestReward(n))
    }

    /// A prune that would remove nothing is not logged.
    pub fn prune(&mut self, policy: PrunePolicy) -> Result<usize, StoreError> {
        let Some(mask) = policy.removal_mask(self.store.records()) else {
            debug!(policy = policy.name(), removed = 0, "durable prune was a no-op");
            return Ok(0);
        };
        self.append(&[WalEntry::Prune(policy)])?;
        let removed = self.store.apply_removal_mask(&mask);
        debug!(
            policy = policy.name(),
            removed,
            remaining = self.store.len(),
            "durable prune applied"
        );
        self.checkpoint_after_mutation();
        Ok(removed)
    }

    /// Write the in-memory state as checkpoint generation `g + 1`, then start
    /// an empty log of the same generation. A crash between the two steps
    /// leaves a stale log that the next open discards.
    pub fn checkpoint(&mut self) -> Result<CheckpointStats, StoreError> {
        let next_generation = self.generation + 1;
        let truncated_wal_entries = self.wal.entry_count();
        write_checkpoint(
            &self.dir.join(CHECKPOINT_FILE),
            next_generation,
            &self.store,
        )?;
        self.generation = next_generation;
        self.wal.reset(next_generation)?;

        let stats = CheckpointStats {
            snapshot_records: self.store.len(),
            truncated_wal_entries,
            generation: next_generation,
        };
        info!(
            path = %self.dir.display(),
            snapshot_records = stats.snapshot_records,
            truncated_wal_entries,
            generation = next_generation,
            "checkpoint complete"
        );
        Ok(stats)
    }

    pub fn checkpoint_if_due(&mut self) -> Result<Option<CheckpointStats>, StoreError> {
        if !self.options.checkpoint.is_due(&self.wal) {
            return Ok(None);
        }
        self.checkpoint().map(Some)
    }

    fn append(&mut self, entries: &[WalEntry]) -> Result<(), StoreError> {
        // A checkpoint whose log reset failed leaves the previous generation
        // open; appending to it would be discarded on the next recovery.
        if self.wal.generation() != self.generation {
            self.wal.reset(self.generation)?;
        }
        self.wal.append_batch(entries)
    }

    /// The mutation is already durable in the log, so a failed automatic
    /// checkpoint is reported but does not fail the call.
    fn checkpoint_after_mutation(&mut self) {
        if let Err(err) = self.checkpoint_if_due() {
            warn!(
                path = %self.dir.display(),
                error = %err,
                "automatic checkpoint failed"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn wal_mut(&mut self) -> &mut FileWal {
        &mut self.wal
    }
}

fn replay_entry(store: &mut RecordStore, entry: WalEntry) -> Result<(), String> {
    match entry {
        WalEntry::Store(record) => {
            validate_record(&record, store.dimension()).map_err(|err| err.to_string())?;
            store.apply_record(record);
        }
        WalEntry::Prune(policy) => {
            store.apply_prune(policy);
        }
    }
    Ok(())
}

fn write_checkpoint(path: &Path, generation: u64, store: &RecordStore) -> Result<(), StoreError> {
    let mut bytes = generation_line(CHECKPOINT_TAG, generation).into_bytes();
    bytes.extend(encode_snapshot(store.dimension(), store.records()));
    write_atomic(path, &bytes)
}

fn read_checkpoint(path: &Path) -> Result<Option<(u64, SnapshotContents)>, StoreError> {
    let bytes = match read_required(path) {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    let Some(split) = bytes.iter().position(|byte| *byte == b'\n') else {
        return Err(StoreError::CorruptSnapshot(
            "checkpoint has no generation header".to_string(),
        ));
    };
    let header = std::str::from_utf8(&bytes[..split])
        .map_err(|_| StoreError::CorruptSnapshot("checkpoint header is not UTF-8".to_string()))?;
    let generation =
        parse_generation_line(CHECKPOINT_TAG, header).map_err(StoreError::CorruptSnapshot)?;
    let contents = decode_snapshot(&bytes[split + 1..])?;
    Ok(Some((generation, contents)))
}

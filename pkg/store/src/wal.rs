//! Append-only write-ahead log.
//!
//! ```text
//! EXPWAL \t 1 \t <generation> \t <crc of generation>
//! <crc32 of payload, 8 hex> \t <payload>                (one per mutation)
//! ```
//!
//! Payloads are `S\t<record fields>` for a store and `O|N|H\t<arg>` for the
//! three pruning policies. A line is only trusted when its checksum matches
//! and it ends in a newline, so a torn tail is never replayed as data.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use schema::Record;
use tracing::warn;

use crate::{
    PrunePolicy, StoreError,
    codec::{
        checksum, fields_to_record, generation_line, parse_checksum, parse_generation_line,
        record_to_fields,
    },
    io_error,
    snapshot::write_atomic,
};

pub const WAL_TAG: &str = "EXPWAL";

#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// A record exactly as it was applied, timestamp included.
    Store(Record),
    Prune(PrunePolicy),
}

impl WalEntry {
    fn encode_payload(&self) -> String {
        match self {
            Self::Store(record) => format!("S\t{}", record_to_fields(record)),
            Self::Prune(PrunePolicy::OlderThan(cutoff_ms)) => format!("O\t{cutoff_ms}"),
            Self::Prune(PrunePolicy::KeepNewest(n)) => format!("N\t{n}"),
            Self::Prune(PrunePolicy::KeepHighestReward(n)) => format!("H\t{n}"),
        }
    }

    fn decode_payload(payload: &str) -> Result<Self, String> {
        let parts: Vec<&str> = payload.split('\t').collect();
        match parts.as_slice() {
            ["S", fields @ ..] => fields_to_record(fields).map(Self::Store),
            ["O", cutoff] => cutoff
                .parse::<i64>()
                .map(|cutoff_ms| Self::Prune(PrunePolicy::OlderThan(cutoff_ms)))
                .map_err(|_| "prune entry has invalid cutoff".to_string()),
            ["N", n] => parse_count(n).map(|n| Self::Prune(PrunePolicy::KeepNewest(n))),
            ["H", n] => parse_count(n).map(|n| Self::Prune(PrunePolicy::KeepHighestReward(n))),
            _ => Err("unknown log entry".to_string()),
        }
    }
}

fn parse_count(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .map_err(|_| "prune entry has invalid count".to_string())
}

/// Decoded log file. `generation` is `None` when the file is missing or empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WalContents {
    pub generation: Option<u64>,
    pub entries: Vec<WalEntry>,
}

#[derive(Debug)]
pub struct FileWal {
    path: PathBuf,
    file: File,
    generation: u64,
    entry_count: usize,
    size_bytes: u64,
    sync_writes: bool,
    /// Set when a failed append could not be rolled back; the tail of the
    /// file is unknown, so nothing more may be appended until a reset.
    broken: bool,
    #[cfg(test)]
    fail_next_append: bool,
    #[cfg(test)]
    fail_next_reset: bool,
}

impl FileWal {
    /// Replace whatever is at `path` with an empty log of `generation`.
    pub fn create(
        path: impl AsRef<Path>,
        generation: u64,
        sync_writes: bool,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        write_atomic(path, generation_line(WAL_TAG, generation).as_bytes())?;
        Self::open_append(path, generation, 0, sync_writes)
    }

    /// Open an existing, already validated log for appending.
    pub fn open_append(
        path: impl AsRef<Path>,
        generation: u64,
        entry_count: usize,
        sync_writes: bool,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| io_error(format!("open {}", path.display()), err))?;
        let size_bytes = file
            .metadata()
            .map_err(|err| io_error(format!("stat {}", path.display()), err))?
            .len();
        Ok(Self {
            path,
            file,
            generation,
            entry_count,
            size_bytes,
            sync_writes,
            broken: false,
            #[cfg(test)]
            fail_next_append: false,
            #[cfg(test)]
            fail_next_reset: false,
        })
    }

    /// Decode every entry in the log at `path`. Any checksum mismatch or
    /// unterminated line is `CorruptSnapshot`.
    pub fn read(path: impl AsRef<Path>) -> Result<WalContents, StoreError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WalContents::default());
            }
            Err(err) => return Err(io_error(format!("read {}", path.display()), err)),
        };
        if bytes.is_empty() {
            return Ok(WalContents::default());
        }
        let text = std::str::from_utf8(&bytes).map_err(|_| corrupt("log is not valid UTF-8"))?;
        if !text.ends_with('\n') {
            return Err(corrupt("log ends with a torn entry"));
        }

        let mut lines = text.split_terminator('\n');
        let header = lines.next().unwrap_or_default();
        let generation = parse_generation_line(WAL_TAG, header).map_err(corrupt)?;

        let mut entries = Vec::new();
        for (index, line) in lines.enumerate() {
            let entry = decode_line(line)
                .map_err(|message| corrupt(format!("log entry {index}: {message}")))?;
            entries.push(entry);
        }
        Ok(WalContents {
            generation: Some(generation),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<(), StoreError> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Append `entries` as one write and, with `sync_writes`, fsync before
    /// returning. On failure the file is truncated back to its previous
    /// length so no partial batch survives.
    pub fn append_batch(&mut self, entries: &[WalEntry]) -> Result<(), StoreError> {
        if self.broken {
            return Err(io_error(
                format!("append {}", self.path.display()),
                std::io::Error::other("log tail is unknown after a failed rollback"),
            ));
        }
        if entries.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for entry in entries {
            let payload = entry.encode_payload();
            lines.push_str(&format!("{:08x}\t{payload}\n", checksum(payload.as_bytes())));
        }

        if let Err(err) = self.write_lines(lines.as_bytes()) {
            let rolled_back = self.file.set_len(self.size_bytes).is_ok();
            self.broken = !rolled_back;
            warn!(
                path = %self.path.display(),
                rolled_back,
                error = %err,
                "write-ahead log append failed"
            );
            return Err(io_error(format!("append {}", self.path.display()), err));
        }
        self.size_bytes += lines.len() as u64;
        self.entry_count += entries.len();
        Ok(())
    }

    fn write_lines(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.take_injected_failure() {
            // Half the line reaches the file before the simulated failure.
            self.file.write_all(&line[..line.len() / 2])?;
            return Err(std::io::Error::other("injected append failure"));
        }
        self.file.write_all(line)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Start an empty log of `generation`, atomically replacing the old file.
    pub fn reset(&mut self, generation: u64) -> Result<(), StoreError> {
        if self.take_injected_reset_failure() {
            return Err(io_error(
                format!("reset {}", self.path.display()),
                std::io::Error::other("injected reset failure"),
            ));
        }
        *self = Self::create(&self.path, generation, self.sync_writes)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_append_failure(&mut self) {
        self.fail_next_append = true;
    }

    #[cfg(test)]
    fn take_injected_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_append)
    }

    #[cfg(not(test))]
    fn take_injected_failure(&mut self) -> bool {
        false
    }

    #[cfg(test)]
    pub(crate) fn inject_reset_failure(&mut self) {
        self.fail_next_reset = true;
    }

    #[cfg(test)]
    fn take_injected_reset_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_reset)
    }

    #[cfg(not(test))]
    fn take_injected_reset_failure(&mut self) -> bool {
        false
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        let _ = self.file.sync_data();
    }
}

fn decode_line(line: &str) -> Result<WalEntry, String> {
    let (raw_crc, payload) = line
        .split_once('\t')
        .ok_or_else(|| "entry has no checksum".to_string())?;
    if checksum(payload.as_bytes()) != parse_checksum(raw_crc)? {
        return Err("entry checksum mismatch".to_string());
    }
    WalEntry::decode_payload(payload)
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::CorruptSnapshot(message.into())
}

//! Snapshot codec: the whole record store as one deterministic byte stream.
//!
//! ```text
//! EXPSNAP \t 1 \t <dimension> \t <record count>
//! R \t <task_id> \t <reward> \t <timestamp> \t <e0,e1,...>     (one per record)
//! END \t <crc32 of every preceding byte, 8 hex digits>
//! ```
//!
//! Records appear in insertion order. Nothing about the act of serializing
//! (time, host, path) is written, so equal stores encode to equal bytes.

use std::{
    fs::{File, OpenOptions, create_dir_all, rename},
    io::Write,
    path::{Path, PathBuf},
};

use schema::{Record, validate_record};

use crate::{
    StoreError,
    codec::{FORMAT_VERSION, checksum, fields_to_record, parse_checksum, record_to_fields},
    io_error,
};

pub const SNAPSHOT_TAG: &str = "EXPSNAP";
const RECORD_TAG: &str = "R";
const FOOTER_TAG: &str = "END";

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotContents {
    pub dimension: usize,
    pub records: Vec<Record>,
}

pub fn encode_snapshot(dimension: usize, records: &[Record]) -> Vec<u8> {
    let mut out = format!(
        "{SNAPSHOT_TAG}\t{FORMAT_VERSION}\t{dimension}\t{}\n",
        records.len()
    );
    for record in records {
        out.push_str(RECORD_TAG);
        out.push('\t');
        out.push_str(&record_to_fields(record));
        out.push('\n');
    }
    let crc = checksum(out.as_bytes());
    out.push_str(&format!("{FOOTER_TAG}\t{crc:08x}\n"));
    out.into_bytes()
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<SnapshotContents, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|_| corrupt("snapshot is not valid UTF-8"))?;
    let Some(without_newline) = text.strip_suffix('\n') else {
        return Err(corrupt("snapshot is truncated"));
    };
    let footer_start = without_newline
        .rfind('\n')
        .map(|index| index + 1)
        .ok_or_else(|| corrupt("snapshot has no footer"))?;
    let (body, footer) = (&text[..footer_start], &without_newline[footer_start..]);

    let expected = match footer.split_once('\t') {
        Some((FOOTER_TAG, raw)) => parse_checksum(raw).map_err(corrupt)?,
        _ => return Err(corrupt("snapshot is truncated (missing footer)")),
    };
    if checksum(body.as_bytes()) != expected {
        return Err(corrupt("snapshot checksum mismatch"));
    }

    let mut lines = body.split_terminator('\n');
    let header = lines.next().ok_or_else(|| corrupt("snapshot has no header"))?;
    let (dimension, declared_count) = parse_header(header)?;

    let mut records = Vec::with_capacity(declared_count.min(1 << 16));
    for (index, line) in lines.enumerate() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.first() != Some(&RECORD_TAG) {
            return Err(corrupt(format!("snapshot line {} is not a record", index + 2)));
        }
        let record = fields_to_record(&parts[1..])
            .map_err(|message| corrupt(format!("snapshot record {index}: {message}")))?;
        validate_record(&record, dimension)
            .map_err(|err| corrupt(format!("snapshot record {index}: {err}")))?;
        records.push(record);
    }
    if records.len() != declared_count {
        return Err(corrupt(format!(
            "snapshot declares {declared_count} records but holds {}",
            records.len()
        )));
    }
    Ok(SnapshotContents { dimension, records })
}

fn parse_header(header: &str) -> Result<(usize, usize), StoreError> {
    let parts: Vec<&str> = header.split('\t').collect();
    if parts.len() != 4 || parts[0] != SNAPSHOT_TAG {
        return Err(corrupt("snapshot has invalid header"));
    }
    if parts[1] != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported snapshot version {}", parts[1])));
    }
    let dimension = parts[2]
        .parse::<usize>()
        .map_err(|_| corrupt("snapshot header has invalid dimension"))?;
    if dimension == 0 {
        return Err(corrupt("snapshot declares zero dimension"));
    }
    let count = parts[3]
        .parse::<usize>()
        .map_err(|_| corrupt("snapshot header has invalid record count"))?;
    Ok((dimension, count))
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::CorruptSnapshot(message.into())
}

// ---------------------------------------------------------------------------
// File helpers shared with the write-ahead log and checkpoint
// ---------------------------------------------------------------------------

/// Read a file that must exist; a missing path is `NotFound`, not an I/O
/// failure.
pub(crate) fn read_required(path: &Path) -> Result<Vec<u8>, StoreError> {
    std::fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(path.display().to_string())
        } else {
            io_error(format!("read {}", path.display()), err)
        }
    })
}

/// Write `bytes` to a temporary sibling, fsync it, then rename over `path`.
/// Readers observe either the old file or the complete new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent)
            .map_err(|err| io_error(format!("create directory {}", parent.display()), err))?;
    }

    let tmp_path = tmp_sibling(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|err| io_error(format!("create {}", tmp_path.display()), err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| io_error(format!("write {}", tmp_path.display()), err))?;
    drop(file);
    rename(&tmp_path, path).map_err(|err| {
        io_error(
            format!("rename {} to {}", tmp_path.display(), path.display()),
            err,
        )
    })?;
    sync_parent_dir(path)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(unix)]
pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| io_error(format!("sync directory {}", parent.display()), err))
}

#[cfg(not(unix))]
pub(crate) fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

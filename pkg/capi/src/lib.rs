//! C-compatible API over the experience store.
//!
//! Every entry point runs inside `std::panic::catch_unwind`; a panic is
//! reported as an internal error instead of unwinding into the caller.
//!
//! Conventions:
//! - `c_int` results: 0 = success, -1 = failure.
//! - Pointer results: NULL = failure.
//! - Disk prune calls return the removed count, or -1 on failure.
//! - After any failure, `expmem_last_error` / `expmem_last_error_code`
//!   describe it. Both are per thread and untouched by successful calls.
//! - Only strings returned by `expmem_query` / `expmem_disk_query` must be
//!   released, with `expmem_free_string`.

use std::{
    cell::RefCell,
    ffi::{CStr, CString, c_char, c_float, c_int},
    panic::{self, AssertUnwindSafe},
    ptr,
};

use schema::{QueryHit, QueryOptions};
use serde::Serialize;
use store::{DurableOptions, ErrorKind, SharedDurableStore, SharedRecordStore, StoreError};
use thiserror::Error;
use tracing::error;

pub const EXPMEM_OK: c_int = 0;
pub const EXPMEM_ERR_INVALID_DIMENSION: c_int = 1;
pub const EXPMEM_ERR_DIMENSION_MISMATCH: c_int = 2;
pub const EXPMEM_ERR_INVALID_REWARD: c_int = 3;
pub const EXPMEM_ERR_INVALID_TASK_ID: c_int = 4;
pub const EXPMEM_ERR_CORRUPT_SNAPSHOT: c_int = 5;
pub const EXPMEM_ERR_PERSISTENCE: c_int = 6;
pub const EXPMEM_ERR_NOT_FOUND: c_int = 7;
pub const EXPMEM_ERR_INTERNAL: c_int = 8;
pub const EXPMEM_ERR_INVALID_ARGUMENT: c_int = 9;

/// Opaque handle to an in-memory store.
pub struct ExpMemHandle {
    store: SharedRecordStore,
}

/// Opaque handle to a disk-backed store.
pub struct ExpMemDiskHandle {
    store: SharedDurableStore,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<(c_int, CString)>> = const { RefCell::new(None) };
}

#[derive(Debug, Error)]
enum FfiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("internal error: failed to encode result: {0}")]
    Encode(String),
}

impl FfiError {
    fn code(&self) -> c_int {
        match self {
            Self::Store(err) => kind_code(err.kind()),
            Self::InvalidArgument(_) => EXPMEM_ERR_INVALID_ARGUMENT,
            Self::Encode(_) => EXPMEM_ERR_INTERNAL,
        }
    }
}

fn kind_code(kind: ErrorKind) -> c_int {
    match kind {
        ErrorKind::InvalidDimension => EXPMEM_ERR_INVALID_DIMENSION,
        ErrorKind::DimensionMismatch => EXPMEM_ERR_DIMENSION_MISMATCH,
        ErrorKind::InvalidReward => EXPMEM_ERR_INVALID_REWARD,
        ErrorKind::InvalidTaskId => EXPMEM_ERR_INVALID_TASK_ID,
        ErrorKind::CorruptSnapshot => EXPMEM_ERR_CORRUPT_SNAPSHOT,
        ErrorKind::PersistenceError => EXPMEM_ERR_PERSISTENCE,
        ErrorKind::NotFound => EXPMEM_ERR_NOT_FOUND,
        ErrorKind::InternalError => EXPMEM_ERR_INTERNAL,
    }
}

fn set_last_error(code: c_int, message: &str) {
    // Interior NULs cannot cross the boundary; drop them rather than lose
    // the whole message.
    let message = CString::new(message.replace('\0', ""))
        .unwrap_or_else(|_| CString::from(c"error message unavailable"));
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some((code, message));
    });
}

/// Run `body`, turning an `Err` or a panic into `fallback` plus a recorded
/// last error.
fn guard<T>(function: &'static str, fallback: T, body: impl FnOnce() -> Result<T, FfiError>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            set_last_error(err.code(), &err.to_string());
            fallback
        }
        Err(_) => {
            error!(function, "panic caught at the C boundary");
            set_last_error(
                EXPMEM_ERR_INTERNAL,
                &format!("internal error: panic in {function}"),
            );
            fallback
        }
    }
}

unsafe fn handle_ref<'a, T>(handle: *const T) -> Result<&'a T, FfiError> {
    unsafe { handle.as_ref() }.ok_or(FfiError::InvalidArgument("handle is null"))
}

unsafe fn str_arg<'a>(raw: *const c_char, what: &'static str) -> Result<&'a str, FfiError> {
    if raw.is_null() {
        return Err(FfiError::InvalidArgument(what));
    }
    unsafe { CStr::from_ptr(raw) }
        .to_str()
        .map_err(|_| FfiError::InvalidArgument("string is not valid UTF-8"))
}

unsafe fn embedding_arg<'a>(raw: *const c_float, dim: usize) -> Result<&'a [f32], FfiError> {
    if raw.is_null() {
        return Err(FfiError::InvalidArgument("embedding is null"));
    }
    Ok(unsafe { std::slice::from_raw_parts(raw, dim) })
}

#[derive(Serialize)]
struct HitJson<'a> {
    task_id: &'a str,
    embedding: &'a [f32],
    reward: f32,
    timestamp: i64,
    score: f32,
}

fn hits_to_c_string(hits: &[QueryHit]) -> Result<*mut c_char, FfiError> {
    let rows: Vec<HitJson<'_>> = hits
        .iter()
        .map(|hit| HitJson {
            task_id: &hit.task_id,
            embedding: hit.embedding.as_deref().unwrap_or(&[]),
            reward: hit.reward,
            timestamp: hit.timestamp,
            score: hit.score,
        })
        .collect();
    let json = serde_json::to_string(&rows).map_err(|err| FfiError::Encode(err.to_string()))?;
    CString::new(json)
        .map(CString::into_raw)
        .map_err(|err| FfiError::Encode(err.to_string()))
}

fn query_options(min_reward: c_float, top_k: usize) -> QueryOptions {
    QueryOptions::new(min_reward, top_k).with_embeddings()
}

fn into_raw<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

// ---------------------------------------------------------------------------
// Errors and strings
// ---------------------------------------------------------------------------

/// Description of the most recent failure on the calling thread, or NULL if
/// none. Owned by the library: valid until the next failing call on this
/// thread and never passed to `expmem_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn expmem_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|(_, message)| message.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Code of the most recent failure on the calling thread (`EXPMEM_OK` if
/// none yet).
#[unsafe(no_mangle)]
pub extern "C" fn expmem_last_error_code() -> c_int {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|(code, _)| *code)
            .unwrap_or(EXPMEM_OK)
    })
}

/// Release a string returned by a query call. NULL is a no-op.
///
/// # Safety
/// `s` must be NULL or a pointer returned by `expmem_query` /
/// `expmem_disk_query` that has not been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_free_string(s: *mut c_char) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        if !s.is_null() {
            drop(unsafe { CString::from_raw(s) });
        }
    }));
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Create an empty store. NULL on failure (zero dimension).
/// Release with `expmem_free`.
#[unsafe(no_mangle)]
pub extern "C" fn expmem_new(dim: usize) -> *mut ExpMemHandle {
    guard("expmem_new", ptr::null_mut(), || {
        let store = SharedRecordStore::new(dim)?;
        Ok(into_raw(ExpMemHandle { store }))
    })
}

/// # Safety
/// `handle` must be NULL or a live pointer from `expmem_new` / `expmem_load`.
/// It must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_free(handle: *mut ExpMemHandle) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        if !handle.is_null() {
            drop(unsafe { Box::from_raw(handle) });
        }
    }));
}

/// Embedding dimension, or 0 if `handle` is NULL.
///
/// # Safety
/// `handle` must be NULL or a live in-memory handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_dimension(handle: *const ExpMemHandle) -> usize {
    guard("expmem_dimension", 0, || {
        Ok(unsafe { handle_ref(handle) }?.store.dimension())
    })
}

/// Number of stored records, or 0 if `handle` is NULL.
///
/// # Safety
/// `handle` must be NULL or a live in-memory handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_len(handle: *const ExpMemHandle) -> usize {
    guard("expmem_len", 0, || Ok(unsafe { handle_ref(handle) }?.store.len()))
}

/// Store one record. 0 on success, -1 on failure.
///
/// # Safety
/// `handle` must be a live in-memory handle, `task_id` a NUL-terminated
/// UTF-8 string and `embedding` must point to `dim` floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_store(
    handle: *const ExpMemHandle,
    task_id: *const c_char,
    embedding: *const c_float,
    dim: usize,
    reward: c_float,
) -> c_int {
    guard("expmem_store", -1, || {
        let handle = unsafe { handle_ref(handle) }?;
        let task_id = unsafe { str_arg(task_id, "task_id is null") }?;
        let embedding = unsafe { embedding_arg(embedding, dim) }?;
        handle.store.insert(task_id, embedding.to_vec(), reward)?;
        Ok(0)
    })
}

/// Top-k query. Returns a JSON array of
/// `{task_id, embedding, reward, timestamp, score}` objects, best first, or
/// NULL on failure. Release the result with `expmem_free_string`.
///
/// # Safety
/// `handle` must be a live in-memory handle and `embedding` must point to
/// `dim` floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_query(
    handle: *const ExpMemHandle,
    embedding: *const c_float,
    dim: usize,
    min_reward: c_float,
    top_k: usize,
) -> *mut c_char {
    guard("expmem_query", ptr::null_mut(), || {
        let handle = unsafe { handle_ref(handle) }?;
        let embedding = unsafe { embedding_arg(embedding, dim) }?;
        let hits = handle
            .store
            .query_with_options(embedding, &query_options(min_reward, top_k))?;
        hits_to_c_string(&hits)
    })
}

/// Write a snapshot to `path`. 0 on success, -1 on failure.
///
/// # Safety
/// `handle` must be a live in-memory handle and `path` a NUL-terminated
/// UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_save(handle: *const ExpMemHandle, path: *const c_char) -> c_int {
    guard("expmem_save", -1, || {
        let handle = unsafe { handle_ref(handle) }?;
        let path = unsafe { str_arg(path, "path is null") }?;
        handle.store.save(path)?;
        Ok(0)
    })
}

/// Load a snapshot written by `expmem_save`. NULL on failure.
/// Release with `expmem_free`.
///
/// # Safety
/// `path` must be a NUL-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_load(path: *const c_char) -> *mut ExpMemHandle {
    guard("expmem_load", ptr::null_mut(), || {
        let path = unsafe { str_arg(path, "path is null") }?;
        let store = SharedRecordStore::load(path)?;
        Ok(into_raw(ExpMemHandle { store }))
    })
}

/// Remove records with `timestamp < cutoff_ms`. Returns the removed count
/// (0 if `handle` is NULL).
///
/// # Safety
/// `handle` must be NULL or a live in-memory handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_prune_older_than(
    handle: *const ExpMemHandle,
    cutoff_ms: i64,
) -> usize {
    guard("expmem_prune_older_than", 0, || {
        Ok(unsafe { handle_ref(handle) }?
            .store
            .prune_older_than(cutoff_ms))
    })
}

/// Keep the `n` newest records. Returns the removed count.
///
/// # Safety
/// `handle` must be NULL or a live in-memory handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_prune_keep_newest(handle: *const ExpMemHandle, n: usize) -> usize {
    guard("expmem_prune_keep_newest", 0, || {
        Ok(unsafe { handle_ref(handle) }?.store.prune_keep_newest(n))
    })
}

/// Keep the `n` highest-reward records. Returns the removed count.
///
/// # Safety
/// `handle` must be NULL or a live in-memory handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_prune_keep_highest_reward(
    handle: *const ExpMemHandle,
    n: usize,
) -> usize {
    guard("expmem_prune_keep_highest_reward", 0, || {
        Ok(unsafe { handle_ref(handle) }?
            .store
            .prune_keep_highest_reward(n))
    })
}

// ---------------------------------------------------------------------------
// Disk-backed store
// ---------------------------------------------------------------------------

/// Durable options for the disk open calls: defaults with the `EXPMEM_*`
/// environment overrides applied.
fn disk_options(compact_on_open: bool) -> DurableOptions {
    disk_options_from(|key| std::env::var(key).ok(), compact_on_open)
}

fn disk_options_from(
    lookup: impl Fn(&str) -> Option<String>,
    compact_on_open: bool,
) -> DurableOptions {
    DurableOptions::from_lookup(lookup).compact_on_open(compact_on_open)
}

/// Open (or create) the store directory at `path`, replaying its log.
/// NULL on failure. Release with `expmem_disk_free`.
///
/// # Safety
/// `path` must be a NUL-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_open(
    path: *const c_char,
    dim: usize,
) -> *mut ExpMemDiskHandle {
    guard("expmem_disk_open", ptr::null_mut(), || {
        let path = unsafe { str_arg(path, "path is null") }?;
        let store = SharedDurableStore::open_with_options(path, dim, disk_options(false))?;
        Ok(into_raw(ExpMemDiskHandle { store }))
    })
}

/// Like `expmem_disk_open`, then checkpoint so the directory holds one
/// exact snapshot and an empty log.
///
/// # Safety
/// `path` must be a NUL-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_open_exact_with_checkpoint(
    path: *const c_char,
    dim: usize,
) -> *mut ExpMemDiskHandle {
    guard("expmem_disk_open_exact_with_checkpoint", ptr::null_mut(), || {
        let path = unsafe { str_arg(path, "path is null") }?;
        let store = SharedDurableStore::open_with_options(path, dim, disk_options(true))?;
        Ok(into_raw(ExpMemDiskHandle { store }))
    })
}

/// # Safety
/// `handle` must be NULL or a live pointer from one of the disk open calls.
/// It must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_free(handle: *mut ExpMemDiskHandle) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        if !handle.is_null() {
            drop(unsafe { Box::from_raw(handle) });
        }
    }));
}

/// # Safety
/// `handle` must be NULL or a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_len(handle: *const ExpMemDiskHandle) -> usize {
    guard("expmem_disk_len", 0, || {
        Ok(unsafe { handle_ref(handle) }?.store.len())
    })
}

/// Log then apply one record. 0 on success, -1 on failure; on failure the
/// store is unchanged.
///
/// # Safety
/// Same contract as `expmem_store`, with a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_store(
    handle: *const ExpMemDiskHandle,
    task_id: *const c_char,
    embedding: *const c_float,
    dim: usize,
    reward: c_float,
) -> c_int {
    guard("expmem_disk_store", -1, || {
        let handle = unsafe { handle_ref(handle) }?;
        let task_id = unsafe { str_arg(task_id, "task_id is null") }?;
        let embedding = unsafe { embedding_arg(embedding, dim) }?;
        handle.store.insert(task_id, embedding.to_vec(), reward)?;
        Ok(0)
    })
}

/// Same result format and release rule as `expmem_query`.
///
/// # Safety
/// Same contract as `expmem_query`, with a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_query(
    handle: *const ExpMemDiskHandle,
    embedding: *const c_float,
    dim: usize,
    min_reward: c_float,
    top_k: usize,
) -> *mut c_char {
    guard("expmem_disk_query", ptr::null_mut(), || {
        let handle = unsafe { handle_ref(handle) }?;
        let embedding = unsafe { embedding_arg(embedding, dim) }?;
        let hits = handle
            .store
            .query_with_options(embedding, &query_options(min_reward, top_k))?;
        hits_to_c_string(&hits)
    })
}

/// Snapshot the store and truncate its log. 0 on success, -1 on failure.
///
/// # Safety
/// `handle` must be a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_checkpoint(handle: *const ExpMemDiskHandle) -> c_int {
    guard("expmem_disk_checkpoint", -1, || {
        unsafe { handle_ref(handle) }?.store.checkpoint()?;
        Ok(0)
    })
}

fn removed_count(removed: usize) -> i64 {
    i64::try_from(removed).unwrap_or(i64::MAX)
}

/// Removed count, or -1 on failure.
///
/// # Safety
/// `handle` must be a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_prune_older_than(
    handle: *const ExpMemDiskHandle,
    cutoff_ms: i64,
) -> i64 {
    guard("expmem_disk_prune_older_than", -1, || {
        let removed = unsafe { handle_ref(handle) }?
            .store
            .prune_older_than(cutoff_ms)?;
        Ok(removed_count(removed))
    })
}

/// Removed count, or -1 on failure.
///
/// # Safety
/// `handle` must be a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_prune_keep_newest(
    handle: *const ExpMemDiskHandle,
    n: usize,
) -> i64 {
    guard("expmem_disk_prune_keep_newest", -1, || {
        let removed = unsafe { handle_ref(handle) }?.store.prune_keep_newest(n)?;
        Ok(removed_count(removed))
    })
}

/// Removed count, or -1 on failure.
///
/// # Safety
/// `handle` must be a live disk handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn expmem_disk_prune_keep_highest_reward(
    handle: *const ExpMemDiskHandle,
    n: usize,
) -> i64 {
    guard("expmem_disk_prune_keep_highest_reward", -1, || {
        let removed = unsafe { handle_ref(handle) }?
            .store
            .prune_keep_highest_reward(n)?;
        Ok(removed_count(removed))
    })
}

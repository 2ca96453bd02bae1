//! Environment overrides for [`DurableOptions`].

use tracing::warn;

use crate::{CheckpointPolicy, DurableOptions};

pub const ENV_CHECKPOINT_MAX_WAL_RECORDS: &str = "EXPMEM_CHECKPOINT_MAX_WAL_RECORDS";
pub const ENV_CHECKPOINT_MAX_WAL_BYTES: &str = "EXPMEM_CHECKPOINT_MAX_WAL_BYTES";
pub const ENV_WAL_SYNC: &str = "EXPMEM_WAL_SYNC";

impl DurableOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build options from any key lookup. Unset keys keep the defaults;
    /// unparsable values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let checkpoint = CheckpointPolicy {
            max_wal_records: parse_threshold(&lookup, ENV_CHECKPOINT_MAX_WAL_RECORDS),
            max_wal_bytes: parse_threshold(&lookup, ENV_CHECKPOINT_MAX_WAL_BYTES),
        };
        let mut options = Self {
            checkpoint,
            ..Self::default()
        };
        if let Some(sync) = parse_switch(&lookup, ENV_WAL_SYNC) {
            options.sync_writes = sync;
        }
        options
    }
}

/// Positive integer threshold, or `off`/`0` to disable.
fn parse_threshold<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialEq + Default,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("off") {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) if value == T::default() => None,
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                key,
                value = trimmed,
                "ignoring invalid value (expected positive integer or off)"
            );
            None
        }
    }
}

fn parse_switch<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            warn!(key, value = trimmed, "ignoring invalid value (expected on or off)");
            None
        }
    }
}

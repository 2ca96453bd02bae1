use std::{
    path::Path,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use schema::{ManualClock, NewRecord};
use store::{CheckpointPolicy, DurableOptions, DurableStore, RecordStore, StoreError};
use tracing::info;
use tracing_subscriber::EnvFilter;

const QUERY_TOP_K: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchmarkProfile {
    Smoke,
    Standard,
    Large,
}

impl BenchmarkProfile {
    fn from_arg(raw: &str) -> Option<Self> {
        match raw {
            "smoke" => Some(Self::Smoke),
            "standard" | "default" => Some(Self::Standard),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    fn fixture_size(self) -> usize {
        match self {
            Self::Smoke => 1_000,
            Self::Standard => 10_000,
            Self::Large => 50_000,
        }
    }

    fn default_iterations(self) -> usize {
        match self {
            Self::Smoke => 50,
            Self::Standard => 200,
            Self::Large => 100,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Smoke => "smoke",
            Self::Standard => "standard",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone)]
struct BenchmarkConfig {
    profile: BenchmarkProfile,
    iterations: Option<usize>,
    dimension: usize,
    sync_writes: bool,
    max_wal_records: Option<usize>,
}

#[derive(Debug, Clone)]
struct BenchmarkSummary {
    profile: BenchmarkProfile,
    fixture_size: usize,
    iterations: usize,
    dimension: usize,
    memory_insert_ms: f64,
    memory_query_avg_ms: f64,
    durable_insert_ms: f64,
    durable_query_avg_ms: f64,
    replay_open_ms: f64,
    replayed_entries: usize,
    checkpoint_ms: f64,
    checkpoint_open_ms: f64,
    snapshot_bytes: usize,
    top_hit_matches: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let summary = match run(&config) {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("Benchmark failed: {err}");
            std::process::exit(1);
        }
    };
    print_summary(&summary);

    if !summary.top_hit_matches {
        eprintln!("Benchmark failed: durable and in-memory stores disagree on the top hit.");
        std::process::exit(1);
    }
    if summary.replayed_entries == 0 && config.max_wal_records.is_none() {
        eprintln!("Benchmark failed: recovery replayed no log entries.");
        std::process::exit(1);
    }
}

fn run(config: &BenchmarkConfig) -> Result<BenchmarkSummary, StoreError> {
    let fixture_size = config.profile.fixture_size();
    let iterations = config
        .iterations
        .unwrap_or_else(|| config.profile.default_iterations());
    let fixture = build_fixture(fixture_size, config.dimension);
    let queries: Vec<Vec<f32>> = (0..iterations)
        .map(|i| synthetic_embedding(i * 7 + 3, config.dimension))
        .collect();
    info!(
        profile = config.profile.as_str(),
        fixture_size, iterations, "starting benchmark"
    );

    let clock = Arc::new(ManualClock::new(now_epoch_millis()));
    let mut memory = RecordStore::with_clock(config.dimension, clock.clone())?;
    let started = Instant::now();
    for item in &fixture {
        memory.insert_batch(vec![item.clone()])?;
        clock.advance(1);
    }
    let memory_insert_ms = elapsed_ms(started);
    let (memory_query_avg_ms, memory_top) = time_queries(&queries, |query| {
        memory.query(query, f32::NEG_INFINITY, QUERY_TOP_K)
    })?;

    let dir = tempfile::Builder::new()
        .prefix("expmem-bench-")
        .tempdir()
        .map_err(|err| StoreError::Internal(format!("create temp dir: {err}")))?;
    let options = DurableOptions {
        sync_writes: config.sync_writes,
        ..DurableOptions::default()
    }
    .with_checkpoint_policy(CheckpointPolicy {
        max_wal_records: config.max_wal_records,
        max_wal_bytes: None,
    });

    let started = Instant::now();
    {
        let mut durable = DurableStore::open_with_options(dir.path(), config.dimension, options)?;
        for item in &fixture {
            durable.insert_batch(vec![item.clone()])?;
        }
    }
    let durable_insert_ms = elapsed_ms(started);

    let started = Instant::now();
    let mut durable = DurableStore::open(dir.path(), config.dimension)?;
    let replay_open_ms = elapsed_ms(started);
    let replayed_entries = durable.recovery_stats().replayed_entries;

    let (durable_query_avg_ms, durable_top) = time_queries(&queries, |query| {
        durable.query(query, f32::NEG_INFINITY, QUERY_TOP_K)
    })?;

    let started = Instant::now();
    durable.checkpoint()?;
    let checkpoint_ms = elapsed_ms(started);
    drop(durable);

    let started = Instant::now();
    let reopened = DurableStore::open(dir.path(), config.dimension)?;
    let checkpoint_open_ms = elapsed_ms(started);
    let snapshot_bytes = file_len(&dir.path().join(store::CHECKPOINT_FILE));
    debug_assert_eq!(reopened.len(), fixture_size);

    Ok(BenchmarkSummary {
        profile: config.profile,
        fixture_size,
        iterations,
        dimension: config.dimension,
        memory_insert_ms,
        memory_query_avg_ms,
        durable_insert_ms,
        durable_query_avg_ms,
        replay_open_ms,
        replayed_entries,
        checkpoint_ms,
        checkpoint_open_ms,
        snapshot_bytes,
        top_hit_matches: memory_top == durable_top,
    })
}

/// Average latency across `queries` plus the top task id of every query.
fn time_queries<F>(
    queries: &[Vec<f32>],
    mut query: F,
) -> Result<(f64, Vec<Option<String>>), StoreError>
where
    F: FnMut(&[f32]) -> Result<Vec<schema::QueryHit>, StoreError>,
{
    let mut tops = Vec::with_capacity(queries.len());
    let started = Instant::now();
    for embedding in queries {
        let hits = query(embedding.as_slice())?;
        tops.push(hits.first().map(|hit| hit.task_id.clone()));
    }
    let avg = elapsed_ms(started) / queries.len().max(1) as f64;
    Ok((avg, tops))
}

fn build_fixture(size: usize, dimension: usize) -> Vec<NewRecord> {
    (0..size)
        .map(|i| {
            NewRecord::new(
                format!("task-{:03}/episode-{i}", i % 97),
                synthetic_embedding(i, dimension),
                ((i * 37) % 100) as f32 / 100.0,
            )
        })
        .collect()
}

/// Deterministic pseudo-random vector; no RNG so runs are comparable.
fn synthetic_embedding(seed: usize, dimension: usize) -> Vec<f32> {
    let mut state = (seed as u64).wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..dimension)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

fn parse_args<I>(args: I) -> Result<BenchmarkConfig, String>
where
    I: Iterator<Item = String>,
{
    let mut profile = BenchmarkProfile::Standard;
    let mut iterations = None;
    let mut dimension = env_or_default_usize("EXPMEM_BENCH_DIMENSION", 64);
    let mut sync_writes = true;
    let mut max_wal_records = None;

    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--smoke" => profile = BenchmarkProfile::Smoke,
            "--profile" => {
                let value = args
                    .next()
                    .ok_or_else(|| "Missing value for --profile".to_string())?;
                profile = BenchmarkProfile::from_arg(&value).ok_or_else(|| {
                    format!("Invalid profile '{value}'. Valid values: smoke, standard, large.")
                })?;
            }
            "--iterations" => {
                iterations = Some(parse_positive_usize_arg(args.next(), "--iterations")?);
            }
            "--dimension" => {
                dimension = parse_positive_usize_arg(args.next(), "--dimension")?;
            }
            "--no-sync" => sync_writes = false,
            "--checkpoint-every" => {
                max_wal_records = Some(parse_positive_usize_arg(
                    args.next(),
                    "--checkpoint-every",
                )?);
            }
            "--help" | "-h" => return Err(usage_text().to_string()),
            _ => {
                return Err(format!("Unknown argument '{arg}'.\n\n{}", usage_text()));
            }
        }
    }

    Ok(BenchmarkConfig {
        profile,
        iterations,
        dimension,
        sync_writes,
        max_wal_records,
    })
}

fn env_or_default_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_positive_usize_arg(value: Option<String>, flag: &str) -> Result<usize, String> {
    let raw = value.ok_or_else(|| format!("Missing value for {flag}"))?;
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("Invalid value '{raw}' for {flag}"))?;
    if parsed == 0 {
        return Err(format!("{flag} must be > 0"));
    }
    Ok(parsed)
}

fn usage_text() -> &'static str {
    concat!(
        "Usage: cargo run -p benchmark-smoke --bin benchmark-smoke --",
        " [--smoke] [--profile smoke|standard|large] [--iterations N]",
        " [--dimension N] [--no-sync] [--checkpoint-every N]",
    )
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn now_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as i64)
        .unwrap_or(0)
}

fn file_len(path: &Path) -> usize {
    std::fs::metadata(path)
        .map(|meta| meta.len() as usize)
        .unwrap_or(0)
}

fn print_summary(summary: &BenchmarkSummary) {
    println!("Benchmark profile: {}", summary.profile.as_str());
    println!("Benchmark fixture size: {}", summary.fixture_size);
    println!("Iterations: {}", summary.iterations);
    println!("Dimension: {}", summary.dimension);
    println!("Memory insert total (ms): {:.4}", summary.memory_insert_ms);
    println!("Memory query avg latency (ms): {:.4}", summary.memory_query_avg_ms);
    println!("Durable insert total (ms): {:.4}", summary.durable_insert_ms);
    println!(
        "Durable query avg latency (ms): {:.4}",
        summary.durable_query_avg_ms
    );
    println!(
        "Recovery open (ms): {:.4} ({} log entries replayed)",
        summary.replay_open_ms, summary.replayed_entries
    );
    println!("Checkpoint (ms): {:.4}", summary.checkpoint_ms);
    println!(
        "Open after checkpoint (ms): {:.4}",
        summary.checkpoint_open_ms
    );
    println!("Checkpoint size (bytes): {}", summary.snapshot_bytes);
    println!("Top hits agree: {}", summary.top_hit_matches);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parses_profile_and_flags() {
        let config = parse_args(args(&[
            "--profile",
            "large",
            "--iterations",
            "7",
            "--dimension",
            "16",
            "--no-sync",
            "--checkpoint-every",
            "500",
        ]))
        .unwrap();
        assert_eq!(config.profile, BenchmarkProfile::Large);
        assert_eq!(config.iterations, Some(7));
        assert_eq!(config.dimension, 16);
        assert!(!config.sync_writes);
        assert_eq!(config.max_wal_records, Some(500));
    }

    #[test]
    fn rejects_unknown_profile_and_zero_values() {
        assert!(parse_args(args(&["--profile", "huge"])).is_err());
        assert!(parse_args(args(&["--iterations", "0"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn synthetic_embeddings_are_deterministic_and_bounded() {
        let a = synthetic_embedding(11, 32);
        assert_eq!(a, synthetic_embedding(11, 32));
        assert_ne!(a, synthetic_embedding(12, 32));
        assert!(a.iter().all(|value| (-1.0..=1.0).contains(value)));
    }

    #[test]
    fn smoke_run_round_trips_through_recovery() {
        let config = BenchmarkConfig {
            profile: BenchmarkProfile::Smoke,
            iterations: Some(5),
            dimension: 8,
            sync_writes: false,
            max_wal_records: None,
        };
        let summary = run(&config).unwrap();
        assert_eq!(summary.fixture_size, 1_000);
        assert_eq!(summary.replayed_entries, 1_000);
        assert!(summary.top_hit_matches);
        assert!(summary.snapshot_bytes > 0);
    }
}

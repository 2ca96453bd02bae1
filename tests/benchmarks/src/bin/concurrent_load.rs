use std::{
    sync::{Arc, mpsc},
    time::Instant,
};

use store::{DurableOptions, SharedDurableStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Config {
    dimension: usize,
    concurrency: usize,
    ops_per_worker: usize,
    query_every: usize,
    checkpoint_every: usize,
    sync_writes: bool,
}

#[derive(Debug, Default)]
struct WorkerStats {
    success: usize,
    failed: usize,
    insert_latencies_ms: Vec<f64>,
    query_latencies_ms: Vec<f64>,
    sample_errors: Vec<String>,
}

impl WorkerStats {
    fn record_error(&mut self, err: impl ToString) {
        self.failed += 1;
        if self.sample_errors.len() < 4 {
            self.sample_errors.push(err.to_string());
        }
    }
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

    if let Err(err) = run(config) {
        eprintln!("concurrent-load failed: {err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), String> {
    let dir = tempfile::Builder::new()
        .prefix("expmem-load-")
        .tempdir()
        .map_err(|err| format!("unable to create temp dir: {err}"))?;
    let mut options = DurableOptions::from_env();
    if !config.sync_writes {
        options.sync_writes = false;
    }
    let store = Arc::new(
        SharedDurableStore::open_with_options(dir.path(), config.dimension, options)
            .map_err(|err| format!("open failed: {err}"))?,
    );

    let total_ops = config.concurrency * config.ops_per_worker;
    let started_at = Instant::now();
    let (tx, rx) = mpsc::channel::<WorkerStats>();

    std::thread::scope(|scope| {
        for worker_idx in 0..config.concurrency {
            let tx = tx.clone();
            let config = config.clone();
            let store = Arc::clone(&store);
            scope.spawn(move || {
                let mut stats = WorkerStats::default();
                for op_idx in 0..config.ops_per_worker {
                    let embedding = worker_embedding(worker_idx, op_idx, config.dimension);
                    let op_started = Instant::now();
                    let task_id = format!("worker-{worker_idx}/op-{op_idx}");
                    match store.insert(task_id, embedding.clone(), 0.5) {
                        Ok(()) => {
                            stats.success += 1;
                            stats
                                .insert_latencies_ms
                                .push(op_started.elapsed().as_secs_f64() * 1000.0);
                        }
                        Err(err) => stats.record_error(err),
                    }
                    if config.query_every > 0 && op_idx % config.query_every == 0 {
                        let query_started = Instant::now();
                        match store.query(&embedding, 0.0, 5) {
                            Ok(_) => stats
                                .query_latencies_ms
                                .push(query_started.elapsed().as_secs_f64() * 1000.0),
                            Err(err) => stats.record_error(err),
                        }
                    }
                    if config.checkpoint_every > 0
                        && op_idx > 0
                        && op_idx % config.checkpoint_every == 0
                        && let Err(err) = store.checkpoint()
                    {
                        stats.record_error(err);
                    }
                }
                let _ = tx.send(stats);
            });
        }
    });
    drop(tx);

    let elapsed_seconds = started_at.elapsed().as_secs_f64();
    let mut success = 0usize;
    let mut failed = 0usize;
    let mut insert_latencies_ms = Vec::with_capacity(total_ops);
    let mut query_latencies_ms = Vec::new();
    let mut errors = Vec::new();
    for stats in rx {
        success += stats.success;
        failed += stats.failed;
        insert_latencies_ms.extend(stats.insert_latencies_ms);
        query_latencies_ms.extend(stats.query_latencies_ms);
        for err in stats.sample_errors {
            if errors.len() >= 10 {
                break;
            }
            errors.push(err);
        }
    }
    if success == 0 {
        return Err("no successful inserts".to_string());
    }
    insert_latencies_ms.sort_by(|a, b| a.total_cmp(b));
    query_latencies_ms.sort_by(|a, b| a.total_cmp(b));

    println!("Concurrent load benchmark");
    println!("dimension: {}", config.dimension);
    println!("concurrency: {}", config.concurrency);
    println!("ops_per_worker: {}", config.ops_per_worker);
    println!("sync_writes: {}", config.sync_writes);
    println!("total_inserts: {total_ops}");
    println!("successful_inserts: {success}");
    println!("failed_ops: {failed}");
    println!("elapsed_seconds: {:.4}", elapsed_seconds);
    println!(
        "throughput_inserts_per_sec: {:.2}",
        success as f64 / elapsed_seconds.max(0.0001)
    );
    println!("insert_p50_ms: {:.4}", percentile(&insert_latencies_ms, 0.50));
    println!("insert_p95_ms: {:.4}", percentile(&insert_latencies_ms, 0.95));
    println!("insert_p99_ms: {:.4}", percentile(&insert_latencies_ms, 0.99));
    println!("query_p50_ms: {:.4}", percentile(&query_latencies_ms, 0.50));
    println!("query_p95_ms: {:.4}", percentile(&query_latencies_ms, 0.95));

    drop(store);
    let recovery_started = Instant::now();
    let reopened = store::DurableStore::open(dir.path(), config.dimension)
        .map_err(|err| format!("reopen failed: {err}"))?;
    println!(
        "recovery_ms: {:.4}",
        recovery_started.elapsed().as_secs_f64() * 1000.0
    );
    println!("recovered_records: {}", reopened.len());

    if failed > 0 {
        for err in errors {
            println!("error_sample: {err}");
        }
        return Err(format!("{failed} operations failed"));
    }
    if reopened.len() != success {
        return Err(format!(
            "recovered {} records, expected {success}",
            reopened.len()
        ));
    }
    Ok(())
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (((sorted.len() - 1) as f64) * quantile).round() as usize;
    sorted[idx]
}

fn worker_embedding(worker_idx: usize, op_idx: usize, dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|i| (((worker_idx * 31 + op_idx * 17 + i * 7) % 101) as f32 / 50.0) - 1.0)
        .collect()
}

fn parse_args<I>(args: I) -> Result<Config, String>
where
    I: Iterator<Item = String>,
{
    let mut config = Config {
        dimension: 32,
        concurrency: 8,
        ops_per_worker: 200,
        query_every: 4,
        checkpoint_every: 0,
        sync_writes: true,
    };

    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dimension" => config.dimension = parse_usize_arg(&mut args, "--dimension")?,
            "--concurrency" => config.concurrency = parse_usize_arg(&mut args, "--concurrency")?,
            "--ops-per-worker" => {
                config.ops_per_worker = parse_usize_arg(&mut args, "--ops-per-worker")?;
            }
            "--query-every" => {
                config.query_every = parse_usize_allow_zero_arg(&mut args, "--query-every")?;
            }
            "--checkpoint-every" => {
                config.checkpoint_every =
                    parse_usize_allow_zero_arg(&mut args, "--checkpoint-every")?;
            }
            "--no-sync" => config.sync_writes = false,
            "--help" | "-h" => return Err(usage_text().to_string()),
            _ => return Err(format!("Unknown argument '{arg}'.\n\n{}", usage_text())),
        }
    }
    Ok(config)
}

fn parse_usize_arg<I>(args: &mut I, flag: &str) -> Result<usize, String>
where
    I: Iterator<Item = String>,
{
    let parsed = parse_usize_allow_zero_arg(args, flag)?;
    if parsed == 0 {
        return Err(format!("{flag} must be > 0"));
    }
    Ok(parsed)
}

fn parse_usize_allow_zero_arg<I>(args: &mut I, flag: &str) -> Result<usize, String>
where
    I: Iterator<Item = String>,
{
    let raw = args
        .next()
        .ok_or_else(|| format!("Missing value for {flag}"))?;
    raw.parse::<usize>()
        .map_err(|_| format!("Invalid value '{raw}' for {flag}"))
}

fn usage_text() -> &'static str {
    concat!(
        "Usage: cargo run -p benchmark-smoke --bin concurrent_load --",
        " [--dimension N] [--concurrency N] [--ops-per-worker N]",
        " [--query-every N] [--checkpoint-every N] [--no-sync]",
    )
}

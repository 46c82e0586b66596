//! # Pipeline Benchmark Harness
//!
//! Purpose: Drive batched writes and reads through `ClusterPipeline` against a
//! live cluster so pipelined throughput can be compared over time.
//!
//! ## Usage
//!
//! ```text
//! slotpipe-bench [config.json] [key_count] [batch_size]
//! ```
//!
//! `config.json` is a serialized `ClientConfig`; pass `-` to use the default
//! seed list. Set `RUST_LOG=slotpipe_client=debug` to watch routing.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys and values are derived from their index.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Guaranteed Cleanup**: Every batch ends with `close()`, even on error.

use std::env;
use std::fs;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use slotpipe_client::{ClientConfig, ClusterClient, Pipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_KEY_COUNT: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 1_000;

struct BenchConfig {
    client: ClientConfig,
    key_count: usize,
    batch_size: usize,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let client = match args.next().as_deref() {
            None | Some("-") => ClientConfig::default(),
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?
            }
        };
        let key_count = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let batch_size = parse_usize(args.next(), DEFAULT_BATCH_SIZE).max(1);

        Ok(BenchConfig {
            client,
            key_count,
            batch_size,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn build_buffers(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{prefix}{i}").into_bytes())
        .collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

/// Runs `fill` into the pipeline and drains it, closing the batch either way.
fn run_batch<T>(
    pipeline: &mut Pipeline,
    fill: impl FnOnce(&mut Pipeline) -> slotpipe_client::ClientResult<()>,
    drain: impl FnOnce(&mut Pipeline) -> slotpipe_client::ClientResult<T>,
) -> Result<T> {
    let result = fill(&mut *pipeline).and_then(|()| drain(&mut *pipeline));
    pipeline.close();
    Ok(result?)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("slotpipe-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let client = ClusterClient::connect(config.client.clone()).context("connecting to cluster")?;
    let map = client.slot_map();
    info!(
        nodes = map.nodes().len(),
        covered = map.covered_slots(),
        "slot map loaded"
    );

    let keys = build_buffers("k", config.key_count);
    let values = build_buffers("v", config.key_count);

    println!(
        "keys={}, batch_size={}, nodes={}",
        config.key_count,
        config.batch_size,
        map.nodes().len()
    );

    let mut pipeline = client.pipelined();

    let start = Instant::now();
    for range in batches(config.key_count, config.batch_size) {
        run_batch(
            &mut pipeline,
            |p| {
                for idx in range {
                    p.set(&keys[idx], &values[idx])?;
                }
                Ok(())
            },
            |p| p.sync(),
        )?;
    }
    report("SET", config.key_count, start.elapsed());

    let start = Instant::now();
    let mut read = 0;
    for range in batches(config.key_count, config.batch_size) {
        let expected = range.len();
        let replies = run_batch(
            &mut pipeline,
            |p| {
                for idx in range {
                    p.get(&keys[idx])?;
                }
                Ok(())
            },
            |p| p.sync_and_return_all(),
        )?;
        if replies.len() != expected {
            bail!("expected {expected} replies, got {}", replies.len());
        }
        read += replies.len();
        black_box(replies);
    }
    report("GET", read, start.elapsed());

    Ok(())
}

fn batches(total: usize, size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    (0..total)
        .step_by(size)
        .map(move |start| start..(start + size).min(total))
}

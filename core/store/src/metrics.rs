//! Prometheus metrics for the storage engine, registered with the default
//! registry.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use std::sync::LazyLock;

fn try_create_int_counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn try_create_int_gauge(name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

pub static COMMITS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_commits_total", "Total number of committed versions").unwrap()
});

pub static NODES_WRITTEN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "triedb_nodes_written_total",
        "Trie nodes appended, by writer stream",
        &["writer"],
    )
    .unwrap()
});

pub static BYTES_WRITTEN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "triedb_bytes_written_total",
        "Bytes appended (padding included), by writer stream",
        &["writer"],
    )
    .unwrap()
});

pub static READS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_reads_issued_total", "Node reads submitted to the ring")
        .unwrap()
});

pub static NODE_CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_node_cache_hits_total", "Node cache hits").unwrap()
});

pub static NODE_CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_node_cache_misses_total", "Node cache misses").unwrap()
});

pub static COMPACTION_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_compaction_runs_total", "Completed compaction cycles")
        .unwrap()
});

pub static CHUNKS_FREED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter("triedb_chunks_freed_total", "Chunks returned to the free list")
        .unwrap()
});

pub static FREE_CHUNKS: LazyLock<IntGauge> = LazyLock::new(|| {
    try_create_int_gauge("triedb_free_chunks", "Chunks currently on the free list").unwrap()
});

pub static NODE_CACHE_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    try_create_int_gauge("triedb_node_cache_bytes", "Bytes held by the node cache").unwrap()
});

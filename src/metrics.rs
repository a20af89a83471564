//! Prometheus instrumentation, adapted from the teacher's `metrics.rs`
//! `lazy_static!` + `prometheus::Registry` pattern, retargeted from
//! indexer-pipeline counters to consumer/applier/recovery counters.

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref APPLIED_SEQ: IntGauge =
        IntGauge::new("ubt_applied_seq", "Highest durably applied outbox seq").unwrap();

    pub static ref APPLIED_BLOCK: IntGauge =
        IntGauge::new("ubt_applied_block", "Highest durably applied block number").unwrap();

    pub static ref OUTBOX_LAG: IntGauge =
        IntGauge::new("ubt_outbox_lag", "latestSeq - processedSeq").unwrap();

    pub static ref EVENTS_APPLIED: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_events_applied_total", "Outbox events applied by kind"),
        &["kind"]
    ).unwrap();

    pub static ref COMMITS_TOTAL: IntCounter =
        IntCounter::new("ubt_commits_total", "Total commit procedures executed").unwrap();

    pub static ref COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("ubt_commit_duration_seconds", "Commit procedure latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref REORGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_reorgs_total", "Reorgs handled by path"),
        &["path"]
    ).unwrap();

    pub static ref VALIDATION_MISMATCHES: IntCounter =
        IntCounter::new("ubt_validation_mismatches_total", "Strict/sampled validation mismatches").unwrap();

    pub static ref VALIDATION_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_validation_runs_total", "Validation runs by mode"),
        &["mode"]
    ).unwrap();

    pub static ref COMPACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_compactions_total", "Outbox compaction RPCs by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref RECOVERY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_recovery_attempts_total", "Startup recovery attempts by stage and outcome"),
        &["stage", "outcome"]
    ).unwrap();

    pub static ref OUTBOX_RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("ubt_outbox_rpc_errors_total", "Outbox RPC errors by method"),
        &["method"]
    ).unwrap();

    pub static ref RPC_CALL_DURATION: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new("ubt_rpc_call_duration_seconds", "Outbox/archive RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();
}

/// Register everything into `REGISTRY`. Idempotent-ish: calling twice would
/// panic on duplicate registration, so this is called exactly once from
/// `main`.
pub fn register_all() {
    let _ = REGISTRY.register(Box::new(APPLIED_SEQ.clone()));
    let _ = REGISTRY.register(Box::new(APPLIED_BLOCK.clone()));
    let _ = REGISTRY.register(Box::new(OUTBOX_LAG.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_APPLIED.clone()));
    let _ = REGISTRY.register(Box::new(COMMITS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(COMMIT_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(REORGS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(VALIDATION_MISMATCHES.clone()));
    let _ = REGISTRY.register(Box::new(VALIDATION_RUNS.clone()));
    let _ = REGISTRY.register(Box::new(COMPACTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECOVERY_ATTEMPTS.clone()));
    let _ = REGISTRY.register(Box::new(OUTBOX_RPC_ERRORS.clone()));
    let _ = REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()));
}

pub fn gather_text() -> Result<String, prometheus::Error> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

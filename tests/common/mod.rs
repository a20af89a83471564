//! Shared fixtures for the end-to-end scenario tests (spec §8): a fake
//! outbox JSON-RPC server standing in for the upstream node, and small
//! builders for envelopes/diffs so each scenario test reads as a sequence
//! of outbox events rather than a pile of JSON. Grounded on the teacher's
//! `tests/` fixtures, which likewise stand up a tiny local HTTP server
//! rather than mocking the RPC client at the type level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use ubt_consumer::config::AppConfig;
use ubt_consumer::types::{AccountUpdate, BootstrapMode, Hash32, QueuedDiff, ReorgMarker};

pub struct FakeOutbox {
    pub events: Vec<Value>,
    pub lowest_seq: AtomicU64,
}

#[derive(Clone)]
struct ServerState {
    inner: Arc<FakeOutbox>,
}

/// Starts a fake outbox server on an ephemeral localhost port and returns
/// its base URL. The server lives for as long as the returned join handle
/// is held; dropping the handle aborts it.
pub async fn spawn_fake_outbox(events: Vec<Value>, lowest_seq: u64) -> (String, tokio::task::JoinHandle<()>) {
    let state = ServerState {
        inner: Arc::new(FakeOutbox { events, lowest_seq: AtomicU64::new(lowest_seq) }),
    };
    let app = Router::new().route("/", post(handle_rpc)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), handle)
}

async fn handle_rpc(State(state): State<ServerState>, Json(body): Json<Value>) -> Json<Value> {
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let result = match method {
        "getEvent" => {
            let seq = params.get(0).and_then(Value::as_u64).unwrap_or(0);
            state.inner.events.iter().find(|e| e.get("seq").and_then(Value::as_u64) == Some(seq)).cloned().unwrap_or(Value::Null)
        }
        "getEvents" => {
            let from = params.get(0).and_then(Value::as_u64).unwrap_or(0);
            let to = params.get(1).and_then(Value::as_u64).unwrap_or(0);
            let matched: Vec<Value> = state
                .inner
                .events
                .iter()
                .filter(|e| {
                    let seq = e.get("seq").and_then(Value::as_u64).unwrap_or(u64::MAX);
                    seq >= from && seq <= to
                })
                .cloned()
                .collect();
            json!(matched)
        }
        "latestSeq" => json!(state.inner.events.last().and_then(|e| e.get("seq")).and_then(Value::as_u64).unwrap_or(0)),
        "lowestSeq" => json!(state.inner.lowest_seq.load(Ordering::SeqCst)),
        "compactOutboxBelow" => {
            let safe_seq = params.get(0).and_then(Value::as_u64).unwrap_or(0);
            let prior = state.inner.lowest_seq.swap(safe_seq, Ordering::SeqCst);
            json!({ "deleted": safe_seq.saturating_sub(prior), "safeSeq": safe_seq })
        }
        "accountRange" => json!({ "accounts": {}, "next": "" }),
        other => return Json(json!({ "jsonrpc": "2.0", "id": 1, "error": format!("unknown method {other}") })),
    };
    Json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

pub fn diff_envelope(seq: u64, block: u64, parent_hash: Hash32, hash: Hash32, diff: &QueuedDiff) -> Value {
    let payload = bincode::serialize(diff).unwrap();
    json!({
        "seq": seq,
        "version": 1,
        "kind": "diff",
        "blockNumber": block,
        "blockHash": format!("0x{}", hex::encode(hash)),
        "parentHash": format!("0x{}", hex::encode(parent_hash)),
        "timestamp": 0,
        "payload": hex::encode(payload),
    })
}

pub fn reorg_envelope(seq: u64, marker: &ReorgMarker) -> Value {
    let payload = bincode::serialize(marker).unwrap();
    json!({
        "seq": seq,
        "version": 1,
        "kind": "reorg",
        "blockNumber": marker.to_number,
        "blockHash": format!("0x{}", hex::encode(marker.to_hash)),
        "parentHash": format!("0x{}", hex::encode([0u8; 32])),
        "timestamp": 0,
        "payload": hex::encode(payload),
    })
}

pub fn single_account_diff(address: [u8; 20], nonce: u64, balance_byte: u8) -> QueuedDiff {
    QueuedDiff {
        accounts: vec![AccountUpdate { address, nonce, balance: vec![balance_byte], code_hash: [0u8; 32], alive: true }],
        storage: vec![],
        codes: vec![],
    }
}

/// Block hash derived deterministically from the block number, so a chain
/// of fixture blocks can reference each other's hash without a real trie.
pub fn fixture_block_hash(block: u64) -> Hash32 {
    if block == 0 {
        return [0u8; 32];
    }
    let mut hash = [0u8; 32];
    hash[24..].copy_from_slice(&block.to_be_bytes());
    hash[0] = 0xAB;
    hash
}

pub fn test_config(datadir: std::path::PathBuf, endpoint: String, apply_commit_interval: u64) -> AppConfig {
    AppConfig {
        outbox_rpc_endpoint: endpoint,
        archive_rpc_endpoint: None,
        datadir,
        apply_commit_interval,
        apply_commit_max_latency_ms: 60_000,
        bootstrap_mode: BootstrapMode::Tail,
        triedb_scheme: "path".into(),
        triedb_state_history: 1024,
        max_recoverable_reorg_depth: 64,
        backpressure_lag_threshold: 1_000,
        outbox_read_ahead: 1,
        block_root_index_stride_high_lag: 64,
        anchor_snapshot_interval: 0,
        recovery_anchor_interval: 0,
        recovery_strict: false,
        slot_index_enabled: false,
        cancun_block: 0,
        validation_strict: false,
        validation_halt_on_mismatch: false,
        validation_sample_rate: 100,
        validate_only: false,
        query_rpc_enabled: false,
        query_rpc_listen_addr: "127.0.0.1:0".into(),
        execution_class_rpc_enabled: false,
        rpc_timeout_ms: 5_000,
        reconnect_delay_ms: 100,
        compaction_safety_margin: 64,
        compaction_interval_secs: 3_600,
    }
}

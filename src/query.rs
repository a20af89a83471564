//! Query Facade (spec §4.6): read-only HTTP surface over the consumer's
//! materialized state, grounded on the teacher's `api/blocks.rs` pattern of
//! axum handlers sharing state via `Extension(Arc<...>)` and answering with
//! typed JSON or a `(StatusCode, Json<Error>)` pair.
//!
//! Every handler resolves a `BlockSelector` against the consumer's state
//! while holding its mutex only long enough to read `appliedBlock`,
//! `appliedRoot`, and the per-block index -- the mutex is released before
//! the (potentially large) trie read, per the spec's explicit instruction.

use std::sync::Arc;

use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::consumer::Consumer;
use crate::error::QueryError;
use crate::trie::MutableTrie;
use crate::types::{Address, BlockNumber, BlockSelector, Hash32, PendingStatus};

/// Hard cap on the number of storage keys accepted by `getAccountProof` in
/// a single call (spec §4.6 "enforce a maximum batch size").
const MAX_PROOF_BATCH: usize = 256;

#[derive(Clone)]
pub struct QueryState {
    pub consumer: Arc<Mutex<Consumer>>,
}

pub fn router(state: QueryState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/safeCompactSeq", get(safe_compact_seq_handler))
        .route("/getBalance", post(get_balance_handler))
        .route("/getCode", post(get_code_handler))
        .route("/getStorageAt", post(get_storage_at_handler))
        .route("/getProof", post(get_proof_handler))
        .route("/getAccountProof", post(get_account_proof_handler))
        .route("/verifyProof", post(verify_proof_handler))
        .layer(Extension(state))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl From<QueryError> for (StatusCode, Json<ErrorBody>) {
    fn from(error: QueryError) -> Self {
        let status = match error {
            QueryError::NotYetAvailable(_) | QueryError::NotAvailable(_) => StatusCode::NOT_FOUND,
            QueryError::UnknownHash | QueryError::UnsupportedSelector(_) => StatusCode::BAD_REQUEST,
            QueryError::BatchTooLarge(_, _) => StatusCode::PAYLOAD_TOO_LARGE,
            QueryError::Applier(_) | QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: error.to_string() }))
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

#[derive(Debug, Deserialize)]
struct SelectorParam {
    /// `"latest"`, a decimal block number, or a `0x`-prefixed 32-byte hash.
    #[serde(default)]
    block: Option<String>,
    #[serde(default)]
    require_canonical: bool,
}

fn parse_selector(param: &SelectorParam) -> Result<BlockSelector, QueryError> {
    let Some(raw) = param.block.as_deref() else {
        return Ok(BlockSelector::Latest);
    };
    match raw {
        "latest" | "" => Ok(BlockSelector::Latest),
        "pending" | "safe" | "finalized" => Err(QueryError::UnsupportedSelector(raw.to_string())),
        _ if raw.starts_with("0x") && raw.len() == 66 => {
            let bytes = hex::decode(&raw[2..]).map_err(|_| QueryError::UnsupportedSelector(raw.to_string()))?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            Ok(BlockSelector::Hash { hash, require_canonical: param.require_canonical })
        }
        _ => match raw.parse::<u64>() {
            Ok(number) => Ok(BlockSelector::Number(number)),
            Err(_) => Err(QueryError::UnsupportedSelector(raw.to_string())),
        },
    }
}

fn parse_address(raw: &str) -> Result<Address, QueryError> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|_| QueryError::Internal("invalid address hex".into()))?;
    if bytes.len() != 20 {
        return Err(QueryError::Internal("address must be 20 bytes".into()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_hash32(raw: &str) -> Result<Hash32, QueryError> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|_| QueryError::Internal("invalid 32-byte hex".into()))?;
    if bytes.len() != 32 {
        return Err(QueryError::Internal("expected 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Resolves a selector to `(blockNumber, root)` against the consumer's
/// current state (spec §4.6 selector-resolution rules), holding the mutex
/// only for this step.
async fn resolve_selector(consumer: &Mutex<Consumer>, selector: BlockSelector) -> Result<(BlockNumber, Hash32), QueryError> {
    let guard = consumer.lock().await;
    let applied_block = guard.applied_block();
    let applied_root = guard.applied_root();
    let history = guard.triedb_state_history();

    let number = match selector {
        BlockSelector::Latest => return Ok((applied_block, applied_root)),
        BlockSelector::Number(n) => n,
        BlockSelector::Hash { hash, require_canonical } => {
            let number = guard.block_number_for_hash(&hash).map_err(|e| QueryError::Internal(e.to_string()))?.ok_or(QueryError::UnknownHash)?;
            if require_canonical {
                let canonical = guard.canonical_block_for(number).map_err(|e| QueryError::Internal(e.to_string()))?;
                if canonical.map(|c| c.hash) != Some(hash) {
                    return Err(QueryError::UnknownHash);
                }
            }
            number
        }
    };

    if number > applied_block {
        return Err(QueryError::NotYetAvailable(number));
    }
    if number < applied_block.saturating_sub(history) {
        return Err(QueryError::NotAvailable(number));
    }
    if number == applied_block {
        return Ok((number, applied_root));
    }
    let root = guard.block_root_for(number).map_err(|e| QueryError::Internal(e.to_string()))?.ok_or(QueryError::NotAvailable(number))?;
    Ok((number, root))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    applied_seq: u64,
    applied_block: BlockNumber,
    applied_root: String,
    pending_seq: u64,
    pending_state: String,
    outbox_lag: u64,
    backpressure_triggered: bool,
}

async fn status_handler(Extension(state): Extension<QueryState>) -> Json<StatusResponse> {
    let guard = state.consumer.lock().await;
    Json(StatusResponse {
        applied_seq: guard.applied_seq(),
        applied_block: guard.applied_block(),
        applied_root: format!("0x{}", hex::encode(guard.applied_root())),
        pending_seq: guard.applied_seq(),
        pending_state: format!("{:?}", PendingStatus::None),
        outbox_lag: guard.outbox_lag(),
        backpressure_triggered: false,
    })
}

async fn safe_compact_seq_handler(Extension(state): Extension<QueryState>) -> Json<u64> {
    let guard = state.consumer.lock().await;
    Json(guard.applied_seq())
}

#[derive(Debug, Deserialize)]
struct AddressQuery {
    address: String,
    #[serde(flatten)]
    selector: SelectorParam,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    balance: String,
}

async fn get_balance_handler(Extension(state): Extension<QueryState>, Json(req): Json<AddressQuery>) -> ApiResult<BalanceResponse> {
    let selector = parse_selector(&req.selector).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let address = parse_address(&req.address).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let (_, root) = resolve_selector(&state.consumer, selector).await.map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let guard = state.consumer.lock().await;
    let view = guard.applier().trie_at(root).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let balance = view.get_balance(&address).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    Ok(Json(BalanceResponse { balance: format!("0x{}", hex::encode(balance.unwrap_or_default())) }))
}

#[derive(Debug, Serialize)]
struct CodeResponse {
    code: String,
}

async fn get_code_handler(Extension(state): Extension<QueryState>, Json(req): Json<AddressQuery>) -> ApiResult<CodeResponse> {
    let selector = parse_selector(&req.selector).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let address = parse_address(&req.address).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let (_, root) = resolve_selector(&state.consumer, selector).await.map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let guard = state.consumer.lock().await;
    let view = guard.applier().trie_at(root).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let code_hash = view.get_code_hash(&address).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let code = match code_hash {
        Some(hash) if hash != [0u8; 32] => guard.applier().get_code(&hash).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?.unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(Json(CodeResponse { code: format!("0x{}", hex::encode(code)) }))
}

#[derive(Debug, Deserialize)]
struct StorageQuery {
    address: String,
    slot: String,
    #[serde(flatten)]
    selector: SelectorParam,
}

#[derive(Debug, Serialize)]
struct StorageResponse {
    value: String,
}

async fn get_storage_at_handler(Extension(state): Extension<QueryState>, Json(req): Json<StorageQuery>) -> ApiResult<StorageResponse> {
    let selector = parse_selector(&req.selector).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let address = parse_address(&req.address).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let slot = parse_hash32(&req.slot).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let (_, root) = resolve_selector(&state.consumer, selector).await.map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let guard = state.consumer.lock().await;
    let view = guard.applier().trie_at(root).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let value = view.get_storage(&address, &slot).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    Ok(Json(StorageResponse { value: format!("0x{}", hex::encode(value)) }))
}

#[derive(Debug, Deserialize)]
struct ProofQuery {
    key: String,
    #[serde(flatten)]
    selector: SelectorParam,
}

#[derive(Debug, Serialize)]
struct ProofResponse {
    key: String,
    root: String,
    proof_nodes: std::collections::HashMap<String, String>,
}

async fn get_proof_handler(Extension(state): Extension<QueryState>, Json(req): Json<ProofQuery>) -> ApiResult<ProofResponse> {
    let selector = parse_selector(&req.selector).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let key = parse_hash32(&req.key).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let (_, root) = resolve_selector(&state.consumer, selector).await.map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let guard = state.consumer.lock().await;
    let nodes = guard.applier().generate_proof_at(root, &key).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    Ok(Json(ProofResponse {
        key: format!("0x{}", hex::encode(key)),
        root: format!("0x{}", hex::encode(root)),
        proof_nodes: nodes.into_iter().map(|(h, bytes)| (format!("0x{}", hex::encode(h)), format!("0x{}", hex::encode(bytes)))).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct AccountProofQuery {
    address: String,
    #[serde(default)]
    slots: Vec<String>,
    #[serde(flatten)]
    selector: SelectorParam,
}

#[derive(Debug, Serialize)]
struct StorageProofEntry {
    key: String,
    proof: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct AccountProofResponse {
    address: String,
    account_proof: std::collections::HashMap<String, String>,
    storage_proof: Vec<StorageProofEntry>,
    root: String,
}

async fn get_account_proof_handler(Extension(state): Extension<QueryState>, Json(req): Json<AccountProofQuery>) -> ApiResult<AccountProofResponse> {
    if req.slots.len() > MAX_PROOF_BATCH {
        return Err(<(StatusCode, Json<ErrorBody>)>::from(QueryError::BatchTooLarge(req.slots.len(), MAX_PROOF_BATCH)));
    }
    let selector = parse_selector(&req.selector).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let address = parse_address(&req.address).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let (_, root) = resolve_selector(&state.consumer, selector).await.map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let account_key = account_proof_key(&address);
    let guard = state.consumer.lock().await;
    let account_proof = guard.applier().generate_proof_at(root, &account_key).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;

    let mut storage_proof = Vec::with_capacity(req.slots.len());
    for raw_slot in &req.slots {
        let slot = parse_hash32(raw_slot).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
        let slot_key = storage_proof_key(&address, &slot);
        let proof = guard.applier().generate_proof_at(root, &slot_key).map_err(QueryError::from).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
        storage_proof.push(StorageProofEntry {
            key: format!("0x{}", hex::encode(slot)),
            proof: proof.into_iter().map(|(h, bytes)| (format!("0x{}", hex::encode(h)), format!("0x{}", hex::encode(bytes)))).collect(),
        });
    }

    Ok(Json(AccountProofResponse {
        address: format!("0x{}", hex::encode(address)),
        account_proof: account_proof.into_iter().map(|(h, bytes)| (format!("0x{}", hex::encode(h)), format!("0x{}", hex::encode(bytes)))).collect(),
        storage_proof,
        root: format!("0x{}", hex::encode(root)),
    }))
}

/// Derives the raw 32-byte trie key for an account proof from its address
/// (spec §4.6 "derived keys for account/storage-slot compatibility").
fn account_proof_key(address: &Address) -> Hash32 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"UBTAccount/");
    hasher.update(address);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn storage_proof_key(address: &Address, slot: &Hash32) -> Hash32 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"UBTStorage/");
    hasher.update(address);
    hasher.update(slot);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[derive(Debug, Deserialize)]
struct VerifyProofQuery {
    root: String,
    key: String,
    proof_nodes: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct VerifyProofResponse {
    valid: bool,
    present: bool,
    value: String,
}

async fn verify_proof_handler(Json(req): Json<VerifyProofQuery>) -> ApiResult<VerifyProofResponse> {
    let root = parse_hash32(&req.root).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let key = parse_hash32(&req.key).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    let mut nodes = std::collections::HashMap::with_capacity(req.proof_nodes.len());
    for (hash_hex, bytes_hex) in &req.proof_nodes {
        let hash = parse_hash32(hash_hex).map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
        let bytes = hex::decode(bytes_hex.strip_prefix("0x").unwrap_or(bytes_hex))
            .map_err(|_| QueryError::Internal("invalid proof node hex".into()))
            .map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
        nodes.insert(hash, bytes);
    }

    let (valid, present, value) = crate::applier::Applier::verify_proof(root, &key, &nodes)
        .map_err(QueryError::from)
        .map_err(<(StatusCode, Json<ErrorBody>)>::from)?;
    Ok(Json(VerifyProofResponse { valid, present, value: format!("0x{}", hex::encode(value)) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing_rejects_pending_safe_finalized() {
        for tag in ["pending", "safe", "finalized"] {
            let param = SelectorParam { block: Some(tag.to_string()), require_canonical: false };
            assert!(matches!(parse_selector(&param), Err(QueryError::UnsupportedSelector(_))));
        }
    }

    #[test]
    fn selector_parsing_accepts_latest_and_number() {
        let latest = SelectorParam { block: None, require_canonical: false };
        assert!(matches!(parse_selector(&latest).unwrap(), BlockSelector::Latest));

        let numbered = SelectorParam { block: Some("42".to_string()), require_canonical: false };
        assert!(matches!(parse_selector(&numbered).unwrap(), BlockSelector::Number(42)));
    }

    #[test]
    fn account_and_storage_proof_keys_differ() {
        let address = [7u8; 20];
        let slot = [1u8; 32];
        assert_ne!(account_proof_key(&address), storage_proof_key(&address, &slot));
    }
}

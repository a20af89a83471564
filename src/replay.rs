//! Replay Client (spec §4.1/§6): archive-RPC adapter used only during
//! slow-path reorg recovery and backfill. Reuses the same hand-rolled
//! `reqwest` + `serde_json::Value` JSON-RPC call shape as `outbox.rs`
//! rather than introducing a second client abstraction.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::error::OutboxError;
use crate::types::{AccountUpdate, Address, BlockNumber, CodeUpdate, Hash32, QueuedDiff, StorageUpdate};

pub struct ReplayClient {
    endpoint: String,
    client: Client,
}

impl ReplayClient {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, OutboxError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| OutboxError::Rpc(e.to_string()))?;
        Ok(Self { endpoint, client })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, OutboxError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let response = self.client.post(&self.endpoint).json(&body).send().await.map_err(|e| OutboxError::Rpc(e.to_string()))?;
        let parsed: Value = response.json().await.map_err(|e| OutboxError::Decode(e.to_string()))?;
        if let Some(error) = parsed.get("error") {
            return Err(OutboxError::Rpc(error.to_string()));
        }
        parsed.get("result").cloned().ok_or_else(|| OutboxError::Decode("missing result field".into()))
    }

    /// Reconstruct a diff for `block` via `debug_traceBlockByNumber` with a
    /// prestate-diff tracer (spec §6).
    pub async fn diff_for_block(&self, block: BlockNumber) -> Result<QueuedDiff, OutboxError> {
        let params = json!([
            format!("0x{block:x}"),
            { "tracer": "prestateTracer", "tracerConfig": { "diffMode": true } }
        ]);
        let result = self.call("debug_traceBlockByNumber", params).await?;
        decode_prestate_diff(&result)
    }

    pub async fn get_balance(&self, address: &Address, block: BlockNumber) -> Result<Vec<u8>, OutboxError> {
        let result = self.call("eth_getBalance", json!([format!("0x{}", hex::encode(address)), format!("0x{block:x}")])).await?;
        decode_quantity(&result)
    }

    pub async fn get_transaction_count(&self, address: &Address, block: BlockNumber) -> Result<u64, OutboxError> {
        let result = self.call("eth_getTransactionCount", json!([format!("0x{}", hex::encode(address)), format!("0x{block:x}")])).await?;
        let hex_str = result.as_str().ok_or_else(|| OutboxError::Decode("eth_getTransactionCount: expected hex string".into()))?;
        u64::from_str_radix(hex_str.trim_start_matches("0x"), 16).map_err(|e| OutboxError::Decode(e.to_string()))
    }

    pub async fn get_code(&self, address: &Address, block: BlockNumber) -> Result<Vec<u8>, OutboxError> {
        let result = self.call("eth_getCode", json!([format!("0x{}", hex::encode(address)), format!("0x{block:x}")])).await?;
        let hex_str = result.as_str().ok_or_else(|| OutboxError::Decode("eth_getCode: expected hex string".into()))?;
        hex::decode(hex_str.trim_start_matches("0x")).map_err(|e| OutboxError::Decode(e.to_string()))
    }

    pub async fn get_storage_at(&self, address: &Address, slot: &Hash32, block: BlockNumber) -> Result<Hash32, OutboxError> {
        let result = self
            .call("eth_getStorageAt", json!([format!("0x{}", hex::encode(address)), format!("0x{}", hex::encode(slot)), format!("0x{block:x}")]))
            .await?;
        let hex_str = result.as_str().ok_or_else(|| OutboxError::Decode("eth_getStorageAt: expected hex string".into()))?;
        let bytes = hex::decode(format!("{:0>64}", hex_str.trim_start_matches("0x"))).map_err(|e| OutboxError::Decode(e.to_string()))?;
        let mut out = [0u8; 32];
        let start = bytes.len().saturating_sub(32);
        out[32 - (bytes.len() - start)..].copy_from_slice(&bytes[start..]);
        Ok(out)
    }

    pub async fn block_hash(&self, block: BlockNumber) -> Result<Hash32, OutboxError> {
        let result = self.call("eth_getBlockByNumber", json!([format!("0x{block:x}"), false])).await?;
        let hex_str = result.get("hash").and_then(Value::as_str).ok_or_else(|| OutboxError::Decode("missing block hash".into()))?;
        let bytes = hex::decode(hex_str.trim_start_matches("0x")).map_err(|e| OutboxError::Decode(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(OutboxError::Decode("block hash: expected 32 bytes".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

fn decode_quantity(value: &Value) -> Result<Vec<u8>, OutboxError> {
    let hex_str = value.as_str().ok_or_else(|| OutboxError::Decode("expected hex quantity".into()))?;
    let trimmed = hex_str.trim_start_matches("0x");
    let padded = if trimmed.len() % 2 == 1 { format!("0{trimmed}") } else { trimmed.to_string() };
    hex::decode(padded).map_err(|e| OutboxError::Decode(e.to_string()))
}

fn decode_address(hex_str: &str) -> Result<Address, OutboxError> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x")).map_err(|e| OutboxError::Decode(e.to_string()))?;
    if bytes.len() != 20 {
        return Err(OutboxError::Decode("address: expected 20 bytes".into()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Decodes a Geth-style `prestateTracer` diffMode result shape:
/// `{ "post": { addr: { balance, nonce, code, storage } }, "pre": {...} }`
/// into a `QueuedDiff` by taking the post-state for every touched address.
fn decode_prestate_diff(result: &Value) -> Result<QueuedDiff, OutboxError> {
    let post = result.get("post").ok_or_else(|| OutboxError::Decode("prestate diff: missing post".into()))?;
    let post_map = post.as_object().ok_or_else(|| OutboxError::Decode("prestate diff: post is not an object".into()))?;

    let mut accounts = Vec::new();
    let mut storage = Vec::new();
    let mut codes = Vec::new();

    let mut addresses: Vec<&String> = post_map.keys().collect();
    addresses.sort();

    for addr_hex in addresses {
        let address = decode_address(addr_hex)?;
        let entry = &post_map[addr_hex];

        let balance = entry.get("balance").map(decode_quantity).transpose()?.unwrap_or_default();
        let nonce = entry
            .get("nonce")
            .and_then(Value::as_str)
            .map(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16))
            .transpose()
            .map_err(|e| OutboxError::Decode(e.to_string()))?
            .unwrap_or(0);

        let mut code_hash = [0u8; 32];
        if let Some(code_hex) = entry.get("code").and_then(Value::as_str) {
            let code = hex::decode(code_hex.trim_start_matches("0x")).map_err(|e| OutboxError::Decode(e.to_string()))?;
            if !code.is_empty() {
                use sha2::{Digest, Sha256};
                let digest = Sha256::digest(&code);
                code_hash.copy_from_slice(&digest);
                codes.push(CodeUpdate { address, code_hash, code });
            }
        }

        accounts.push(AccountUpdate { address, nonce, balance, code_hash, alive: true });

        if let Some(slots) = entry.get("storage").and_then(Value::as_object) {
            let mut slot_keys: Vec<&String> = slots.keys().collect();
            slot_keys.sort();
            for slot_hex in slot_keys {
                let slot = decode_bytes32(slot_hex)?;
                let value = decode_bytes32(slots[slot_hex].as_str().unwrap_or("0x0"))?;
                storage.push(StorageUpdate { address, slot, value });
            }
        }
    }

    Ok(QueuedDiff { accounts, storage, codes })
}

fn decode_bytes32(hex_str: &str) -> Result<Hash32, OutboxError> {
    let trimmed = hex_str.trim_start_matches("0x");
    let padded = format!("{trimmed:0>64}");
    let bytes = hex::decode(padded).map_err(|e| OutboxError::Decode(e.to_string()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[bytes.len() - 32..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_prestate_diff_into_sorted_diff() {
        let result = json!({
            "post": {
                "0x0000000000000000000000000000000000000001": {
                    "balance": "0x64",
                    "nonce": "0x1",
                    "storage": { "0x01": "0x02" }
                }
            }
        });
        let diff = decode_prestate_diff(&result).unwrap();
        assert_eq!(diff.accounts.len(), 1);
        assert_eq!(diff.accounts[0].nonce, 1);
        assert_eq!(diff.storage.len(), 1);
    }
}

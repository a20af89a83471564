//! Outbox Reader (spec §4.1): JSON-RPC client for the upstream node's
//! outbox. Lazy-dials a single cached `reqwest::Client` under a mutex,
//! following the manual `reqwest::Client` + `serde_json::Value` idiom the
//! teacher uses for its own outbound HTTP calls (`api/price.rs`) rather
//! than pulling in a dedicated jsonrpc crate.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::OutboxError;
use crate::types::{BlockSelector, EventKind, Hash32, OutboxEnvelope, QueuedDiff, ReorgMarker, Seq};

/// Only payload version this daemon understands; a mismatch is an
/// invariant violation (spec §7), not a transient error.
pub const PAYLOAD_VERSION: u16 = 1;

pub fn decode_diff_payload(envelope: &OutboxEnvelope) -> Result<QueuedDiff, OutboxError> {
    if envelope.version != PAYLOAD_VERSION {
        return Err(OutboxError::Decode(format!("unsupported envelope version {}", envelope.version)));
    }
    bincode::deserialize(&envelope.payload).map_err(|e| OutboxError::Decode(e.to_string()))
}

pub fn decode_reorg_payload(envelope: &OutboxEnvelope) -> Result<ReorgMarker, OutboxError> {
    if envelope.version != PAYLOAD_VERSION {
        return Err(OutboxError::Decode(format!("unsupported envelope version {}", envelope.version)));
    }
    bincode::deserialize(&envelope.payload).map_err(|e| OutboxError::Decode(e.to_string()))
}

pub struct OutboxReader {
    endpoint: String,
    timeout: Duration,
    reconnect_delay: Duration,
    client: Arc<Mutex<Option<Client>>>,
    last_reconnect_attempt: Mutex<Option<std::time::Instant>>,
}

impl OutboxReader {
    pub fn new(endpoint: String, timeout: Duration, reconnect_delay: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            reconnect_delay,
            client: Arc::new(Mutex::new(None)),
            last_reconnect_attempt: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Client, OutboxError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let mut last_attempt = self.last_reconnect_attempt.lock().await;
        if let Some(at) = *last_attempt {
            if at.elapsed() < self.reconnect_delay {
                return Err(OutboxError::Closed);
            }
        }
        *last_attempt = Some(std::time::Instant::now());

        let built = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| OutboxError::Rpc(e.to_string()))?;
        *guard = Some(built.clone());
        Ok(built)
    }

    /// Tear down the cached client so the next call redials.
    async fn invalidate(&self) {
        *self.client.lock().await = None;
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, OutboxError> {
        let client = self.client().await?;
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });

        let response = client.post(&self.endpoint).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                OutboxError::Timeout(self.timeout)
            } else {
                OutboxError::Rpc(e.to_string())
            }
        });

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.invalidate().await;
                return Err(e);
            }
        };

        if !response.status().is_success() {
            self.invalidate().await;
            return Err(OutboxError::Rpc(format!("http status {}", response.status())));
        }

        let parsed: Value = response.json().await.map_err(|e| OutboxError::Decode(e.to_string()))?;
        if let Some(error) = parsed.get("error") {
            return Err(OutboxError::Rpc(error.to_string()));
        }
        parsed.get("result").cloned().ok_or_else(|| OutboxError::Decode("missing result field".into()))
    }

    pub async fn read_event(&self, seq: Seq) -> Result<Option<OutboxEnvelope>, OutboxError> {
        let result = self.call("getEvent", json!([seq])).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(decode_envelope(&result)?))
    }

    pub async fn read_range(&self, from: Seq, to: Seq) -> Result<Vec<OutboxEnvelope>, OutboxError> {
        let result = self.call("getEvents", json!([from, to])).await?;
        let array = result.as_array().ok_or_else(|| OutboxError::Decode("getEvents: expected array".into()))?;
        array.iter().map(decode_envelope).collect()
    }

    pub async fn latest_seq(&self) -> Result<Seq, OutboxError> {
        let result = self.call("latestSeq", json!([])).await?;
        result.as_u64().ok_or_else(|| OutboxError::Decode("latestSeq: expected u64".into()))
    }

    pub async fn lowest_seq(&self) -> Result<Seq, OutboxError> {
        let result = self.call("lowestSeq", json!([])).await?;
        result.as_u64().ok_or_else(|| OutboxError::Decode("lowestSeq: expected u64".into()))
    }

    pub async fn compact_below(&self, safe_seq: Seq) -> Result<(u64, Seq), OutboxError> {
        let result = self.call("compactOutboxBelow", json!([safe_seq])).await?;
        let deleted = result.get("deleted").and_then(Value::as_u64).unwrap_or(0);
        let achieved = result.get("safeSeq").and_then(Value::as_u64).unwrap_or(safe_seq);
        Ok((deleted, achieved))
    }

    pub async fn account_range(
        &self,
        selector: BlockSelector,
        start_key: &[u8],
        page_size: usize,
    ) -> Result<(Value, Option<Vec<u8>>), OutboxError> {
        let selector_json = selector_to_json(selector);
        let result = self
            .call("accountRange", json!([selector_json, hex::encode(start_key), page_size, false, false, false]))
            .await?;
        let accounts = result.get("accounts").cloned().unwrap_or(Value::Null);
        let next = result
            .get("next")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .and_then(|s| hex::decode(s).ok());
        Ok((accounts, next))
    }
}

fn selector_to_json(selector: BlockSelector) -> Value {
    match selector {
        BlockSelector::Latest => json!("latest"),
        BlockSelector::Number(n) => json!(n),
        BlockSelector::Hash { hash, .. } => json!(format!("0x{}", hex::encode(hash))),
    }
}

fn decode_hash32(value: &Value, field: &str) -> Result<Hash32, OutboxError> {
    let hex_str = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| OutboxError::Decode(format!("missing field: {field}")))?;
    let hex_str = hex_str.trim_start_matches("0x");
    let bytes = hex::decode(hex_str).map_err(|e| OutboxError::Decode(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(OutboxError::Decode(format!("{field}: expected 32 bytes, got {}", bytes.len())));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn decode_envelope(value: &Value) -> Result<OutboxEnvelope, OutboxError> {
    let seq = value.get("seq").and_then(Value::as_u64).ok_or_else(|| OutboxError::Decode("missing seq".into()))?;
    let version = value.get("version").and_then(Value::as_u64).ok_or_else(|| OutboxError::Decode("missing version".into()))? as u16;
    let kind_str = value.get("kind").and_then(Value::as_str).ok_or_else(|| OutboxError::Decode("missing kind".into()))?;
    let kind = match kind_str {
        "diff" => EventKind::Diff,
        "reorg" => EventKind::Reorg,
        other => return Err(OutboxError::Decode(format!("unknown event kind: {other}"))),
    };
    let block_number = value
        .get("blockNumber")
        .and_then(Value::as_u64)
        .ok_or_else(|| OutboxError::Decode("missing blockNumber".into()))?;
    let block_hash = decode_hash32(value, "blockHash")?;
    let parent_hash = decode_hash32(value, "parentHash")?;
    let timestamp = value.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
    let payload_hex = value.get("payload").and_then(Value::as_str).ok_or_else(|| OutboxError::Decode("missing payload".into()))?;
    let payload = hex::decode(payload_hex.trim_start_matches("0x")).map_err(|e| OutboxError::Decode(e.to_string()))?;

    Ok(OutboxEnvelope { seq, version, kind, block_number, block_hash, parent_hash, timestamp, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_diff_envelope() {
        let value = json!({
            "seq": 5,
            "version": 1,
            "kind": "diff",
            "blockNumber": 10,
            "blockHash": format!("0x{}", hex::encode([1u8; 32])),
            "parentHash": format!("0x{}", hex::encode([2u8; 32])),
            "timestamp": 1234,
            "payload": hex::encode([9u8, 9, 9]),
        });
        let envelope = decode_envelope(&value).unwrap();
        assert_eq!(envelope.seq, 5);
        assert_eq!(envelope.kind, EventKind::Diff);
        assert_eq!(envelope.block_hash, [1u8; 32]);
        assert_eq!(envelope.payload, vec![9, 9, 9]);
    }

    #[test]
    fn rejects_unknown_event_kind() {
        let value = json!({
            "seq": 0, "version": 1, "kind": "bogus", "blockNumber": 0,
            "blockHash": format!("0x{}", hex::encode([0u8; 32])),
            "parentHash": format!("0x{}", hex::encode([0u8; 32])),
            "timestamp": 0, "payload": "",
        });
        assert!(decode_envelope(&value).is_err());
    }
}

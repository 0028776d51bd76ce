//! JSON-RPC source backed by an archive node.
//!
//! Talks JSON-RPC 2.0 over HTTP. Resolving a snapshot takes two calls:
//!
//! 1. `chain_getBlockHash(height)` to pin the query to a block.
//! 2. The configured snapshot method (default `subnetInfo_getAllSubnets`)
//!    with `[block_hash]`, returning a JSON array of subnet records.
//!
//! The snapshot method must return decoded JSON records. Runtime APIs that
//! answer with SCALE-encoded bytes need a JSON-returning method or proxy in
//! front of the node.
//!
//! The current height comes from `chain_getHeader`, whose `number` may be a
//! hex string (Substrate style) or a plain integer.
//!
//! # Retry Strategy
//!
//! Transport problems are retried with exponential backoff before the call
//! is reported as failed:
//! - HTTP 429 (rate limited) and 5xx → retry
//! - Network errors and timeouts → retry
//! - Other HTTP 4xx and JSON-RPC `error` objects → fail immediately
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::SourceConfig;
use crate::models::{snapshot_from_records, Height, Snapshot, SubnetInfo};

use super::SnapshotSource;

/// A [`SnapshotSource`] that queries a node over HTTP JSON-RPC.
pub struct JsonRpcSource {
    url: String,
    snapshot_method: String,
    max_retries: u32,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcSource {
    /// Build a source from configuration. Does not touch the network.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            url: config.url.clone(),
            snapshot_method: config.snapshot_method.clone(),
            max_retries: config.max_retries,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC call and return its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(method, attempt, ?delay, "retrying RPC call");
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&self.url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .with_context(|| format!("{}: response is not valid JSON", method))?;
                        trace!(method, id, "RPC response received");
                        return parse_rpc_response(method, json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("{}: HTTP {}: {}", method, status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{}: HTTP {}: {}", method, status, body_text);
                }
                Err(e) => {
                    let err = anyhow::Error::new(e).context(format!("{} request failed", method));
                    last_err = Some(err);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", method)))
    }

    async fn block_hash(&self, height: Height) -> Result<String> {
        let result = self.call("chain_getBlockHash", json!([height])).await?;
        match result {
            Value::String(hash) => Ok(hash),
            Value::Null => bail!("unknown block {}", height),
            other => bail!("chain_getBlockHash: unexpected result {}", other),
        }
    }
}

#[async_trait]
impl SnapshotSource for JsonRpcSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn current_height(&self) -> Result<Height> {
        let header = self.call("chain_getHeader", json!([])).await?;
        let number = header
            .get("number")
            .ok_or_else(|| anyhow!("chain_getHeader: missing 'number'"))?;
        parse_height(number).context("chain_getHeader: invalid 'number'")
    }

    async fn snapshot_at(&self, height: Height) -> Result<Snapshot> {
        let hash = self.block_hash(height).await?;
        let result = self.call(&self.snapshot_method, json!([hash])).await?;
        parse_subnets(&self.snapshot_method, result)
    }
}

/// Decode a snapshot method result into a [`Snapshot`].
fn parse_subnets(method: &str, result: Value) -> Result<Snapshot> {
    if result.is_string() {
        bail!(
            "{}: returned encoded bytes instead of JSON records; configure a JSON-returning snapshot_method",
            method
        );
    }
    let records: Vec<SubnetInfo> =
        serde_json::from_value(result).with_context(|| format!("{}: malformed subnet list", method))?;
    Ok(snapshot_from_records(records))
}

/// Split a JSON-RPC envelope into its `result` or an error.
fn parse_rpc_response(method: &str, json: Value) -> Result<Value> {
    if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("{}: node error {}: {}", method, code, message);
    }
    match json {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| anyhow!("{}: response has neither result nor error", method)),
        _ => bail!("{}: response is not a JSON object", method),
    }
}

/// Parse a block number given as `"0x1a2b"`, `"6699"` or `6699`.
pub fn parse_height(value: &Value) -> Result<Height> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| anyhow!("block number {} is not a u64", n)),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => Height::from_str_radix(hex, 16)
                    .with_context(|| format!("invalid hex block number '{}'", s)),
                None => s
                    .parse::<Height>()
                    .with_context(|| format!("invalid block number '{}'", s)),
            }
        }
        other => bail!("unexpected block number {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_list_must_be_json_records() {
        let snapshot = parse_subnets(
            "subnetInfo_getAllSubnets",
            json!([{ "netuid": 3, "subnet_name": "gamma" }, { "netuid": 1 }]),
        )
        .unwrap();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![1, 3]);

        let err = parse_subnets("subnetInfo_getSubnetsInfo", json!("0x0c0100")).unwrap_err();
        assert!(err.to_string().contains("encoded bytes"));
        assert!(parse_subnets("m", json!({ "netuid": 1 })).is_err());
    }

    #[test]
    fn parses_height_forms() {
        assert_eq!(parse_height(&json!("0x1a")).unwrap(), 26);
        assert_eq!(parse_height(&json!("4200")).unwrap(), 4200);
        assert_eq!(parse_height(&json!(77)).unwrap(), 77);
        assert!(parse_height(&json!("0xzz")).is_err());
        assert!(parse_height(&json!(-1)).is_err());
        assert!(parse_height(&json!(null)).is_err());
    }

    #[test]
    fn rpc_envelope_result_and_error() {
        let ok = parse_rpc_response("m", json!({"jsonrpc": "2.0", "id": 1, "result": [1, 2]}));
        assert_eq!(ok.unwrap(), json!([1, 2]));

        let null_result = parse_rpc_response("m", json!({"jsonrpc": "2.0", "id": 1, "result": null}));
        assert_eq!(null_result.unwrap(), Value::Null);

        let err = parse_rpc_response(
            "m",
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "State pruned"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("State pruned"));

        assert!(parse_rpc_response("m", json!({"jsonrpc": "2.0", "id": 1})).is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails() {
        let source = JsonRpcSource::new(&SourceConfig {
            url: "http://127.0.0.1:1".to_string(),
            snapshot_method: "subnetInfo_getAllSubnets".to_string(),
            timeout_secs: 1,
            max_retries: 0,
        })
        .unwrap();
        assert!(source.current_height().await.is_err());
        assert!(source.snapshot_at(10).await.is_err());
    }
}

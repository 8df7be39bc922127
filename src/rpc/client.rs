//! The measured Engine-API client.
//!
//! Two durations are captured per call: **server time** runs from request
//! dispatch (on a warm keep-alive connection) to the last response byte;
//! **full duration** additionally covers JWT minting and request assembly.

use super::{jwt, validate::Validation};
use crate::config::BootstrapFcuConfig;
use alloy_primitives::B256;
use color_eyre::{
    eyre::{bail, eyre},
    Result,
};
use serde_json::Value;
use std::{
    str::FromStr,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// The outcome of one raw call.
#[derive(Debug, Clone)]
pub(crate) struct CallOutcome {
    /// The raw response body.
    pub(crate) body: String,
    /// Dispatch-to-last-byte duration, nanoseconds.
    pub(crate) server_time_ns: u64,
    /// Assembly-to-last-byte duration, nanoseconds.
    pub(crate) full_duration_ns: u64,
}

/// A reference to a block, captured via `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockRef {
    /// The block number.
    pub(crate) number: u64,
    /// The block number as the raw 0x-hex string the client returned.
    pub(crate) number_hex: String,
    /// The block hash.
    pub(crate) hash: B256,
}

/// The Engine-API endpoint of one client instance.
#[derive(Debug, Clone)]
pub(crate) struct EngineClient {
    http: reqwest::Client,
    endpoint: Url,
    secret: Vec<u8>,
}

impl EngineClient {
    /// Creates a client for an endpoint and JWT secret.
    pub(crate) fn new(endpoint: Url, secret: Vec<u8>) -> Result<Self> {
        // Payload execution can take minutes; no request timeout. A single
        // idle connection keeps the measured path on a warm socket.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            secret,
        })
    }

    /// Issues a raw, pre-serialised JSON-RPC request and measures it.
    pub(crate) async fn call_raw(&self, request: &str) -> Result<CallOutcome> {
        let full_start = Instant::now();
        let token = jwt::mint(&self.secret);
        let prepared = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {token}"))
            .body(request.to_string());

        let server_start = Instant::now();
        let response = prepared.send().await?;
        let status = response.status();
        // Read the body once; validation and the `.response` file both use
        // this buffer.
        let body = response.text().await?;
        let server_time_ns = server_start.elapsed().as_nanos() as u64;
        let full_duration_ns = full_start.elapsed().as_nanos() as u64;

        if !status.is_success() {
            bail!("engine endpoint returned HTTP {status}: {}", body.trim());
        }
        Ok(CallOutcome {
            body,
            server_time_ns,
            full_duration_ns,
        })
    }

    /// Issues a structured JSON-RPC call and returns the `result` value.
    pub(crate) async fn call_method(&self, method: &str, params: Value) -> Result<Value> {
        let request = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))?;
        let outcome = self.call_raw(&request).await?;
        let parsed: Value = serde_json::from_str(&outcome.body)?;
        if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
            bail!("{method} failed: {error}");
        }
        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| eyre!("{method} returned no result"))
    }

    /// Waits until the endpoint accepts JWT-authenticated requests.
    pub(crate) async fn wait_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                bail!("cancelled while waiting for RPC readiness");
            }
            match self.call_method("eth_chainId", Value::Array(vec![])).await {
                Ok(_) => {
                    info!(target: "rpc", "engine endpoint ready at {}", self.endpoint);
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(e.wrap_err("engine endpoint never became ready"));
                }
                Err(e) => debug!(target: "rpc", "endpoint not ready yet: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Captures the client's current head.
    pub(crate) async fn latest_block(&self) -> Result<BlockRef> {
        let block = self
            .call_method(
                "eth_getBlockByNumber",
                serde_json::json!(["latest", false]),
            )
            .await?;
        let number_hex = block
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre!("latest block has no number"))?
            .to_string();
        let number = u64::from_str_radix(number_hex.trim_start_matches("0x"), 16)?;
        let hash = block
            .get("hash")
            .and_then(Value::as_str)
            .map(B256::from_str)
            .transpose()?
            .ok_or_else(|| eyre!("latest block has no hash"))?;
        Ok(BlockRef {
            number,
            number_hex,
            hash,
        })
    }

    /// Drives the bootstrap forkchoiceUpdated loop: retries with constant
    /// backoff until the client stops answering SYNCING.
    pub(crate) async fn bootstrap_fcu(
        &self,
        config: &BootstrapFcuConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = serde_json::json!({
            "headBlockHash": config.head_block_hash,
            "safeBlockHash": config.head_block_hash,
            "finalizedBlockHash": config.head_block_hash,
        });
        let request = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "engine_forkchoiceUpdatedV3",
            "params": [state, Value::Null],
        }))?;

        for attempt in 0..=config.max_retries {
            if cancel.is_cancelled() {
                bail!("cancelled during bootstrap FCU");
            }
            let outcome = self.call_raw(&request).await?;
            match super::validate::validate_response("engine_forkchoiceUpdatedV3", &outcome.body) {
                Validation::Valid => {
                    info!(target: "rpc", "bootstrap FCU accepted after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Validation::Syncing => {
                    debug!(target: "rpc", "bootstrap FCU attempt {} answered SYNCING", attempt + 1);
                    tokio::select! {
                        _ = tokio::time::sleep(config.backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Validation::Invalid(reason) => {
                    warn!(target: "rpc", "bootstrap FCU rejected: {reason}");
                    bail!("bootstrap FCU rejected: {reason}");
                }
            }
        }
        bail!(
            "bootstrap FCU still SYNCING after {} attempts",
            config.max_retries + 1
        )
    }
}

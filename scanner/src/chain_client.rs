//! HTTP client for the chain-data provider
//!
//! The provider exposes plain HTTP/JSON: a chain tip endpoint, a block range
//! endpoint, and a transaction detail endpoint. Responses may be delayed or
//! transiently unavailable, so every call retries with exponential backoff
//! before surfacing an error. A range fetch is all-or-nothing: it either
//! returns every block in `[from, to]` with full output scripts or fails.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::models::{ChainBlock, ChainBlockData, RawTransaction};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {code}")]
    Status { code: u16 },

    #[error("requested height not yet available")]
    NotYetAvailable,

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Transient faults worth another attempt. `NotYetAvailable` is a wait
    /// signal, not a fault, and malformed payloads will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status { code } => *code == 429 || *code >= 500,
            FetchError::NotYetAvailable | FetchError::Malformed(_) => false,
        }
    }
}

/// Delay before retry `attempt` (0-based): doubles from `base` up to `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(cap)
}

/// Upstream chain-data source, as seen by the scanner.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn tip_height(&self) -> Result<i64, FetchError>;
    async fn blocks_in_range(&self, from: i64, to: i64) -> Result<Vec<ChainBlockData>, FetchError>;
    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, FetchError>;
}

#[derive(Debug, Deserialize)]
struct TipResponse {
    height: i64,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    height: i64,
    hash: String,
    time: i64,
    transactions: Vec<TxResponse>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    txid: String,
    #[serde(default)]
    address: Option<String>,
    /// Hex-encoded output scripts. Some provider deployments omit them from
    /// range responses, in which case the client resolves each transaction
    /// through the detail endpoint.
    #[serde(default)]
    outputs: Option<Vec<String>>,
    #[serde(default)]
    block_height: Option<i64>,
    #[serde(default)]
    block_time: Option<i64>,
}

pub struct HttpChainProvider {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl HttpChainProvider {
    pub fn new(base_url: &str, max_retries: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            backoff_base,
            backoff_cap,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            match self.get_json_once(&url).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt);
                    warn!(%url, attempt, error = %err, "provider call failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.client.get(url).send().await?;
        match response.status().as_u16() {
            200 => response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Malformed(e.to_string())),
            404 => Err(FetchError::NotYetAvailable),
            code => Err(FetchError::Status { code }),
        }
    }

    fn convert_tx(&self, tx: TxResponse, header: Option<&ChainBlock>) -> Result<RawTransaction, FetchError> {
        let scripts = tx
            .outputs
            .ok_or_else(|| FetchError::Malformed(format!("transaction {} has no outputs", tx.txid)))?;
        let output_scripts = scripts
            .iter()
            .map(|hex_script| {
                hex::decode(hex_script)
                    .map_err(|e| FetchError::Malformed(format!("transaction {}: bad script hex: {e}", tx.txid)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawTransaction {
            txid: tx.txid,
            sender_address: tx.address,
            output_scripts,
            block_height: header.map(|h| h.height).or(tx.block_height),
            block_time: header.map(|h| h.time).or(tx.block_time),
        })
    }
}

#[async_trait]
impl ChainProvider for HttpChainProvider {
    async fn tip_height(&self) -> Result<i64, FetchError> {
        let tip: TipResponse = self.get_json("/v1/chain/tip").await?;
        Ok(tip.height)
    }

    async fn blocks_in_range(&self, from: i64, to: i64) -> Result<Vec<ChainBlockData>, FetchError> {
        let blocks: Vec<BlockResponse> = self.get_json(&format!("/v1/blocks?from={from}&to={to}")).await?;

        // The range must come back contiguous. A short response that stops
        // early means the tip moved under us; anything else is a broken
        // provider.
        for (i, block) in blocks.iter().enumerate() {
            let expected = from + i as i64;
            if block.height != expected {
                return Err(FetchError::Malformed(format!(
                    "non-contiguous range response: expected height {expected}, got {}",
                    block.height
                )));
            }
        }
        if blocks.last().map(|b| b.height) != Some(to) {
            return Err(FetchError::NotYetAvailable);
        }

        let mut result = Vec::with_capacity(blocks.len());
        for block in blocks {
            let header = ChainBlock { height: block.height, hash: block.hash, time: block.time };
            let mut transactions = Vec::with_capacity(block.transactions.len());
            for tx in block.transactions {
                let tx = if tx.outputs.is_some() {
                    self.convert_tx(tx, Some(&header))?
                } else {
                    // range endpoint returned ids only; resolve the scripts
                    let mut full = self.raw_transaction(&tx.txid).await?;
                    full.block_height = Some(header.height);
                    full.block_time = Some(header.time);
                    full
                };
                transactions.push(tx);
            }
            result.push(ChainBlockData { header, transactions });
        }
        Ok(result)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, FetchError> {
        let tx: TxResponse = self.get_json(&format!("/v1/tx/{txid}")).await?;
        self.convert_tx(tx, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 10), cap);
        // overflow-safe for absurd attempt counts
        assert_eq!(backoff_delay(base, cap, 64), cap);
    }

    #[test]
    fn retry_classification() {
        assert!(FetchError::Status { code: 500 }.is_retryable());
        assert!(FetchError::Status { code: 429 }.is_retryable());
        assert!(!FetchError::Status { code: 400 }.is_retryable());
        assert!(!FetchError::NotYetAvailable.is_retryable());
        assert!(!FetchError::Malformed("bad".into()).is_retryable());
    }
}

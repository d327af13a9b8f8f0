//! Unified scanning loop
//!
//! One logical task drives fetch → decode → persist cycles. The checkpoint
//! advances strictly after a batch commit, so persistence failures retry the
//! same range (upserts are idempotent by txid), decode failures skip only
//! the offending output, and fatal errors stop the loop for an operator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use protocol_core::{assemble, decode_output, ParsedTransaction, RawTxContext};

use crate::cache::{TransactionCache, TxCacheEntry};
use crate::chain_client::{backoff_delay, ChainProvider, FetchError};
use crate::config::Config;
use crate::database::PersistenceGateway;
use crate::error::Result;
use crate::models::{ChainBlock, ChainBlockData, RawTransaction};
use crate::scanner::ScanCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Idle,
    Fetching,
    Decoding,
    Persisting,
    Committed,
    Backoff,
    Stopped,
}

/// Introspection snapshot, for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub state: ScannerState,
    pub checkpoint: Option<i64>,
    pub tip: Option<i64>,
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Chain tip has not reached the next height yet.
    NoNewData,
    Committed { from: i64, to: i64, txs_seen: usize, txs_ours: usize },
}

struct DecodeSummary {
    parsed: Vec<ParsedTransaction>,
    txs_seen: usize,
    outputs_skipped: usize,
    records_rejected: usize,
}

pub struct UnifiedScanner {
    provider: Arc<dyn ChainProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    cursor: ScanCursor,
    cache: TransactionCache,
    batch_size: i64,
    poll_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    state: ScannerState,
    last_tip: Option<i64>,
    last_checkpoint: Option<i64>,
    shutdown: watch::Receiver<bool>,
}

impl UnifiedScanner {
    pub fn new(
        config: &Config,
        provider: Arc<dyn ChainProvider>,
        gateway: Arc<dyn PersistenceGateway>,
        cursor: ScanCursor,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            gateway,
            cursor,
            cache: TransactionCache::new(config.cache_capacity, config.cache_ttl),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            state: ScannerState::Idle,
            last_tip: None,
            last_checkpoint: None,
            shutdown,
        }
    }

    pub fn status(&self) -> ScannerStatus {
        ScannerStatus {
            state: self.state,
            checkpoint: self.last_checkpoint,
            tip: self.last_tip,
            observed_at: chrono::Utc::now(),
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps, waking early if shutdown is signalled.
    async fn interruptible_sleep(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Runs cycles until shutdown or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!("starting scanner loop");
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.shutdown_requested() {
                self.state = ScannerState::Stopped;
                info!("shutdown signal received, stopping scanner");
                return Ok(());
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Committed { from, to, txs_seen, txs_ours }) => {
                    consecutive_failures = 0;
                    info!(from, to, txs_seen, txs_ours, "batch committed");
                }
                Ok(CycleOutcome::NoNewData) => {
                    consecutive_failures = 0;
                    self.state = ScannerState::Idle;
                    self.interruptible_sleep(self.poll_interval).await;
                }
                Err(err) if err.is_fatal() => {
                    self.state = ScannerState::Stopped;
                    error!(error = %err, "fatal scanner error, stopping");
                    return Err(err);
                }
                Err(err) => {
                    self.state = ScannerState::Backoff;
                    let delay = backoff_delay(self.backoff_base, self.backoff_cap, consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(error = %err, failures = consecutive_failures, "cycle failed, backing off for {delay:?}");
                    self.interruptible_sleep(delay).await;
                }
            }
        }
    }

    /// One fetch → decode → persist cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.state = ScannerState::Fetching;
        let from = self.cursor.next_height().await?;

        let tip = match self.provider.tip_height().await {
            Ok(tip) => tip,
            Err(FetchError::NotYetAvailable) => return Ok(CycleOutcome::NoNewData),
            Err(err) => return Err(err.into()),
        };
        self.last_tip = Some(tip);
        if tip < from {
            return Ok(CycleOutcome::NoNewData);
        }

        let to = tip.min(from + self.batch_size - 1);
        let blocks = match self.provider.blocks_in_range(from, to).await {
            Ok(blocks) => blocks,
            Err(FetchError::NotYetAvailable) => return Ok(CycleOutcome::NoNewData),
            Err(err) => return Err(err.into()),
        };

        self.state = ScannerState::Decoding;
        let summary = self.decode_blocks(&blocks);
        if summary.outputs_skipped > 0 || summary.records_rejected > 0 {
            warn!(
                outputs_skipped = summary.outputs_skipped,
                records_rejected = summary.records_rejected,
                "batch decoded with local failures"
            );
        }

        self.state = ScannerState::Persisting;
        let headers: Vec<ChainBlock> = blocks.iter().map(|b| b.header.clone()).collect();
        self.gateway.record_blocks(&headers).await?;
        self.gateway.process_transaction_batch(&summary.parsed).await?;

        // Only a durably committed batch moves the checkpoint.
        self.cursor.advance(to).await?;
        self.last_checkpoint = Some(to);
        self.state = ScannerState::Committed;

        Ok(CycleOutcome::Committed {
            from,
            to,
            txs_seen: summary.txs_seen,
            txs_ours: summary.parsed.len(),
        })
    }

    /// Decode and assemble every transaction in the batch. Synchronous and
    /// CPU-bound; per-output and per-record failures are logged and skipped,
    /// never aborting the cycle.
    fn decode_blocks(&self, blocks: &[ChainBlockData]) -> DecodeSummary {
        let mut summary = DecodeSummary { parsed: Vec::new(), txs_seen: 0, outputs_skipped: 0, records_rejected: 0 };

        for block in blocks {
            for tx in &block.transactions {
                summary.txs_seen += 1;
                if let Some(hit) = self.cache.get(&tx.txid, tx.block_height) {
                    if let Some(parsed) = hit.parsed {
                        summary.parsed.push(parsed);
                    }
                    continue;
                }
                let parsed = self.decode_transaction(tx, &mut summary);
                self.cache.insert(
                    &tx.txid,
                    TxCacheEntry { parsed: parsed.clone(), decoded_at_height: tx.block_height },
                );
                if let Some(parsed) = parsed {
                    summary.parsed.push(parsed);
                }
            }
        }
        summary
    }

    fn decode_transaction(&self, tx: &RawTransaction, summary: &mut DecodeSummary) -> Option<ParsedTransaction> {
        let mut outputs = Vec::new();
        for (vout, script) in tx.output_scripts.iter().enumerate() {
            match decode_output(script, vout as u32) {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(err) => {
                    summary.outputs_skipped += 1;
                    warn!(txid = %tx.txid, vout = err.vout(), error = %err, "skipping undecodable output");
                }
            }
        }

        let ctx = RawTxContext {
            txid: tx.txid.clone(),
            sender_address: tx.sender_address.clone(),
            block_height: tx.block_height,
            block_time: tx.block_time,
        };
        let outcome = assemble(&ctx, outputs);
        for skipped in &outcome.skipped {
            summary.records_rejected += 1;
            warn!(txid = %tx.txid, vout = skipped.vout, error = %skipped.error, "record rejected during assembly");
        }
        outcome.parsed
    }
}

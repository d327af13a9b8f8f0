//! Data models shared between the chain client, the scanner and the store

use protocol_core::{lock_status, LockStatus, VoteOption};
use serde::{Deserialize, Serialize};

/// Confirmed block header. Immutable once past the reorg-safety depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub height: i64,
    pub hash: String,
    pub time: i64,
}

/// One transaction as delivered by the chain-data provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    /// 64-char hex transaction id.
    pub txid: String,
    pub sender_address: Option<String>,
    /// Raw script bytes per output, in vout order.
    pub output_scripts: Vec<Vec<u8>>,
    /// Unset while the transaction is unconfirmed.
    pub block_height: Option<i64>,
    pub block_time: Option<i64>,
}

/// A block header plus its transactions, the unit returned by range fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlockData {
    pub header: ChainBlock,
    pub transactions: Vec<RawTransaction>,
}

/// Stored post, as returned by the persistence gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub txid: String,
    pub post_id: String,
    pub content: Option<String>,
    pub author_address: Option<String>,
    pub block_height: Option<i64>,
    pub block_time: Option<i64>,
    pub tags: Vec<String>,
    pub media_mime: Option<String>,
    pub question: Option<String>,
    /// Ordered by option index; empty unless vote options were requested.
    pub options: Vec<VoteOption>,
    pub lock: Option<Lock>,
}

/// Stored lock. Status is derived from the current height, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lock {
    pub txid: String,
    /// Post id, or `post_id:option_index` for a vote-option lock.
    pub target_id: String,
    pub author_address: Option<String>,
    pub amount: i64,
    pub duration: Option<i64>,
    pub unlock_height: Option<i64>,
}

impl Lock {
    pub fn status(&self, current_height: i64) -> LockStatus {
        lock_status(self.unlock_height, current_height)
    }
}

/// Target id of a vote-option lock.
pub fn option_target_id(post_id: &str, option_index: i64) -> String {
    format!("{post_id}:{option_index}")
}

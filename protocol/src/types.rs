//! Domain records produced by the decode and assembly layers

use serde::{Deserialize, Serialize};

/// Record type carried by the `type` field of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Content,
    Image,
    Tags,
    VoteQuestion,
    VoteOptionText,
    VoteOptionLock,
    VoteOptionsPacked,
}

impl RecordKind {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "content" => Some(RecordKind::Content),
            "image" => Some(RecordKind::Image),
            "tags" => Some(RecordKind::Tags),
            "vote_question" => Some(RecordKind::VoteQuestion),
            "vote_option_text" => Some(RecordKind::VoteOptionText),
            "vote_option_lock" => Some(RecordKind::VoteOptionLock),
            "vote_options_packed" => Some(RecordKind::VoteOptionsPacked),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            RecordKind::Content => "content",
            RecordKind::Image => "image",
            RecordKind::Tags => "tags",
            RecordKind::VoteQuestion => "vote_question",
            RecordKind::VoteOptionText => "vote_option_text",
            RecordKind::VoteOptionLock => "vote_option_lock",
            RecordKind::VoteOptionsPacked => "vote_options_packed",
        }
    }
}

/// Binary media carried inside an ordinal-style envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// One entry of a `vote_options_packed` value slot.
///
/// The array is serialized as a JSON string inside a single value push,
/// which is why the field names follow the wire's camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedOption {
    pub text: String,
    #[serde(default)]
    pub lock_amount: Option<i64>,
    #[serde(default)]
    pub lock_duration: Option<i64>,
    pub option_index: i64,
}

/// Typed payload of one decoded output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RecordPayload {
    Content { content: String },
    Image { media: MediaPayload },
    Tags { tags: Vec<String> },
    VoteQuestion { question: String },
    VoteOptionText { text: String, option_index: i64 },
    VoteOptionLock { option_index: i64, lock_amount: i64, lock_duration: i64 },
    VoteOptionsPacked { options: Vec<PackedOption> },
}

/// One protocol output after script decoding.
///
/// `sequence` and `parent_sequence` define the within-post tree; `post_id`
/// correlates outputs across transactions and is treated as an opaque
/// case-sensitive string. Keys the decoder does not know about are kept in
/// `unknown_fields` for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedOutput {
    pub vout: u32,
    pub kind: RecordKind,
    pub post_id: Option<String>,
    pub sequence: i64,
    pub parent_sequence: Option<i64>,
    pub lock_amount: Option<i64>,
    pub lock_duration: Option<i64>,
    pub payload: RecordPayload,
    pub unknown_fields: Vec<(String, String)>,
}

/// What a parsed transaction contributes to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    /// Root `content` output present: creates a post.
    Post,
    /// Root `vote_question` output present: creates a vote post.
    VoteQuestion,
    /// Only children present: enriches a post created by an earlier transaction.
    Enrichment,
}

impl TxKind {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "post" => Some(TxKind::Post),
            "vote_question" => Some(TxKind::VoteQuestion),
            "enrichment" => Some(TxKind::Enrichment),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            TxKind::Post => "post",
            TxKind::VoteQuestion => "vote_question",
            TxKind::Enrichment => "enrichment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    /// Committed amount in satoshis, always > 0.
    pub amount: i64,
    /// Lock duration in blocks.
    pub duration: i64,
    /// `broadcast_height + duration`; unset while the transaction is
    /// unconfirmed and recomputed once it confirms.
    pub unlock_height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    pub text: String,
    pub index: i64,
    pub lock: Option<LockPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePayload {
    pub question: String,
    /// Ordered strictly by `index`, never by arrival order.
    pub options: Vec<VoteOption>,
}

/// A child output whose parent is not part of the same transaction.
///
/// Retained rather than dropped: the root may have arrived in an earlier
/// transaction with the same `post_id`, in which case the store applies the
/// child to the existing post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChild {
    pub vout: u32,
    /// The child's own correlation key; falls back to the transaction-level
    /// `post_id` when the output did not carry one.
    pub post_id: Option<String>,
    pub parent_sequence: Option<i64>,
    pub payload: RecordPayload,
    pub lock: Option<LockPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMeta {
    pub post_id: Option<String>,
    pub content: Option<String>,
    pub image: Option<MediaPayload>,
    pub tags: Vec<String>,
    pub vote: Option<VotePayload>,
    pub lock: Option<LockPayload>,
    pub pending: Vec<PendingChild>,
}

/// The assembled logical record for one transaction, the unit handed to the
/// persistence gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub txid: String,
    pub kind: TxKind,
    pub sender_address: Option<String>,
    pub block_height: Option<i64>,
    pub block_time: Option<i64>,
    pub meta: PostMeta,
}

/// Derived lock state relative to the current chain height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Unlock height not yet known (transaction unconfirmed).
    Pending,
    /// `current_height < unlock_height`.
    Active,
    /// `current_height >= unlock_height`.
    Unlockable,
}

/// The single canonical boundary rule for lock state.
///
/// Every caller, the scanner included, must go through this function rather
/// than comparing heights inline.
pub fn lock_status(unlock_height: Option<i64>, current_height: i64) -> LockStatus {
    match unlock_height {
        None => LockStatus::Pending,
        Some(h) if current_height < h => LockStatus::Active,
        Some(_) => LockStatus::Unlockable,
    }
}

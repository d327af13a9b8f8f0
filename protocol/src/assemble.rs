//! Grouping decoded outputs into one parsed transaction
//!
//! A `content` or `vote_question` output with no parent reference is the
//! root of the tree; image, tags, vote-option, and lock outputs are children
//! pointing at it via `parent_seq`. Children whose parent is not part of the
//! same transaction are kept as pending enrichment, since their root may
//! have arrived in an earlier transaction with the same `post_id`.
//!
//! Assembly is order-independent: outputs are processed in `vout` order no
//! matter how they arrived, so any permutation of the same set yields the
//! same result (including which duplicate vote option loses the conflict).

use crate::error::AssemblyError;
use crate::types::{
    DecodedOutput, LockPayload, ParsedTransaction, PendingChild, PostMeta, RecordKind, RecordPayload,
    TxKind, VoteOption, VotePayload,
};

/// Transaction-level context the assembler needs alongside the outputs.
#[derive(Debug, Clone)]
pub struct RawTxContext {
    pub txid: String,
    pub sender_address: Option<String>,
    pub block_height: Option<i64>,
    pub block_time: Option<i64>,
}

/// A record rejected during assembly, with enough context to log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedOutput {
    pub vout: u32,
    pub error: AssemblyError,
}

#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    /// `None` when the transaction carried no usable protocol records.
    pub parsed: Option<ParsedTransaction>,
    pub skipped: Vec<SkippedOutput>,
}

/// `broadcast_height + duration` when both are known; left unset for
/// unconfirmed transactions and recomputed once the transaction confirms.
fn lock_payload(amount: Option<i64>, duration: Option<i64>, block_height: Option<i64>) -> Option<LockPayload> {
    match (amount, duration) {
        // a zero amount commits nothing; treat as no lock
        (Some(amount), Some(duration)) if amount > 0 => Some(LockPayload {
            amount,
            duration,
            unlock_height: block_height.map(|h| h + duration),
        }),
        _ => None,
    }
}

struct OptionCandidate {
    vout: u32,
    index: i64,
    text: String,
    lock: Option<LockPayload>,
}

pub fn assemble(ctx: &RawTxContext, mut outputs: Vec<DecodedOutput>) -> AssemblyOutcome {
    let mut skipped = Vec::new();
    if outputs.is_empty() {
        return AssemblyOutcome { parsed: None, skipped };
    }
    outputs.sort_by_key(|o| o.vout);

    // The root is the lowest-vout content/vote_question output that does not
    // reference a parent. Later parentless roots in the same transaction are
    // conflicts, not enrichment.
    let root_pos = outputs.iter().position(|o| {
        o.parent_sequence.is_none() && matches!(o.kind, RecordKind::Content | RecordKind::VoteQuestion)
    });

    let mut meta = PostMeta::default();
    let mut kind = TxKind::Enrichment;
    let mut root_seq = None;
    let mut root_vout = None;

    if let Some(pos) = root_pos {
        let root = outputs.remove(pos);
        root_seq = Some(root.sequence);
        root_vout = Some(root.vout);
        meta.post_id = root.post_id.clone();
        meta.lock = lock_payload(root.lock_amount, root.lock_duration, ctx.block_height);
        match root.payload {
            RecordPayload::Content { content } => {
                meta.content = Some(content);
                kind = TxKind::Post;
            }
            RecordPayload::VoteQuestion { question } => {
                meta.vote = Some(VotePayload { question, options: Vec::new() });
                kind = TxKind::VoteQuestion;
            }
            _ => unreachable!("root position only matches content/vote_question"),
        }
    }

    let mut option_candidates: Vec<OptionCandidate> = Vec::new();
    let mut option_locks: Vec<(u32, i64, LockPayload)> = Vec::new();

    for output in outputs {
        if meta.post_id.is_none() {
            meta.post_id = output.post_id.clone();
        }
        let attached = match output.parent_sequence {
            // children may omit parent_seq when they share a transaction with
            // their root
            None => root_seq.is_some(),
            Some(parent) => root_seq == Some(parent),
        };
        if !attached {
            let lock = lock_payload(output.lock_amount, output.lock_duration, ctx.block_height);
            meta.pending.push(PendingChild {
                vout: output.vout,
                post_id: output.post_id.clone(),
                parent_sequence: output.parent_sequence,
                payload: output.payload,
                lock,
            });
            continue;
        }
        match output.payload {
            // a post may combine free text and a vote question across two
            // outputs; a second output of the kind already seen is a conflict
            RecordPayload::Content { content } => {
                if meta.content.is_none() {
                    meta.content = Some(content);
                } else {
                    skipped.push(SkippedOutput {
                        vout: output.vout,
                        error: AssemblyError::DuplicateRoot {
                            kept_vout: root_vout.expect("attached implies a root"),
                            vout: output.vout,
                        },
                    });
                }
            }
            RecordPayload::VoteQuestion { question } => {
                if meta.vote.is_none() {
                    meta.vote = Some(VotePayload { question, options: Vec::new() });
                } else {
                    skipped.push(SkippedOutput {
                        vout: output.vout,
                        error: AssemblyError::DuplicateRoot {
                            kept_vout: root_vout.expect("attached implies a root"),
                            vout: output.vout,
                        },
                    });
                }
            }
            RecordPayload::Image { media } => {
                meta.image.get_or_insert(media);
            }
            RecordPayload::Tags { tags } => {
                for tag in tags {
                    if !meta.tags.contains(&tag) {
                        meta.tags.push(tag);
                    }
                }
            }
            RecordPayload::VoteOptionText { text, option_index } => {
                let lock = lock_payload(output.lock_amount, output.lock_duration, ctx.block_height);
                option_candidates.push(OptionCandidate { vout: output.vout, index: option_index, text, lock });
            }
            RecordPayload::VoteOptionsPacked { options } => {
                for opt in options {
                    let lock = lock_payload(opt.lock_amount, opt.lock_duration, ctx.block_height);
                    option_candidates.push(OptionCandidate {
                        vout: output.vout,
                        index: opt.option_index,
                        text: opt.text,
                        lock,
                    });
                }
            }
            RecordPayload::VoteOptionLock { option_index, lock_amount, lock_duration } => {
                if let Some(lock) = lock_payload(Some(lock_amount), Some(lock_duration), ctx.block_height) {
                    option_locks.push((output.vout, option_index, lock));
                }
            }
        }
    }

    // Options order strictly by their index field, not by arrival order. On
    // a duplicate index the lowest-vout output wins and the later one is
    // rejected, whatever permutation the outputs arrived in.
    option_candidates.sort_by(|a, b| (a.index, a.vout).cmp(&(b.index, b.vout)));
    let mut options: Vec<VoteOption> = Vec::new();
    let mut winner_vouts: Vec<u32> = Vec::new();
    for candidate in option_candidates {
        match (options.last(), winner_vouts.last()) {
            (Some(last), Some(kept_vout)) if last.index == candidate.index => {
                skipped.push(SkippedOutput {
                    vout: candidate.vout,
                    error: AssemblyError::DuplicateOptionIndex {
                        index: candidate.index,
                        kept_vout: *kept_vout,
                        vout: candidate.vout,
                    },
                });
            }
            _ => {
                options.push(VoteOption { text: candidate.text, index: candidate.index, lock: candidate.lock });
                winner_vouts.push(candidate.vout);
            }
        }
    }

    // Dedicated lock outputs override the option's inline lock fields;
    // options lock independently from the question.
    for (vout, index, lock) in option_locks {
        match options.iter_mut().find(|o| o.index == index) {
            Some(option) => option.lock = Some(lock),
            // the option itself may live in an earlier transaction
            None => meta.pending.push(PendingChild {
                vout,
                post_id: meta.post_id.clone(),
                parent_sequence: root_seq,
                payload: RecordPayload::VoteOptionLock {
                    option_index: index,
                    lock_amount: lock.amount,
                    lock_duration: lock.duration,
                },
                lock: Some(lock),
            }),
        }
    }

    if !options.is_empty() {
        match meta.vote.as_mut() {
            Some(vote) => vote.options = options,
            // options attached to a plain content root wait for the question
            // to arrive through a later transaction
            None => {
                for (option, vout) in options.into_iter().zip(winner_vouts) {
                    meta.pending.push(PendingChild {
                        vout,
                        post_id: meta.post_id.clone(),
                        parent_sequence: root_seq,
                        payload: RecordPayload::VoteOptionText { text: option.text.clone(), option_index: option.index },
                        lock: option.lock,
                    });
                }
            }
        }
    }

    if root_seq.is_none() && meta.pending.is_empty() {
        return AssemblyOutcome { parsed: None, skipped };
    }

    AssemblyOutcome {
        parsed: Some(ParsedTransaction {
            txid: ctx.txid.clone(),
            kind,
            sender_address: ctx.sender_address.clone(),
            block_height: ctx.block_height,
            block_time: ctx.block_time,
            meta,
        }),
        skipped,
    }
}

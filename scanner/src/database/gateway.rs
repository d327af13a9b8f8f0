//! Persistence gateway
//!
//! The write contract is idempotent-by-txid upserts: replaying a transaction
//! yields the same stored state as applying it once, and a confirmation
//! replay (same txid, now with a block height) fills in unlock heights.
//! Batches run inside one SQL transaction, so a batch is applied fully or
//! not at all.
//!
//! Enrichment children whose post has not been created yet are kept in
//! `pending_outputs`, and replayed the moment the matching root arrives.

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::warn;

use protocol_core::{
    LockPayload, ParsedTransaction, PendingChild, PostMeta, RecordPayload, TxKind, VoteOption,
};

use crate::models::{option_target_id, ChainBlock, Lock, Post};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Write/read contract between the scanner and durable storage.
///
/// Constructed explicitly and injected into the orchestrator, so tests can
/// substitute an in-memory fake.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Idempotent single-record upsert.
    async fn process_transaction(&self, tx: &ParsedTransaction) -> Result<(), PersistError>;

    /// Atomic-or-nothing batch upsert; partial failure rolls back the whole
    /// batch.
    async fn process_transaction_batch(&self, txs: &[ParsedTransaction]) -> Result<(), PersistError>;

    /// Records scanned block headers.
    async fn record_blocks(&self, blocks: &[ChainBlock]) -> Result<(), PersistError>;

    async fn get_transaction(&self, txid: &str) -> Result<Option<ParsedTransaction>, PersistError>;

    async fn get_post(&self, post_id: &str, include_vote_options: bool) -> Result<Option<Post>, PersistError>;

    async fn get_locks_for_target(&self, target_id: &str) -> Result<Vec<Lock>, PersistError>;

    /// Highest recorded block height, 0 before the first block.
    async fn get_current_block_height(&self) -> Result<i64, PersistError>;
}

pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn apply_parsed(txn: &mut Transaction<'_, Sqlite>, tx: &ParsedTransaction) -> Result<(), PersistError> {
        let meta_json = serde_json::to_string(&tx.meta)?;
        sqlx::query(
            r#"
            INSERT INTO transactions (txid, kind, post_id, sender_address, block_height, block_time, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (txid) DO UPDATE SET
                block_height = excluded.block_height,
                block_time = excluded.block_time,
                meta = excluded.meta
            "#,
        )
        .bind(&tx.txid)
        .bind(tx.kind.as_wire())
        .bind(&tx.meta.post_id)
        .bind(&tx.sender_address)
        .bind(tx.block_height)
        .bind(tx.block_time)
        .bind(&meta_json)
        .execute(&mut **txn)
        .await?;

        match tx.kind {
            TxKind::Post | TxKind::VoteQuestion => Self::apply_root(txn, tx).await?,
            TxKind::Enrichment => {}
        }

        for child in &tx.meta.pending {
            Self::apply_or_defer_child(txn, tx, child).await?;
        }

        Ok(())
    }

    async fn apply_root(txn: &mut Transaction<'_, Sqlite>, tx: &ParsedTransaction) -> Result<(), PersistError> {
        let meta = &tx.meta;
        // A root without an explicit correlation id correlates with itself.
        let post_id = meta.post_id.clone().unwrap_or_else(|| tx.txid.clone());

        sqlx::query(
            r#"
            INSERT INTO posts (txid, post_id, content, author_address, block_height, block_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (txid) DO UPDATE SET
                content = excluded.content,
                block_height = excluded.block_height,
                block_time = excluded.block_time
            ON CONFLICT (post_id) DO NOTHING
            "#,
        )
        .bind(&tx.txid)
        .bind(&post_id)
        .bind(&meta.content)
        .bind(&tx.sender_address)
        .bind(tx.block_height)
        .bind(tx.block_time)
        .execute(&mut **txn)
        .await?;

        for tag in &meta.tags {
            Self::upsert_tag(txn, &post_id, tag).await?;
        }

        if let Some(media) = &meta.image {
            Self::upsert_media(txn, &post_id, &media.mime_type, &media.bytes).await?;
        }

        if let Some(vote) = &meta.vote {
            sqlx::query(
                r#"
                INSERT INTO vote_questions (post_id, question)
                VALUES ($1, $2)
                ON CONFLICT (post_id) DO UPDATE SET question = excluded.question
                "#,
            )
            .bind(&post_id)
            .bind(&vote.question)
            .execute(&mut **txn)
            .await?;

            for option in &vote.options {
                Self::upsert_option(txn, &post_id, &tx.txid, tx.sender_address.as_deref(), option).await?;
            }
        }

        if let Some(lock) = &meta.lock {
            Self::upsert_lock(txn, &tx.txid, &post_id, tx.sender_address.as_deref(), lock).await?;
        }

        Self::replay_pending(txn, &post_id).await?;
        Ok(())
    }

    /// Applies one enrichment child when its post already exists, otherwise
    /// parks it in `pending_outputs` for the root to pick up later.
    async fn apply_or_defer_child(
        txn: &mut Transaction<'_, Sqlite>,
        tx: &ParsedTransaction,
        child: &PendingChild,
    ) -> Result<(), PersistError> {
        let post_id = child.post_id.clone().or_else(|| tx.meta.post_id.clone());
        let exists = match &post_id {
            Some(id) => sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE post_id = $1")
                .bind(id)
                .fetch_one(&mut **txn)
                .await?
                > 0,
            None => false,
        };

        if exists {
            let post_id = post_id.expect("exists implies a post id");
            Self::apply_child(txn, &post_id, &tx.txid, tx.sender_address.as_deref(), child).await
        } else {
            // No correlation id means the child can never be applied; it is
            // still recorded so nothing disappears silently.
            if post_id.is_none() {
                warn!(txid = %tx.txid, vout = child.vout, "enrichment child without post_id can never be applied");
            }
            sqlx::query(
                r#"
                INSERT INTO pending_outputs (txid, vout, post_id, sender_address, parent_sequence, payload, lock)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (txid, vout) DO NOTHING
                "#,
            )
            .bind(&tx.txid)
            .bind(child.vout as i64)
            .bind(&post_id)
            .bind(&tx.sender_address)
            .bind(child.parent_sequence)
            .bind(serde_json::to_string(&child.payload)?)
            .bind(child.lock.as_ref().map(serde_json::to_string).transpose()?)
            .execute(&mut **txn)
            .await?;
            Ok(())
        }
    }

    /// Replays parked children once their root post exists.
    async fn replay_pending(txn: &mut Transaction<'_, Sqlite>, post_id: &str) -> Result<(), PersistError> {
        let rows: Vec<(String, i64, Option<String>, String, Option<String>)> = sqlx::query_as(
            "SELECT txid, vout, sender_address, payload, lock FROM pending_outputs WHERE post_id = $1 ORDER BY txid, vout",
        )
        .bind(post_id)
        .fetch_all(&mut **txn)
        .await?;

        for (source_txid, vout, sender, payload_json, lock_json) in rows {
            let child = PendingChild {
                vout: vout as u32,
                post_id: Some(post_id.to_string()),
                parent_sequence: None,
                payload: serde_json::from_str(&payload_json)?,
                lock: lock_json.as_deref().map(serde_json::from_str).transpose()?,
            };
            Self::apply_child(txn, post_id, &source_txid, sender.as_deref(), &child).await?;
        }

        sqlx::query("DELETE FROM pending_outputs WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut **txn)
            .await?;
        Ok(())
    }

    async fn apply_child(
        txn: &mut Transaction<'_, Sqlite>,
        post_id: &str,
        source_txid: &str,
        author: Option<&str>,
        child: &PendingChild,
    ) -> Result<(), PersistError> {
        match &child.payload {
            RecordPayload::Content { content } => {
                sqlx::query("UPDATE posts SET content = COALESCE(content, $1) WHERE post_id = $2")
                    .bind(content)
                    .bind(post_id)
                    .execute(&mut **txn)
                    .await?;
            }
            RecordPayload::Image { media } => {
                Self::upsert_media(txn, post_id, &media.mime_type, &media.bytes).await?;
            }
            RecordPayload::Tags { tags } => {
                for tag in tags {
                    Self::upsert_tag(txn, post_id, tag).await?;
                }
            }
            RecordPayload::VoteQuestion { question } => {
                sqlx::query(
                    "INSERT INTO vote_questions (post_id, question) VALUES ($1, $2) ON CONFLICT (post_id) DO NOTHING",
                )
                .bind(post_id)
                .bind(question)
                .execute(&mut **txn)
                .await?;
            }
            RecordPayload::VoteOptionText { text, option_index } => {
                let option = VoteOption { text: text.clone(), index: *option_index, lock: child.lock.clone() };
                Self::upsert_option(txn, post_id, source_txid, author, &option).await?;
            }
            RecordPayload::VoteOptionLock { option_index, .. } => {
                if let Some(lock) = &child.lock {
                    sqlx::query(
                        r#"
                        UPDATE vote_options
                        SET lock_amount = $1, lock_duration = $2, unlock_height = $3
                        WHERE post_id = $4 AND option_index = $5
                        "#,
                    )
                    .bind(lock.amount)
                    .bind(lock.duration)
                    .bind(lock.unlock_height)
                    .bind(post_id)
                    .bind(option_index)
                    .execute(&mut **txn)
                    .await?;
                    let target = option_target_id(post_id, *option_index);
                    Self::upsert_lock(txn, source_txid, &target, author, lock).await?;
                }
            }
            RecordPayload::VoteOptionsPacked { options } => {
                for opt in options {
                    let lock = opt.lock_amount.zip(opt.lock_duration).and_then(|(amount, duration)| {
                        (amount > 0).then_some(LockPayload { amount, duration, unlock_height: None })
                    });
                    let option = VoteOption { text: opt.text.clone(), index: opt.option_index, lock };
                    Self::upsert_option(txn, post_id, source_txid, author, &option).await?;
                }
            }
        }
        Ok(())
    }

    async fn upsert_tag(txn: &mut Transaction<'_, Sqlite>, post_id: &str, tag: &str) -> Result<(), PersistError> {
        sqlx::query("INSERT INTO post_tags (post_id, tag) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(post_id)
            .bind(tag)
            .execute(&mut **txn)
            .await?;
        Ok(())
    }

    async fn upsert_media(
        txn: &mut Transaction<'_, Sqlite>,
        post_id: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<(), PersistError> {
        sqlx::query(
            "INSERT INTO post_media (post_id, mime_type, bytes) VALUES ($1, $2, $3) ON CONFLICT (post_id) DO NOTHING",
        )
        .bind(post_id)
        .bind(mime_type)
        .bind(bytes)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    /// First writer of an option index wins; a replay of the same source
    /// transaction may still update it (confirmation fills unlock heights).
    async fn upsert_option(
        txn: &mut Transaction<'_, Sqlite>,
        post_id: &str,
        source_txid: &str,
        author: Option<&str>,
        option: &VoteOption,
    ) -> Result<(), PersistError> {
        let result = sqlx::query(
            r#"
            INSERT INTO vote_options (post_id, option_index, txid, text, lock_amount, lock_duration, unlock_height)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (post_id, option_index) DO UPDATE SET
                text = excluded.text,
                lock_amount = excluded.lock_amount,
                lock_duration = excluded.lock_duration,
                unlock_height = excluded.unlock_height
            WHERE vote_options.txid = excluded.txid
            "#,
        )
        .bind(post_id)
        .bind(option.index)
        .bind(source_txid)
        .bind(&option.text)
        .bind(option.lock.as_ref().map(|l| l.amount))
        .bind(option.lock.as_ref().map(|l| l.duration))
        .bind(option.lock.as_ref().and_then(|l| l.unlock_height))
        .execute(&mut **txn)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                post_id,
                option_index = option.index,
                txid = source_txid,
                "vote option index already taken by an earlier transaction, rejecting"
            );
            return Ok(());
        }

        if let Some(lock) = &option.lock {
            let target = option_target_id(post_id, option.index);
            Self::upsert_lock(txn, source_txid, &target, author, lock).await?;
        }
        Ok(())
    }

    async fn upsert_lock(
        txn: &mut Transaction<'_, Sqlite>,
        txid: &str,
        target_id: &str,
        author: Option<&str>,
        lock: &LockPayload,
    ) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            INSERT INTO locks (txid, target_id, author_address, amount, duration, unlock_height)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (txid, target_id) DO UPDATE SET unlock_height = excluded.unlock_height
            "#,
        )
        .bind(txid)
        .bind(target_id)
        .bind(author)
        .bind(lock.amount)
        .bind(lock.duration)
        .bind(lock.unlock_height)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    txid: String,
    post_id: String,
    content: Option<String>,
    author_address: Option<String>,
    block_height: Option<i64>,
    block_time: Option<i64>,
    media_mime: Option<String>,
}

#[derive(sqlx::FromRow)]
struct VoteOptionRow {
    option_index: i64,
    text: String,
    lock_amount: Option<i64>,
    lock_duration: Option<i64>,
    unlock_height: Option<i64>,
}

impl VoteOptionRow {
    fn into_option(self) -> VoteOption {
        let lock = self.lock_amount.zip(self.lock_duration).map(|(amount, duration)| LockPayload {
            amount,
            duration,
            unlock_height: self.unlock_height,
        });
        VoteOption { text: self.text, index: self.option_index, lock }
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn process_transaction(&self, tx: &ParsedTransaction) -> Result<(), PersistError> {
        let mut txn = self.pool.begin().await?;
        Self::apply_parsed(&mut txn, tx).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn process_transaction_batch(&self, txs: &[ParsedTransaction]) -> Result<(), PersistError> {
        let mut txn = self.pool.begin().await?;
        for tx in txs {
            Self::apply_parsed(&mut txn, tx).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn record_blocks(&self, blocks: &[ChainBlock]) -> Result<(), PersistError> {
        let mut txn = self.pool.begin().await?;
        for block in blocks {
            sqlx::query(
                r#"
                INSERT INTO blocks (height, hash, timestamp) VALUES ($1, $2, $3)
                ON CONFLICT (height) DO UPDATE SET hash = excluded.hash, timestamp = excluded.timestamp
                "#,
            )
            .bind(block.height)
            .bind(&block.hash)
            .bind(block.time)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<ParsedTransaction>, PersistError> {
        let row: Option<(String, String, Option<String>, Option<i64>, Option<i64>, String)> = sqlx::query_as(
            "SELECT txid, kind, sender_address, block_height, block_time, meta FROM transactions WHERE txid = $1",
        )
        .bind(txid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((txid, kind_raw, sender_address, block_height, block_time, meta_json)) => {
                let kind = TxKind::from_wire(&kind_raw)
                    .ok_or_else(|| PersistError::InvalidRecord(format!("unknown transaction kind `{kind_raw}`")))?;
                let meta: PostMeta = serde_json::from_str(&meta_json)?;
                Ok(Some(ParsedTransaction { txid, kind, sender_address, block_height, block_time, meta }))
            }
        }
    }

    async fn get_post(&self, post_id: &str, include_vote_options: bool) -> Result<Option<Post>, PersistError> {
        let row: Option<PostRow> = sqlx::query_as(
            r#"
            SELECT
                p.txid,
                p.post_id,
                p.content,
                p.author_address,
                p.block_height,
                p.block_time,
                m.mime_type AS media_mime
            FROM posts p
            LEFT JOIN post_media m ON m.post_id = p.post_id
            WHERE p.post_id = $1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let tags: Vec<String> = sqlx::query_scalar("SELECT tag FROM post_tags WHERE post_id = $1 ORDER BY tag")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await?;

        let question: Option<String> = sqlx::query_scalar("SELECT question FROM vote_questions WHERE post_id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;

        let options = if include_vote_options {
            let rows: Vec<VoteOptionRow> = sqlx::query_as(
                r#"
                SELECT option_index, text, lock_amount, lock_duration, unlock_height
                FROM vote_options
                WHERE post_id = $1
                ORDER BY option_index
                "#,
            )
            .bind(post_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(VoteOptionRow::into_option).collect()
        } else {
            Vec::new()
        };

        // the author's own lock, not locks added by other users
        let lock: Option<Lock> = sqlx::query_as(
            r#"
            SELECT txid, target_id, author_address, amount, duration, unlock_height
            FROM locks
            WHERE txid = $1 AND target_id = $2
            "#,
        )
        .bind(&row.txid)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(Some(Post {
            txid: row.txid,
            post_id: row.post_id,
            content: row.content,
            author_address: row.author_address,
            block_height: row.block_height,
            block_time: row.block_time,
            tags,
            media_mime: row.media_mime,
            question,
            options,
            lock,
        }))
    }

    async fn get_locks_for_target(&self, target_id: &str) -> Result<Vec<Lock>, PersistError> {
        let locks: Vec<Lock> = sqlx::query_as(
            r#"
            SELECT txid, target_id, author_address, amount, duration, unlock_height
            FROM locks
            WHERE target_id = $1
            ORDER BY txid
            "#,
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(locks)
    }

    async fn get_current_block_height(&self) -> Result<i64, PersistError> {
        let height: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(height), 0) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(height)
    }
}

//! Persisted scan checkpoint
//!
//! A single row holding the last block height whose transactions were fully
//! and durably processed. The orchestrator is the only writer; it advances
//! the cursor strictly after a batch commit succeeds, so a crash at any
//! point restarts from the last committed height.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{Result, ScannerError};

pub struct ScanCursor {
    pool: SqlitePool,
    genesis_height: i64,
}

impl ScanCursor {
    pub fn new(pool: SqlitePool, genesis_height: i64) -> Self {
        Self { pool, genesis_height }
    }

    async fn stored(&self) -> Result<Option<i64>> {
        let row: Option<i64> = sqlx::query_scalar("SELECT block_height FROM scan_checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(height) if height < 0 => Err(ScannerError::CorruptCheckpoint(format!(
                "stored height {height} is negative"
            ))),
            other => Ok(other),
        }
    }

    /// Last fully committed height, defaulting to the configured genesis
    /// height before the first commit.
    pub async fn current(&self) -> Result<i64> {
        Ok(self.stored().await?.unwrap_or(self.genesis_height))
    }

    /// First height the next cycle should fetch.
    pub async fn next_height(&self) -> Result<i64> {
        Ok(match self.stored().await? {
            Some(height) => height + 1,
            None => self.genesis_height,
        })
    }

    /// Moves the checkpoint forward. Going backwards indicates a logic bug
    /// upstream and is fatal, never retried.
    pub async fn advance(&self, height: i64) -> Result<()> {
        if let Some(current) = self.stored().await? {
            if height < current {
                return Err(ScannerError::NonMonotonicAdvance { current, requested: height });
            }
        }
        sqlx::query(
            r#"
            INSERT INTO scan_checkpoint (id, block_height) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET block_height = excluded.block_height, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(height)
        .execute(&self.pool)
        .await?;
        debug!(height, "checkpoint advanced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tempfile::tempdir;

    async fn open(dir: &std::path::Path) -> Database {
        let db = Database::new(&dir.join("cursor.db")).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn defaults_to_genesis_until_first_advance() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        let cursor = ScanCursor::new(db.pool().clone(), 700_000);

        assert_eq!(cursor.current().await.unwrap(), 700_000);
        assert_eq!(cursor.next_height().await.unwrap(), 700_000);

        cursor.advance(700_004).await.unwrap();
        assert_eq!(cursor.current().await.unwrap(), 700_004);
        assert_eq!(cursor.next_height().await.unwrap(), 700_005);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path()).await;
            let cursor = ScanCursor::new(db.pool().clone(), 0);
            cursor.advance(42).await.unwrap();
        }
        let db = Database::new(&dir.path().join("cursor.db")).await.unwrap();
        let cursor = ScanCursor::new(db.pool().clone(), 0);
        assert_eq!(cursor.current().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn rejects_non_monotonic_advance_without_mutating() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        let cursor = ScanCursor::new(db.pool().clone(), 0);

        cursor.advance(10).await.unwrap();
        let err = cursor.advance(9).await.unwrap_err();
        assert!(matches!(err, ScannerError::NonMonotonicAdvance { current: 10, requested: 9 }));
        assert!(err.is_fatal());
        assert_eq!(cursor.current().await.unwrap(), 10);

        // re-advancing to the same height is a no-op, not an error
        cursor.advance(10).await.unwrap();
        assert_eq!(cursor.current().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn negative_stored_height_is_corrupt() {
        let dir = tempdir().unwrap();
        let db = open(dir.path()).await;
        sqlx::query("INSERT INTO scan_checkpoint (id, block_height) VALUES (1, -5)")
            .execute(db.pool())
            .await
            .unwrap();
        let cursor = ScanCursor::new(db.pool().clone(), 0);
        let err = cursor.current().await.unwrap_err();
        assert!(matches!(err, ScannerError::CorruptCheckpoint(_)));
        assert!(err.is_fatal());
    }
}

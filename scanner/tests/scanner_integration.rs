//! End-to-end scanner tests against a scripted chain provider and a real
//! SQLite store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

use lockpost_scanner::chain_client::{ChainProvider, FetchError};
use lockpost_scanner::config::Config;
use lockpost_scanner::database::{Database, PersistError, PersistenceGateway, SqliteGateway};
use lockpost_scanner::models::{ChainBlock, ChainBlockData, RawTransaction};
use lockpost_scanner::scanner::{CycleOutcome, ScanCursor, ScannerState, UnifiedScanner};
use protocol_core::script::ScriptBuilder;
use protocol_core::ParsedTransaction;

fn test_config(dir: &TempDir, batch_size: i64) -> Config {
    Config {
        database_path: dir.path().join("scanner.db"),
        provider_url: "http://localhost:0".into(),
        genesis_height: 100,
        batch_size,
        poll_interval: Duration::from_millis(5),
        fetch_max_retries: 2,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        cache_capacity: 1_000,
        cache_ttl: Duration::from_secs(60),
    }
}

struct FakeProvider {
    blocks: Vec<ChainBlockData>,
    tip: i64,
}

#[async_trait]
impl ChainProvider for FakeProvider {
    async fn tip_height(&self) -> Result<i64, FetchError> {
        Ok(self.tip)
    }

    async fn blocks_in_range(&self, from: i64, to: i64) -> Result<Vec<ChainBlockData>, FetchError> {
        if from > self.tip {
            return Err(FetchError::NotYetAvailable);
        }
        Ok(self
            .blocks
            .iter()
            .filter(|b| b.header.height >= from && b.header.height <= to)
            .cloned()
            .collect())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, FetchError> {
        self.blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.txid == txid)
            .cloned()
            .ok_or(FetchError::NotYetAvailable)
    }
}

/// Gateway wrapper that fails the first batch, for retry-path tests.
struct FlakyGateway {
    inner: SqliteGateway,
    fail_next: AtomicBool,
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn process_transaction(&self, tx: &ParsedTransaction) -> Result<(), PersistError> {
        self.inner.process_transaction(tx).await
    }

    async fn process_transaction_batch(&self, txs: &[ParsedTransaction]) -> Result<(), PersistError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PersistError::InvalidRecord("injected batch failure".into()));
        }
        self.inner.process_transaction_batch(txs).await
    }

    async fn record_blocks(&self, blocks: &[ChainBlock]) -> Result<(), PersistError> {
        self.inner.record_blocks(blocks).await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<ParsedTransaction>, PersistError> {
        self.inner.get_transaction(txid).await
    }

    async fn get_post(
        &self,
        post_id: &str,
        include_vote_options: bool,
    ) -> Result<Option<lockpost_scanner::models::Post>, PersistError> {
        self.inner.get_post(post_id, include_vote_options).await
    }

    async fn get_locks_for_target(&self, target_id: &str) -> Result<Vec<lockpost_scanner::models::Lock>, PersistError> {
        self.inner.get_locks_for_target(target_id).await
    }

    async fn get_current_block_height(&self) -> Result<i64, PersistError> {
        self.inner.get_current_block_height().await
    }
}

fn content_script(post_id: &str, content: &str) -> Vec<u8> {
    let mut b = ScriptBuilder::data_carrier();
    b.field("type", b"content")
        .field("post_id", post_id.as_bytes())
        .field("seq", b"0")
        .field("content", content.as_bytes());
    b.into_script()
}

fn question_script(post_id: &str, question: &str) -> Vec<u8> {
    let mut b = ScriptBuilder::data_carrier();
    b.field("type", b"vote_question")
        .field("post_id", post_id.as_bytes())
        .field("seq", b"0")
        .field("question", question.as_bytes());
    b.into_script()
}

fn option_script(post_id: &str, text: &str, index: i64) -> Vec<u8> {
    let mut b = ScriptBuilder::data_carrier();
    b.field("type", b"vote_option_text")
        .field("post_id", post_id.as_bytes())
        .field("parent_seq", b"0")
        .field("text", text.as_bytes())
        .field("option_index", index.to_string().as_bytes());
    b.into_script()
}

/// A P2PKH-looking script no decoder should touch.
fn foreign_script() -> Vec<u8> {
    vec![0x76, 0xa9, 0x14, 0x00, 0x11, 0x22]
}

fn tx(txid: &str, height: i64, scripts: Vec<Vec<u8>>) -> RawTransaction {
    RawTransaction {
        txid: txid.to_string(),
        sender_address: Some("1ScannerTest".into()),
        output_scripts: scripts,
        block_height: Some(height),
        block_time: Some(1_700_000_000 + height),
    }
}

fn block(height: i64, transactions: Vec<RawTransaction>) -> ChainBlockData {
    ChainBlockData {
        header: ChainBlock { height, hash: format!("hash{height}"), time: 1_700_000_000 + height },
        transactions,
    }
}

async fn open_database(config: &Config) -> Database {
    let db = Database::new(&config.database_path).await.unwrap();
    db.migrate().await.unwrap();
    db
}

#[tokio::test]
async fn scans_decodes_and_commits_batches() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 10);
    let db = open_database(&config).await;
    let gateway = Arc::new(SqliteGateway::new(db.pool().clone()));

    let provider = Arc::new(FakeProvider {
        blocks: vec![
            block(100, vec![
                tx("a1", 100, vec![content_script("p1", "hello"), foreign_script()]),
                tx("f1", 100, vec![foreign_script()]),
            ]),
            block(101, vec![tx("a2", 101, vec![
                question_script("p2", "favourite height?"),
                option_script("p2", "even", 0),
                option_script("p2", "odd", 1),
            ])]),
        ],
        tip: 101,
    });

    let cursor = ScanCursor::new(db.pool().clone(), config.genesis_height);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scanner = UnifiedScanner::new(&config, provider, gateway.clone(), cursor, shutdown_rx);

    let outcome = scanner.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Committed { from: 100, to: 101, txs_seen: 3, txs_ours: 2 });

    let post = gateway.get_post("p1", false).await.unwrap().unwrap();
    assert_eq!(post.content.as_deref(), Some("hello"));

    let vote = gateway.get_post("p2", true).await.unwrap().unwrap();
    assert_eq!(vote.question.as_deref(), Some("favourite height?"));
    assert_eq!(vote.options.len(), 2);
    assert_eq!(vote.options[0].text, "even");

    assert_eq!(gateway.get_current_block_height().await.unwrap(), 101);

    // tip unchanged: nothing more to do
    assert_eq!(scanner.run_cycle().await.unwrap(), CycleOutcome::NoNewData);
}

#[tokio::test]
async fn vote_options_arriving_in_a_later_block() {
    let dir = tempdir().unwrap();
    // batch size 1 forces the question and its options into separate cycles
    let config = test_config(&dir, 1);
    let db = open_database(&config).await;
    let gateway = Arc::new(SqliteGateway::new(db.pool().clone()));

    let provider = Arc::new(FakeProvider {
        blocks: vec![
            block(100, vec![tx("a1", 100, vec![question_script("p2", "q?")])]),
            block(101, vec![tx("b1", 101, vec![
                option_script("p2", "yes", 0),
                option_script("p2", "no", 1),
            ])]),
        ],
        tip: 101,
    });

    let cursor = ScanCursor::new(db.pool().clone(), config.genesis_height);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scanner = UnifiedScanner::new(&config, provider, gateway.clone(), cursor, shutdown_rx);

    assert!(matches!(scanner.run_cycle().await.unwrap(), CycleOutcome::Committed { from: 100, to: 100, .. }));
    assert!(matches!(scanner.run_cycle().await.unwrap(), CycleOutcome::Committed { from: 101, to: 101, .. }));

    let post = gateway.get_post("p2", true).await.unwrap().unwrap();
    assert_eq!(post.question.as_deref(), Some("q?"));
    assert_eq!(post.options.len(), 2);
    assert_eq!(post.options[0].text, "yes");
    assert_eq!(post.options[1].text, "no");
}

#[tokio::test]
async fn malformed_output_does_not_sink_the_transaction() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 10);
    let db = open_database(&config).await;
    let gateway = Arc::new(SqliteGateway::new(db.pool().clone()));

    // protocol carrier that declares an 8-byte push but truncates
    let malformed = vec![0x00, 0x6a, 0x08, b'l', b'o', b'c'];
    let provider = Arc::new(FakeProvider {
        blocks: vec![block(100, vec![tx("a1", 100, vec![malformed, content_script("p1", "survives")])])],
        tip: 100,
    });

    let cursor = ScanCursor::new(db.pool().clone(), config.genesis_height);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scanner = UnifiedScanner::new(&config, provider, gateway.clone(), cursor, shutdown_rx);

    assert!(matches!(scanner.run_cycle().await.unwrap(), CycleOutcome::Committed { txs_ours: 1, .. }));
    let post = gateway.get_post("p1", false).await.unwrap().unwrap();
    assert_eq!(post.content.as_deref(), Some("survives"));
}

#[tokio::test]
async fn persist_failure_retries_the_same_range() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 10);
    let db = open_database(&config).await;
    let gateway = Arc::new(FlakyGateway {
        inner: SqliteGateway::new(db.pool().clone()),
        fail_next: AtomicBool::new(true),
    });

    let provider = Arc::new(FakeProvider {
        blocks: vec![block(100, vec![tx("a1", 100, vec![content_script("p1", "hello")])])],
        tip: 100,
    });

    let cursor = ScanCursor::new(db.pool().clone(), config.genesis_height);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scanner = UnifiedScanner::new(&config, provider, gateway.clone(), cursor, shutdown_rx);

    let err = scanner.run_cycle().await.unwrap_err();
    assert!(!err.is_fatal());

    // checkpoint did not move: the retry covers the same range
    let outcome = scanner.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Committed { from: 100, to: 100, .. }));
    assert!(gateway.get_post("p1", false).await.unwrap().is_some());
}

#[tokio::test]
async fn shutdown_signal_stops_the_loop() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 10);
    let db = open_database(&config).await;
    let gateway = Arc::new(SqliteGateway::new(db.pool().clone()));
    let provider = Arc::new(FakeProvider { blocks: vec![], tip: 99 });

    let cursor = ScanCursor::new(db.pool().clone(), config.genesis_height);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scanner = UnifiedScanner::new(&config, provider, gateway, cursor, shutdown_rx);

    shutdown_tx.send(true).unwrap();
    scanner.run().await.unwrap();
    assert_eq!(scanner.status().state, ScannerState::Stopped);
}

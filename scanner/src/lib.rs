//! Lockpost chain scanner
//!
//! This crate runs the scanning daemon: it reads new chain transactions from
//! the upstream provider, decodes the ones carrying the lockpost protocol
//! via `protocol_core`, and persists posts, votes and locks idempotently
//! behind the persistence gateway.

pub mod cache;
pub mod chain_client;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod scanner;

pub use error::{ScannerError, Result};

// Type alias for database pool
pub type DbPool = sqlx::SqlitePool;

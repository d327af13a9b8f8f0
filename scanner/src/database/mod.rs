//! Persistence layer: connection management and the gateway

pub mod connection;
pub mod gateway;

pub use connection::Database;
pub use gateway::{PersistError, PersistenceGateway, SqliteGateway};

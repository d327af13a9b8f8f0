//! Scanning loop: checkpoint cursor and the orchestrating service

pub mod cursor;
pub mod service;

pub use cursor::ScanCursor;
pub use service::{CycleOutcome, ScannerState, ScannerStatus, UnifiedScanner};

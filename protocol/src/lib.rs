//! Lockpost on-chain protocol
//!
//! This crate implements the pure decode layer of the lockpost scanner:
//! turning a single output script into a typed record, and grouping the
//! records of one transaction into a parsed post/vote/enrichment tree.
//! No I/O happens here.

pub mod assemble;
pub mod envelope;
pub mod error;
pub mod script;
pub mod types;

pub use assemble::{assemble, AssemblyOutcome, RawTxContext, SkippedOutput};
pub use error::{AssemblyError, DecodeError};
pub use script::decode_output;
pub use types::*;

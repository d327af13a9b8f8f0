//! Decode and assembly error types
//!
//! Both error kinds are local by design: a `DecodeError` skips one output,
//! an `AssemblyError` rejects one record, and the rest of the transaction
//! keeps assembling. Every variant carries the output index so the caller
//! can log exactly what was dropped.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("output {vout}: truncated push, declared {declared} bytes but only {remaining} remain")]
    TruncatedPush { vout: u32, declared: usize, remaining: usize },

    #[error("output {vout}: unexpected opcode 0x{opcode:02x} inside data carrier")]
    UnexpectedOpcode { vout: u32, opcode: u8 },

    #[error("output {vout}: field key is not valid UTF-8")]
    NonUtf8Key { vout: u32 },

    #[error("output {vout}: value of `{key}` is not valid UTF-8")]
    NonUtf8Value { vout: u32, key: String },

    #[error("output {vout}: key `{key}` has no value push")]
    DanglingKey { vout: u32, key: String },

    #[error("output {vout}: unknown record type `{value}`")]
    UnknownRecordType { vout: u32, value: String },

    #[error("output {vout}: missing required field `{key}`")]
    MissingField { vout: u32, key: &'static str },

    #[error("output {vout}: field `{key}`: {reason}")]
    InvalidNumber { vout: u32, key: String, reason: String },

    #[error("output {vout}: media envelope: {reason}")]
    BadEnvelope { vout: u32, reason: String },

    #[error("output {vout}: malformed JSON in `{key}`: {reason}")]
    BadJson { vout: u32, key: String, reason: String },
}

impl DecodeError {
    /// Index of the output the error was raised for.
    pub fn vout(&self) -> u32 {
        match self {
            DecodeError::TruncatedPush { vout, .. }
            | DecodeError::UnexpectedOpcode { vout, .. }
            | DecodeError::NonUtf8Key { vout }
            | DecodeError::NonUtf8Value { vout, .. }
            | DecodeError::DanglingKey { vout, .. }
            | DecodeError::UnknownRecordType { vout, .. }
            | DecodeError::MissingField { vout, .. }
            | DecodeError::InvalidNumber { vout, .. }
            | DecodeError::BadEnvelope { vout, .. }
            | DecodeError::BadJson { vout, .. } => *vout,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("vote option index {index} already taken by output {kept_vout}, rejecting output {vout}")]
    DuplicateOptionIndex { index: i64, kept_vout: u32, vout: u32 },

    #[error("root record already taken by output {kept_vout}, rejecting output {vout}")]
    DuplicateRoot { kept_vout: u32, vout: u32 },
}

//! Output script decoding
//!
//! A lockpost output is an unspendable data carrier:
//!
//! ```text
//! OP_FALSE OP_RETURN <"lockpost"> <key> <value> <key> <value> ...
//! ```
//!
//! The decoder walks the script one opcode at a time with [`ScriptCursor`]
//! and returns structured errors on malformed length prefixes. A script
//! without the protocol marker is simply not ours (`Ok(None)`), never an
//! error.

use std::collections::HashMap;

use crate::envelope;
use crate::error::DecodeError;
use crate::types::{DecodedOutput, PackedOption, RecordKind, RecordPayload};

pub const OP_FALSE: u8 = 0x00;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// First data push of every lockpost output.
pub const PROTOCOL_MARKER: &[u8] = b"lockpost";

/// Walks script bytes opcode by opcode.
pub struct ScriptCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    vout: u32,
}

impl<'a> ScriptCursor<'a> {
    pub fn new(bytes: &'a [u8], vout: u32) -> Self {
        Self { bytes, pos: 0, vout }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(DecodeError::TruncatedPush { vout: self.vout, declared: n, remaining });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_le(&mut self, width: usize) -> Result<usize, DecodeError> {
        let bytes = self.take(width)?;
        let mut len = 0usize;
        for (i, b) in bytes.iter().enumerate() {
            len |= (*b as usize) << (8 * i);
        }
        Ok(len)
    }

    /// Consumes the leading `OP_FALSE OP_RETURN` (or bare `OP_RETURN`)
    /// prefix. Returns false without consuming anything if the script is not
    /// a data carrier.
    pub fn strip_data_carrier_prefix(&mut self) -> bool {
        match (self.bytes.first(), self.bytes.get(1)) {
            (Some(&OP_FALSE), Some(&OP_RETURN)) => {
                self.pos = 2;
                true
            }
            (Some(&OP_RETURN), _) => {
                self.pos = 1;
                true
            }
            _ => false,
        }
    }

    /// Reads the next data push. `Ok(None)` at end of script.
    pub fn read_push(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let opcode = match self.take_byte() {
            Some(b) => b,
            None => return Ok(None),
        };
        let data = match opcode {
            OP_FALSE => Vec::new(),
            len @ 0x01..=0x4b => self.take(len as usize)?.to_vec(),
            OP_PUSHDATA1 => {
                let len = self.take_le(1)?;
                self.take(len)?.to_vec()
            }
            OP_PUSHDATA2 => {
                let len = self.take_le(2)?;
                self.take(len)?.to_vec()
            }
            OP_PUSHDATA4 => {
                let len = self.take_le(4)?;
                self.take(len)?.to_vec()
            }
            n @ OP_1..=OP_16 => vec![n - OP_1 + 1],
            other => return Err(DecodeError::UnexpectedOpcode { vout: self.vout, opcode: other }),
        };
        Ok(Some(data))
    }
}

/// Raw fields of one output, after push parsing but before interpretation.
struct FieldMap {
    vout: u32,
    fields: HashMap<String, Vec<u8>>,
    /// Shadowed duplicates and keys the decoder does not know about.
    unknown: Vec<(String, String)>,
}

impl FieldMap {
    fn take_raw(&mut self, key: &str) -> Option<Vec<u8>> {
        self.fields.remove(key)
    }

    fn take_string(&mut self, key: &str) -> Result<Option<String>, DecodeError> {
        match self.take_raw(key) {
            None => Ok(None),
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| DecodeError::NonUtf8Value { vout: self.vout, key: key.to_string() }),
        }
    }

    fn require_string(&mut self, key: &'static str) -> Result<String, DecodeError> {
        self.take_string(key)?
            .ok_or(DecodeError::MissingField { vout: self.vout, key })
    }

    fn take_number(&mut self, key: &str) -> Result<Option<i64>, DecodeError> {
        match self.take_string(key)? {
            None => Ok(None),
            Some(text) => parse_decimal(&text)
                .map(Some)
                .map_err(|reason| DecodeError::InvalidNumber {
                    vout: self.vout,
                    key: key.to_string(),
                    reason,
                }),
        }
    }

    fn require_number(&mut self, key: &'static str) -> Result<i64, DecodeError> {
        self.take_number(key)?
            .ok_or(DecodeError::MissingField { vout: self.vout, key })
    }

    fn take_json<T: serde::de::DeserializeOwned>(&mut self, key: &'static str) -> Result<Option<T>, DecodeError> {
        match self.take_string(key)? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| DecodeError::BadJson {
                vout: self.vout,
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Everything not consumed goes to the forward-compatibility bag.
    fn into_unknown_fields(mut self) -> Vec<(String, String)> {
        let mut rest: Vec<(String, Vec<u8>)> = self.fields.into_iter().collect();
        rest.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in rest {
            self.unknown.push((key, stringify(&value)));
        }
        self.unknown
    }
}

/// Numeric protocol fields are decimal ASCII, non-negative, and must fit in
/// a 63-bit signed integer. Anything else is a decode error, never clamped.
fn parse_decimal(text: &str) -> Result<i64, String> {
    if text.is_empty() {
        return Err("empty number".into());
    }
    if text.starts_with('-') || text.starts_with('+') {
        return Err("negative or signed values are invalid".into());
    }
    let mut value: i64 = 0;
    for c in text.chars() {
        let digit = c.to_digit(10).ok_or_else(|| format!("non-digit character `{c}`"))? as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| "exceeds 63-bit signed range".to_string())?;
    }
    Ok(value)
}

fn stringify(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", hex::encode(value)),
    }
}

/// Decodes a single output script.
///
/// Returns `Ok(None)` for scripts that do not carry the protocol marker.
/// Malformed protocol scripts yield a typed [`DecodeError`] so the caller
/// can skip just this output.
pub fn decode_output(script: &[u8], vout: u32) -> Result<Option<DecodedOutput>, DecodeError> {
    let mut cursor = ScriptCursor::new(script, vout);
    if !cursor.strip_data_carrier_prefix() {
        return Ok(None);
    }
    let marker = match cursor.read_push()? {
        Some(push) => push,
        None => return Ok(None),
    };
    if marker != PROTOCOL_MARKER {
        return Ok(None);
    }

    let mut map = FieldMap { vout, fields: HashMap::new(), unknown: Vec::new() };
    while let Some(key_bytes) = cursor.read_push()? {
        let key = String::from_utf8(key_bytes).map_err(|_| DecodeError::NonUtf8Key { vout })?;
        let value = cursor
            .read_push()?
            .ok_or_else(|| DecodeError::DanglingKey { vout, key: key.clone() })?;
        // Duplicate keys: last one wins, the shadowed value is preserved.
        if let Some(old) = map.fields.insert(key.clone(), value) {
            map.unknown.push((key, stringify(&old)));
        }
    }

    let type_raw = map.require_string("type")?;
    let kind = RecordKind::from_wire(&type_raw)
        .ok_or(DecodeError::UnknownRecordType { vout, value: type_raw })?;

    let post_id = map.take_string("post_id")?;
    let sequence = map.take_number("seq")?.unwrap_or(0);
    let parent_sequence = map.take_number("parent_seq")?;
    let lock_amount = map.take_number("lock_amount")?;
    let lock_duration = map.take_number("lock_duration")?;

    let payload = match kind {
        RecordKind::Content => RecordPayload::Content { content: map.require_string("content")? },
        RecordKind::Image => {
            let raw = map
                .take_raw("data")
                .ok_or(DecodeError::MissingField { vout, key: "data" })?;
            RecordPayload::Image { media: envelope::decode(&raw, vout)? }
        }
        RecordKind::Tags => {
            let tags: Vec<String> = map
                .take_json("tags")?
                .ok_or(DecodeError::MissingField { vout, key: "tags" })?;
            RecordPayload::Tags { tags }
        }
        RecordKind::VoteQuestion => RecordPayload::VoteQuestion { question: map.require_string("question")? },
        RecordKind::VoteOptionText => RecordPayload::VoteOptionText {
            text: map.require_string("text")?,
            option_index: map.require_number("option_index")?,
        },
        RecordKind::VoteOptionLock => RecordPayload::VoteOptionLock {
            option_index: map.require_number("option_index")?,
            lock_amount: lock_amount.ok_or(DecodeError::MissingField { vout, key: "lock_amount" })?,
            lock_duration: lock_duration.ok_or(DecodeError::MissingField { vout, key: "lock_duration" })?,
        },
        RecordKind::VoteOptionsPacked => {
            let options: Vec<PackedOption> = map
                .take_json("options")?
                .ok_or(DecodeError::MissingField { vout, key: "options" })?;
            for opt in &options {
                for (key, value) in [
                    ("optionIndex", Some(opt.option_index)),
                    ("lockAmount", opt.lock_amount),
                    ("lockDuration", opt.lock_duration),
                ] {
                    if let Some(v) = value {
                        if v < 0 {
                            return Err(DecodeError::InvalidNumber {
                                vout,
                                key: key.to_string(),
                                reason: "negative values are invalid".into(),
                            });
                        }
                    }
                }
            }
            RecordPayload::VoteOptionsPacked { options }
        }
    };

    Ok(Some(DecodedOutput {
        vout,
        kind,
        post_id,
        sequence,
        parent_sequence,
        lock_amount,
        lock_duration,
        payload,
        unknown_fields: map.into_unknown_fields(),
    }))
}

/// Builds protocol output scripts, primarily for transaction construction
/// and round-trip tests.
pub struct ScriptBuilder {
    bytes: Vec<u8>,
}

impl ScriptBuilder {
    /// Starts an `OP_FALSE OP_RETURN` carrier with the protocol marker.
    pub fn data_carrier() -> Self {
        let mut builder = Self { bytes: vec![OP_FALSE, OP_RETURN] };
        builder.push(PROTOCOL_MARKER);
        builder
    }

    pub fn push(&mut self, data: &[u8]) -> &mut Self {
        match data.len() {
            0 => self.bytes.push(OP_FALSE),
            len @ 1..=0x4b => {
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 0x4c..=0xff => {
                self.bytes.push(OP_PUSHDATA1);
                self.bytes.push(len as u8);
                self.bytes.extend_from_slice(data);
            }
            len @ 0x100..=0xffff => {
                self.bytes.push(OP_PUSHDATA2);
                self.bytes.extend_from_slice(&(len as u16).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
            len => {
                self.bytes.push(OP_PUSHDATA4);
                self.bytes.extend_from_slice(&(len as u32).to_le_bytes());
                self.bytes.extend_from_slice(data);
            }
        }
        self
    }

    pub fn field(&mut self, key: &str, value: &[u8]) -> &mut Self {
        self.push(key.as_bytes());
        self.push(value);
        self
    }

    pub fn into_script(self) -> Vec<u8> {
        self.bytes
    }
}

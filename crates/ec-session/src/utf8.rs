//! Incremental UTF-8 assembly of detokenized byte fragments.
//!
//! A token's piece may end in the middle of a multi-byte codepoint, so the
//! bytes are held back until they form complete text.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Result of scanning a byte buffer by leading-byte pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Status {
    /// Only whole sequences (including the empty buffer).
    Complete,
    /// Well-formed so far, but the last sequence is cut short.
    Incomplete,
    /// A leading byte with no valid pattern, or a bad continuation byte.
    Invalid,
}

/// Expected sequence length for a leading byte, or `None` if the byte cannot
/// start a sequence.
fn sequence_len(lead: u8) -> Option<usize> {
    if lead & 0x80 == 0x00 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

/// Classify `bytes` by scanning leading-byte patterns left to right.
///
/// Only the bit patterns are checked; overlong forms and surrogates pass.
pub fn utf8_status(bytes: &[u8]) -> Utf8Status {
    let mut i = 0;
    while i < bytes.len() {
        let Some(len) = sequence_len(bytes[i]) else {
            return Utf8Status::Invalid;
        };
        for k in 1..len {
            match bytes.get(i + k) {
                None => return Utf8Status::Incomplete,
                Some(b) if b & 0xC0 != 0x80 => return Utf8Status::Invalid,
                Some(_) => {}
            }
        }
        i += len;
    }
    Utf8Status::Complete
}

/// True if `bytes` consists solely of whole sequences. Invalid and
/// incomplete input both yield false.
pub fn is_complete_utf8(bytes: &[u8]) -> bool {
    utf8_status(bytes) == Utf8Status::Complete
}

/// What the assembler does once its pending bytes can never become valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidUtf8Policy {
    /// Keep buffering, as if the bytes were incomplete.
    Buffer,
    /// Emit the pending bytes with U+FFFD for bad sequences and start over.
    #[default]
    Replace,
}

#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
    policy: InvalidUtf8Policy,
}

impl Utf8Assembler {
    pub fn new(policy: InvalidUtf8Policy) -> Self {
        Self {
            pending: Vec::new(),
            policy,
        }
    }

    /// Append `fragment`. Returns the accumulated text once it is complete,
    /// `None` while still waiting for more bytes.
    pub fn push(&mut self, fragment: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(fragment);
        match utf8_status(&self.pending) {
            Utf8Status::Complete => Some(self.take()),
            Utf8Status::Incomplete => None,
            Utf8Status::Invalid => match self.policy {
                InvalidUtf8Policy::Buffer => None,
                InvalidUtf8Policy::Replace => {
                    warn!(bytes = ?self.pending, "invalid UTF-8 in token stream; replacing");
                    Some(self.take())
                }
            },
        }
    }

    fn take(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        match String::from_utf8(bytes) {
            Ok(s) => s,
            // Pattern-valid but not strictly valid (overlong, surrogate).
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    /// Bytes waiting for the rest of their codepoint.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn policy(&self) -> InvalidUtf8Policy {
        self.policy
    }
}

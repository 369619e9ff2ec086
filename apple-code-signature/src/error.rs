// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types.

use thiserror::Error;

/// Unified error type for code signature data structure handling.
#[derive(Debug, Error)]
pub enum CodeSignatureError {
    #[error("(de)serialization error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed blob: {0}")]
    MalformedBlob(&'static str),

    #[error("bad magic when parsing {0}")]
    BadMagic(&'static str),

    #[error("superblob index entry {0:#x} references data outside the superblob")]
    TruncatedSuperBlob(u32),

    #[error("slot {0} is out of range")]
    SlotOutOfRange(i64),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("digest length mismatch: expected {expected} bytes, got {got}")]
    DigestLengthMismatch { expected: usize, got: usize },

    #[error("unsupported code directory version: {0:#x}")]
    InvalidVersion(u32),

    #[error("invalid page size exponent: {0}")]
    InvalidPageSize(u8),

    #[error("content is shorter than the configured code limit")]
    ContentTooShort,

    #[error("pre-encrypt digest count disagrees with code slot count")]
    PreEncryptSlotMismatch,
}

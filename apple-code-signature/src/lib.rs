// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apple code signature data structures.
//!
//! This crate builds and parses the binary data structures that attach
//! code identity metadata to executable images:
//!
//! * Generic magic-tagged, length-prefixed *blobs* and the indexed
//!   *SuperBlob* container ([embedded_signature]).
//! * The *code directory*, recording per-page digests of executable
//!   content and digests of auxiliary resources ([code_directory],
//!   [code_directory_builder]).
//! * *Requirements* and the type-keyed *requirement set*
//!   ([requirement]). Requirement expressions are carried as opaque
//!   bytes; this crate does not compile or evaluate them.
//!
//! All multi-byte integers are big-endian on the wire. Structures
//! round-trip: parsing serialized bytes and serializing again yields
//! identical bytes.
//!
//! This crate does not verify signatures, perform any cryptographic
//! signing, or parse Mach-O binaries. Callers supply raw byte ranges
//! and receive serialized signature structures.

pub mod code_directory;
pub mod code_directory_builder;
pub mod digest;
pub mod embedded_signature;
pub mod embedded_signature_builder;
pub mod error;
pub mod requirement;

pub use {
    code_directory::{
        CodeDirectoryBlob, CodeDirectoryVersion, CodeSignatureFlags, ExecutableSegmentFlags,
        Scatter,
    },
    code_directory_builder::CodeDirectoryBuilder,
    digest::{Digest, DigestType},
    embedded_signature::{
        Blob, BlobData, BlobEntry, CodeSigningMagic, CodeSigningSlot, DetachedSignature,
        EmbeddedSignature, ParsedBlob,
    },
    embedded_signature_builder::SuperBlobBuilder,
    error::CodeSignatureError,
    requirement::{RequirementBlob, RequirementSetBlob, RequirementSetBuilder, RequirementType},
};

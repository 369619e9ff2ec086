// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure.
//!
//! The code directory records digests of the signed content: one digest
//! per page of executable code (*code slots*) plus digests of a fixed
//! set of auxiliary resources (*special slots*, addressed by negative
//! indices). The header is versioned; each version adds a trailing group
//! of optional fields.

use {
    crate::{
        digest::{Digest, DigestType},
        embedded_signature::{read_blob_header, Blob, CodeSigningMagic, CodeSigningSlot},
        error::CodeSignatureError,
    },
    bitflags::bitflags,
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::BTreeMap, io::Write},
};

bitflags! {
    /// Code signature flags.
    ///
    /// These are flags embedded in the code directory and govern use of
    /// the signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit when the code starts executing.
        const FORCE_HARD = 0x0100;
        /// Set the "kill" status bit when the code starts executing.
        const FORCE_KILL = 0x0200;
        /// Force certain process status bits when the code starts executing.
        const HARD = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply hardened runtime policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags! {
    /// Executable segment flags.
    ///
    /// These describe the executable segment of the signed binary.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Version of the code directory header format.
///
/// Each version extends the fixed header with a group of trailing
/// fields. Parsers gate field groups on the version; builders emit the
/// minimal version accommodating the populated fields.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20001,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecSegment = 0x20400,
    SupportsRuntime = 0x20500,
}

/// Versions at or above this value have no known header layout.
const VERSION_LIMIT: u32 = 0x2f000;

/// An entry of the scatter vector.
///
/// Describes a run of `count` pages starting at page `base` whose
/// content lives at `target_offset`. The vector is terminated on the
/// wire by an all-zero entry, which is not part of the logical vector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Scatter {
    /// Number of pages. Zero marks the sentinel entry.
    pub count: u32,
    /// First page number.
    pub base: u32,
    /// Byte offset in the target.
    pub target_offset: u64,
}

/// Byte length of the fixed header for a given version, from blob start.
fn fixed_header_size(version: u32) -> usize {
    if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
        96
    } else if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
        88
    } else if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
        64
    } else if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
        52
    } else if version >= CodeDirectoryVersion::SupportsScatter as u32 {
        48
    } else {
        44
    }
}

/// Read a NUL terminated UTF-8 string at an absolute offset.
fn read_nul_terminated_str<'a>(
    data: &'a [u8],
    offset: usize,
    what: &'static str,
) -> Result<&'a str, CodeSignatureError> {
    let data = data
        .get(offset..)
        .ok_or(CodeSignatureError::MalformedBlob(what))?;
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodeSignatureError::MalformedBlob(what))?;

    std::str::from_utf8(&data[0..nul]).map_err(|_| CodeSignatureError::MalformedBlob(what))
}

/// Read `count` digests of `digest_size` bytes at an absolute offset.
fn read_digests<'a>(
    data: &'a [u8],
    offset: usize,
    count: usize,
    digest_size: usize,
    what: &'static str,
) -> Result<Vec<Digest<'a>>, CodeSignatureError> {
    (0..count)
        .map(|i| {
            let start = offset + i * digest_size;
            data.get(start..start + digest_size)
                .map(Digest::from)
                .ok_or(CodeSignatureError::MalformedBlob(what))
        })
        .collect()
}

/// Represents a parsed or built code directory blob.
///
/// Offsets are not stored: they are recomputed from the canonical field
/// ordering whenever the blob is serialized. The canonical ordering is
/// fixed header, scatter vector, identifier, team identifier,
/// pre-encrypt digests, special slot digests, code slot digests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeDirectoryBlob<'a> {
    /// Header format version.
    pub version: u32,
    /// Setup and mode flags (CodeSignatureFlags bits).
    pub flags: u32,
    /// Count of special slots, including unset trailing ones.
    pub n_special_slots: u32,
    /// Limit to the main image signature range, in bytes.
    pub code_limit: u32,
    /// Size of each digest, in bytes.
    pub digest_size: u8,
    /// Type of digest.
    pub digest_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// The page size, log2(page size in bytes). 0 = infinite.
    pub page_size: u8,
    /// Unused, must be zero.
    pub spare2: u32,
    /// The scatter vector, without its sentinel entry.
    pub scatter: Option<Vec<Scatter>>,
    /// Unused, must be zero. Present from SupportsCodeLimit64.
    pub spare3: Option<u32>,
    /// Code limit if it does not fit the 32-bit field.
    pub code_limit_64: Option<u64>,
    /// Offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags (ExecutableSegmentFlags bits).
    pub exec_seg_flags: Option<u64>,
    /// Runtime version encoded as an unsigned integer.
    pub runtime: Option<u32>,
    /// Unique identifier of the signed entity.
    pub ident: Cow<'a, str>,
    /// Team identifier.
    pub team_name: Option<Cow<'a, str>>,
    /// Digests of code pages, by code slot index.
    pub code_digests: Vec<Digest<'a>>,
    /// Pre-encrypt digests of code pages, when present.
    ///
    /// When present, holds exactly as many digests as there are code
    /// slots.
    pub pre_encrypt_digests: Option<Vec<Digest<'a>>>,
    /// Set special slot digests, keyed by slot.
    ///
    /// Unset slots within `n_special_slots` are not stored; they read
    /// and serialize as all-zero digests.
    pub special_digests: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::CodeDirectory
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (magic, _, data) = read_blob_header(data)?;

        if magic != u32::from(CodeSigningMagic::CodeDirectory) {
            return Err(CodeSignatureError::BadMagic("code directory blob"));
        }

        let offset = &mut 8usize;

        let version: u32 = data.gread_with(offset, scroll::BE)?;
        if !(CodeDirectoryVersion::Initial as u32..VERSION_LIMIT).contains(&version) {
            return Err(CodeSignatureError::InvalidVersion(version));
        }

        let flags: u32 = data.gread_with(offset, scroll::BE)?;
        let hash_offset: u32 = data.gread_with(offset, scroll::BE)?;
        let ident_offset: u32 = data.gread_with(offset, scroll::BE)?;
        let n_special_slots: u32 = data.gread_with(offset, scroll::BE)?;
        let n_code_slots: u32 = data.gread_with(offset, scroll::BE)?;
        let code_limit: u32 = data.gread_with(offset, scroll::BE)?;
        let digest_size: u8 = data.gread_with(offset, scroll::BE)?;
        let digest_type: u8 = data.gread_with(offset, scroll::BE)?;
        let platform: u8 = data.gread_with(offset, scroll::BE)?;
        let page_size: u8 = data.gread_with(offset, scroll::BE)?;
        let spare2: u32 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?)
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?)
        } else {
            None
        };
        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with::<u32>(offset, scroll::BE)?),
                Some(data.gread_with::<u64>(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };
        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
                (
                    Some(data.gread_with::<u64>(offset, scroll::BE)?),
                    Some(data.gread_with::<u64>(offset, scroll::BE)?),
                    Some(data.gread_with::<u64>(offset, scroll::BE)?),
                )
            } else {
                (None, None, None)
            };
        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                (
                    Some(data.gread_with::<u32>(offset, scroll::BE)?),
                    Some(data.gread_with::<u32>(offset, scroll::BE)?),
                )
            } else {
                (None, None)
            };

        let digest_size_us = digest_size as usize;

        let scatter = match scatter_offset {
            Some(scatter_offset) if scatter_offset != 0 => {
                let offset = &mut (scatter_offset as usize);
                let mut entries = Vec::new();

                loop {
                    let count: u32 = data.gread_with(offset, scroll::BE)?;
                    let base: u32 = data.gread_with(offset, scroll::BE)?;
                    let target_offset: u64 = data.gread_with(offset, scroll::BE)?;
                    let _spare: u64 = data.gread_with(offset, scroll::BE)?;

                    if count == 0 {
                        break;
                    }

                    entries.push(Scatter {
                        count,
                        base,
                        target_offset,
                    });
                }

                Some(entries)
            }
            _ => None,
        };

        let ident = Cow::Borrowed(read_nul_terminated_str(
            data,
            ident_offset as usize,
            "code directory identifier",
        )?);

        let team_name = match team_offset {
            Some(team_offset) if team_offset != 0 => Some(Cow::Borrowed(read_nul_terminated_str(
                data,
                team_offset as usize,
                "code directory team identifier",
            )?)),
            _ => None,
        };

        let pre_encrypt_digests = match pre_encrypt_offset {
            Some(pre_encrypt_offset) if pre_encrypt_offset != 0 => Some(read_digests(
                data,
                pre_encrypt_offset as usize,
                n_code_slots as usize,
                digest_size_us,
                "code directory pre-encrypt digests",
            )?),
            _ => None,
        };

        // Special slot -k sits at hash_offset - k * digest_size. Unset
        // (all-zero) slots are not retained; n_special_slots preserves
        // the count.
        let mut special_digests = BTreeMap::new();
        for k in 1..=n_special_slots {
            let start = (hash_offset as usize)
                .checked_sub(k as usize * digest_size_us)
                .ok_or(CodeSignatureError::MalformedBlob(
                    "code directory special digests",
                ))?;
            let digest = data
                .get(start..start + digest_size_us)
                .map(Digest::from)
                .ok_or(CodeSignatureError::MalformedBlob(
                    "code directory special digests",
                ))?;

            if !digest.is_null() {
                special_digests.insert(CodeSigningSlot::from(k), digest);
            }
        }

        let code_digests = read_digests(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            digest_size_us,
            "code directory code digests",
        )?;

        Ok(Self {
            version,
            flags,
            n_special_slots,
            code_limit,
            digest_size,
            digest_type: DigestType::from(digest_type),
            platform,
            page_size,
            spare2,
            scatter,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            ident,
            team_name,
            code_digests,
            pre_encrypt_digests,
            special_digests,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        let version = self.version;
        let digest_size = self.digest_size as usize;
        let n_code_slots = self.code_digests.len();

        if let Some(pre) = &self.pre_encrypt_digests {
            if pre.len() != n_code_slots {
                return Err(CodeSignatureError::PreEncryptSlotMismatch);
            }
        }

        // Offsets are absolute from the blob start; this payload is
        // prepended with the 8 byte blob header.
        let scatter_start = fixed_header_size(version);
        let scatter_len = self
            .scatter
            .as_ref()
            .map(|v| (v.len() + 1) * 24)
            .unwrap_or(0);
        let ident_offset = scatter_start + scatter_len;
        let team_offset = ident_offset + self.ident.len() + 1;
        let pre_encrypt_offset =
            team_offset + self.team_name.as_ref().map(|t| t.len() + 1).unwrap_or(0);
        let pre_encrypt_len = self
            .pre_encrypt_digests
            .as_ref()
            .map(|v| v.len() * digest_size)
            .unwrap_or(0);
        let hash_offset =
            pre_encrypt_offset + pre_encrypt_len + self.n_special_slots as usize * digest_size;

        let mut res = Vec::new();

        res.iowrite_with(version, scroll::BE)?;
        res.iowrite_with(self.flags, scroll::BE)?;
        res.iowrite_with(hash_offset as u32, scroll::BE)?;
        res.iowrite_with(ident_offset as u32, scroll::BE)?;
        res.iowrite_with(self.n_special_slots, scroll::BE)?;
        res.iowrite_with(n_code_slots as u32, scroll::BE)?;
        res.iowrite_with(self.code_limit, scroll::BE)?;
        res.iowrite_with(self.digest_size, scroll::BE)?;
        res.iowrite_with(u8::from(self.digest_type), scroll::BE)?;
        res.iowrite_with(self.platform, scroll::BE)?;
        res.iowrite_with(self.page_size, scroll::BE)?;
        res.iowrite_with(self.spare2, scroll::BE)?;

        if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            let value = if self.scatter.is_some() {
                scatter_start as u32
            } else {
                0
            };
            res.iowrite_with(value, scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            let value = if self.team_name.is_some() {
                team_offset as u32
            } else {
                0
            };
            res.iowrite_with(value, scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            res.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            res.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
            res.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            res.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            res.iowrite_with(self.exec_seg_flags.unwrap_or(0), scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
            res.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            let value = if self.pre_encrypt_digests.is_some() {
                pre_encrypt_offset as u32
            } else {
                0
            };
            res.iowrite_with(value, scroll::BE)?;
        }

        if let Some(scatter) = &self.scatter {
            for entry in scatter.iter().chain(std::iter::once(&Scatter::default())) {
                res.iowrite_with(entry.count, scroll::BE)?;
                res.iowrite_with(entry.base, scroll::BE)?;
                res.iowrite_with(entry.target_offset, scroll::BE)?;
                res.iowrite_with(0u64, scroll::BE)?;
            }
        }

        res.write_all(self.ident.as_bytes())?;
        res.iowrite(0u8)?;

        if let Some(team_name) = &self.team_name {
            res.write_all(team_name.as_bytes())?;
            res.iowrite(0u8)?;
        }

        if let Some(digests) = &self.pre_encrypt_digests {
            for digest in digests {
                self.check_digest(digest)?;
                res.write_all(&digest.data)?;
            }
        }

        // Special slots in descending index order: -n_special_slots
        // first. Unset slots serialize as all-zero digests.
        for k in (1..=self.n_special_slots).rev() {
            match self.special_digests.get(&CodeSigningSlot::from(k)) {
                Some(digest) => {
                    self.check_digest(digest)?;
                    res.write_all(&digest.data)?;
                }
                None => {
                    res.write_all(&vec![0u8; digest_size])?;
                }
            }
        }

        for digest in &self.code_digests {
            self.check_digest(digest)?;
            res.write_all(&digest.data)?;
        }

        Ok(res)
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Number of code slots.
    pub fn n_code_slots(&self) -> u32 {
        self.code_digests.len() as u32
    }

    /// Obtain the digest at a logical slot index.
    ///
    /// Negative indices address special slots; an unset special slot
    /// within `n_special_slots` reads as an all-zero digest.
    /// Non-negative indices address code slots; with `pre_encrypt` set,
    /// the pre-encrypt digest vector is read instead, yielding None
    /// when that vector is absent.
    ///
    /// Indices outside the configured slot counts fail with
    /// [CodeSignatureError::SlotOutOfRange].
    pub fn slot_digest(
        &self,
        slot: i64,
        pre_encrypt: bool,
    ) -> Result<Option<Digest<'_>>, CodeSignatureError> {
        if slot < 0 {
            let k = u32::try_from(slot.unsigned_abs())
                .map_err(|_| CodeSignatureError::SlotOutOfRange(slot))?;

            if k > self.n_special_slots {
                return Err(CodeSignatureError::SlotOutOfRange(slot));
            }

            Ok(Some(
                self.special_digests
                    .get(&CodeSigningSlot::from(k))
                    .cloned()
                    .unwrap_or_else(|| Digest::from(vec![0u8; self.digest_size as usize])),
            ))
        } else {
            let index =
                usize::try_from(slot).map_err(|_| CodeSignatureError::SlotOutOfRange(slot))?;

            if index >= self.code_digests.len() {
                return Err(CodeSignatureError::SlotOutOfRange(slot));
            }

            if pre_encrypt {
                Ok(self
                    .pre_encrypt_digests
                    .as_ref()
                    .and_then(|digests| digests.get(index).cloned()))
            } else {
                Ok(Some(self.code_digests[index].clone()))
            }
        }
    }

    /// The digest for a special slot, if set.
    pub fn special_digest(&self, slot: CodeSigningSlot) -> Option<&Digest<'a>> {
        self.special_digests.get(&slot)
    }

    fn check_digest(&self, digest: &Digest<'_>) -> Result<(), CodeSignatureError> {
        if digest.data.len() == self.digest_size as usize {
            Ok(())
        } else {
            Err(CodeSignatureError::DigestLengthMismatch {
                expected: self.digest_size as usize,
                got: digest.data.len(),
            })
        }
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            n_special_slots: self.n_special_slots,
            code_limit: self.code_limit,
            digest_size: self.digest_size,
            digest_type: self.digest_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter: self.scatter.clone(),
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_digests: self.code_digests.iter().map(|d| d.to_owned()).collect(),
            pre_encrypt_digests: self
                .pre_encrypt_digests
                .as_ref()
                .map(|digests| digests.iter().map(|d| d.to_owned()).collect()),
            special_digests: self
                .special_digests
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect(),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building code directory blobs.

use {
    crate::{
        code_directory::{
            CodeDirectoryBlob, CodeDirectoryVersion, CodeSignatureFlags, ExecutableSegmentFlags,
            Scatter,
        },
        digest::{Digest, DigestType},
        embedded_signature::CodeSigningSlot,
        error::CodeSignatureError,
    },
    log::warn,
    rayon::prelude::*,
    std::collections::BTreeMap,
};

/// Accumulates signing parameters and slot digests and emits an
/// immutable [CodeDirectoryBlob].
///
/// The builder tracks which optional fields have been populated and
/// computes the minimal header version accommodating them. A lower
/// explicit version passed to [CodeDirectoryBuilder::build] is
/// normalized up to that minimum.
///
/// Slot digests can be set directly or computed from executable content
/// via [CodeDirectoryBuilder::add_code_hashes].
#[derive(Clone, Debug)]
pub struct CodeDirectoryBuilder<'a> {
    digest_type: DigestType,
    digest_size: usize,
    flags: CodeSignatureFlags,
    exec_length: u64,
    page_size: u8,
    platform: u8,
    identifier: String,
    team_id: Option<String>,
    exec_seg_base: Option<u64>,
    exec_seg_limit: Option<u64>,
    exec_seg_flags: Option<ExecutableSegmentFlags>,
    runtime: Option<u32>,
    scatter: Option<Vec<Scatter>>,
    special_digests: BTreeMap<CodeSigningSlot, Digest<'a>>,
    code_digests: BTreeMap<usize, Digest<'a>>,
    pre_encrypt_digests: BTreeMap<usize, Digest<'a>>,
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// Create a builder using the given digest algorithm for all slots.
    ///
    /// Fails with [CodeSignatureError::DigestUnknownAlgorithm] if the
    /// algorithm has no known digest size.
    pub fn new(digest_type: DigestType) -> Result<Self, CodeSignatureError> {
        let digest_size = digest_type.hash_len()?;

        Ok(Self {
            digest_type,
            digest_size,
            flags: CodeSignatureFlags::empty(),
            exec_length: 0,
            page_size: 0,
            platform: 0,
            identifier: String::new(),
            team_id: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            scatter: None,
            special_digests: BTreeMap::new(),
            code_digests: BTreeMap::new(),
            pre_encrypt_digests: BTreeMap::new(),
        })
    }

    /// The digest algorithm in use.
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn set_flags(&mut self, flags: CodeSignatureFlags) {
        self.flags = flags;
    }

    /// Set the number of bytes of content covered by code slot digests.
    pub fn set_exec_length(&mut self, exec_length: u64) {
        self.exec_length = exec_length;
    }

    /// Set the page size as a log2 exponent. 0 means unpaged.
    pub fn set_page_size_exponent(&mut self, exponent: u8) -> Result<(), CodeSignatureError> {
        if exponent > 31 {
            return Err(CodeSignatureError::InvalidPageSize(exponent));
        }

        self.page_size = exponent;

        Ok(())
    }

    pub fn set_platform(&mut self, platform: u8) {
        self.platform = platform;
    }

    pub fn set_identifier(&mut self, identifier: impl ToString) {
        self.identifier = identifier.to_string();
    }

    pub fn set_team_id(&mut self, team_id: impl ToString) {
        self.team_id = Some(team_id.to_string());
    }

    /// Describe the executable segment of the signed binary.
    pub fn set_exec_segment(&mut self, base: u64, limit: u64, flags: ExecutableSegmentFlags) {
        self.exec_seg_base = Some(base);
        self.exec_seg_limit = Some(limit);
        self.exec_seg_flags = Some(flags);
    }

    /// Set the hardened runtime version.
    pub fn set_runtime_version(&mut self, version: u32) {
        self.runtime = Some(version);
    }

    /// Set the scatter vector, without its sentinel entry.
    pub fn set_scatter(&mut self, scatter: Vec<Scatter>) {
        self.scatter = Some(scatter);
    }

    /// Number of special slots the built directory will carry.
    ///
    /// This is the highest slot number set so far.
    pub fn n_special_slots(&self) -> u32 {
        self.special_digests
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0)
    }

    /// Number of code slots, derived from the content length and page size.
    pub fn n_code_slots(&self) -> usize {
        if self.exec_length == 0 {
            0
        } else if self.page_size == 0 {
            1
        } else {
            let page = 1u64 << self.page_size;
            ((self.exec_length + page - 1) / page) as usize
        }
    }

    /// Store the digest for a special slot, replacing any previous one.
    ///
    /// Only slots with a code directory counterpart (1 through 11) are
    /// accepted.
    pub fn set_special_slot(
        &mut self,
        slot: CodeSigningSlot,
        digest: impl Into<Digest<'a>>,
    ) -> Result<(), CodeSignatureError> {
        if !slot.has_code_directory_special_slot() {
            return Err(CodeSignatureError::SlotOutOfRange(i64::from(u32::from(
                slot,
            ))));
        }

        let digest = self.check_digest(digest)?;
        self.special_digests.insert(slot, digest);

        Ok(())
    }

    /// Store the digest for a code slot, replacing any previous one.
    pub fn set_code_slot(
        &mut self,
        index: usize,
        digest: impl Into<Digest<'a>>,
    ) -> Result<(), CodeSignatureError> {
        if index >= self.n_code_slots() {
            return Err(CodeSignatureError::SlotOutOfRange(index as i64));
        }

        let digest = self.check_digest(digest)?;
        self.code_digests.insert(index, digest);

        Ok(())
    }

    /// Store the pre-encrypt digest for a code slot.
    pub fn set_pre_encrypt_slot(
        &mut self,
        index: usize,
        digest: impl Into<Digest<'a>>,
    ) -> Result<(), CodeSignatureError> {
        if index >= self.n_code_slots() {
            return Err(CodeSignatureError::SlotOutOfRange(index as i64));
        }

        let digest = self.check_digest(digest)?;
        self.pre_encrypt_digests.insert(index, digest);

        Ok(())
    }

    /// Digest executable content into code slots.
    ///
    /// Content is digested in page sized chunks; the final chunk may be
    /// short. Chunk digests are independent, so they are computed in
    /// parallel and assigned to slots by chunk index.
    pub fn add_code_hashes(&mut self, content: &[u8]) -> Result<(), CodeSignatureError> {
        let limit = usize::try_from(self.exec_length)
            .map_err(|_| CodeSignatureError::ContentTooShort)?;
        let content = content
            .get(0..limit)
            .ok_or(CodeSignatureError::ContentTooShort)?;

        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![]
        } else if self.page_size == 0 {
            vec![content]
        } else {
            content.chunks(1usize << self.page_size).collect()
        };

        let digest_type = self.digest_type;
        let digests = chunks
            .into_par_iter()
            .map(move |chunk| digest_type.digest_data(chunk))
            .collect::<Result<Vec<_>, CodeSignatureError>>()?;

        for (index, digest) in digests.into_iter().enumerate() {
            self.code_digests.insert(index, Digest::from(digest));
        }

        Ok(())
    }

    /// The minimal header version accommodating the populated fields.
    pub fn version(&self) -> CodeDirectoryVersion {
        if self.runtime.is_some() || !self.pre_encrypt_digests.is_empty() {
            CodeDirectoryVersion::SupportsRuntime
        } else if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            CodeDirectoryVersion::SupportsExecSegment
        } else if self.exec_length > u32::MAX as u64 {
            CodeDirectoryVersion::SupportsCodeLimit64
        } else if self.team_id.is_some() {
            CodeDirectoryVersion::SupportsTeamId
        } else if self.scatter.is_some() {
            CodeDirectoryVersion::SupportsScatter
        } else {
            CodeDirectoryVersion::Initial
        }
    }

    /// Build the code directory.
    ///
    /// The emitted version is the maximum of `requested_version` and the
    /// computed minimum; a lower request is normalized upward with a
    /// logged warning.
    pub fn build(
        &self,
        requested_version: CodeDirectoryVersion,
    ) -> Result<CodeDirectoryBlob<'static>, CodeSignatureError> {
        let minimum = self.version();
        if requested_version < minimum {
            warn!(
                "requested code directory version {:#x} cannot represent all fields; \
                 using {:#x}",
                requested_version as u32, minimum as u32
            );
        }
        let version = minimum.max(requested_version) as u32;

        let n_code_slots = self.n_code_slots();

        let (code_limit, code_limit_64) = if self.exec_length > u32::MAX as u64 {
            (0, Some(self.exec_length))
        } else if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            (self.exec_length as u32, Some(0))
        } else {
            (self.exec_length as u32, None)
        };

        let null_digest = || Digest::from(vec![0u8; self.digest_size]);

        let code_digests = (0..n_code_slots)
            .map(|i| {
                self.code_digests
                    .get(&i)
                    .map(|d| d.to_owned())
                    .unwrap_or_else(null_digest)
            })
            .collect::<Vec<_>>();

        let pre_encrypt_digests = if self.pre_encrypt_digests.is_empty() {
            None
        } else {
            let digests = (0..n_code_slots)
                .map(|i| {
                    self.pre_encrypt_digests
                        .get(&i)
                        .map(|d| d.to_owned())
                        .ok_or(CodeSignatureError::PreEncryptSlotMismatch)
                })
                .collect::<Result<Vec<_>, _>>()?;

            Some(digests)
        };

        let mut cd = CodeDirectoryBlob {
            version,
            flags: self.flags.bits(),
            n_special_slots: self.n_special_slots(),
            code_limit,
            digest_size: self.digest_size as u8,
            digest_type: self.digest_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: 0,
            scatter: self.scatter.clone(),
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            ident: self.identifier.clone().into(),
            team_name: self.team_id.clone().map(|x| x.into()),
            code_digests,
            pre_encrypt_digests,
            special_digests: self
                .special_digests
                .iter()
                .map(|(slot, digest)| (*slot, digest.to_owned()))
                .collect(),
        };

        // Populate the field groups the final version serializes, so the
        // built instance compares equal to its own parse.
        if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            cd.spare3 = Some(0);
            cd.code_limit_64 = code_limit_64;
        }
        if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
            cd.exec_seg_base = Some(self.exec_seg_base.unwrap_or(0));
            cd.exec_seg_limit = Some(self.exec_seg_limit.unwrap_or(0));
            cd.exec_seg_flags = Some(self.exec_seg_flags.map(|f| f.bits()).unwrap_or(0));
        }
        if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
            cd.runtime = Some(self.runtime.unwrap_or(0));
        }

        Ok(cd)
    }

    fn check_digest(
        &self,
        digest: impl Into<Digest<'a>>,
    ) -> Result<Digest<'a>, CodeSignatureError> {
        let digest = digest.into();

        if digest.data.len() == self.digest_size {
            Ok(digest)
        } else {
            Err(CodeSignatureError::DigestLengthMismatch {
                expected: self.digest_size,
                got: digest.data.len(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::embedded_signature::Blob};

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunk_counts() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_page_size_exponent(12)?;

        builder.set_exec_length(4096 * 2);
        assert_eq!(builder.n_code_slots(), 2);

        builder.set_exec_length(4096 * 2 + 1);
        assert_eq!(builder.n_code_slots(), 3);

        builder.set_exec_length(1);
        assert_eq!(builder.n_code_slots(), 1);

        builder.set_exec_length(0);
        assert_eq!(builder.n_code_slots(), 0);

        // Unpaged: one chunk regardless of length.
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_exec_length(1 << 20);
        assert_eq!(builder.n_code_slots(), 1);

        Ok(())
    }

    #[test]
    fn code_hashes_chunking() -> Result<(), CodeSignatureError> {
        let data = content(4096 + 100);

        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_page_size_exponent(12)?;
        builder.set_exec_length(data.len() as u64);
        builder.add_code_hashes(&data)?;

        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.n_code_slots(), 2);
        assert_eq!(
            cd.code_digests[0].to_vec(),
            DigestType::Sha256.digest_data(&data[0..4096])?
        );
        // The final chunk covers exactly the trailing 100 bytes.
        assert_eq!(
            cd.code_digests[1].to_vec(),
            DigestType::Sha256.digest_data(&data[4096..])?
        );

        // Deterministic across runs.
        let mut builder2 = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder2.set_page_size_exponent(12)?;
        builder2.set_exec_length(data.len() as u64);
        builder2.add_code_hashes(&data)?;
        assert_eq!(builder2.build(CodeDirectoryVersion::Initial)?, cd);

        Ok(())
    }

    #[test]
    fn unpaged_single_chunk() -> Result<(), CodeSignatureError> {
        let data = content(10000);

        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_exec_length(data.len() as u64);
        builder.add_code_hashes(&data)?;

        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.n_code_slots(), 1);
        assert_eq!(
            cd.code_digests[0].to_vec(),
            DigestType::Sha256.digest_data(&data)?
        );

        Ok(())
    }

    #[test]
    fn content_shorter_than_exec_length() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_exec_length(100);

        assert!(matches!(
            builder.add_code_hashes(&[0u8; 50]),
            Err(CodeSignatureError::ContentTooShort)
        ));

        Ok(())
    }

    #[test]
    fn version_minimality() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        assert_eq!(builder.version(), CodeDirectoryVersion::Initial);

        builder.set_scatter(vec![]);
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsScatter);

        builder.set_team_id("ABCDEF1234");
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsTeamId);

        builder.set_exec_segment(0, 16384, ExecutableSegmentFlags::MAIN_BINARY);
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsExecSegment);

        builder.set_runtime_version(0x000d0100);
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsRuntime);

        Ok(())
    }

    #[test]
    fn large_code_limit_selects_64bit() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_exec_length(u32::MAX as u64 + 1);
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsCodeLimit64);

        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.code_limit, 0);
        assert_eq!(cd.code_limit_64, Some(u32::MAX as u64 + 1));

        Ok(())
    }

    #[test]
    fn requested_version_normalized_upward() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_identifier("com.example.test");
        builder.set_exec_segment(0, 4096, ExecutableSegmentFlags::MAIN_BINARY);

        // Requesting a version below the minimum yields the minimum.
        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsExecSegment as u32);

        // Requesting a higher version than required honors the request.
        let cd = builder.build(CodeDirectoryVersion::SupportsRuntime)?;
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsRuntime as u32);

        Ok(())
    }

    #[test]
    fn special_slot_eager_bounds() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;

        builder.set_special_slot(CodeSigningSlot::Info, vec![1u8; 32])?;
        builder.set_special_slot(CodeSigningSlot::LibraryConstraint, vec![2u8; 32])?;
        assert_eq!(builder.n_special_slots(), 11);

        assert!(matches!(
            builder.set_special_slot(CodeSigningSlot::Signature, vec![3u8; 32]),
            Err(CodeSignatureError::SlotOutOfRange(0x10000))
        ));
        assert!(matches!(
            builder.set_special_slot(CodeSigningSlot::CodeDirectory, vec![3u8; 32]),
            Err(CodeSignatureError::SlotOutOfRange(0))
        ));

        // Wrong digest length is rejected eagerly.
        assert!(matches!(
            builder.set_special_slot(CodeSigningSlot::Info, vec![1u8; 20]),
            Err(CodeSignatureError::DigestLengthMismatch { .. })
        ));

        Ok(())
    }

    #[test]
    fn code_slot_eager_bounds() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_page_size_exponent(12)?;
        builder.set_exec_length(4096 * 2);

        builder.set_code_slot(0, vec![1u8; 32])?;
        builder.set_code_slot(1, vec![2u8; 32])?;
        assert!(matches!(
            builder.set_code_slot(2, vec![3u8; 32]),
            Err(CodeSignatureError::SlotOutOfRange(2))
        ));

        Ok(())
    }

    #[test]
    fn unsupported_digest_rejected() {
        assert!(matches!(
            CodeDirectoryBuilder::new(DigestType::None),
            Err(CodeSignatureError::DigestUnknownAlgorithm)
        ));
    }

    #[test]
    fn built_directory_round_trips() -> Result<(), CodeSignatureError> {
        let data = content(4096 * 3 + 7);

        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_flags(CodeSignatureFlags::ADHOC | CodeSignatureFlags::RUNTIME);
        builder.set_identifier("com.example.test");
        builder.set_team_id("ABCDEF1234");
        builder.set_page_size_exponent(12)?;
        builder.set_exec_length(data.len() as u64);
        builder.set_exec_segment(0, 16384, ExecutableSegmentFlags::MAIN_BINARY);
        builder.add_code_hashes(&data)?;
        builder.set_special_slot(
            CodeSigningSlot::RequirementSet,
            DigestType::Sha256.digest_data(&[0u8; 12])?,
        )?;

        let cd = builder.build(CodeDirectoryVersion::SupportsExecSegment)?;
        assert_eq!(cd.n_code_slots(), 4);
        assert_eq!(cd.n_special_slots, 2);

        let bytes = cd.to_blob_bytes()?;
        let parsed =
            crate::code_directory::CodeDirectoryBlob::from_blob_bytes(&bytes)?;
        assert_eq!(parsed, cd);
        assert_eq!(parsed.to_blob_bytes()?, bytes);

        // Slot -1 was never set and reads as the null digest.
        assert!(parsed.slot_digest(-1, false)?.unwrap().is_null());

        Ok(())
    }

    #[test]
    fn default_empty_identifier_round_trips() -> Result<(), CodeSignatureError> {
        let data = content(4096);

        // Identifier never set: the built directory carries the empty
        // string, serialized as a lone NUL.
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_page_size_exponent(12)?;
        builder.set_exec_length(data.len() as u64);
        builder.add_code_hashes(&data)?;

        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.ident, "");

        let bytes = cd.to_blob_bytes()?;
        assert_eq!(bytes[44], 0);

        let parsed = crate::code_directory::CodeDirectoryBlob::from_blob_bytes(&bytes)?;
        assert_eq!(parsed, cd);
        assert_eq!(parsed.ident, "");
        assert_eq!(parsed.to_blob_bytes()?, bytes);

        Ok(())
    }

    #[test]
    fn pre_encrypt_slots() -> Result<(), CodeSignatureError> {
        let mut builder = CodeDirectoryBuilder::new(DigestType::Sha256)?;
        builder.set_page_size_exponent(12)?;
        builder.set_exec_length(4096 * 2);
        builder.set_code_slot(0, vec![1u8; 32])?;
        builder.set_code_slot(1, vec![2u8; 32])?;
        builder.set_pre_encrypt_slot(0, vec![3u8; 32])?;

        // Pre-encrypt digests raise the version and must cover every
        // code slot.
        assert_eq!(builder.version(), CodeDirectoryVersion::SupportsRuntime);
        assert!(matches!(
            builder.build(CodeDirectoryVersion::Initial),
            Err(CodeSignatureError::PreEncryptSlotMismatch)
        ));

        builder.set_pre_encrypt_slot(1, vec![4u8; 32])?;
        let cd = builder.build(CodeDirectoryVersion::Initial)?;
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsRuntime as u32);
        assert_eq!(cd.slot_digest(1, true)?.unwrap().to_vec(), vec![4u8; 32]);

        Ok(())
    }
}

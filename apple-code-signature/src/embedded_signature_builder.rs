// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building SuperBlob containers.

use {
    crate::{
        embedded_signature::{Blob, BlobData, CodeSigningMagic, CodeSigningSlot},
        error::CodeSignatureError,
    },
    scroll::IOwrite,
    std::{collections::BTreeMap, io::Write},
};

/// Builder for SuperBlob containers.
///
/// A SuperBlob holds heterogeneous blobs addressed by a slot. The
/// serialized form is the blob header, a count, a (slot, offset) index
/// table sorted ascending by slot, and the sub-blob bytes packed
/// contiguously in index order.
///
/// The same builder serves every SuperBlob variant; the magic selects
/// the variant. Embedded signatures key sub-blobs by signing slot,
/// detached signatures by architecture, DR lists by sequential index —
/// arbitrary keys are expressed as [CodeSigningSlot::Unknown].
#[derive(Debug)]
pub struct SuperBlobBuilder<'a> {
    magic: CodeSigningMagic,
    blobs: BTreeMap<CodeSigningSlot, BlobData<'a>>,
}

impl<'a> SuperBlobBuilder<'a> {
    pub fn new(magic: CodeSigningMagic) -> Self {
        Self {
            magic,
            blobs: BTreeMap::new(),
        }
    }

    /// A builder for an embedded signature SuperBlob.
    pub fn embedded_signature() -> Self {
        Self::new(CodeSigningMagic::EmbeddedSignature)
    }

    /// A builder for a detached signature SuperBlob.
    pub fn detached_signature() -> Self {
        Self::new(CodeSigningMagic::DetachedSignature)
    }

    /// A builder for a library dependency (DR list) SuperBlob.
    pub fn dr_list() -> Self {
        Self::new(CodeSigningMagic::DrList)
    }

    /// The magic of the SuperBlob being built.
    pub fn magic(&self) -> CodeSigningMagic {
        self.magic
    }

    /// Register the blob for a slot, replacing any previous one.
    pub fn add(&mut self, slot: CodeSigningSlot, blob: BlobData<'a>) {
        self.blobs.insert(slot, blob);
    }

    /// Whether a blob has been registered for the given slot.
    pub fn contains(&self, slot: CodeSigningSlot) -> bool {
        self.blobs.contains_key(&slot)
    }

    /// Get the blob registered for a slot, if any.
    pub fn get(&self, slot: CodeSigningSlot) -> Option<&BlobData<'a>> {
        self.blobs.get(&slot)
    }

    /// Number of registered blobs.
    pub fn count(&self) -> usize {
        self.blobs.len()
    }

    /// The exact byte length the SuperBlob serializes to.
    pub fn size(&self) -> Result<usize, CodeSignatureError> {
        let mut size = 12;

        for blob in self.blobs.values() {
            size += 8 + 8 + blob.serialize_payload()?.len();
        }

        Ok(size)
    }

    /// Serialize the SuperBlob.
    pub fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignatureError> {
        let blobs = self
            .blobs
            .iter()
            .map(|(slot, blob)| {
                let bytes = blob.to_blob_bytes()?;
                Ok((*slot, bytes))
            })
            .collect::<Result<Vec<_>, CodeSignatureError>>()?;

        let total_length = 12 + blobs.len() * 8 + blobs.iter().map(|(_, b)| b.len()).sum::<usize>();

        let mut res = Vec::with_capacity(total_length);
        res.iowrite_with(u32::from(self.magic), scroll::BE)?;
        res.iowrite_with(total_length as u32, scroll::BE)?;
        res.iowrite_with(blobs.len() as u32, scroll::BE)?;

        // Index entries first, then sub-blob data in the same order.
        let mut offset = 12 + blobs.len() * 8;
        for (slot, bytes) in &blobs {
            res.iowrite_with(u32::from(*slot), scroll::BE)?;
            res.iowrite_with(offset as u32, scroll::BE)?;
            offset += bytes.len();
        }

        for (_, bytes) in &blobs {
            res.write_all(bytes)?;
        }

        Ok(res)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            embedded_signature::{BlobWrapperBlob, EmbeddedSignature, EntitlementsBlob},
            requirement::RequirementSetBuilder,
        },
    };

    #[test]
    fn empty_superblob_exact_bytes() -> Result<(), CodeSignatureError> {
        let builder = SuperBlobBuilder::embedded_signature();
        assert_eq!(builder.size()?, 12);

        let bytes = builder.to_blob_bytes()?;
        assert_eq!(
            bytes,
            [0xfa, 0xde, 0x0c, 0xc0, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00]
        );

        let parsed = EmbeddedSignature::from_bytes(&bytes)?;
        assert_eq!(parsed.count, 0);

        Ok(())
    }

    #[test]
    fn sorted_packing_and_parse_back() -> Result<(), CodeSignatureError> {
        let mut builder = SuperBlobBuilder::embedded_signature();

        // Added out of slot order; the index is emitted sorted.
        builder.add(
            CodeSigningSlot::Signature,
            BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data(vec![1, 2, 3]))),
        );
        builder.add(
            CodeSigningSlot::RequirementSet,
            BlobData::RequirementSet(Box::new(RequirementSetBuilder::new().build())),
        );
        builder.add(
            CodeSigningSlot::Entitlements,
            BlobData::Entitlements(Box::new(EntitlementsBlob::from_string(&"<plist/>"))),
        );

        assert!(builder.contains(CodeSigningSlot::Signature));
        assert!(!builder.contains(CodeSigningSlot::Info));
        assert!(builder.get(CodeSigningSlot::RequirementSet).is_some());

        let bytes = builder.to_blob_bytes()?;
        assert_eq!(bytes.len(), builder.size()?);

        let parsed = EmbeddedSignature::from_bytes(&bytes)?;
        assert_eq!(parsed.count, 3);
        assert_eq!(
            parsed.blobs.iter().map(|e| e.slot).collect::<Vec<_>>(),
            vec![
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::Signature,
            ]
        );

        // Offsets increase strictly and pack contiguously after the index.
        let mut expected_offset = 12 + 3 * 8;
        for entry in &parsed.blobs {
            assert_eq!(entry.offset, expected_offset);
            expected_offset += entry.length;
        }
        assert_eq!(expected_offset, bytes.len());

        assert_eq!(parsed.signature_data()?, Some(&[1u8, 2, 3][..]));
        assert_eq!(parsed.code_requirements()?.unwrap().count(), 0);
        assert!(parsed.code_directory()?.is_none());

        Ok(())
    }

    #[test]
    fn add_replaces_existing_slot() -> Result<(), CodeSignatureError> {
        let mut builder = SuperBlobBuilder::embedded_signature();
        builder.add(
            CodeSigningSlot::Signature,
            BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data(vec![1]))),
        );
        builder.add(
            CodeSigningSlot::Signature,
            BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data(vec![2, 3]))),
        );

        assert_eq!(builder.count(), 1);

        let bytes = builder.to_blob_bytes()?;
        let parsed = EmbeddedSignature::from_bytes(&bytes)?;
        assert_eq!(parsed.signature_data()?, Some(&[2u8, 3][..]));

        Ok(())
    }

    #[test]
    fn detached_signature_keyed_by_architecture() -> Result<(), CodeSignatureError> {
        let embedded = SuperBlobBuilder::embedded_signature().to_blob_bytes()?;

        let mut builder = SuperBlobBuilder::detached_signature();
        builder.add(
            CodeSigningSlot::Unknown(0x0100000c),
            BlobData::from_blob_bytes(&embedded)?,
        );

        let bytes = builder.to_blob_bytes()?;
        let parsed = crate::embedded_signature::DetachedSignature::from_bytes(&bytes)?;
        assert_eq!(parsed.architectures(), vec![0x0100000c]);

        let arch_sig = parsed.architecture_signature(0x0100000c)?.unwrap();
        assert_eq!(arch_sig.count, 0);
        assert!(parsed.architecture_signature(0xffffffff)?.is_none());

        Ok(())
    }
}

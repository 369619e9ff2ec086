// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures.
//!
//! Code signatures are stored as tagged, length-prefixed binary units
//! called *blobs*. A blob begins with an 8 byte header holding a magic
//! (identifying the blob type) and the total blob length, both big-endian.
//! A *SuperBlob* is a blob whose payload is an index of other blobs:
//! after the header comes a count and `count` (type, offset) index entries,
//! sorted ascending by type, followed by the sub-blob data packed
//! contiguously in index order. Offsets are absolute from the start of the
//! SuperBlob.
//!
//! The SuperBlob holding a complete signature is the *embedded signature*.
//! Its index is keyed by [CodeSigningSlot] and typically references a
//! [crate::code_directory::CodeDirectoryBlob], a
//! [crate::requirement::RequirementSetBlob], entitlements blobs, and a
//! wrapped CMS signature.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        digest::DigestType,
        error::CodeSignatureError,
        requirement::{RequirementBlob, RequirementSetBlob},
    },
    log::debug,
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, cmp::Ordering, fmt::Display, io::Write},
};

/// Header magic for blobs, identifying the blob type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirement set blob.
    RequirementSet,
    /// Code directory blob.
    CodeDirectory,
    /// Embedded signature.
    ///
    /// This is the magic of the SuperBlob holding all other signature blobs.
    EmbeddedSignature,
    /// Old embedded signature.
    EmbeddedSignatureOld,
    /// Detached signature, holding embedded signatures for multiple binaries.
    DetachedSignature,
    /// Entitlements blob, holding an XML plist.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// DER encoded launch constraints blob.
    ConstraintsDer,
    /// Library dependency (designated requirement) records.
    DrList,
    /// Blob wrapper, holding a CMS signature.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0c05 => Self::DrList,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade8181 => Self::ConstraintsDer,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::DrList => 0xfade0c05,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::ConstraintsDer => 0xfade8181,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// Slot type within a SuperBlob index.
///
/// Values 1 through 11 double as the special slot numbers of a code
/// directory: the digest of the blob stored at slot N of the embedded
/// signature lands in special slot -N of the code directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodeSigningSlot {
    /// The code directory itself.
    CodeDirectory,
    /// Info.plist.
    Info,
    /// Internal requirements.
    RequirementSet,
    /// Resource directory (CodeResources manifest).
    ResourceDir,
    /// Application specific slot (top directory).
    Application,
    /// Embedded entitlements (XML plist).
    Entitlements,
    /// Representation specific (DMG or disk image contents).
    RepSpecific,
    /// Embedded entitlements (DER).
    EntitlementsDer,
    /// Launch constraints applied to the binary itself.
    LaunchConstraintSelf,
    /// Launch constraints applied to the parent process.
    LaunchConstraintParent,
    /// Launch constraints applied to the responsible process.
    LaunchConstraintResponsibleProcess,
    /// Constraints applied to loaded libraries.
    LibraryConstraint,
    /// First alternate code directory.
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    /// CMS signature.
    Signature,
    Identification,
    /// Notarization ticket.
    Ticket,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            8 => Self::LaunchConstraintSelf,
            9 => Self::LaunchConstraintParent,
            10 => Self::LaunchConstraintResponsibleProcess,
            11 => Self::LibraryConstraint,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::LaunchConstraintSelf => 8,
            CodeSigningSlot::LaunchConstraintParent => 9,
            CodeSigningSlot::LaunchConstraintResponsibleProcess => 10,
            CodeSigningSlot::LibraryConstraint => 11,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether digests of this slot's blob are stored in a code directory
    /// special slot.
    pub fn has_code_directory_special_slot(&self) -> bool {
        (1..=u32::from(Self::LibraryConstraint)).contains(&u32::from(*self))
    }
}

/// Read the blob header from given data.
///
/// Returns the magic, the declared total length, and the blob data
/// trimmed to that length. Fails if the header is incomplete or the
/// declared length does not fit the available data.
pub fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), CodeSignatureError> {
    if data.len() < 8 {
        return Err(CodeSignatureError::MalformedBlob(
            "not enough data for blob header",
        ));
    }

    let magic: u32 = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < 8 {
        return Err(CodeSignatureError::MalformedBlob(
            "declared length smaller than blob header",
        ));
    }

    if length > data.len() {
        return Err(CodeSignatureError::MalformedBlob(
            "declared length exceeds available data",
        ));
    }

    Ok((magic, length, &data[0..length]))
}

/// Read a blob header and require a specific magic.
///
/// Returns the blob payload, without the 8 byte header, trimmed to the
/// declared length.
pub fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: CodeSigningMagic,
    entity: &'static str,
) -> Result<&'a [u8], CodeSignatureError> {
    let (magic, _, data) = read_blob_header(data)?;

    if magic != u32::from(expected_magic) {
        Err(CodeSignatureError::BadMagic(entity))
    } else {
        Ok(&data[8..])
    }
}

/// Common behavior for blobs.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic of this blob type.
    fn magic(&self) -> CodeSigningMagic;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to all
    /// blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError>;

    /// Serialize this blob to bytes.
    ///
    /// This is [Blob::serialize_payload] with the blob header prepended.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignatureError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + 8);
        res.iowrite_with(u32::from(self.magic()), scroll::BE)?;
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        res.write_all(&payload)?;

        Ok(res)
    }

    /// Obtain the digest of the blob using the specified digester.
    ///
    /// Digests are over the entire serialized blob, header included.
    fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodeSignatureError> {
        digest_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// An unparsed blob of unrecognized type.
#[derive(Debug)]
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::from(self.magic)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self {
            magic,
            data: Cow::Borrowed(&data[8..]),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.data.to_vec())
    }
}

/// Entitlements, as an XML property list.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> EntitlementsBlob<'a> {
    pub fn from_string(s: &impl ToString) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    /// The property list XML.
    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::Entitlements
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let payload =
            read_and_validate_blob_header(data, CodeSigningMagic::Entitlements, "entitlements blob")?;
        let plist = std::str::from_utf8(payload)
            .map_err(|_| CodeSignatureError::MalformedBlob("entitlements plist is not UTF-8"))?;

        Ok(Self {
            plist: plist.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> Display for EntitlementsBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.plist)
    }
}

/// Entitlements, DER encoded.
#[derive(Debug)]
pub struct EntitlementsDerBlob<'a> {
    der: Cow<'a, [u8]>,
}

impl<'a> EntitlementsDerBlob<'a> {
    pub fn from_der(der: impl Into<Cow<'a, [u8]>>) -> Self {
        Self { der: der.into() }
    }

    /// The DER encoded entitlements data.
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl<'a> Blob<'a> for EntitlementsDerBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::EntitlementsDer
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let der = read_and_validate_blob_header(
            data,
            CodeSigningMagic::EntitlementsDer,
            "DER entitlements blob",
        )?;

        Ok(Self { der: der.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.der.to_vec())
    }
}

/// Launch constraints, DER encoded.
#[derive(Debug)]
pub struct ConstraintsDerBlob<'a> {
    der: Cow<'a, [u8]>,
}

impl<'a> ConstraintsDerBlob<'a> {
    pub fn from_der(der: impl Into<Cow<'a, [u8]>>) -> Self {
        Self { der: der.into() }
    }

    /// The DER encoded constraints data.
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl<'a> Blob<'a> for ConstraintsDerBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::ConstraintsDer
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let der = read_and_validate_blob_header(
            data,
            CodeSigningMagic::ConstraintsDer,
            "DER constraints blob",
        )?;

        Ok(Self { der: der.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.der.to_vec())
    }
}

/// A blob wrapping arbitrary data, conventionally a CMS signature.
#[derive(Debug)]
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> BlobWrapperBlob<'a> {
    pub fn from_data(data: impl Into<Cow<'a, [u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// The wrapped data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::BlobWrapper
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let data =
            read_and_validate_blob_header(data, CodeSigningMagic::BlobWrapper, "blob wrapper")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.data.to_vec())
    }
}

macro_rules! unparsed_superblob {
    ($name:ident, $magic:ident, $entity:literal, $doc:literal) => {
        #[doc = $doc]
        ///
        /// The sub-blob index is not parsed by this type; it simply holds
        /// the serialized payload.
        #[derive(Debug)]
        pub struct $name<'a> {
            data: Cow<'a, [u8]>,
        }

        impl<'a> Blob<'a> for $name<'a> {
            fn magic(&self) -> CodeSigningMagic {
                CodeSigningMagic::$magic
            }

            fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
                let data = read_and_validate_blob_header(data, CodeSigningMagic::$magic, $entity)?;

                Ok(Self { data: data.into() })
            }

            fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
                Ok(self.data.to_vec())
            }
        }
    };
}

unparsed_superblob!(
    EmbeddedSignatureBlob,
    EmbeddedSignature,
    "embedded signature blob",
    "An embedded signature SuperBlob, held unparsed."
);
unparsed_superblob!(
    EmbeddedSignatureOldBlob,
    EmbeddedSignatureOld,
    "old embedded signature blob",
    "An old style embedded signature, held unparsed."
);
unparsed_superblob!(
    DetachedSignatureBlob,
    DetachedSignature,
    "detached signature blob",
    "A detached signature SuperBlob, held unparsed."
);
unparsed_superblob!(
    DrListBlob,
    DrList,
    "DR list blob",
    "Library dependency (designated requirement) records, held unparsed."
);

/// Represents a single, parsed blob of arbitrary type.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    EmbeddedSignature(Box<EmbeddedSignatureBlob<'a>>),
    EmbeddedSignatureOld(Box<EmbeddedSignatureOldBlob<'a>>),
    DetachedSignature(Box<DetachedSignatureBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    EntitlementsDer(Box<EntitlementsDerBlob<'a>>),
    ConstraintsDer(Box<ConstraintsDerBlob<'a>>),
    DrList(Box<DrListBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic(&self) -> CodeSigningMagic {
        match self {
            Self::Requirement(b) => b.magic(),
            Self::RequirementSet(b) => b.magic(),
            Self::CodeDirectory(b) => b.magic(),
            Self::EmbeddedSignature(b) => b.magic(),
            Self::EmbeddedSignatureOld(b) => b.magic(),
            Self::DetachedSignature(b) => b.magic(),
            Self::Entitlements(b) => b.magic(),
            Self::EntitlementsDer(b) => b.magic(),
            Self::ConstraintsDer(b) => b.magic(),
            Self::DrList(b) => b.magic(),
            Self::BlobWrapper(b) => b.magic(),
            Self::Other(b) => b.magic(),
        }
    }

    /// Parse the blob data by reading its magic and dispatching to the
    /// appropriate parser.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (magic, _, _) = read_blob_header(data)?;

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::EmbeddedSignature => {
                Self::EmbeddedSignature(Box::new(EmbeddedSignatureBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::EmbeddedSignatureOld => Self::EmbeddedSignatureOld(Box::new(
                EmbeddedSignatureOldBlob::from_blob_bytes(data)?,
            )),
            CodeSigningMagic::DetachedSignature => {
                Self::DetachedSignature(Box::new(DetachedSignatureBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::EntitlementsDer => {
                Self::EntitlementsDer(Box::new(EntitlementsDerBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::ConstraintsDer => {
                Self::ConstraintsDer(Box::new(ConstraintsDerBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::DrList => Self::DrList(Box::new(DrListBlob::from_blob_bytes(data)?)),
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Unknown(magic) => {
                debug!("unknown blob magic {:#010x}; storing as opaque data", magic);
                Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?))
            }
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::EmbeddedSignature(b) => b.serialize_payload(),
            Self::EmbeddedSignatureOld(b) => b.serialize_payload(),
            Self::DetachedSignature(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::EntitlementsDer(b) => b.serialize_payload(),
            Self::ConstraintsDer(b) => b.serialize_payload(),
            Self::DrList(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }
}

/// Represents a single blob as defined by a SuperBlob index entry.
///
/// Instances have copies of their own index info, including the relative
/// order, slot type, and start offset within the SuperBlob.
///
/// The blob data is unparsed in this type and can be turned into a
/// [ParsedBlob] via [BlobEntry::into_parsed_blob].
#[derive(Clone, Debug)]
pub struct BlobEntry<'a> {
    /// Our index within the SuperBlob.
    pub index: usize,
    /// The slot type.
    pub slot: CodeSigningSlot,
    /// Our start offset within the SuperBlob.
    pub offset: usize,
    /// The magic value at the beginning of the blob.
    pub magic: CodeSigningMagic,
    /// The total length of the blob, header included.
    pub length: usize,
    /// The raw data of this blob, header included.
    pub data: &'a [u8],
}

impl<'a> BlobEntry<'a> {
    /// Attempt to convert to a [ParsedBlob].
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, CodeSignatureError> {
        ParsedBlob::try_from(self)
    }

    /// The payload of this blob, without the blob header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[8..]
    }

    /// Compute the digest of this blob's full data with the specified digester.
    pub fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodeSignatureError> {
        digest_type.digest_data(self.data)
    }
}

/// Represents the parsed content of a blob entry.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    /// The blob record this blob came from.
    pub blob_entry: BlobEntry<'a>,
    /// The parsed blob data.
    pub blob: BlobData<'a>,
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = CodeSignatureError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// Parse a SuperBlob's header and index, validating that every index
/// entry references data within the declared bounds.
fn parse_superblob<'a>(
    data: &'a [u8],
    expected_magic: CodeSigningMagic,
    entity: &'static str,
) -> Result<(u32, u32, &'a [u8], Vec<BlobEntry<'a>>), CodeSignatureError> {
    let (magic, length, data) = read_blob_header(data)?;

    if magic != u32::from(expected_magic) {
        return Err(CodeSignatureError::BadMagic(entity));
    }

    let count: u32 = data.pread_with(8, scroll::BE)?;

    if 12usize + count as usize * 8 > length {
        return Err(CodeSignatureError::MalformedBlob(
            "superblob index table exceeds declared length",
        ));
    }

    let mut blobs = Vec::with_capacity(count as usize);
    let offset = &mut 12usize;

    for index in 0..count as usize {
        let slot: u32 = data.gread_with(offset, scroll::BE)?;
        let blob_offset: u32 = data.gread_with(offset, scroll::BE)?;

        let blob_data = data
            .get(blob_offset as usize..)
            .ok_or(CodeSignatureError::TruncatedSuperBlob(slot))?;
        let (blob_magic, blob_length, blob_data) =
            read_blob_header(blob_data).map_err(|_| CodeSignatureError::TruncatedSuperBlob(slot))?;

        blobs.push(BlobEntry {
            index,
            slot: CodeSigningSlot::from(slot),
            offset: blob_offset as usize,
            magic: CodeSigningMagic::from(blob_magic),
            length: blob_length,
            data: blob_data,
        });
    }

    Ok((length as u32, count, data, blobs))
}

/// Represents a parsed embedded signature SuperBlob.
#[derive(Debug)]
pub struct EmbeddedSignature<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Total length of the SuperBlob.
    pub length: u32,
    /// Number of blobs in this SuperBlob.
    pub count: u32,
    /// Raw data backing this SuperBlob.
    pub data: &'a [u8],
    /// All the blobs, in index order.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> EmbeddedSignature<'a> {
    /// Attempt to parse an embedded signature SuperBlob from bytes.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (length, count, data, blobs) = parse_superblob(
            data,
            CodeSigningMagic::EmbeddedSignature,
            "embedded signature",
        )?;

        Ok(Self {
            magic: CodeSigningMagic::EmbeddedSignature,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first blob entry for a given slot.
    ///
    /// Returns None if this slot isn't present.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    /// Find the first blob entry for a given slot and parse it.
    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, CodeSignatureError> {
        if let Some(entry) = self.find_slot(slot) {
            Ok(Some(entry.clone().into_parsed_blob()?))
        } else {
            Ok(None)
        }
    }

    /// Obtain the code directory, if present.
    pub fn code_directory(
        &self,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodeSignatureError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::CodeDirectory)? {
            if let BlobData::CodeDirectory(cd) = parsed.blob {
                Ok(Some(cd))
            } else {
                Err(CodeSignatureError::BadMagic("code directory blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Obtain the code requirement set, if present.
    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, CodeSignatureError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::RequirementSet)? {
            if let BlobData::RequirementSet(set) = parsed.blob {
                Ok(Some(set))
            } else {
                Err(CodeSignatureError::BadMagic("requirement set blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Obtain the XML plist entitlements, if present.
    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, CodeSignatureError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::Entitlements)? {
            if let BlobData::Entitlements(e) = parsed.blob {
                Ok(Some(e))
            } else {
                Err(CodeSignatureError::BadMagic("entitlements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Obtain the DER encoded entitlements, if present.
    pub fn entitlements_der(
        &self,
    ) -> Result<Option<Box<EntitlementsDerBlob<'a>>>, CodeSignatureError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::EntitlementsDer)? {
            if let BlobData::EntitlementsDer(e) = parsed.blob {
                Ok(Some(e))
            } else {
                Err(CodeSignatureError::BadMagic("DER entitlements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Obtain the raw CMS signature data, if present.
    ///
    /// The returned data is the payload of the blob wrapper in the
    /// signature slot.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, CodeSignatureError> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            Ok(Some(entry.payload()))
        } else {
            Ok(None)
        }
    }
}

/// Represents a parsed detached signature SuperBlob.
///
/// Sub-blobs are embedded signatures, keyed by the CPU type of the
/// binary they apply to (or 0xffffffff for the global slot).
#[derive(Debug)]
pub struct DetachedSignature<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Total length of the SuperBlob.
    pub length: u32,
    /// Number of blobs in this SuperBlob.
    pub count: u32,
    /// Raw data backing this SuperBlob.
    pub data: &'a [u8],
    /// All the blobs, in index order.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> DetachedSignature<'a> {
    /// Attempt to parse a detached signature SuperBlob from bytes.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (length, count, data, blobs) = parse_superblob(
            data,
            CodeSigningMagic::DetachedSignature,
            "detached signature",
        )?;

        Ok(Self {
            magic: CodeSigningMagic::DetachedSignature,
            length,
            count,
            data,
            blobs,
        })
    }

    /// The architecture keys present, in index order.
    pub fn architectures(&self) -> Vec<u32> {
        self.blobs.iter().map(|e| u32::from(e.slot)).collect()
    }

    /// Obtain the embedded signature for a given architecture key.
    pub fn architecture_signature(
        &self,
        arch: u32,
    ) -> Result<Option<EmbeddedSignature<'a>>, CodeSignatureError> {
        self.blobs
            .iter()
            .find(|e| u32::from(e.slot) == arch)
            .map(|e| EmbeddedSignature::from_bytes(e.data))
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magic_round_trip() {
        for v in [
            0xfade0c00, 0xfade0c01, 0xfade0c02, 0xfade0c05, 0xfade0cc0, 0xfade0b02, 0xfade0cc1,
            0xfade7171, 0xfade7172, 0xfade8181, 0xfade0b01, 0xdeadbeef,
        ] {
            assert_eq!(u32::from(CodeSigningMagic::from(v)), v);
        }
    }

    #[test]
    fn slot_round_trip() {
        for v in [0, 1, 2, 3, 7, 11, 0x1000, 0x1004, 0x10000, 0x10002, 42] {
            assert_eq!(u32::from(CodeSigningSlot::from(v)), v);
        }

        assert!(CodeSigningSlot::Info.has_code_directory_special_slot());
        assert!(CodeSigningSlot::LibraryConstraint.has_code_directory_special_slot());
        assert!(!CodeSigningSlot::CodeDirectory.has_code_directory_special_slot());
        assert!(!CodeSigningSlot::Signature.has_code_directory_special_slot());
    }

    #[test]
    fn blob_header_bounds() {
        assert!(matches!(
            read_blob_header(&[0xfa, 0xde, 0x0c, 0x00, 0x00, 0x00, 0x00]),
            Err(CodeSignatureError::MalformedBlob(_))
        ));

        // Declared length smaller than the header itself.
        assert!(matches!(
            read_blob_header(&[0xfa, 0xde, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x04]),
            Err(CodeSignatureError::MalformedBlob(_))
        ));

        // Declared length larger than available data.
        assert!(matches!(
            read_blob_header(&[0xfa, 0xde, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x10]),
            Err(CodeSignatureError::MalformedBlob(_))
        ));

        let (magic, length, data) =
            read_blob_header(&[0xfa, 0xde, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x09, 0x42, 0xff])
                .unwrap();
        assert_eq!(magic, 0xfade0c00);
        assert_eq!(length, 9);
        // Trailing data beyond the declared length is trimmed.
        assert_eq!(data, &[0xfa, 0xde, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x09, 0x42]);
    }

    #[test]
    fn empty_entitlements_der() -> Result<(), CodeSignatureError> {
        let blob = EntitlementsDerBlob::from_der(vec![]);
        assert_eq!(
            blob.to_blob_bytes()?,
            [0xfa, 0xde, 0x71, 0x72, 0x00, 0x00, 0x00, 0x08]
        );

        let parsed = EntitlementsDerBlob::from_blob_bytes(&[
            0xfa, 0xde, 0x71, 0x72, 0x00, 0x00, 0x00, 0x08,
        ])?;
        assert!(parsed.der().is_empty());

        Ok(())
    }

    #[test]
    fn entitlements_round_trip() -> Result<(), CodeSignatureError> {
        let blob = EntitlementsBlob::from_string(&"<plist></plist>");
        let bytes = blob.to_blob_bytes()?;

        let parsed = EntitlementsBlob::from_blob_bytes(&bytes)?;
        assert_eq!(parsed.as_str(), "<plist></plist>");
        assert_eq!(parsed.to_blob_bytes()?, bytes);

        Ok(())
    }

    #[test]
    fn unknown_magic_is_opaque() -> Result<(), CodeSignatureError> {
        let data = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x0a, 0x01, 0x02];

        let blob = BlobData::from_blob_bytes(&data)?;
        assert!(matches!(blob, BlobData::Other(_)));
        assert_eq!(blob.to_blob_bytes()?, data);

        Ok(())
    }

    #[test]
    fn superblob_truncated_entry() {
        // One index entry whose offset is beyond the declared length.
        let data = [
            0xfa, 0xde, 0x0c, 0xc0, 0x00, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x02, 0x00, 0x00, 0x00, 0x60,
        ];

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignatureError::TruncatedSuperBlob(2))
        ));
    }

    #[test]
    fn superblob_index_table_bounds() {
        // Count claims 2 entries but only the header is present.
        let data = [
            0xfa, 0xde, 0x0c, 0xc0, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x02,
        ];

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignatureError::MalformedBlob(_))
        ));
    }

    #[test]
    fn blob_digest() -> Result<(), CodeSignatureError> {
        let blob = EntitlementsDerBlob::from_der(vec![]);
        let digest = blob.digest_with(DigestType::Sha256)?;

        assert_eq!(
            digest,
            DigestType::Sha256.digest_data(&[0xfa, 0xde, 0x71, 0x72, 0x00, 0x00, 0x00, 0x08])?
        );

        Ok(())
    }
}

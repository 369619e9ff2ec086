// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code requirement data structures.
//!
//! A *requirement* is a boolean expression evaluated against a code
//! subject. This crate treats the compiled expression as an opaque byte
//! payload; it does not evaluate or encode expressions.
//!
//! Requirements are grouped into a *requirement set*, a SuperBlob keyed
//! by requirement type (host, guest, designated, ...).

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, read_blob_header, Blob, CodeSigningMagic,
        },
        error::CodeSignatureError,
    },
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, cmp::Ordering, collections::BTreeMap, fmt::Display, io::Write},
};

/// Type of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequirementType {
    /// What hosts may run us.
    Host,
    /// What guests we may run.
    Guest,
    /// Designated requirement.
    Designated,
    /// What libraries we may link against.
    Library,
    /// What plugins we may load.
    Plugin,
    /// Unknown requirement type.
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(v: RequirementType) -> Self {
        match v {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl PartialOrd for RequirementType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequirementType {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl Display for RequirementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
            Self::Designated => f.write_str("designated"),
            Self::Library => f.write_str("library"),
            Self::Plugin => f.write_str("plugin"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown: {v}")),
        }
    }
}

/// A single requirement blob.
///
/// The payload is the compiled requirement expression, held as opaque
/// bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequirementBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> RequirementBlob<'a> {
    /// Wrap an already encoded requirement expression in a blob.
    ///
    /// The content is not validated.
    pub fn blobify(data: impl Into<Cow<'a, [u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// The encoded requirement expression.
    pub fn expression_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::Requirement
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let data =
            read_and_validate_blob_header(data, CodeSigningMagic::Requirement, "requirement blob")?;

        Ok(Self {
            data: Cow::Borrowed(data),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        Ok(self.data.to_vec())
    }
}

/// A requirement set: a SuperBlob of requirements keyed by type.
///
/// Entries are held sorted ascending by type, matching the serialized
/// index order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequirementSetBlob<'a> {
    requirements: Vec<(RequirementType, RequirementBlob<'a>)>,
}

impl<'a> RequirementSetBlob<'a> {
    /// Number of requirements in the set.
    pub fn count(&self) -> usize {
        self.requirements.len()
    }

    /// The requirement types present, in index order.
    pub fn types(&self) -> Vec<RequirementType> {
        self.requirements.iter().map(|(t, _)| *t).collect()
    }

    /// Find the requirement for a given type.
    ///
    /// Returns None if the type is not present.
    pub fn find(&self, typ: RequirementType) -> Option<&RequirementBlob<'a>> {
        self.requirements
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, blob)| blob)
    }

    /// Iterate (type, requirement) pairs in index order.
    pub fn requirements(&self) -> impl Iterator<Item = &(RequirementType, RequirementBlob<'a>)> {
        self.requirements.iter()
    }
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic(&self) -> CodeSigningMagic {
        CodeSigningMagic::RequirementSet
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignatureError> {
        let (magic, length, data) = read_blob_header(data)?;

        if magic != u32::from(CodeSigningMagic::RequirementSet) {
            return Err(CodeSignatureError::BadMagic("requirement set blob"));
        }

        let count = data.pread_with::<u32>(8, scroll::BE)? as usize;

        if 12 + count * 8 > length {
            return Err(CodeSignatureError::MalformedBlob(
                "requirement set index table exceeds declared length",
            ));
        }

        let mut requirements = Vec::with_capacity(count);
        let offset = &mut 12usize;

        for _ in 0..count {
            let typ: u32 = data.gread_with(offset, scroll::BE)?;
            let blob_offset: u32 = data.gread_with(offset, scroll::BE)?;

            let blob_data = data
                .get(blob_offset as usize..)
                .ok_or(CodeSignatureError::TruncatedSuperBlob(typ))?;
            let blob = RequirementBlob::from_blob_bytes(blob_data)
                .map_err(|e| match e {
                    CodeSignatureError::BadMagic(entity) => CodeSignatureError::BadMagic(entity),
                    _ => CodeSignatureError::TruncatedSuperBlob(typ),
                })?;

            requirements.push((RequirementType::from(typ), blob));
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignatureError> {
        let mut index = Vec::new();
        let mut blobs = Vec::new();

        // Sub-blob offsets are absolute from the start of the outer blob,
        // which prepends an 8 byte header to this payload.
        let mut blob_offset = 8 + 4 + self.requirements.len() * 8;

        for (typ, requirement) in &self.requirements {
            let bytes = requirement.to_blob_bytes()?;

            index.iowrite_with(u32::from(*typ), scroll::BE)?;
            index.iowrite_with(blob_offset as u32, scroll::BE)?;

            blob_offset += bytes.len();
            blobs.write_all(&bytes)?;
        }

        let mut res = Vec::new();
        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;
        res.write_all(&index)?;
        res.write_all(&blobs)?;

        Ok(res)
    }
}

/// Builder for [RequirementSetBlob] instances.
///
/// Requirements can be added in any order; the built set is sorted
/// ascending by requirement type. Adding a requirement for a type
/// already present replaces the previous one.
#[derive(Clone, Debug, Default)]
pub struct RequirementSetBuilder<'a> {
    requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> RequirementSetBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the requirement for a type, replacing any previous one.
    pub fn add(&mut self, typ: RequirementType, requirement: RequirementBlob<'a>) {
        self.requirements.insert(typ, requirement);
    }

    /// Whether a requirement for the given type has been added.
    pub fn contains(&self, typ: RequirementType) -> bool {
        self.requirements.contains_key(&typ)
    }

    /// Get the requirement for a type, if added.
    pub fn get(&self, typ: RequirementType) -> Option<&RequirementBlob<'a>> {
        self.requirements.get(&typ)
    }

    /// The exact byte length the built set serializes to.
    pub fn size(&self) -> usize {
        12 + self
            .requirements
            .values()
            .map(|r| 8 + 8 + r.expression_bytes().len())
            .sum::<usize>()
    }

    /// Build the requirement set.
    ///
    /// An empty builder yields a valid zero-count set.
    pub fn build(&self) -> RequirementSetBlob<'a> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(typ, blob)| (*typ, blob.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EMPTY_SET: &[u8] = &[
        0xfa, 0xde, 0x0c, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn requirement_type_round_trip() {
        for v in [1, 2, 3, 4, 5, 99] {
            assert_eq!(u32::from(RequirementType::from(v)), v);
        }

        assert_eq!(format!("{}", RequirementType::Designated), "designated");
        assert_eq!(format!("{}", RequirementType::Host), "host");
    }

    #[test]
    fn empty_set_exact_bytes() -> Result<(), CodeSignatureError> {
        let set = RequirementSetBuilder::new().build();
        assert_eq!(set.to_blob_bytes()?, EMPTY_SET);
        assert_eq!(RequirementSetBuilder::new().size(), EMPTY_SET.len());

        let parsed = RequirementSetBlob::from_blob_bytes(EMPTY_SET)?;
        assert_eq!(parsed.count(), 0);
        assert_eq!(parsed, set);

        Ok(())
    }

    #[test]
    fn sorted_packing_exact_bytes() -> Result<(), CodeSignatureError> {
        let host_data = hex::decode(concat!(
            "00000001000000020000000e",
            "636f6d2e6170706c652e686f73740000"
        ))
        .unwrap();
        let designated_data = hex::decode(concat!(
            "000000010000000200000014",
            "636f6d2e6170706c652e64657369676e61746564"
        ))
        .unwrap();

        let expected = hex::decode(
            [
                "fade0c0100000068",
                "00000002",
                "000000010000001c",
                "0000000300000040",
                "fade0c0000000024",
                &hex::encode(&host_data),
                "fade0c0000000028",
                &hex::encode(&designated_data),
            ]
            .concat(),
        )
        .unwrap();

        // Added out of order; the built set is sorted by type.
        let mut builder = RequirementSetBuilder::new();
        builder.add(
            RequirementType::Designated,
            RequirementBlob::blobify(designated_data.clone()),
        );
        builder.add(
            RequirementType::Host,
            RequirementBlob::blobify(host_data.clone()),
        );

        assert_eq!(builder.size(), expected.len());

        let set = builder.build();
        let serialized = set.to_blob_bytes()?;
        assert_eq!(serialized, expected);
        assert_eq!(
            set.types(),
            vec![RequirementType::Host, RequirementType::Designated]
        );

        let parsed = RequirementSetBlob::from_blob_bytes(&serialized)?;
        assert_eq!(parsed, set);
        assert_eq!(parsed.to_blob_bytes()?, serialized);

        assert_eq!(
            parsed
                .find(RequirementType::Host)
                .map(|r| r.expression_bytes()),
            Some(host_data.as_slice())
        );
        assert!(parsed.find(RequirementType::Library).is_none());

        Ok(())
    }

    #[test]
    fn add_replaces_existing() {
        let mut builder = RequirementSetBuilder::new();
        builder.add(RequirementType::Host, RequirementBlob::blobify(vec![1]));
        builder.add(RequirementType::Host, RequirementBlob::blobify(vec![2, 3]));

        assert!(builder.contains(RequirementType::Host));
        assert_eq!(
            builder.get(RequirementType::Host).unwrap().expression_bytes(),
            &[2, 3]
        );
        assert_eq!(builder.build().count(), 1);
    }

    #[test]
    fn truncated_index_entry() {
        // Index references offset 0x60 in a 0x1c byte set.
        let data = hex::decode("fade0c010000001c000000010000000100000060deadbeefcafed00d").unwrap();

        assert!(matches!(
            RequirementSetBlob::from_blob_bytes(&data),
            Err(CodeSignatureError::TruncatedSuperBlob(1))
        ));
    }

    #[test]
    fn sub_blob_magic_enforced() {
        // Index entry points at a blob with the wrong magic.
        let data = hex::decode("fade0c010000001c000000010000000100000014fade0c0200000008").unwrap();

        assert!(matches!(
            RequirementSetBlob::from_blob_bytes(&data),
            Err(CodeSignatureError::BadMagic(_))
        ));
    }
}

#![forbid(unsafe_code)]
//! Shared identifier types, 8-bit generation arithmetic, and the persisted
//! member-table codec.
//!
//! Everything persisted is fixed-width little-endian. Parsing failures are
//! reported as [`ParseError`]; the engine converts them into its user-facing
//! error type at the crate boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of member devices in one filesystem.
pub const MEMBERS_MAX: usize = 64;

/// Maximum replication level tracked by usage accounting.
pub const REPLICAS_MAX: usize = 4;

/// Member-table image magic ("BKTM").
pub const MEMBER_TABLE_MAGIC: u32 = 0x424B_544D;
pub const MEMBER_TABLE_VERSION: u16 = 1;
pub const MEMBER_TABLE_HEADER_SIZE: usize = 16;
pub const MEMBER_SIZE: usize = 32;

/// Index of a member device within the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

/// Bucket number within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdx(pub u64);

// ── Generations ─────────────────────────────────────────────────────────────

/// Per-bucket generation number. Wraps modulo 256.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Gen(pub u8);

impl Gen {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Signed distance from `b` to `a` in the cyclic 8-bit generation space.
///
/// Positive when `a` is after `b`. The half-way point (distance 128) is
/// ambiguous and reports `-128` in both directions.
#[must_use]
#[inline]
pub fn gen_cmp(a: Gen, b: Gen) -> i32 {
    #[expect(clippy::cast_possible_wrap)]
    let diff = a.0.wrapping_sub(b.0) as i8;
    i32::from(diff)
}

/// How far `a` is after `b`, or zero if it is not after it.
#[must_use]
#[inline]
pub fn gen_after(a: Gen, b: Gen) -> u8 {
    u8::try_from(gen_cmp(a, b)).unwrap_or(0)
}

// ── Data types ──────────────────────────────────────────────────────────────

/// What a bucket currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    #[default]
    None = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
    /// Parity blocks of an erasure-coded stripe.
    #[serde(rename = "stripe_parity")]
    StripeParity = 7,
}

impl DataType {
    pub const COUNT: usize = 8;

    pub const ALL: [Self; Self::COUNT] = [
        Self::None,
        Self::Sb,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
        Self::StripeParity,
    ];

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.as_u8())
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sb => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
            Self::StripeParity => "stripe_parity",
        }
    }

    /// Superblock and journal buckets are accounted as hidden space.
    #[must_use]
    pub fn is_hidden(self) -> bool {
        matches!(self, Self::Sb | Self::Journal)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Member state ────────────────────────────────────────────────────────────

/// Participation state of a member device.
///
/// This is stored and consulted only; deciding whether a transition is safe
/// belongs to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MemberState {
    #[default]
    Rw = 0,
    Ro = 1,
    Failed = 2,
    Spare = 3,
}

impl MemberState {
    pub const ALL: [Self; 4] = [Self::Rw, Self::Ro, Self::Failed, Self::Spare];

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::Failed => "failed",
            Self::Spare => "spare",
        }
    }

    /// Only read-write members receive new allocations.
    #[must_use]
    pub fn allocates(self) -> bool {
        self == Self::Rw
    }

    /// Whether data on this member still counts toward replica placement.
    #[must_use]
    pub fn holds_replicas(self) -> bool {
        matches!(self, Self::Rw | Self::Ro)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory overrides for device state feasibility checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForceFlags(pub u32);

impl ForceFlags {
    pub const NONE: Self = Self(0);
    pub const DEGRADED: Self = Self(1 << 0);
    pub const DATA_LOST: Self = Self(1 << 1);
    pub const METADATA_LOST: Self = Self(1 << 2);
    pub const LOST: Self = Self(Self::DATA_LOST.0 | Self::METADATA_LOST.0);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── Member geometry ─────────────────────────────────────────────────────────

/// Persisted per-device geometry and state.
///
/// On-disk layout (32 bytes, little-endian):
///
/// | Offset | Width | Field |
/// |--------|-------|-------|
/// | 0 | 8 | `nbuckets` |
/// | 8 | 2 | `first_bucket` |
/// | 10 | 2 | `bucket_size` (sectors) |
/// | 12 | 1 | `state` |
/// | 13 | 3 | reserved |
/// | 16 | 8 | `last_mount` |
/// | 24 | 8 | reserved |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub nbuckets: u64,
    pub first_bucket: u16,
    pub bucket_size: u16,
    pub state: MemberState,
    pub last_mount: u64,
}

impl Member {
    #[must_use]
    pub fn new(nbuckets: u64, bucket_size: u16) -> Self {
        Self {
            nbuckets,
            first_bucket: 0,
            bucket_size,
            state: MemberState::Rw,
            last_mount: 0,
        }
    }

    /// Buckets in `[first_bucket, nbuckets)`.
    #[must_use]
    pub fn usable_buckets(&self) -> u64 {
        self.nbuckets.saturating_sub(u64::from(self.first_bucket))
    }

    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> BucketIdx {
        BucketIdx(sector / u64::from(self.bucket_size.max(1)))
    }

    #[must_use]
    pub fn bucket_to_sector(&self, bucket: BucketIdx) -> u64 {
        bucket.0 * u64::from(self.bucket_size)
    }

    /// Check geometry a device can be brought up with.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.bucket_size == 0 {
            return Err(ParseError::InvalidField {
                field: "bucket_size",
                reason: "must be non-zero",
            });
        }
        if self.nbuckets <= u64::from(self.first_bucket) {
            return Err(ParseError::InvalidField {
                field: "nbuckets",
                reason: "must exceed first_bucket",
            });
        }
        Ok(())
    }

    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, MEMBER_SIZE)?;
        let state_raw = data[12];
        let state = MemberState::from_u8(state_raw).ok_or(ParseError::InvalidField {
            field: "state",
            reason: "unknown member state",
        })?;
        Ok(Self {
            nbuckets: read_le_u64(data, 0)?,
            first_bucket: read_le_u16(data, 8)?,
            bucket_size: read_le_u16(data, 10)?,
            state,
            last_mount: read_le_u64(data, 16)?,
        })
    }

    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < MEMBER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: MEMBER_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        out[..MEMBER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.nbuckets.to_le_bytes());
        out[8..10].copy_from_slice(&self.first_bucket.to_le_bytes());
        out[10..12].copy_from_slice(&self.bucket_size.to_le_bytes());
        out[12] = self.state as u8;
        out[16..24].copy_from_slice(&self.last_mount.to_le_bytes());
        Ok(())
    }
}

// ── Replicas entries ────────────────────────────────────────────────────────

/// One replication configuration in use: data of `data_type` stored on
/// `devs`, readable while at least `nr_required` of them are present.
///
/// `devs` is kept sorted and deduplicated so equal sets compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    pub devs: Vec<DeviceIdx>,
}

impl ReplicasEntry {
    #[must_use]
    pub fn new(data_type: DataType, nr_required: u8, mut devs: Vec<DeviceIdx>) -> Self {
        devs.sort_unstable();
        devs.dedup();
        Self {
            data_type,
            nr_required,
            devs,
        }
    }

    /// Superblock, journal and btree entries guard metadata.
    #[must_use]
    pub fn is_metadata(&self) -> bool {
        matches!(
            self.data_type,
            DataType::Sb | DataType::Journal | DataType::Btree
        )
    }

    /// Decode one entry at `offset`, returning it and the bytes consumed.
    ///
    /// Encoding: type, nr_required, nr_devs, then one byte per device.
    fn parse_from_bytes(data: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let head = ensure_slice(data, offset, 3)?;
        let data_type = DataType::from_u8(head[0]).ok_or(ParseError::InvalidField {
            field: "replicas.data_type",
            reason: "unknown data type",
        })?;
        let nr_required = head[1];
        let nr_devs = usize::from(head[2]);
        let raw = ensure_slice(data, offset + 3, nr_devs)?;
        let devs: Vec<DeviceIdx> = raw.iter().map(|d| DeviceIdx(u32::from(*d))).collect();
        if nr_required == 0 || usize::from(nr_required) > nr_devs {
            return Err(ParseError::InvalidField {
                field: "replicas.nr_required",
                reason: "must be in 1..=nr_devs",
            });
        }
        Ok((Self::new(data_type, nr_required, devs), 3 + nr_devs))
    }

    fn write_to_bytes(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let nr_devs = u8::try_from(self.devs.len()).map_err(|_| ParseError::InvalidField {
            field: "replicas.nr_devs",
            reason: "too many devices",
        })?;
        out.push(self.data_type.as_u8());
        out.push(self.nr_required);
        out.push(nr_devs);
        for dev in &self.devs {
            let raw = u8::try_from(dev.0).map_err(|_| ParseError::InvalidField {
                field: "replicas.devs",
                reason: "device index exceeds MEMBERS_MAX",
            })?;
            out.push(raw);
        }
        Ok(())
    }
}

/// The persisted member table: a small header followed by fixed-size members
/// and an optional replicas section.
///
/// Header layout: magic (u32), version (u16), member count (u16), seq (u64).
/// The replicas section is a `u16` entry count followed by variable-length
/// entries; an image that ends right after the members has no entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTable {
    pub seq: u64,
    pub members: Vec<Member>,
    #[serde(default)]
    pub replicas: Vec<ReplicasEntry>,
}

impl MemberTable {
    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != MEMBER_TABLE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(MEMBER_TABLE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u16(data, 4)?;
        if version != MEMBER_TABLE_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported member table version",
            });
        }
        let count = usize::from(read_le_u16(data, 6)?);
        if count > MEMBERS_MAX {
            return Err(ParseError::InvalidField {
                field: "nr_members",
                reason: "exceeds MEMBERS_MAX",
            });
        }
        let seq = read_le_u64(data, 8)?;

        let mut members = Vec::with_capacity(count);
        for i in 0..count {
            let offset = MEMBER_TABLE_HEADER_SIZE + i * MEMBER_SIZE;
            let raw = ensure_slice(data, offset, MEMBER_SIZE)?;
            members.push(Member::parse_from_bytes(raw)?);
        }

        let mut offset = MEMBER_TABLE_HEADER_SIZE + count * MEMBER_SIZE;
        let mut replicas = Vec::new();
        if offset < data.len() {
            let nr = read_le_u16(data, offset)?;
            offset += 2;
            for _ in 0..nr {
                let (entry, consumed) = ReplicasEntry::parse_from_bytes(data, offset)?;
                if entry
                    .devs
                    .iter()
                    .any(|d| usize::try_from(d.0).map_or(true, |d| d >= count))
                {
                    return Err(ParseError::InvalidField {
                        field: "replicas.devs",
                        reason: "device is not a member",
                    });
                }
                offset += consumed;
                replicas.push(entry);
            }
        }
        Ok(Self {
            seq,
            members,
            replicas,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let count = u16::try_from(self.members.len())
            .ok()
            .filter(|n| usize::from(*n) <= MEMBERS_MAX)
            .ok_or(ParseError::InvalidField {
                field: "nr_members",
                reason: "exceeds MEMBERS_MAX",
            })?;
        let mut out = vec![0_u8; MEMBER_TABLE_HEADER_SIZE + self.members.len() * MEMBER_SIZE];
        out[0..4].copy_from_slice(&MEMBER_TABLE_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&MEMBER_TABLE_VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&count.to_le_bytes());
        out[8..16].copy_from_slice(&self.seq.to_le_bytes());
        for (i, member) in self.members.iter().enumerate() {
            let offset = MEMBER_TABLE_HEADER_SIZE + i * MEMBER_SIZE;
            member.write_to_bytes(&mut out[offset..offset + MEMBER_SIZE])?;
        }
        if !self.replicas.is_empty() {
            let nr = u16::try_from(self.replicas.len()).map_err(|_| ParseError::InvalidField {
                field: "nr_replicas",
                reason: "too many entries",
            })?;
            out.extend_from_slice(&nr.to_le_bytes());
            for entry in &self.replicas {
                entry.write_to_bytes(&mut out)?;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Gen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(matches!(
            read_le_u64(&bytes, 4),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
    }

    #[test]
    fn gen_cmp_wraps_near_255() {
        assert_eq!(gen_cmp(Gen(0), Gen(255)), 1);
        assert_eq!(gen_cmp(Gen(255), Gen(0)), -1);
        assert_eq!(gen_cmp(Gen(3), Gen(250)), 9);
        assert_eq!(gen_after(Gen(3), Gen(250)), 9);
        assert_eq!(gen_after(Gen(250), Gen(3)), 0);
    }

    #[test]
    fn gen_half_way_point_is_never_after() {
        assert_eq!(gen_cmp(Gen(128), Gen(0)), -128);
        assert_eq!(gen_cmp(Gen(0), Gen(128)), -128);
        assert_eq!(gen_after(Gen(128), Gen(0)), 0);
    }

    #[test]
    fn equal_gens_are_not_stale() {
        for g in 0..=255_u8 {
            assert_eq!(gen_after(Gen(g), Gen(g)), 0);
        }
        assert_eq!(gen_after(Gen(6), Gen(5)), 1);
    }

    #[test]
    fn data_type_roundtrip_and_names() {
        for ty in DataType::ALL {
            assert_eq!(DataType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(DataType::from_u8(7), Some(DataType::StripeParity));
        assert_eq!(DataType::from_u8(8), None);
        assert_eq!(DataType::Btree.to_string(), "btree");
        assert!(DataType::Journal.is_hidden());
        assert!(!DataType::User.is_hidden());
    }

    #[test]
    fn member_state_parse_and_gates() {
        assert_eq!(MemberState::parse("failed"), Some(MemberState::Failed));
        assert_eq!(MemberState::parse("offline"), None);
        assert!(MemberState::Rw.allocates());
        assert!(!MemberState::Ro.allocates());
        assert!(MemberState::Ro.holds_replicas());
        assert!(!MemberState::Failed.holds_replicas());
        assert!(!MemberState::Spare.holds_replicas());
    }

    #[test]
    fn force_flags_lost_covers_both() {
        assert!(ForceFlags::LOST.contains(ForceFlags::DATA_LOST));
        assert!(ForceFlags::LOST.contains(ForceFlags::METADATA_LOST));
        assert!(!ForceFlags::DEGRADED.contains(ForceFlags::DATA_LOST));
        let f = ForceFlags::DEGRADED.union(ForceFlags::DATA_LOST);
        assert!(f.contains(ForceFlags::DEGRADED));
    }

    #[test]
    fn member_geometry_conversions() {
        let mut m = Member::new(1000, 4096);
        m.first_bucket = 8;
        assert_eq!(m.usable_buckets(), 992);
        assert_eq!(m.sector_to_bucket(8191), BucketIdx(1));
        assert_eq!(m.bucket_to_sector(BucketIdx(3)), 12288);
        assert!(m.validate().is_ok());
        m.bucket_size = 0;
        assert!(m.validate().is_err());
    }

    #[test]
    fn member_table_layout_is_little_endian() {
        let table = MemberTable {
            seq: 7,
            members: vec![Member {
                nbuckets: 0x0102,
                first_bucket: 1,
                bucket_size: 0x0800,
                state: MemberState::Ro,
                last_mount: 9,
            }],
            replicas: Vec::new(),
        };
        let bytes = table.to_bytes().expect("encode");
        assert_eq!(bytes.len(), MEMBER_TABLE_HEADER_SIZE + MEMBER_SIZE);
        assert_eq!(&bytes[0..4], &MEMBER_TABLE_MAGIC.to_le_bytes());
        let m = &bytes[MEMBER_TABLE_HEADER_SIZE..];
        assert_eq!(&m[0..2], &[0x02, 0x01]);
        assert_eq!(&m[10..12], &[0x00, 0x08]);
        assert_eq!(m[12], 1);
        assert_eq!(MemberTable::parse_from_bytes(&bytes).expect("decode"), table);
    }

    #[test]
    fn member_table_rejects_bad_magic_and_state() {
        let mut bytes = MemberTable {
            seq: 0,
            members: vec![Member::new(16, 128)],
            replicas: Vec::new(),
        }
        .to_bytes()
        .expect("encode");

        bytes[MEMBER_TABLE_HEADER_SIZE + 12] = 9;
        assert!(matches!(
            MemberTable::parse_from_bytes(&bytes),
            Err(ParseError::InvalidField { field: "state", .. })
        ));

        bytes[0] ^= 0xFF;
        assert!(matches!(
            MemberTable::parse_from_bytes(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn replicas_section_roundtrips_and_sorts_devs() {
        let table = MemberTable {
            seq: 3,
            members: vec![Member::new(64, 128), Member::new(64, 128), Member::new(64, 128)],
            replicas: vec![
                ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(2), DeviceIdx(0)]),
                ReplicasEntry::new(DataType::Btree, 2, vec![DeviceIdx(1), DeviceIdx(2)]),
            ],
        };
        assert_eq!(table.replicas[0].devs, vec![DeviceIdx(0), DeviceIdx(2)]);
        assert!(table.replicas[1].is_metadata());

        let bytes = table.to_bytes().expect("encode");
        assert_eq!(
            bytes.len(),
            MEMBER_TABLE_HEADER_SIZE + 3 * MEMBER_SIZE + 2 + 5 + 5
        );
        assert_eq!(MemberTable::parse_from_bytes(&bytes).expect("decode"), table);
    }

    #[test]
    fn replicas_section_rejects_unknown_member() {
        let table = MemberTable {
            seq: 0,
            members: vec![Member::new(64, 128)],
            replicas: vec![ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(4)])],
        };
        let bytes = table.to_bytes().expect("encode");
        assert!(matches!(
            MemberTable::parse_from_bytes(&bytes),
            Err(ParseError::InvalidField {
                field: "replicas.devs",
                ..
            })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn gen_cmp_antisymmetric_off_the_half_way_point(a in any::<u8>(), b in any::<u8>()) {
            prop_assume!(a.wrapping_sub(b) != 128);
            prop_assert_eq!(gen_cmp(Gen(a), Gen(b)), -gen_cmp(Gen(b), Gen(a)));
        }

        #[test]
        fn gen_after_matches_positive_part(a in any::<u8>(), b in any::<u8>()) {
            let cmp = gen_cmp(Gen(a), Gen(b));
            prop_assert_eq!(i32::from(gen_after(Gen(a), Gen(b))), cmp.max(0));
            prop_assert!(gen_after(Gen(a), Gen(b)) == 0 || gen_after(Gen(b), Gen(a)) == 0);
        }

        #[test]
        fn next_gen_is_one_after(a in any::<u8>()) {
            prop_assert_eq!(gen_after(Gen(a).next(), Gen(a)), 1);
        }
    }
}

// Copyright 2024 Oxide Computer Company
//! On-disk format of a metadata copy
//!
//! Each copy occupies a fixed run of sectors on the spare device:
//!
//! ```text
//! | CopyHeader (bincode, HEADER_SIZE bytes) | body (data_length bytes) | 0 |
//! ```
//!
//! The body is the bincode-serialized [`MetadataSnapshot`].  The data
//! checksum covers the header fields (checksums excluded) followed by the
//! body; the header checksum covers the header fields followed by the data
//! checksum, so it is validated first and vouches for everything else in the
//! header.
use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::allocator::RemapEntry;
use crate::config::PersistedConfig;
use crate::health::HealthSummary;
use crate::{crc32, SpareError};

pub const METADATA_MAGIC: u32 = 0x5350_4d50;
pub const METADATA_VERSION: u32 = 1;
/// Size of a bincode-encoded [`CopyHeader`]
pub const HEADER_SIZE: usize = 40;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence_number: u64,
    pub copy_index: u32,
    pub timestamp: u64,
    pub data_length: u32,
    pub data_checksum: u32,
    pub header_checksum: u32,
}

/// The header without its checksums, as fed to both checksums
#[derive(Serialize)]
struct ChecksummedFields {
    magic: u32,
    version: u32,
    sequence_number: u64,
    copy_index: u32,
    timestamp: u64,
    data_length: u32,
}

impl CopyHeader {
    fn fields(&self) -> ChecksummedFields {
        ChecksummedFields {
            magic: self.magic,
            version: self.version,
            sequence_number: self.sequence_number,
            copy_index: self.copy_index,
            timestamp: self.timestamp,
            data_length: self.data_length,
        }
    }

    fn data_crc(&self, body: &[u8]) -> Result<u32, SpareError> {
        let fields = bincode::serialize(&self.fields())?;
        Ok(crc32(&[&fields, body]))
    }

    fn header_crc(&self) -> Result<u32, SpareError> {
        let fields = bincode::serialize(&self.fields())?;
        Ok(crc32(&[&fields, &self.data_checksum.to_le_bytes()]))
    }
}

/// Geometry of the devices a snapshot was written for
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub spare_id: Uuid,
    pub main_sectors: u64,
    pub spare_sectors: u64,
    pub sector_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub identity: DeviceIdentity,
    pub remaps: Vec<RemapEntry>,
    pub health: HealthSummary,
    pub config: PersistedConfig,
}

/// A copy which passed every check
#[derive(Clone, Debug)]
pub struct DecodedCopy {
    pub header: CopyHeader,
    /// Raw body bytes, for comparing copies without re-encoding
    pub body: Vec<u8>,
    pub snapshot: MetadataSnapshot,
}

impl DecodedCopy {
    /// Whether two copies carry the same write
    pub fn same_contents(&self, other: &DecodedCopy) -> bool {
        self.header.sequence_number == other.header.sequence_number
            && self.header.timestamp == other.header.timestamp
            && self.body == other.body
    }
}

/// Why a copy was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyFault {
    #[error("bad magic {0:#x}")]
    BadMagic(u32),

    #[error(
        "header checksum mismatch: stored {stored:#x}, computed {computed:#x}"
    )]
    HeaderChecksum { stored: u32, computed: u32 },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("data length {0} does not fit in the copy")]
    DataLength(u32),

    #[error(
        "data checksum mismatch: stored {stored:#x}, computed {computed:#x}"
    )]
    DataChecksum { stored: u32, computed: u32 },

    #[error("copy {found} found in slot {expected}")]
    MisplacedCopy { expected: u32, found: u32 },

    #[error("body decode failed: {0}")]
    Decode(String),
}

impl CopyFault {
    /// True if the header itself can't be trusted
    pub fn is_header_fault(&self) -> bool {
        matches!(
            self,
            CopyFault::BadMagic(_)
                | CopyFault::HeaderChecksum { .. }
                | CopyFault::UnsupportedVersion(_)
                | CopyFault::MisplacedCopy { .. }
        )
    }
}

/// Serializes `snapshot` into a buffer of exactly `copy_bytes` bytes
pub fn encode(
    snapshot: &MetadataSnapshot,
    sequence_number: u64,
    copy_index: u32,
    timestamp: u64,
    copy_bytes: usize,
) -> Result<Vec<u8>, SpareError> {
    let body = bincode::serialize(snapshot)?;
    if HEADER_SIZE + body.len() > copy_bytes {
        return Err(SpareError::GenericError(format!(
            "metadata snapshot of {} bytes does not fit in {} byte copy",
            body.len(),
            copy_bytes - HEADER_SIZE.min(copy_bytes),
        )));
    }

    let mut header = CopyHeader {
        magic: METADATA_MAGIC,
        version: METADATA_VERSION,
        sequence_number,
        copy_index,
        timestamp,
        data_length: body.len() as u32,
        data_checksum: 0,
        header_checksum: 0,
    };
    header.data_checksum = header.data_crc(&body)?;
    header.header_checksum = header.header_crc()?;

    let mut out = vec![0u8; copy_bytes];
    bincode::serialize_into(&mut out[..HEADER_SIZE], &header)?;
    out[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(&body);
    Ok(out)
}

/// Validates and decodes the copy in `buf`, which was read from slot
/// `expected_index`.
pub fn decode(
    buf: &[u8],
    expected_index: u32,
) -> Result<DecodedCopy, CopyFault> {
    if buf.len() < HEADER_SIZE {
        return Err(CopyFault::DataLength(0));
    }
    let header: CopyHeader = bincode::deserialize(&buf[..HEADER_SIZE])
        .map_err(|e| CopyFault::Decode(e.to_string()))?;

    if header.magic != METADATA_MAGIC {
        return Err(CopyFault::BadMagic(header.magic));
    }
    let computed = header
        .header_crc()
        .map_err(|e| CopyFault::Decode(e.to_string()))?;
    if computed != header.header_checksum {
        return Err(CopyFault::HeaderChecksum {
            stored: header.header_checksum,
            computed,
        });
    }
    if header.version != METADATA_VERSION {
        return Err(CopyFault::UnsupportedVersion(header.version));
    }

    let len = header.data_length as usize;
    if HEADER_SIZE + len > buf.len() {
        return Err(CopyFault::DataLength(header.data_length));
    }
    let body = &buf[HEADER_SIZE..HEADER_SIZE + len];
    let computed = header
        .data_crc(body)
        .map_err(|e| CopyFault::Decode(e.to_string()))?;
    if computed != header.data_checksum {
        return Err(CopyFault::DataChecksum {
            stored: header.data_checksum,
            computed,
        });
    }

    if header.copy_index != expected_index {
        return Err(CopyFault::MisplacedCopy {
            expected: expected_index,
            found: header.copy_index,
        });
    }

    let snapshot: MetadataSnapshot = bincode::deserialize(body)
        .map_err(|e| CopyFault::Decode(e.to_string()))?;
    Ok(DecodedCopy {
        header,
        body: body.to_vec(),
        snapshot,
    })
}

/// Picks the authoritative copy: highest sequence number, then newest
/// timestamp, then lowest copy index.
pub fn select_best<'a, I>(copies: I) -> Option<&'a DecodedCopy>
where
    I: IntoIterator<Item = &'a DecodedCopy>,
{
    copies.into_iter().max_by_key(|c| {
        (
            c.header.sequence_number,
            c.header.timestamp,
            Reverse(c.header.copy_index),
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::allocator::RemapReason;
    use crate::config::EngineConfig;
    use proptest::prelude::*;
    use test_strategy::proptest;

    const COPY_BYTES: usize = 4096;

    fn snapshot(remaps: u64) -> MetadataSnapshot {
        MetadataSnapshot {
            identity: DeviceIdentity {
                spare_id: Uuid::new_v4(),
                main_sectors: 10_000,
                spare_sectors: 20_000,
                sector_size: 512,
            },
            remaps: (0..remaps)
                .map(|i| RemapEntry {
                    original_sector: i * 3,
                    spare_sector: 9000 + i,
                    creation_timestamp: 77,
                    access_count: 0,
                    error_count: 1,
                    reason: RemapReason::ReadError,
                    flags: 0,
                })
                .collect(),
            health: HealthSummary {
                tracked_sectors: 12,
                scan_cursor: 400,
                ..Default::default()
            },
            config: EngineConfig::default().persisted(),
        }
    }

    #[test]
    fn header_size_matches_encoding() {
        let h = CopyHeader {
            magic: 0,
            version: 0,
            sequence_number: 0,
            copy_index: 0,
            timestamp: 0,
            data_length: 0,
            data_checksum: 0,
            header_checksum: 0,
        };
        assert_eq!(bincode::serialize(&h).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode() {
        let snap = snapshot(5);
        let buf = encode(&snap, 9, 2, 1234, COPY_BYTES).unwrap();
        assert_eq!(buf.len(), COPY_BYTES);
        let c = decode(&buf, 2).unwrap();
        assert_eq!(c.snapshot, snap);
        assert_eq!(c.header.sequence_number, 9);
        assert_eq!(c.header.copy_index, 2);
        assert_eq!(c.header.timestamp, 1234);
    }

    #[test]
    fn too_large_snapshot_rejected() {
        let snap = snapshot(200);
        assert!(encode(&snap, 0, 0, 0, 1024).is_err());
    }

    #[test]
    fn zeroed_copy_is_bad_magic() {
        let buf = vec![0u8; COPY_BYTES];
        assert_eq!(decode(&buf, 0).unwrap_err(), CopyFault::BadMagic(0));
    }

    #[test]
    fn header_corruption_detected_first() {
        let mut buf = encode(&snapshot(1), 1, 0, 5, COPY_BYTES).unwrap();
        // Flip a bit in the sequence number and one in the body
        buf[8] ^= 1;
        buf[HEADER_SIZE + 3] ^= 0x80;
        let err = decode(&buf, 0).unwrap_err();
        assert!(matches!(err, CopyFault::HeaderChecksum { .. }));
        assert!(err.is_header_fault());
    }

    #[test]
    fn body_corruption_detected() {
        let mut buf = encode(&snapshot(3), 1, 0, 5, COPY_BYTES).unwrap();
        buf[HEADER_SIZE + 10] ^= 0x01;
        let err = decode(&buf, 0).unwrap_err();
        assert!(matches!(err, CopyFault::DataChecksum { .. }));
        assert!(!err.is_header_fault());
    }

    #[test]
    fn padding_is_not_checksummed() {
        let mut buf = encode(&snapshot(1), 1, 0, 5, COPY_BYTES).unwrap();
        buf[COPY_BYTES - 1] = 0xff;
        decode(&buf, 0).unwrap();
    }

    #[test]
    fn copy_in_wrong_slot_rejected() {
        let buf = encode(&snapshot(1), 1, 3, 5, COPY_BYTES).unwrap();
        assert_eq!(
            decode(&buf, 1).unwrap_err(),
            CopyFault::MisplacedCopy {
                expected: 1,
                found: 3
            }
        );
    }

    #[test]
    fn selection_order() {
        let snap = snapshot(0);
        let copy = |seq, ts, idx| {
            decode(&encode(&snap, seq, idx, ts, COPY_BYTES).unwrap(), idx)
                .unwrap()
        };
        let copies = [copy(4, 10, 0), copy(5, 9, 1), copy(5, 9, 2)];
        let best = select_best(&copies).unwrap();
        assert_eq!(best.header.copy_index, 1);

        let copies = [copy(5, 9, 1), copy(5, 11, 4), copy(3, 99, 0)];
        assert_eq!(select_best(&copies).unwrap().header.copy_index, 4);

        let none: [DecodedCopy; 0] = [];
        assert!(select_best(&none).is_none());
    }

    #[proptest]
    fn selection_independent_of_order(
        #[strategy(proptest::collection::vec((0u64..4, 0u64..4), 5))]
        versions: Vec<(u64, u64)>,
        #[strategy(Just((0..5usize).collect::<Vec<_>>()).prop_shuffle())]
        order: Vec<usize>,
    ) {
        let snap = snapshot(0);
        let copies: Vec<DecodedCopy> = versions
            .iter()
            .enumerate()
            .map(|(i, (seq, ts))| {
                let buf =
                    encode(&snap, *seq, i as u32, *ts, COPY_BYTES).unwrap();
                decode(&buf, i as u32).unwrap()
            })
            .collect();

        let expected = select_best(&copies).unwrap().header;
        let shuffled: Vec<DecodedCopy> =
            order.iter().map(|&i| copies[i].clone()).collect();
        prop_assert_eq!(select_best(&shuffled).unwrap().header, expected);

        // Nothing beats the winner
        for c in &copies {
            let key = (c.header.sequence_number, c.header.timestamp);
            prop_assert!(key <= (expected.sequence_number, expected.timestamp));
            if key == (expected.sequence_number, expected.timestamp) {
                prop_assert!(c.header.copy_index >= expected.copy_index);
            }
        }
    }
}

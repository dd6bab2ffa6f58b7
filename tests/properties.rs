//! Property tests for the pure pieces: request splitting and the on-disk
//! header codec.

use proptest::prelude::*;

use deltadisk::core::types::Generation;
use deltadisk::engine::split_extents;
use deltadisk::format::{DeltaHeader, HEADER_CRC_OFFSET};

proptest! {
    /// Splitting covers the input range exactly, in order, and no extent
    /// crosses a cluster boundary.
    #[test]
    fn prop_split_covers_exactly(
        offset in 0u64..1_000_000,
        len in 0u64..10_000,
        shift in 3u32..12,
    ) {
        let per_cluster = 1u64 << shift;
        let extents = split_extents(offset, len, shift);

        let mut at = offset;
        for extent in &extents {
            prop_assert!(extent.sectors > 0);
            prop_assert_eq!(extent.cluster, at >> shift);
            prop_assert_eq!(extent.offset_sectors as u64, at & (per_cluster - 1));
            // Never crosses a cluster boundary.
            prop_assert!(extent.offset_sectors as u64 + extent.sectors as u64 <= per_cluster);
            at += extent.sectors as u64;
        }
        prop_assert_eq!(at, offset + len);

        // One sub-request per touched cluster.
        if len > 0 {
            let first = offset >> shift;
            let last = (offset + len - 1) >> shift;
            prop_assert_eq!(extents.len() as u64, last - first + 1);
        } else {
            prop_assert!(extents.is_empty());
        }
    }

    /// Header encode/decode is the identity over valid headers.
    #[test]
    fn prop_header_roundtrip(
        shift in 3u32..=21,
        clusters in 1u64..1_000_000,
        generation in 0u64..1_000_000_000,
        flags in 0u32..4,
    ) {
        let header = DeltaHeader {
            cluster_shift: shift,
            virtual_clusters: clusters,
            generation: Generation(generation),
            bat_entries: clusters as u32,
            flags,
        };
        let decoded = DeltaHeader::decode(&header.encode()).unwrap();
        prop_assert_eq!(decoded, header);
    }

    /// Any single-byte corruption of the CRC-covered region is detected.
    #[test]
    fn prop_header_detects_corruption(
        at in 0usize..HEADER_CRC_OFFSET,
        flip in 1u8..=255,
    ) {
        let header = DeltaHeader {
            cluster_shift: 11,
            virtual_clusters: 4096,
            generation: Generation(7),
            bat_entries: 4096,
            flags: 0,
        };
        let mut buf = header.encode();
        buf[at] ^= flip;
        prop_assert!(DeltaHeader::decode(&buf).is_err());
    }
}

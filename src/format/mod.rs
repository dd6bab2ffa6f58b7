//! Byte-exact on-disk layout of an image delta
//!
//! An image file is laid out as a header cluster, a BAT region, and a data
//! region, all little-endian:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Header (cluster 0)                                   │
//! │   magic[16] version cluster_shift virtual_size       │
//! │   generation bat_entries flags crc32 … zero padding  │
//! ├──────────────────────────────────────────────────────┤
//! │ BAT region: 4 KiB pages                              │
//! │   each page: generation stamp (u64) + 1022 × u32     │
//! ├──────────────────────────────────────────────────────┤
//! │ Data region: physical cluster n at byte n·cluster    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A BAT entry of 0 means "hole". A BAT page whose embedded generation
//! stamp exceeds the header generation was written by a commit that never
//! became durable and is treated as all-hole on load.

use crate::core::error::{Error, Result};
use crate::core::types::{cluster_bytes, Generation, MAX_CLUSTER_SHIFT, MIN_CLUSTER_SHIFT};

/// Image magic, first 16 bytes of the file.
pub const DELTA_MAGIC: &[u8; 16] = b"DeltaDiskImage\0\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header flag: this image is a base layer (has no parent).
pub const FLAG_BASE: u32 = 1;

/// Size of one BAT page on disk.
pub const BAT_PAGE_SIZE: usize = 4096;

/// Bytes reserved at the head of each BAT page for the generation stamp.
pub const BAT_PAGE_STAMP: usize = 8;

/// Mapping entries held by one BAT page.
pub const BAT_ENTRIES_PER_PAGE: usize = (BAT_PAGE_SIZE - BAT_PAGE_STAMP) / 4;

/// Fixed header fields end here; the CRC covers bytes `0..HEADER_CRC_OFFSET`.
pub const HEADER_CRC_OFFSET: usize = 48;

/// On-disk header of an image delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    /// log2 of the cluster size in 512-byte sectors
    pub cluster_shift: u32,
    /// Size of the virtual disk this delta represents, in clusters
    pub virtual_clusters: u64,
    /// Highest durably committed metadata generation
    pub generation: Generation,
    /// Number of BAT entries (one per addressable logical cluster)
    pub bat_entries: u32,
    /// Header flags ([`FLAG_BASE`])
    pub flags: u32,
}

impl DeltaHeader {
    /// Encode into a full header page. Only the first [`BAT_PAGE_SIZE`]
    /// bytes of the header cluster carry data; the rest is zero padding.
    pub fn encode(&self) -> [u8; BAT_PAGE_SIZE] {
        let mut buf = [0u8; BAT_PAGE_SIZE];
        buf[0..16].copy_from_slice(DELTA_MAGIC);
        buf[16..20].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[20..24].copy_from_slice(&self.cluster_shift.to_le_bytes());
        buf[24..32].copy_from_slice(&self.virtual_clusters.to_le_bytes());
        buf[32..40].copy_from_slice(&self.generation.0.to_le_bytes());
        buf[40..44].copy_from_slice(&self.bat_entries.to_le_bytes());
        buf[44..48].copy_from_slice(&self.flags.to_le_bytes());
        let crc = crc32(&buf[..HEADER_CRC_OFFSET]);
        buf[48..52].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and validate a header from the first page of the file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_CRC_OFFSET + 4 {
            return Err(Error::CorruptHeader("header truncated".into()));
        }
        if &buf[0..16] != DELTA_MAGIC {
            return Err(Error::CorruptHeader("bad magic".into()));
        }
        let stored_crc = u32::from_le_bytes(buf[48..52].try_into().expect("fixed slice"));
        if crc32(&buf[..HEADER_CRC_OFFSET]) != stored_crc {
            return Err(Error::CorruptHeader("crc mismatch".into()));
        }
        let version = u32::from_le_bytes(buf[16..20].try_into().expect("fixed slice"));
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        let header = DeltaHeader {
            cluster_shift: u32::from_le_bytes(buf[20..24].try_into().expect("fixed slice")),
            virtual_clusters: u64::from_le_bytes(buf[24..32].try_into().expect("fixed slice")),
            generation: Generation(u64::from_le_bytes(
                buf[32..40].try_into().expect("fixed slice"),
            )),
            bat_entries: u32::from_le_bytes(buf[40..44].try_into().expect("fixed slice")),
            flags: u32::from_le_bytes(buf[44..48].try_into().expect("fixed slice")),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_shift < MIN_CLUSTER_SHIFT || self.cluster_shift > MAX_CLUSTER_SHIFT {
            return Err(Error::CorruptHeader(format!(
                "cluster shift {} out of range",
                self.cluster_shift
            )));
        }
        if self.virtual_clusters > u32::MAX as u64 {
            return Err(Error::CorruptHeader(
                "virtual size exceeds addressable clusters".into(),
            ));
        }
        if (self.bat_entries as u64) < self.virtual_clusters {
            return Err(Error::CorruptHeader(
                "BAT shorter than virtual size".into(),
            ));
        }
        Ok(())
    }
}

/// Number of BAT pages needed for `bat_entries` entries.
pub fn bat_pages(bat_entries: u32) -> u32 {
    (bat_entries as u64).div_ceil(BAT_ENTRIES_PER_PAGE as u64) as u32
}

/// Byte offset of BAT page `page` within the file.
pub fn bat_page_offset(cluster_shift: u32, page: u32) -> u64 {
    cluster_bytes(cluster_shift) + page as u64 * BAT_PAGE_SIZE as u64
}

/// First physical cluster index usable for data: everything below it is
/// occupied by the header cluster and the BAT region.
pub fn first_data_cluster(cluster_shift: u32, bat_entries: u32) -> u32 {
    let meta_bytes =
        cluster_bytes(cluster_shift) + bat_pages(bat_entries) as u64 * BAT_PAGE_SIZE as u64;
    meta_bytes.div_ceil(cluster_bytes(cluster_shift)) as u32
}

/// BAT page index and in-page slot for a logical cluster.
pub fn bat_position(cluster: u64) -> (u32, usize) {
    (
        (cluster / BAT_ENTRIES_PER_PAGE as u64) as u32,
        (cluster % BAT_ENTRIES_PER_PAGE as u64) as usize,
    )
}

/// Encode a BAT page: generation stamp followed by entries.
///
/// `entries` shorter than a full page is zero-extended (trailing holes).
pub fn encode_bat_page(generation: Generation, entries: &[u32]) -> [u8; BAT_PAGE_SIZE] {
    let mut buf = [0u8; BAT_PAGE_SIZE];
    buf[0..8].copy_from_slice(&generation.0.to_le_bytes());
    for (i, entry) in entries.iter().take(BAT_ENTRIES_PER_PAGE).enumerate() {
        let at = BAT_PAGE_STAMP + i * 4;
        buf[at..at + 4].copy_from_slice(&entry.to_le_bytes());
    }
    buf
}

/// Decode a BAT page into its generation stamp and entries.
pub fn decode_bat_page(buf: &[u8; BAT_PAGE_SIZE]) -> (Generation, Vec<u32>) {
    let stamp = Generation(u64::from_le_bytes(
        buf[0..8].try_into().expect("fixed slice"),
    ));
    let mut entries = Vec::with_capacity(BAT_ENTRIES_PER_PAGE);
    for i in 0..BAT_ENTRIES_PER_PAGE {
        let at = BAT_PAGE_STAMP + i * 4;
        entries.push(u32::from_le_bytes(
            buf[at..at + 4].try_into().expect("fixed slice"),
        ));
    }
    (stamp, entries)
}

/// CRC32 (reflected, polynomial 0xEDB88320) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB88320;
    let mut crc: u32 = 0xFFFFFFFF;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }

    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_vectors() {
        // Standard CRC32 test vectors
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b"The quick brown fox jumps over the lazy dog"), 0x414FA339);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DeltaHeader {
            cluster_shift: 11,
            virtual_clusters: 4096,
            generation: Generation(17),
            bat_entries: 4096,
            flags: FLAG_BASE,
        };
        let buf = header.encode();
        let decoded = DeltaHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_corruption() {
        let header = DeltaHeader {
            cluster_shift: 11,
            virtual_clusters: 16,
            generation: Generation(1),
            bat_entries: 16,
            flags: 0,
        };
        let mut buf = header.encode();

        // Flip one bit inside the CRC-covered region.
        buf[24] ^= 0x01;
        assert!(matches!(
            DeltaHeader::decode(&buf),
            Err(Error::CorruptHeader(_))
        ));

        // Bad magic.
        let mut buf = header.encode();
        buf[0] = b'X';
        assert!(matches!(
            DeltaHeader::decode(&buf),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_header_rejects_future_version() {
        let header = DeltaHeader {
            cluster_shift: 11,
            virtual_clusters: 16,
            generation: Generation(1),
            bat_entries: 16,
            flags: 0,
        };
        let mut buf = header.encode();
        buf[16..20].copy_from_slice(&2u32.to_le_bytes());
        let crc = crc32(&buf[..HEADER_CRC_OFFSET]);
        buf[48..52].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            DeltaHeader::decode(&buf),
            Err(Error::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_bat_page_roundtrip() {
        let mut entries = vec![0u32; BAT_ENTRIES_PER_PAGE];
        entries[0] = 7;
        entries[1021] = 99;
        let buf = encode_bat_page(Generation(5), &entries);
        let (stamp, decoded) = decode_bat_page(&buf);
        assert_eq!(stamp, Generation(5));
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_geometry() {
        assert_eq!(bat_pages(1), 1);
        assert_eq!(bat_pages(1022), 1);
        assert_eq!(bat_pages(1023), 2);
        assert_eq!(bat_position(0), (0, 0));
        assert_eq!(bat_position(1022), (1, 0));

        // 1 MiB clusters: the header occupies cluster 0, the single BAT
        // page sits at the start of cluster 1, data starts at cluster 2.
        assert_eq!(first_data_cluster(11, 1022), 2);

        // 4 KiB clusters: header is cluster 0, each BAT page is exactly one
        // cluster.
        assert_eq!(first_data_cluster(3, 1022), 2);
        assert_eq!(first_data_cluster(3, 1023), 3);
    }
}

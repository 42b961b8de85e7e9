#![forbid(unsafe_code)]
//! Core domain types for the Scour workspace.
//!
//! Offset and identifier newtypes, on-disk geometry constants, extent flags,
//! little-endian parse helpers, and the wire-stable scrub progress record.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed page size; every buffer the scrubber moves is a multiple of this.
pub const PAGE_SIZE: u32 = 4096;

/// Pages packed into one read batch (128 KiB per submitted I/O).
pub const PAGES_PER_RD_BATCH: usize = 32;
/// Pages packed into one replace-target write batch.
pub const PAGES_PER_WR_BATCH: usize = 32;

/// Upper bound on pages per logical block. `MAX_PAGES_PER_BLOCK * PAGE_SIZE`
/// must cover the largest node/leaf/sector size supported.
pub const MAX_PAGES_PER_BLOCK: usize = 16;

/// Contiguous device range covered by one RAID mapping on one mirror.
pub const STRIPE_LEN: u64 = 64 * 1024;

/// Mirrors a logical block may have (copies, not counting a replace target).
pub const MAX_MIRRORS: usize = 3;

/// Hard ceiling on the adaptive batch pool.
pub const MAX_BATCH_POOL: u16 = 1024;
/// Steady-state pool size when no deadline is set.
pub const DEFAULT_BATCH_POOL: u16 = 64;

/// Size of one super block copy on disk.
pub const SUPER_INFO_SIZE: u32 = 4096;
/// Fixed byte offsets of the super block mirrors, clipped to device size.
pub const SUPER_OFFSETS: [u64; 3] = [64 * 1024, 64 * 1024 * 1024, 256 * 1024 * 1024 * 1024];

/// On-disk checksum slot width. Only the first `CSUM_SIZE` bytes carry the
/// CRC32C; the rest is zero padding.
pub const CSUM_SLOT_SIZE: usize = 32;
/// Bytes of the slot actually compared (CRC32C).
pub const CSUM_SIZE: usize = 4;

/// Identifier of a device inside a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevId(pub u64);

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Logical byte address in the volume's unified address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Logical(pub u64);

impl Logical {
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for Logical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical byte offset on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Physical(pub u64);

impl fmt::Display for Physical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mirror number, 1-based like the RAID mapper reports it. Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MirrorNum(pub u8);

impl MirrorNum {
    /// 0-based index into per-mirror arrays.
    #[must_use]
    pub fn index(self) -> usize {
        debug_assert!(self.0 >= 1);
        usize::from(self.0.saturating_sub(1))
    }
}

/// Transaction generation counter carried by extents and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

/// Inode number, used for warning path resolution and event lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNum(pub u64);

// ── Extent flags ────────────────────────────────────────────────────────────

/// Extent flag bits carried on every scrub page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentFlags(pub u64);

impl ExtentFlags {
    pub const DATA: Self = Self(1 << 0);
    pub const TREE_BLOCK: Self = Self(1 << 1);
    /// Internal marker for super block copies; never stored in the extent
    /// index, only set by the super pass.
    pub const SUPER: Self = Self(1 << 48);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        self.contains(Self::DATA)
    }

    #[must_use]
    pub fn is_tree_block(self) -> bool {
        self.contains(Self::TREE_BLOCK)
    }

    #[must_use]
    pub fn is_super(self) -> bool {
        self.contains(Self::SUPER)
    }
}

/// Background scheduling flags accepted by scrub start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgFlags(pub u8);

impl BgFlags {
    /// Pre-enumerate device extents to refine the byte target.
    pub const ENUM: Self = Self(1 << 0);
    /// Allow an I/O-priority boost when progress falls far behind.
    pub const BOOST: Self = Self(1 << 1);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Validated block-size pair for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    sectorsize: u32,
    nodesize: u32,
}

impl VolumeGeometry {
    /// Validate the geometry the walker depends on: sector size equals the
    /// page size, node size is a power-of-two multiple of it, and both fit a
    /// single scrub block.
    pub fn new(sectorsize: u32, nodesize: u32) -> Result<Self, ParseError> {
        if sectorsize != PAGE_SIZE {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must equal the page size",
            });
        }
        if !nodesize.is_power_of_two() || nodesize < sectorsize {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be a power of two >= sectorsize",
            });
        }
        let max_block = PAGE_SIZE * MAX_PAGES_PER_BLOCK as u32;
        if nodesize > max_block || sectorsize > max_block {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds max pages per block",
            });
        }
        if u64::from(nodesize) > STRIPE_LEN {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds stripe length",
            });
        }
        Ok(Self {
            sectorsize,
            nodesize,
        })
    }

    #[must_use]
    pub fn sectorsize(self) -> u32 {
        self.sectorsize
    }

    #[must_use]
    pub fn nodesize(self) -> u32 {
        self.nodesize
    }

    /// Block size for an extent with the given flags: sector for data,
    /// node for metadata.
    #[must_use]
    pub fn block_size_for(self, flags: ExtentFlags) -> u32 {
        if flags.is_tree_block() {
            self.nodesize
        } else {
            self.sectorsize
        }
    }
}

// ── Parse helpers ───────────────────────────────────────────────────────────

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

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "offset + len overflows",
    })?;
    data.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len(),
    })
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut buf = [0_u8; N];
    buf.copy_from_slice(bytes);
    Ok(buf)
}

// ── Progress record ─────────────────────────────────────────────────────────

/// Wire-stable statistics snapshot for one scrub run.
///
/// All counters are cumulative for the run. `last_physical` is a cursor, not
/// a counter, and is the only field two clean back-to-back runs may differ
/// in besides nothing at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubProgress {
    pub data_extents_scrubbed: u64,
    pub tree_extents_scrubbed: u64,
    pub data_bytes_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    pub data_bytes_verified: u64,
    pub tree_bytes_verified: u64,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
    pub super_errors: u64,
    pub no_csum: u64,
    pub csum_discards: u64,
    pub corrected_errors: u64,
    pub uncorrectable_errors: u64,
    pub unverified_errors: u64,
    pub malloc_errors: u64,
    pub last_physical: u64,
    pub sync_errors: u64,
}

impl ScrubProgress {
    /// Bytes counted toward the rate controller's progress figure.
    #[must_use]
    pub fn bytes_scrubbed(&self) -> u64 {
        self.data_bytes_scrubbed + self.tree_bytes_scrubbed
    }

    /// True when no fault of any kind was recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.read_errors == 0
            && self.csum_errors == 0
            && self.verify_errors == 0
            && self.super_errors == 0
            && self.corrected_errors == 0
            && self.uncorrectable_errors == 0
            && self.unverified_errors == 0
            && self.malloc_errors == 0
    }
}

impl fmt::Display for ScrubProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scrubbed {} data + {} tree bytes, {} corrected, {} uncorrectable, {} unverified",
            self.data_bytes_scrubbed,
            self.tree_bytes_scrubbed,
            self.corrected_errors,
            self.uncorrectable_errors,
            self.unverified_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_accepts_page_sized_sectors() {
        let geo = VolumeGeometry::new(4096, 16384).expect("valid geometry");
        assert_eq!(geo.sectorsize(), 4096);
        assert_eq!(geo.nodesize(), 16384);
        assert_eq!(geo.block_size_for(ExtentFlags::DATA), 4096);
        assert_eq!(geo.block_size_for(ExtentFlags::TREE_BLOCK), 16384);
    }

    #[test]
    fn geometry_rejects_oversized_nodes() {
        // Larger than MAX_PAGES_PER_BLOCK pages.
        assert!(VolumeGeometry::new(4096, 128 * 1024).is_err());
        // Not a power of two.
        assert!(VolumeGeometry::new(4096, 12288).is_err());
        // Sector below page size.
        assert!(VolumeGeometry::new(512, 16384).is_err());
    }

    #[test]
    fn extent_flags_distinguish_kinds() {
        assert!(ExtentFlags::DATA.is_data());
        assert!(!ExtentFlags::DATA.is_tree_block());
        assert!(ExtentFlags::TREE_BLOCK.is_tree_block());
        assert!(ExtentFlags::SUPER.is_super());
        let both = ExtentFlags(ExtentFlags::DATA.0 | ExtentFlags::SUPER.0);
        assert!(both.is_data() && both.is_super());
    }

    #[test]
    fn mirror_num_is_one_based() {
        assert_eq!(MirrorNum(1).index(), 0);
        assert_eq!(MirrorNum(3).index(), 2);
    }

    #[test]
    fn le_helpers_reject_short_input() {
        let data = [1_u8, 2, 3];
        assert!(read_le_u32(&data, 0).is_err());
        assert_eq!(read_le_u32(&[5, 0, 0, 0], 0).unwrap(), 5);
        assert!(read_le_u64(&data, 0).is_err());
    }

    #[test]
    fn progress_bytes_and_cleanliness() {
        let mut p = ScrubProgress::default();
        assert!(p.is_clean());
        p.data_bytes_scrubbed = 100;
        p.tree_bytes_scrubbed = 28;
        assert_eq!(p.bytes_scrubbed(), 128);
        p.csum_errors = 1;
        assert!(!p.is_clean());
    }

    #[test]
    fn progress_serializes_stably() {
        let p = ScrubProgress {
            data_bytes_scrubbed: 512 * 1024,
            corrected_errors: 1,
            ..ScrubProgress::default()
        };
        let json = serde_json::to_string(&p).expect("serialize");
        let back: ScrubProgress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(p, back);
    }
}

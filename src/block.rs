//! On-flash block layout
//!
//! Every write-granularity block on the device is self-describing: the first
//! 64 bits are a packed header `kind:2 | level:6 | start:56`, the rest is
//! kind-specific payload. Mapping-table pages carry a dense array of 8-byte
//! child addresses; segment-metadata blocks carry a serialized
//! [`SegmentMeta`] record. Erased flash is recognized by its first 32-bit
//! word reading all ones.

use serde::{Deserialize, Serialize};

use crate::common::{Address, FlashMapError, Result};

/// Size of the packed block header prefix.
pub const BLOCK_HEADER_SIZE: usize = 8;

const KIND_BITS: u64 = 2;
const LEVEL_BITS: u64 = 6;
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;

/// Maximum tree level representable in the header's 6-bit field.
pub const MAX_LEVEL: u8 = (1 << LEVEL_BITS) - 1;

/// What a block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Mapping-table page; `start` is the low bound of its logical range
    Mt = 0,
    /// User data page; `start` is its logical page address
    Data = 1,
    /// Per-segment metadata record
    SegMeta = 2,
}

impl BlockKind {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(BlockKind::Mt),
            1 => Some(BlockKind::Data),
            2 => Some(BlockKind::SegMeta),
            _ => None,
        }
    }
}

/// Decoded form of the 64-bit header prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BlockKind,
    /// Tree depth for MT pages; the root is level 0
    pub level: u8,
    /// Start of the covered logical range (MT) or the logical address (data)
    pub start: u64,
}

impl BlockHeader {
    pub fn new(kind: BlockKind, level: u8, start: u64) -> Self {
        debug_assert!(level <= MAX_LEVEL);
        debug_assert!(start < (1 << 56));
        Self { kind, level, start }
    }

    /// Pack into the on-flash 64-bit representation.
    pub fn pack(&self) -> u64 {
        (self.kind as u64 & KIND_MASK)
            | ((u64::from(self.level) & LEVEL_MASK) << KIND_BITS)
            | (self.start << (KIND_BITS + LEVEL_BITS))
    }

    /// Decode a packed header word. Returns `None` for undefined kind bits
    /// (which is what an erased word decodes to).
    pub fn unpack(word: u64) -> Option<Self> {
        let kind = BlockKind::from_bits(word & KIND_MASK)?;
        Some(Self {
            kind,
            level: ((word >> KIND_BITS) & LEVEL_MASK) as u8,
            start: word >> (KIND_BITS + LEVEL_BITS),
        })
    }

    /// Decode the header prefix of a block buffer.
    pub fn read_from(block: &[u8]) -> Option<Self> {
        let word = u64::from_le_bytes(block[..BLOCK_HEADER_SIZE].try_into().ok()?);
        Self::unpack(word)
    }

    /// Stamp this header onto a block buffer, leaving the payload untouched.
    pub fn write_to(&self, block: &mut [u8]) {
        block[..BLOCK_HEADER_SIZE].copy_from_slice(&self.pack().to_le_bytes());
    }
}

/// An erased block reads back as all ones; testing the first 32-bit word is
/// enough since no valid header packs to that pattern.
pub fn is_erased(block: &[u8]) -> bool {
    block.len() >= 4 && block[..4] == [crate::device::ERASED_BYTE; 4]
}

/// Number of child entries a mapping page of `block_size` holds.
pub fn fanout(block_size: u32) -> u32 {
    (block_size as usize - BLOCK_HEADER_SIZE) as u32 / std::mem::size_of::<Address>() as u32
}

/// Read child entry `index` from a mapping page.
pub fn entry_slot(block: &[u8], index: usize) -> Address {
    let off = BLOCK_HEADER_SIZE + index * std::mem::size_of::<Address>();
    u64::from_le_bytes(block[off..off + 8].try_into().unwrap())
}

/// Write child entry `index` of a mapping page.
pub fn set_entry_slot(block: &mut [u8], index: usize, addr: Address) {
    let off = BLOCK_HEADER_SIZE + index * std::mem::size_of::<Address>();
    block[off..off + 8].copy_from_slice(&addr.to_le_bytes());
}

/// Reset every child entry of a mapping page to [`INVALID_ADDRESS`],
/// leaving the header prefix alone.
pub fn fill_payload_unallocated(block: &mut [u8]) {
    block[BLOCK_HEADER_SIZE..].fill(crate::device::ERASED_BYTE);
}

/// Per-segment metadata record, stored in the first write-granularity slot
/// of each segment. The geometry echo lets reopen detect a parameter
/// mismatch before trusting anything else in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub kind: u8,
    pub contains_checkpoint: bool,
    pub block_size: u32,
    pub npage_mappings: u32,
    /// Log tail at the moment this segment was opened
    pub tail_offset: u64,
    /// Monotonic segment sequence number; recovery picks the maximum
    pub seq_num: u64,
}

impl SegmentMeta {
    pub fn new(block_size: u32, npage_mappings: u32) -> Self {
        Self {
            kind: BlockKind::SegMeta as u8,
            contains_checkpoint: true,
            block_size,
            npage_mappings,
            tail_offset: 0,
            seq_num: 0,
        }
    }

    /// Serialize into a zeroed write-granularity buffer.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        let encoded = bincode::serialize(self)?;
        if encoded.len() > buf.len() {
            return Err(FlashMapError::InvariantViolated {
                message: format!(
                    "segment metadata ({} bytes) exceeds one write-granularity slot ({} bytes)",
                    encoded.len(),
                    buf.len()
                ),
            });
        }
        buf.fill(0);
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }

    /// Decode the record at the start of a segment. Returns `None` for
    /// erased slots and anything that does not validate as segment
    /// metadata, so a recovery scan can just skip them.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if is_erased(buf) {
            return None;
        }
        let meta: SegmentMeta = bincode::deserialize(buf).ok()?;
        if meta.kind != BlockKind::SegMeta as u8 {
            return None;
        }
        Some(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::INVALID_ADDRESS;

    #[test]
    fn test_header_roundtrip() {
        let header = BlockHeader::new(BlockKind::Mt, 3, 294);
        let unpacked = BlockHeader::unpack(header.pack()).unwrap();
        assert_eq!(unpacked, header);
    }

    #[test]
    fn test_header_in_block() {
        let mut block = vec![0u8; 64];
        BlockHeader::new(BlockKind::Data, 0, 1 << 40).write_to(&mut block);

        let read = BlockHeader::read_from(&block).unwrap();
        assert_eq!(read.kind, BlockKind::Data);
        assert_eq!(read.start, 1 << 40);
    }

    #[test]
    fn test_erased_block_has_no_header() {
        let block = vec![0xFFu8; 64];
        assert!(is_erased(&block));
        assert!(BlockHeader::read_from(&block).is_none());
    }

    #[test]
    fn test_entry_slots() {
        let mut block = vec![0u8; 64];
        BlockHeader::new(BlockKind::Mt, 1, 0).write_to(&mut block);
        fill_payload_unallocated(&mut block);

        assert_eq!(fanout(64), 7);
        for i in 0..7 {
            assert_eq!(entry_slot(&block, i), INVALID_ADDRESS);
        }

        set_entry_slot(&mut block, 3, 4096);
        assert_eq!(entry_slot(&block, 3), 4096);
        assert_eq!(entry_slot(&block, 2), INVALID_ADDRESS);
        // header prefix untouched
        assert_eq!(BlockHeader::read_from(&block).unwrap().level, 1);
    }

    #[test]
    fn test_segment_meta_roundtrip() {
        let mut meta = SegmentMeta::new(64, 64);
        meta.tail_offset = 8192;
        meta.seq_num = 17;

        let mut buf = vec![0u8; 64];
        meta.encode_into(&mut buf).unwrap();
        assert_eq!(SegmentMeta::decode(&buf), Some(meta));
    }

    #[test]
    fn test_segment_meta_rejects_erased_and_garbage() {
        let erased = vec![0xFFu8; 64];
        assert!(SegmentMeta::decode(&erased).is_none());

        let mut mt_page = vec![0u8; 64];
        BlockHeader::new(BlockKind::Mt, 2, 49).write_to(&mut mt_page);
        assert!(SegmentMeta::decode(&mt_page).is_none());
    }

    #[test]
    fn test_meta_fits_in_granularity() {
        let meta = SegmentMeta::new(64, 64);
        let encoded = bincode::serialize(&meta).unwrap();
        assert!(encoded.len() <= 64);
    }
}

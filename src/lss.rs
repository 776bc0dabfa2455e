//! Log-structured store
//!
//! Appends write-granularity blocks at a head offset that circles through
//! the device's erase segments. Space is reclaimed at the tail: a block
//! found there is copied forward if the mapping tree still references it,
//! and the move is remembered in a small relocation buffer that is drained
//! back into the tree later. Each segment opens with a metadata record;
//! recovery scans those records, picks the newest checkpointed segment, and
//! takes the last root page inside it as the authoritative tree.

use crate::block::{self, BlockHeader, BlockKind, SegmentMeta};
use crate::common::{FlashMapError, Result, INVALID_ADDRESS};
use crate::device::FlashDevice;
use crate::mapping_table::MappingTable;
use crate::page_cache::{CacheId, EntryRef};

/// Tail-cleaning attempts per append before the log is declared full.
const TAIL_CLEAN_RETRY_LIMIT: u32 = 10;

/// A block that moved during tail cleaning: readers chase `old -> new` until
/// the tree itself is repointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelocRecord {
    pub old_offset: u64,
    pub new_offset: u64,
    /// Header captured from the relocated block; the drain descends by its
    /// level and start range.
    pub header: BlockHeader,
}

/// Bounded buffer of pending relocations, sorted by `old_offset`.
pub(crate) struct RelocBuffer {
    records: Vec<RelocRecord>,
    capacity: usize,
}

impl RelocBuffer {
    pub fn new(write_granularity: u32) -> Self {
        let capacity =
            (write_granularity as usize / std::mem::size_of::<RelocRecord>()).max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Follow one hop of relocation for `old_offset`, if one is pending.
    pub fn lookup(&self, old_offset: u64) -> Option<u64> {
        self.records
            .binary_search_by_key(&old_offset, |record| record.old_offset)
            .ok()
            .map(|position| self.records[position].new_offset)
    }

    /// Rewrite an existing record when the incoming move extends it: a page
    /// relocated twice stays a single `orig -> latest` hop. Returns whether
    /// a record absorbed the move.
    fn collapse(&mut self, old_offset: u64, new_offset: u64, header: &BlockHeader) -> bool {
        for record in &mut self.records {
            if record.old_offset == old_offset || record.new_offset == old_offset {
                debug_assert_eq!(&record.header, header);
                record.new_offset = new_offset;
                return true;
            }
        }
        false
    }

    fn insert_sorted(&mut self, record: RelocRecord) {
        let position = self
            .records
            .partition_point(|other| other.old_offset < record.old_offset);
        self.records.insert(position, record);
    }

    fn snapshot(&self) -> Vec<RelocRecord> {
        self.records.clone()
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Mutable log position plus the metadata template for the segment being
/// filled.
pub(crate) struct LogState {
    pub head: u64,
    pub tail: u64,
    pub seg_meta: SegmentMeta,
    pub realloc: RelocBuffer,
}

impl LogState {
    pub fn new(block_size: u32, npage_mappings: u32) -> Self {
        Self {
            head: 0,
            tail: 0,
            seg_meta: SegmentMeta::new(block_size, npage_mappings),
            realloc: RelocBuffer::new(block_size),
        }
    }
}

/// Device scan summary produced by [`MappingTable::debug_analyze`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnalysis {
    pub alive_blocks: u64,
    pub dead_blocks: u64,
    pub erased_blocks: u64,
    pub invalid_blocks: u64,
    /// Block counts per tree level (levels 8 and deeper are not expected)
    pub level_histogram: [u64; 8],
}

impl MappingTable {
    pub(crate) fn granularity(&self) -> u64 {
        u64::from(self.dev.write_granularity())
    }

    /// Bytes between tail and head, following the wraparound.
    pub(crate) fn used_space(&self) -> u64 {
        if self.log.head >= self.log.tail {
            self.log.head - self.log.tail
        } else {
            (self.dev.total_size() - self.log.tail) + self.log.head
        }
    }

    fn head_tail_distance(&self) -> u64 {
        self.dev.total_size() - self.used_space()
    }

    /// Append one block at the head and return its address.
    ///
    /// With `clean_tail` set, the tail is advanced first until at least two
    /// segments of slack separate it from the head. Crossing a segment
    /// boundary rotates the log: the next segment is erased, given a fresh
    /// metadata record, and a checkpoint (relocation drain, bottom-up flush,
    /// root append) is taken. The checkpoint's own appends run with
    /// `clean_tail` off, which is what bounds the recursion.
    pub(crate) fn lss_write(&mut self, data: &[u8], clean_tail: bool) -> Result<u64> {
        let address = self.prepare_append(data.len() as u64, clean_tail)?;
        self.dev.write(address, data)?;
        Ok(address)
    }

    /// Everything an append does up to the device write: space management,
    /// segment rotation with its checkpoint, and the stale-destination
    /// drain. Reserves and returns the target address. Split from
    /// [`lss_write`](Self::lss_write) so a cache flush can capture its block
    /// contents *after* this housekeeping, which may itself rewrite the
    /// block being flushed.
    pub(crate) fn prepare_append(&mut self, len: u64, clean_tail: bool) -> Result<u64> {
        debug_assert_eq!(len, self.granularity(), "appends are single blocks");
        let flash_size = self.dev.total_size();
        let segment_size = u64::from(self.dev.segment_size());
        let threshold = 2 * segment_size;

        if self.used_space() > segment_size {
            if clean_tail {
                let mut attempts = 0u32;
                loop {
                    self.clean_tail_block()?;
                    attempts += 1;
                    if self.head_tail_distance() > threshold {
                        break;
                    }
                    if attempts > TAIL_CLEAN_RETRY_LIMIT {
                        log::error!(
                            "tail cleaning stalled: head={} tail={} distance={}",
                            self.log.head,
                            self.log.tail,
                            self.head_tail_distance()
                        );
                        let _ = self.debug_analyze();
                        return Err(FlashMapError::SpaceExhausted { attempts });
                    }
                }
            } else if len + segment_size > self.head_tail_distance() {
                return Err(FlashMapError::SpaceExhausted { attempts: 0 });
            }
        }

        if self.log.head / segment_size != (self.log.head + len) / segment_size {
            let next_segment = (self.log.head / segment_size + 1) % (flash_size / segment_size);
            let next_offset = next_segment * segment_size;
            self.log.head = next_offset;

            if cfg!(debug_assertions) && self.segment_has_live_block(next_offset)? {
                return Err(FlashMapError::InvariantViolated {
                    message: format!(
                        "rotating into segment at {next_offset} that still holds live blocks"
                    ),
                });
            }

            self.dev.erase_segment(next_offset)?;

            self.log.seg_meta.contains_checkpoint = true;
            self.log.seg_meta.block_size = self.block_size;
            self.log.seg_meta.npage_mappings = self.npage_mappings;
            self.log.seg_meta.tail_offset = self.log.tail;
            self.log.seg_meta.seq_num += 1;
            self.write_segment_meta(next_offset)?;

            // Checkpoint: pending relocations first, then every dirty page
            // deepest-level first, then the root append that terminates it.
            self.realloc_drain()?;
            self.flush_all(CacheId::Table, false)?;
            let root = self.root.to_vec();
            self.root_offset = self.lss_write(&root, false)?;
        }

        // The head may be the stale side of a pending relocation; apply the
        // buffer before overwriting what its record refers to.
        if self.log.realloc.lookup(self.log.head).is_some() {
            self.realloc_drain()?;
        }

        let address = self.log.head;
        self.log.head = address + len;
        Ok(address)
    }

    /// Read one block, following one pending relocation hop transparently.
    pub(crate) fn lss_read(&self, storage_address: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.granularity());
        let actual = self
            .log
            .realloc
            .lookup(storage_address)
            .unwrap_or(storage_address);
        self.dev.read(actual, buf)
    }

    /// Examine the block under the tail, relocate it if still referenced,
    /// and advance the tail one block (wrapping at the device end).
    fn clean_tail_block(&mut self) -> Result<()> {
        let granularity = self.granularity();
        let tail_offset = self.log.tail;
        let mut buf = vec![0u8; granularity as usize];
        self.dev.read(tail_offset, &mut buf)?;

        if self.block_alive(tail_offset, &buf)? {
            let header =
                BlockHeader::read_from(&buf).ok_or_else(|| FlashMapError::InvariantViolated {
                    message: format!("live block at {tail_offset} has no readable header"),
                })?;
            let new_address = self.lss_write(&buf, false)?;
            self.realloc_insert(header, tail_offset, new_address)?;
            log::debug!("relocated live block {tail_offset} -> {new_address}");
        }

        let mut new_tail = tail_offset + granularity;
        if new_tail >= self.dev.total_size() {
            new_tail = 0;
        }
        self.log.tail = new_tail;
        Ok(())
    }

    /// Whether the mapping tree still references the block at
    /// `block_address`. Erased blocks and segment metadata are dead by
    /// definition; so is the root, which must never be copied forward (the
    /// recovered root has to be the last block of its checkpoint, and a
    /// relocated copy could outlive flushes it does not reflect).
    fn block_alive(&mut self, block_address: u64, blockbuf: &[u8]) -> Result<bool> {
        if block::is_erased(blockbuf) {
            return Ok(false);
        }
        let header = match BlockHeader::read_from(blockbuf) {
            Some(header) => header,
            None => return Ok(false),
        };
        if header.kind == BlockKind::SegMeta {
            return Ok(false);
        }
        if header.kind == BlockKind::Mt && header.level == 0 {
            return Ok(false);
        }

        let (holder, index) = self.locate_parent_slot(header, CacheId::Reader)?;
        let slot_address = match holder {
            Some(entry) => block::entry_slot(self.arena.block(entry), index),
            None => block::entry_slot(&self.root, index),
        };
        self.unpin_entry(holder);

        // the reference may itself be mid-move
        let current = self.log.realloc.lookup(slot_address).unwrap_or(slot_address);
        Ok(current == block_address)
    }

    /// Descend to the mapping page holding the child slot for the block
    /// `header` describes. Starts from the deepest resident ancestor in the
    /// writer cache and pages the rest in through `via`; the returned holder
    /// (None = the root) is left pinned for the caller.
    fn locate_parent_slot(
        &mut self,
        header: BlockHeader,
        via: CacheId,
    ) -> Result<(Option<EntryRef>, usize)> {
        let fanout = u64::from(self.fanout);
        let mut block_range = self.padded;
        for _ in 0..header.level {
            block_range /= fanout;
            if block_range == 0 {
                return Err(FlashMapError::InvariantViolated {
                    message: format!("block level {} deeper than the tree", header.level),
                });
            }
        }
        let parent_range = block_range * fanout;
        let parent_start = (header.start / parent_range) * parent_range;

        let mut entry =
            self.cache_get_page_entry(CacheId::Table, parent_start, parent_start + parent_range);
        let (mut range_start, mut range) = match entry {
            Some(e) => {
                let slot = self.arena.slot(e);
                (slot.start, slot.end - slot.start)
            }
            None => (0, self.padded),
        };

        loop {
            let sub_range = range / fanout;
            let index = ((header.start % range) / sub_range) as usize;
            if sub_range == block_range {
                return Ok((entry, index));
            }

            let slot_address = match entry {
                Some(e) => block::entry_slot(self.arena.block(e), index),
                None => block::entry_slot(&self.root, index),
            };
            if slot_address == INVALID_ADDRESS {
                self.unpin_entry(entry);
                return Err(FlashMapError::InvariantViolated {
                    message: format!(
                        "descent toward start {} level {} hit an unallocated slot",
                        header.start, header.level
                    ),
                });
            }

            let child_start = range_start + index as u64 * sub_range;
            let parent_link = match via {
                CacheId::Table => entry,
                CacheId::Reader => None,
            };
            let child = self.acquire_from_storage(
                via,
                child_start,
                child_start + sub_range,
                slot_address,
                parent_link,
                false,
            )?;
            self.unpin_entry(entry);
            entry = Some(child);
            range_start = child_start;
            range = sub_range;
        }
    }

    /// Repoint the tree for one buffered relocation. A slot that no longer
    /// matches `old_offset` was superseded by a newer write of the same
    /// page; the record is then obsolete and skipped.
    fn apply_relocation(&mut self, record: RelocRecord) -> Result<()> {
        let (holder, index) = self.locate_parent_slot(record.header, CacheId::Table)?;
        let slot_address = match holder {
            Some(entry) => block::entry_slot(self.arena.block(entry), index),
            None => block::entry_slot(&self.root, index),
        };
        if slot_address == record.old_offset {
            match holder {
                Some(entry) => {
                    block::set_entry_slot(
                        self.arena.block_mut(entry),
                        index,
                        record.new_offset,
                    );
                    self.mark_dirty_entry(Some(entry));
                }
                // slots held by the root need no dirty flag; the root is
                // rewritten at every checkpoint
                None => block::set_entry_slot(&mut self.root, index, record.new_offset),
            }
        }
        self.unpin_entry(holder);
        Ok(())
    }

    /// Apply every buffered relocation to the tree and empty the buffer.
    /// Draining twice in a row is a no-op by construction.
    pub(crate) fn realloc_drain(&mut self) -> Result<()> {
        if self.log.realloc.is_empty() {
            return Ok(());
        }
        // Records stay visible while they are applied: reads issued by the
        // descents below must still see the pending redirections.
        let pending = self.log.realloc.snapshot();
        for record in pending {
            self.apply_relocation(record)?;
        }
        self.log.realloc.clear();
        Ok(())
    }

    fn realloc_insert(
        &mut self,
        header: BlockHeader,
        old_offset: u64,
        new_offset: u64,
    ) -> Result<()> {
        if self.log.realloc.collapse(old_offset, new_offset, &header) {
            return Ok(());
        }
        if self.log.realloc.is_full() {
            self.realloc_drain()?;
        }
        self.log.realloc.insert_sorted(RelocRecord {
            old_offset,
            new_offset,
            header,
        });
        Ok(())
    }

    /// Serialize the current segment metadata into the first slot of the
    /// segment and park the head right behind it.
    fn write_segment_meta(&mut self, segment_offset: u64) -> Result<()> {
        let granularity = self.granularity();
        let mut buf = vec![0u8; granularity as usize];
        self.log.seg_meta.encode_into(&mut buf)?;
        debug_assert!(self.log.realloc.lookup(segment_offset).is_none());
        self.dev.write(segment_offset, &buf)?;
        self.log.head = segment_offset + granularity;
        log::debug!(
            "wrote segment metadata at {}: tail_offset={} seq_num={}",
            segment_offset,
            self.log.seg_meta.tail_offset,
            self.log.seg_meta.seq_num
        );
        Ok(())
    }

    /// Format the device into a fresh log: all segments erased, segment 0
    /// opened with sequence number 0, and the empty root appended so the
    /// device is recoverable from the very first write.
    pub(crate) fn log_init(&mut self) -> Result<()> {
        self.dev.erase_all()?;
        self.log.head = 0;
        self.log.tail = 0;
        self.log.seg_meta = SegmentMeta::new(self.block_size, self.npage_mappings);
        self.write_segment_meta(0)?;
        let root = self.root.to_vec();
        self.root_offset = self.lss_write(&root, false)?;
        log::info!(
            "created new log structure ({} bytes in {} segments)",
            self.dev.total_size(),
            self.dev.total_size() / u64::from(self.dev.segment_size())
        );
        Ok(())
    }

    /// Recover the latest root after a restart: pick the checkpointed
    /// segment with the highest sequence number, verify its geometry echo,
    /// and take the last level-0 mapping block inside it as the root.
    pub(crate) fn recover_root(&mut self) -> Result<()> {
        let segment_size = u64::from(self.dev.segment_size());
        let granularity = self.granularity();
        let flash_size = self.dev.total_size();
        let mut buf = vec![0u8; granularity as usize];

        let mut winner: Option<(u64, SegmentMeta)> = None;
        let mut offset = 0u64;
        while offset < flash_size {
            self.dev.read(offset, &mut buf)?;
            if let Some(meta) = SegmentMeta::decode(&buf) {
                if meta.contains_checkpoint
                    && winner.is_none_or(|(_, best)| meta.seq_num >= best.seq_num)
                {
                    winner = Some((offset, meta));
                }
            }
            offset += segment_size;
        }
        let (segment_offset, meta) = winner.ok_or(FlashMapError::Uninitialized)?;
        log::info!(
            "found checkpoint in segment {} (seq={})",
            segment_offset / segment_size,
            meta.seq_num
        );

        if meta.block_size != self.block_size || meta.npage_mappings != self.npage_mappings {
            return Err(FlashMapError::GeometryMismatch {
                message: format!(
                    "device formatted with block_size={} npage_mappings={}, reopened with {} and {}",
                    meta.block_size, meta.npage_mappings, self.block_size, self.npage_mappings
                ),
            });
        }
        self.log.seg_meta = meta;

        // A checkpoint can be followed by a shutdown flush, so the segment
        // may hold several roots; the last one reflects everything before it.
        let mut root_offset = None;
        let mut offset = segment_offset + granularity;
        while offset < segment_offset + segment_size {
            self.dev.read(offset, &mut buf)?;
            if !block::is_erased(&buf) {
                if let Some(header) = BlockHeader::read_from(&buf) {
                    if header.kind == BlockKind::Mt && header.level == 0 {
                        root_offset = Some(offset);
                        self.root.copy_from_slice(&buf);
                    }
                }
            }
            offset += granularity;
        }
        let root_offset = root_offset.ok_or_else(|| FlashMapError::InvariantViolated {
            message: format!("checkpointed segment at {segment_offset} holds no root page"),
        })?;
        log::info!("recovered root at offset {root_offset}");

        self.root_offset = root_offset;
        self.log.head = root_offset + granularity;
        self.log.tail = self.log.seg_meta.tail_offset;
        Ok(())
    }

    /// Debug check used before erasing a segment the head rotates into.
    fn segment_has_live_block(&mut self, segment_offset: u64) -> Result<bool> {
        let granularity = self.granularity();
        let segment_size = u64::from(self.dev.segment_size());
        let mut buf = vec![0u8; granularity as usize];
        let mut offset = segment_offset;
        while offset < segment_offset + segment_size {
            self.dev.read(offset, &mut buf)?;
            if !block::is_erased(&buf) && self.block_alive(offset, &buf)? {
                return Ok(true);
            }
            offset += granularity;
        }
        Ok(false)
    }

    /// Scan the whole device and report what the log holds. Diagnostic
    /// only; the counts also go to the debug log.
    pub fn debug_analyze(&mut self) -> Result<LogAnalysis> {
        let granularity = self.granularity();
        let flash_size = self.dev.total_size();
        let mut analysis = LogAnalysis::default();
        let mut buf = vec![0u8; granularity as usize];

        let mut offset = 0u64;
        while offset < flash_size {
            self.dev.read(offset, &mut buf)?;
            if block::is_erased(&buf) {
                analysis.erased_blocks += 1;
                offset += granularity;
                continue;
            }
            match BlockHeader::read_from(&buf) {
                None => analysis.invalid_blocks += 1,
                Some(header) => {
                    match self.block_alive(offset, &buf) {
                        Ok(true) => analysis.alive_blocks += 1,
                        Ok(false) => analysis.dead_blocks += 1,
                        Err(_) => analysis.invalid_blocks += 1,
                    }
                    if (header.level as usize) < analysis.level_histogram.len() {
                        analysis.level_histogram[header.level as usize] += 1;
                    }
                }
            }
            offset += granularity;
        }

        log::debug!(
            "log analysis: head={} tail={} used={} alive={} dead={} erased={} invalid={}",
            self.log.head,
            self.log.tail,
            self.used_space(),
            analysis.alive_blocks,
            analysis.dead_blocks,
            analysis.erased_blocks,
            analysis.invalid_blocks
        );
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use tempfile::tempdir;

    fn header(level: u8, start: u64) -> BlockHeader {
        BlockHeader::new(BlockKind::Mt, level, start)
    }

    #[test]
    fn test_reloc_buffer_lookup() {
        let mut buffer = RelocBuffer::new(64);
        assert!(buffer.capacity >= 1);

        buffer.insert_sorted(RelocRecord {
            old_offset: 640,
            new_offset: 1280,
            header: header(2, 7),
        });
        assert_eq!(buffer.lookup(640), Some(1280));
        assert_eq!(buffer.lookup(1280), None);
        assert_eq!(buffer.lookup(0), None);
    }

    #[test]
    fn test_reloc_buffer_collapses_chained_moves() {
        let mut buffer = RelocBuffer::new(64);
        let hdr = header(2, 14);

        assert!(!buffer.collapse(640, 1280, &hdr));
        buffer.insert_sorted(RelocRecord {
            old_offset: 640,
            new_offset: 1280,
            header: hdr,
        });

        // the page moves again: 1280 -> 1920 extends the existing record
        assert!(buffer.collapse(1280, 1920, &hdr));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.lookup(640), Some(1920));

        // a fresh write of the same old offset replaces the target
        assert!(buffer.collapse(640, 2560, &hdr));
        assert_eq!(buffer.lookup(640), Some(2560));
    }

    #[test]
    fn test_reloc_buffer_stays_sorted() {
        let mut buffer = RelocBuffer::new(256);
        for old in [320u64, 64, 192, 128] {
            buffer.insert_sorted(RelocRecord {
                old_offset: old,
                new_offset: old + 64,
                header: header(1, 0),
            });
        }
        let olds: Vec<u64> = buffer.records.iter().map(|r| r.old_offset).collect();
        assert_eq!(olds, vec![64, 128, 192, 320]);
        assert_eq!(buffer.lookup(192), Some(256));
    }

    #[test]
    fn test_drain_twice_is_noop() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("drain.dbf"), 64, 64, 10, true);
        let mut table = MappingTable::open(config).unwrap();

        // enough churn to force tail cleaning and buffered relocations
        for round in 0u64..6 {
            for logical in 0..64u64 {
                table.update(logical, round * 1000 + logical).unwrap();
            }
        }

        table.realloc_drain().unwrap();
        assert!(table.log.realloc.is_empty());
        // second drain has nothing to apply and changes nothing
        table.realloc_drain().unwrap();
        assert!(table.log.realloc.is_empty());

        for logical in 0..64u64 {
            assert_eq!(table.lookup(logical).unwrap(), Some(5000 + logical));
        }
        table.close().unwrap();
    }

    #[test]
    fn test_analyzer_sees_fresh_log() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("analyze.dbf"), 64, 64, 10, true);
        let mut table = MappingTable::open(config).unwrap();

        let analysis = table.debug_analyze().unwrap();
        // a freshly formatted device: segment 0 metadata plus the root,
        // everything else erased
        assert_eq!(analysis.alive_blocks, 0);
        assert!(analysis.dead_blocks >= 2);
        assert!(analysis.erased_blocks > 0);

        table.update(10, 5555).unwrap();
        let analysis = table.debug_analyze().unwrap();
        let _ = analysis;
        table.close().unwrap();
    }
}

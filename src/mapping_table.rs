//! Mapping table: a fixed-fanout tree over a padded logical address space
//!
//! The tree's shape is fully determined by the geometry: every page at level
//! `n` covers `padded / fanout^n` logical addresses, so a descent never
//! materializes structure, it only pages nodes in. The root is pinned in
//! memory for the whole session and written back at checkpoints; everything
//! below it flows through the page cache and the log-structured store.

use std::collections::HashMap;

use crate::block::{self, BlockHeader, BlockKind};
use crate::common::{Config, FlashMapError, Result, INVALID_ADDRESS};
use crate::device::{FileFlash, FlashDevice};
use crate::lss::LogState;
use crate::page_cache::{CacheId, EntryRef, PageArena, PageCache};

/// Height of a complete tree over `total_entries` leaves, counting the root.
fn max_tree_height(total_entries: u64, fanout: u64) -> u32 {
    if total_entries <= fanout {
        return 2;
    }
    let mut capacity = 1u64;
    let mut height = 1u32;
    while capacity < total_entries {
        capacity *= fanout;
        height += 1;
    }
    height
}

/// Point-in-time counters for the log and caches.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub head: u64,
    pub tail: u64,
    pub used_space: u64,
    pub device_size: u64,
    pub segment_size: u32,
    pub seq_num: u64,
    /// Pages resident in the writer cache
    pub cached_pages: u32,
    pub pending_relocations: usize,
}

/// Persistent logical-to-physical page-address translator.
///
/// One handle owns the device, the log store, the mapping tree, and the
/// cache pair; all operations are synchronous on the caller's thread.
pub struct MappingTable {
    pub(crate) dev: Box<dyn FlashDevice>,
    pub(crate) block_size: u32,
    pub(crate) npage_mappings: u32,
    pub(crate) fanout: u32,
    /// Logical space rounded up to a power of the fanout, so every page
    /// covers an integer sub-range
    pub(crate) padded: u64,
    /// The always-resident root page
    pub(crate) root: Box<[u8]>,
    pub(crate) root_offset: u64,
    pub(crate) log: LogState,
    pub(crate) arena: PageArena,
    /// Writer cache: the only source of dirty pages
    pub(crate) cache: PageCache,
    /// Read-only pool for the log store's aliveness descents
    pub(crate) reader_cache: PageCache,
    closed: bool,
}

impl MappingTable {
    /// Open a translator backed by a file-based flash simulator at
    /// `config.path`, formatting it when `config.create` is set.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let dev = FileFlash::open(
            &config.path,
            config.segment_count,
            config.segment_size,
            config.block_size,
        )?;
        Self::open_with_device(Box::new(dev), config)
    }

    /// Open on a caller-supplied device. The device's write granularity
    /// must equal the configured block size in this release.
    pub fn open_with_device(dev: Box<dyn FlashDevice>, config: Config) -> Result<Self> {
        config.validate()?;
        if dev.write_granularity() != config.block_size {
            return Err(FlashMapError::Config {
                message: format!(
                    "block size {} must equal the device write granularity {}",
                    config.block_size,
                    dev.write_granularity()
                ),
            });
        }

        let block_size = config.block_size;
        let npage_mappings = config.npage_mappings;
        let fanout = block::fanout(block_size);

        let mut padded = u64::from(fanout);
        while u64::from(npage_mappings) > padded {
            padded *= u64::from(fanout);
        }

        // The reader pool needs one slot per tree level; one more slot is
        // reserved for the root, which lives outside the cache entirely.
        let reader_capacity = max_tree_height(padded, u64::from(fanout));
        let main_capacity = config
            .cache_capacity
            .checked_sub(1 + reader_capacity)
            .filter(|&capacity| capacity >= reader_capacity)
            .ok_or_else(|| FlashMapError::Config {
                message: format!(
                    "cache capacity {} too small for a tree of height {}; need at least {}",
                    config.cache_capacity,
                    reader_capacity,
                    1 + 2 * reader_capacity
                ),
            })?;

        let mut arena = PageArena::new(main_capacity + reader_capacity, block_size);
        let cache = PageCache::new(&mut arena, 0..main_capacity);
        let reader_cache =
            PageCache::new(&mut arena, main_capacity..main_capacity + reader_capacity);

        let mut root = vec![0u8; block_size as usize].into_boxed_slice();
        BlockHeader::new(BlockKind::Mt, 0, 0).write_to(&mut root);

        // `closed` starts true so a failed open drops without attempting a
        // checkpoint against a device it never initialized.
        let mut table = Self {
            dev,
            block_size,
            npage_mappings,
            fanout,
            padded,
            root,
            root_offset: INVALID_ADDRESS,
            log: LogState::new(block_size, npage_mappings),
            arena,
            cache,
            reader_cache,
            closed: true,
        };

        if config.create {
            block::fill_payload_unallocated(&mut table.root);
            table.log_init()?;
        } else {
            table.recover_root()?;
        }
        table.closed = false;
        Ok(table)
    }

    pub fn npage_mappings(&self) -> u32 {
        self.npage_mappings
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    /// Map `logical` to `physical`, materializing any missing tree branch
    /// along the way.
    pub fn update(&mut self, logical: u64, physical: u64) -> Result<()> {
        self.update_inner(logical, physical, true)
    }

    /// Translate `logical`. `Ok(None)` means the address was never mapped.
    pub fn lookup(&mut self, logical: u64) -> Result<Option<u64>> {
        self.lookup_inner(logical, true)
    }

    /// Drain relocations, flush every dirty page bottom-up, and append the
    /// root: an implicit checkpoint. The handle stays usable afterwards,
    /// and dropping an unclosed handle performs the same sequence
    /// best-effort.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.realloc_drain()?;
        self.flush_all(CacheId::Table, false)?;
        let root = self.root.to_vec();
        self.root_offset = self.lss_write(&root, false)?;
        self.closed = true;
        log::info!("translator closed; root at offset {}", self.root_offset);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            head: self.log.head,
            tail: self.log.tail,
            used_space: self.used_space(),
            device_size: self.dev.total_size(),
            segment_size: self.dev.segment_size(),
            seq_num: self.log.seg_meta.seq_num,
            cached_pages: self.cache.resident().len() as u32,
            pending_relocations: self.log.realloc.len(),
        }
    }

    fn node_level(&self, entry: Option<EntryRef>) -> u8 {
        let blockbuf = match entry {
            Some(e) => self.arena.block(e),
            None => &self.root[..],
        };
        BlockHeader::read_from(blockbuf).map_or(0, |header| header.level)
    }

    fn node_slot(&self, entry: Option<EntryRef>, index: usize) -> u64 {
        let blockbuf = match entry {
            Some(e) => self.arena.block(e),
            None => &self.root[..],
        };
        block::entry_slot(blockbuf, index)
    }

    fn update_inner(&mut self, logical: u64, physical: u64, clean_tail: bool) -> Result<()> {
        if logical >= u64::from(self.npage_mappings) {
            return Err(FlashMapError::OutOfRange {
                logical,
                limit: u64::from(self.npage_mappings),
            });
        }

        let fanout = u64::from(self.fanout);
        // Start from the deepest resident page covering the address; the
        // root stands in when nothing is cached.
        let mut entry = self.cache_search(CacheId::Table, logical);
        let (mut range_start, mut range) = match entry {
            Some(e) => {
                let slot = self.arena.slot(e);
                (slot.start, slot.end - slot.start)
            }
            None => (0, self.padded),
        };

        loop {
            let sub_range = range / fanout;
            let index = ((logical % range) / sub_range) as usize;

            if sub_range == 1 {
                match entry {
                    Some(e) => {
                        block::set_entry_slot(self.arena.block_mut(e), index, physical);
                        self.arena.slot_mut(e).dirty = true;
                    }
                    None => block::set_entry_slot(&mut self.root, index, physical),
                }
                self.unpin_entry(entry);
                return Ok(());
            }

            let slot_address = self.node_slot(entry, index);
            let level = self.node_level(entry);
            let child_start = range_start + index as u64 * sub_range;
            let child = if slot_address == INVALID_ADDRESS {
                // first touch of this branch: the page exists only in cache
                // until a flush gives it a storage address
                let child = self.cache_insert(
                    CacheId::Table,
                    child_start,
                    child_start + sub_range,
                    level + 1,
                    entry,
                    clean_tail,
                )?;
                block::fill_payload_unallocated(self.arena.block_mut(child));
                child
            } else {
                self.acquire_from_storage(
                    CacheId::Table,
                    child_start,
                    child_start + sub_range,
                    slot_address,
                    entry,
                    clean_tail,
                )?
            };
            self.unpin_entry(entry);
            entry = Some(child);
            range_start = child_start;
            range = sub_range;
        }
    }

    fn lookup_inner(&mut self, logical: u64, clean_tail: bool) -> Result<Option<u64>> {
        if logical >= u64::from(self.npage_mappings) {
            return Err(FlashMapError::OutOfRange {
                logical,
                limit: u64::from(self.npage_mappings),
            });
        }

        let fanout = u64::from(self.fanout);
        let mut entry = self.cache_search(CacheId::Table, logical);
        let (mut range_start, mut range) = match entry {
            Some(e) => {
                let slot = self.arena.slot(e);
                (slot.start, slot.end - slot.start)
            }
            None => (0, self.padded),
        };

        loop {
            let sub_range = range / fanout;
            let index = ((logical % range) / sub_range) as usize;
            let slot_address = self.node_slot(entry, index);

            if sub_range == 1 {
                self.unpin_entry(entry);
                if slot_address == INVALID_ADDRESS {
                    return Ok(None);
                }
                return Ok(Some(slot_address));
            }

            if slot_address == INVALID_ADDRESS {
                // untouched branch: nothing below was ever mapped
                self.unpin_entry(entry);
                return Ok(None);
            }

            let child_start = range_start + index as u64 * sub_range;
            let child = self.acquire_from_storage(
                CacheId::Table,
                child_start,
                child_start + sub_range,
                slot_address,
                entry,
                clean_tail,
            )?;
            self.unpin_entry(entry);
            entry = Some(child);
            range_start = child_start;
            range = sub_range;
        }
    }

    /// Structural audit of the cache pair. Checks that each cache's LRU
    /// list and residency index agree, that no range is resident twice
    /// across the pair, and that every pin is accounted for by a live
    /// parent link (so a quiescent translator holds no leaked pins).
    #[doc(hidden)]
    pub fn self_check(&self) -> Result<()> {
        self.cache.check_lists(&self.arena)?;
        self.reader_cache.check_lists(&self.arena)?;

        let mut ranges: HashMap<(u64, u64), u32> = HashMap::new();
        for &index in self
            .cache
            .resident()
            .iter()
            .chain(self.reader_cache.resident())
        {
            let slot = self.arena.slot_raw(index);
            if let Some(previous) = ranges.insert((slot.start, slot.end), index) {
                return Err(FlashMapError::InvariantViolated {
                    message: format!(
                        "range [{}, {}) resident twice (slots {previous} and {index})",
                        slot.start, slot.end
                    ),
                });
            }
        }

        let mut expected_pins: HashMap<u32, u16> = HashMap::new();
        for &index in self
            .cache
            .resident()
            .iter()
            .chain(self.reader_cache.resident())
        {
            if let Some(parent) = self.arena.slot_raw(index).parent {
                if !self.arena.is_current(parent) {
                    return Err(FlashMapError::InvariantViolated {
                        message: format!("slot {index} links a recycled parent"),
                    });
                }
                *expected_pins.entry(parent.index).or_default() += 1;
            }
        }
        for &index in self
            .cache
            .resident()
            .iter()
            .chain(self.reader_cache.resident())
        {
            let actual = self.arena.slot_raw(index).pin_count;
            let expected = expected_pins.get(&index).copied().unwrap_or(0);
            if actual != expected {
                return Err(FlashMapError::InvariantViolated {
                    message: format!(
                        "slot {index} holds {actual} pins but {expected} children link it"
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Drop for MappingTable {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                log::error!("close during drop failed: {err}");
            }
        }
    }
}

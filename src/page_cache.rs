//! Mapping-table page cache
//!
//! A bounded set of in-memory mapping pages with pin counts, dirty tracking,
//! an intrusive LRU list, and a range-sorted index for covering-range
//! searches. All entry records and block buffers live in one preallocated
//! [`PageArena`] shared by the translator's two caches: the writer cache that
//! the mapping table mutates, and a read-only cache the log store uses for
//! its aliveness descents. Sharing one arena lets a page move between the
//! caches by handing over its slot instead of copying the block, so a range
//! is ever resident exactly once across the pair.
//!
//! Entries are addressed by stable arena indices; an [`EntryRef`] carries a
//! generation tag so a stale handle cannot silently reach a recycled slot.

use crate::block::{self, BlockHeader, BlockKind};
use crate::common::{FlashMapError, Result, INVALID_ADDRESS};
use crate::device::FlashDevice;
use crate::mapping_table::MappingTable;

/// Stable handle to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryRef {
    pub index: u32,
    pub generation: u32,
}

/// Which cache of the pair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheId {
    /// The writer cache owned by the mapping table; the only source of
    /// dirty pages.
    Table,
    /// The read-only pool the log store descends through while deciding
    /// block aliveness.
    Reader,
}

/// One arena slot: entry bookkeeping for the block buffer with the same
/// index. The free-list link is kept separate from the LRU links on purpose;
/// overloading one for the other invites stale-pointer bugs.
#[derive(Debug)]
pub(crate) struct Slot {
    pub start: u64,
    pub end: u64,
    pub parent: Option<EntryRef>,
    pub pin_count: u16,
    pub dirty: bool,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
    free_next: Option<u32>,
    generation: u32,
}

impl Slot {
    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.parent = None;
        self.pin_count = 0;
        self.dirty = false;
    }
}

/// Preallocated entry records plus their block buffers. Created once at
/// open; no per-operation heap allocation happens in the cache.
pub(crate) struct PageArena {
    slots: Vec<Slot>,
    blocks: Vec<u8>,
    block_size: usize,
}

impl PageArena {
    pub fn new(capacity: u32, block_size: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot {
                start: 0,
                end: 0,
                parent: None,
                pin_count: 0,
                dirty: false,
                lru_prev: None,
                lru_next: None,
                free_next: None,
                generation: 0,
            });
        }
        Self {
            slots,
            blocks: vec![0; capacity as usize * block_size as usize],
            block_size: block_size as usize,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Handle for the slot's current incarnation.
    pub fn entry_ref(&self, index: u32) -> EntryRef {
        EntryRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Whether the handle still names a live incarnation of its slot.
    pub fn is_current(&self, entry: EntryRef) -> bool {
        self.slots[entry.index as usize].generation == entry.generation
    }

    pub fn slot(&self, entry: EntryRef) -> &Slot {
        debug_assert!(self.is_current(entry), "stale cache entry handle");
        &self.slots[entry.index as usize]
    }

    pub fn slot_mut(&mut self, entry: EntryRef) -> &mut Slot {
        debug_assert!(self.is_current(entry), "stale cache entry handle");
        &mut self.slots[entry.index as usize]
    }

    pub fn slot_raw(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    pub fn slot_raw_mut(&mut self, index: u32) -> &mut Slot {
        &mut self.slots[index as usize]
    }

    pub fn block(&self, entry: EntryRef) -> &[u8] {
        debug_assert!(self.is_current(entry), "stale cache entry handle");
        self.block_raw(entry.index)
    }

    pub fn block_mut(&mut self, entry: EntryRef) -> &mut [u8] {
        debug_assert!(self.is_current(entry), "stale cache entry handle");
        self.block_raw_mut(entry.index)
    }

    pub fn block_raw(&self, index: u32) -> &[u8] {
        let start = index as usize * self.block_size;
        &self.blocks[start..start + self.block_size]
    }

    pub fn block_raw_mut(&mut self, index: u32) -> &mut [u8] {
        let start = index as usize * self.block_size;
        &mut self.blocks[start..start + self.block_size]
    }
}

/// One cache of the pair: a sorted residency index, an intrusive LRU list
/// (head = most recently used), and a free list of arena slots this cache
/// may hand out.
pub(crate) struct PageCache {
    capacity: u32,
    /// Resident slot indices sorted by `(start, span)`
    order: Vec<u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    free_head: Option<u32>,
}

impl PageCache {
    /// Build a cache owning the arena slots in `range` (pushed onto its
    /// free list).
    pub fn new(arena: &mut PageArena, range: std::ops::Range<u32>) -> Self {
        let mut cache = Self {
            capacity: range.end - range.start,
            order: Vec::with_capacity((range.end - range.start) as usize),
            lru_head: None,
            lru_tail: None,
            free_head: None,
        };
        for index in range {
            arena.slot_raw_mut(index).free_next = cache.free_head;
            cache.free_head = Some(index);
        }
        cache
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn resident(&self) -> &[u32] {
        &self.order
    }

    fn sort_key(arena: &PageArena, index: u32) -> (u64, u64) {
        let slot = arena.slot_raw(index);
        (slot.start, slot.end - slot.start)
    }

    /// Pop a slot off the free list, if any.
    pub fn allocate(&mut self, arena: &mut PageArena) -> Option<u32> {
        let index = self.free_head?;
        {
            let slot = arena.slot_raw_mut(index);
            self.free_head = slot.free_next;
            slot.free_next = None;
            slot.lru_prev = None;
            slot.lru_next = None;
            slot.pin_count = 0;
            slot.dirty = false;
        }
        Some(index)
    }

    /// Return a slot to the free list, retiring its current incarnation.
    pub fn free(&mut self, arena: &mut PageArena, index: u32) {
        let slot = arena.slot_raw_mut(index);
        slot.reset();
        slot.generation = slot.generation.wrapping_add(1);
        slot.free_next = self.free_head;
        self.free_head = Some(index);
    }

    pub fn lru_remove(&mut self, arena: &mut PageArena, index: u32) {
        let (prev, next) = {
            let slot = arena.slot_raw(index);
            (slot.lru_prev, slot.lru_next)
        };
        match prev {
            Some(p) => arena.slot_raw_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => arena.slot_raw_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let slot = arena.slot_raw_mut(index);
        slot.lru_prev = None;
        slot.lru_next = None;
    }

    pub fn lru_push_head(&mut self, arena: &mut PageArena, index: u32) {
        {
            let slot = arena.slot_raw_mut(index);
            slot.lru_prev = None;
            slot.lru_next = self.lru_head;
        }
        if let Some(old_head) = self.lru_head {
            arena.slot_raw_mut(old_head).lru_prev = Some(index);
        }
        self.lru_head = Some(index);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(index);
        }
    }

    pub fn lru_move_to_head(&mut self, arena: &mut PageArena, index: u32) {
        if self.lru_head == Some(index) {
            return;
        }
        self.lru_remove(arena, index);
        self.lru_push_head(arena, index);
    }

    /// First unpinned entry walking from the cold end of the LRU list.
    pub fn lru_pick_unpinned(&self, arena: &PageArena) -> Option<u32> {
        let mut cursor = self.lru_tail;
        while let Some(index) = cursor {
            if arena.slot_raw(index).pin_count == 0 {
                return Some(index);
            }
            cursor = arena.slot_raw(index).lru_prev;
        }
        None
    }

    /// Smallest-range resident page covering `logical`, pinned and promoted
    /// to the hot end of the LRU list.
    pub fn search(&mut self, arena: &mut PageArena, logical: u64) -> Option<u32> {
        let mut best: Option<u32> = None;
        let mut best_span = u64::MAX;
        for &index in &self.order {
            let slot = arena.slot_raw(index);
            if logical >= slot.start && logical < slot.end {
                let span = slot.end - slot.start;
                if span < best_span {
                    best = Some(index);
                    best_span = span;
                }
            }
        }
        if let Some(index) = best {
            self.lru_move_to_head(arena, index);
            arena.slot_raw_mut(index).pin_count += 1;
        }
        best
    }

    /// Smallest resident range containing all of `[start, end)`, pinned.
    pub fn get_page_entry(&mut self, arena: &mut PageArena, start: u64, end: u64) -> Option<u32> {
        let mut best: Option<u32> = None;
        let mut best_span = u64::MAX;
        for &index in &self.order {
            let slot = arena.slot_raw(index);
            if start >= slot.start && start < slot.end && end > slot.start && end <= slot.end {
                let span = slot.end - slot.start;
                if span < best_span {
                    best = Some(index);
                    best_span = span;
                }
            }
        }
        if let Some(index) = best {
            arena.slot_raw_mut(index).pin_count += 1;
        }
        best
    }

    pub fn insert_sorted(&mut self, arena: &PageArena, index: u32) {
        let key = Self::sort_key(arena, index);
        let pos = self
            .order
            .partition_point(|&other| Self::sort_key(arena, other) < key);
        debug_assert!(
            pos >= self.order.len() || Self::sort_key(arena, self.order[pos]) != key,
            "duplicate range in cache"
        );
        self.order.insert(pos, index);
    }

    pub fn remove_from_order(&mut self, index: u32) {
        let pos = self
            .order
            .iter()
            .position(|&other| other == index)
            .expect("entry missing from residency index");
        self.order.remove(pos);
    }

    /// Structural audit: the LRU list and the sorted index must describe the
    /// same resident set, and the index must actually be sorted.
    pub fn check_lists(&self, arena: &PageArena) -> Result<()> {
        let mut seen = 0usize;
        let mut cursor = self.lru_head;
        let mut prev: Option<u32> = None;
        while let Some(index) = cursor {
            if arena.slot_raw(index).lru_prev != prev {
                return Err(FlashMapError::InvariantViolated {
                    message: format!("LRU back-link broken at slot {index}"),
                });
            }
            if !self.order.contains(&index) {
                return Err(FlashMapError::InvariantViolated {
                    message: format!("slot {index} is on the LRU list but not resident"),
                });
            }
            seen += 1;
            if seen > self.order.len() {
                return Err(FlashMapError::InvariantViolated {
                    message: "LRU list longer than the resident set (cycle?)".to_string(),
                });
            }
            prev = Some(index);
            cursor = arena.slot_raw(index).lru_next;
        }
        if seen != self.order.len() {
            return Err(FlashMapError::InvariantViolated {
                message: format!(
                    "LRU list holds {seen} entries, residency index holds {}",
                    self.order.len()
                ),
            });
        }
        for pair in self.order.windows(2) {
            if Self::sort_key(arena, pair[0]) >= Self::sort_key(arena, pair[1]) {
                return Err(FlashMapError::InvariantViolated {
                    message: "residency index out of order".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Move a live entry from `donor` into `receiver`, and donate `receiver`'s
/// unused `fresh` slot back to `donor`'s free list. This is the whole
/// cross-cache handoff: the block buffer never moves or gets copied, and
/// afterwards the range exists in exactly one cache.
pub(crate) fn transfer_ownership(
    arena: &mut PageArena,
    receiver: &mut PageCache,
    fresh: u32,
    donor: &mut PageCache,
    live: u32,
) {
    receiver.lru_remove(arena, fresh);
    donor.lru_remove(arena, live);
    receiver.remove_from_order(fresh);
    donor.remove_from_order(live);
    receiver.insert_sorted(arena, live);
    receiver.lru_push_head(arena, live);
    donor.free(arena, fresh);
}

/// Outcome of making room for a new entry.
enum EvictOutcome {
    /// A slot was reclaimed and may be rewired.
    Reused(u32),
    /// Flushing the victim pulled the wanted range back in; use it directly.
    Resident(EntryRef),
}

impl MappingTable {
    pub(crate) fn cache_pair(&mut self, which: CacheId) -> (&mut PageCache, &mut PageArena) {
        match which {
            CacheId::Table => (&mut self.cache, &mut self.arena),
            CacheId::Reader => (&mut self.reader_cache, &mut self.arena),
        }
    }

    fn unpin_index(arena: &mut PageArena, index: u32) -> u16 {
        let slot = arena.slot_raw_mut(index);
        debug_assert!(slot.pin_count > 0, "unpin of an unpinned entry");
        slot.pin_count -= 1;
        slot.pin_count
    }

    /// Release one pin. Accepts `None` so descent loops can treat the root
    /// uniformly.
    pub(crate) fn unpin_entry(&mut self, entry: Option<EntryRef>) -> u16 {
        match entry {
            Some(e) => {
                debug_assert!(self.arena.is_current(e));
                Self::unpin_index(&mut self.arena, e.index)
            }
            None => 0,
        }
    }

    /// Flag an entry as needing write-back. A `None` target is the root,
    /// which has no dirty flag: it is rewritten wholesale at checkpoints.
    pub(crate) fn mark_dirty_entry(&mut self, entry: Option<EntryRef>) {
        if let Some(e) = entry {
            self.arena.slot_mut(e).dirty = true;
        }
    }

    pub(crate) fn cache_search(&mut self, which: CacheId, logical: u64) -> Option<EntryRef> {
        let (cache, arena) = self.cache_pair(which);
        let index = cache.search(arena, logical)?;
        Some(arena.entry_ref(index))
    }

    pub(crate) fn cache_get_page_entry(
        &mut self,
        which: CacheId,
        start: u64,
        end: u64,
    ) -> Option<EntryRef> {
        let (cache, arena) = self.cache_pair(which);
        let index = cache.get_page_entry(arena, start, end)?;
        Some(arena.entry_ref(index))
    }

    /// Pin and return an entry for `[start, end)`, allocating (and possibly
    /// evicting) when the range is not resident. A newly allocated entry's
    /// block gets its header stamped but keeps whatever payload the slot
    /// last held; the caller must overwrite or reset it.
    pub(crate) fn cache_insert(
        &mut self,
        which: CacheId,
        start: u64,
        end: u64,
        level: u8,
        parent: Option<EntryRef>,
        clean_tail: bool,
    ) -> Result<EntryRef> {
        {
            let (cache, arena) = self.cache_pair(which);
            if let Some(found) = cache.get_page_entry(arena, start, end) {
                let slot = arena.slot_raw(found);
                if slot.start == start && slot.end == end {
                    cache.lru_move_to_head(arena, found);
                    return Ok(arena.entry_ref(found));
                }
                // a covering ancestor, not the page asked for
                Self::unpin_index(arena, found);
            }
        }

        let free = {
            let (cache, arena) = self.cache_pair(which);
            cache.allocate(arena)
        };
        let index = match free {
            Some(index) => index,
            None => match self.evict_slot(which, start, end, clean_tail)? {
                EvictOutcome::Reused(index) => index,
                EvictOutcome::Resident(entry) => return Ok(entry),
            },
        };

        let (cache, arena) = self.cache_pair(which);
        {
            let slot = arena.slot_raw_mut(index);
            slot.start = start;
            slot.end = end;
            slot.parent = parent;
            slot.pin_count = 1;
            slot.dirty = false;
        }
        BlockHeader::new(BlockKind::Mt, level, start).write_to(arena.block_raw_mut(index));
        if let Some(p) = parent {
            arena.slot_mut(p).pin_count += 1;
        }
        cache.insert_sorted(arena, index);
        cache.lru_push_head(arena, index);
        Ok(arena.entry_ref(index))
    }

    /// Reclaim an unpinned slot, flushing it first when dirty. Flushing can
    /// re-enter the cache (a checkpoint or relocation drain runs inside the
    /// append), so the victim is re-validated afterwards and the wanted
    /// range is re-probed before the slot is recycled.
    fn evict_slot(
        &mut self,
        which: CacheId,
        start: u64,
        end: u64,
        clean_tail: bool,
    ) -> Result<EvictOutcome> {
        let mut candidate: Option<u32> = None;
        loop {
            {
                let (cache, arena) = self.cache_pair(which);
                if let Some(prev) = candidate {
                    // the flush pinned it again; put it back and pick anew
                    cache.lru_push_head(arena, prev);
                }
                candidate = cache.lru_pick_unpinned(arena);
            }
            let cand = match candidate {
                Some(cand) => cand,
                None => {
                    let capacity = match which {
                        CacheId::Table => self.cache.capacity(),
                        CacheId::Reader => self.reader_cache.capacity(),
                    };
                    return Err(FlashMapError::CacheExhausted { capacity });
                }
            };
            {
                let (cache, arena) = self.cache_pair(which);
                cache.lru_remove(arena, cand);
            }
            if self.arena.slot_raw(cand).dirty {
                let entry = self.arena.entry_ref(cand);
                self.flush_entry(entry, clean_tail)?;
            }
            debug_assert!(!self.arena.slot_raw(cand).dirty);
            if self.arena.slot_raw(cand).pin_count == 0 {
                break;
            }
        }
        let cand = candidate.expect("eviction loop exited without a victim");

        // The flush may have pulled the wanted range in behind our back (a
        // relocation drain loads pages); reading it from flash again would
        // clobber that newer copy.
        {
            let (cache, arena) = self.cache_pair(which);
            if let Some(spawned) = cache.get_page_entry(arena, start, end) {
                let slot = arena.slot_raw(spawned);
                if slot.start == start && slot.end == end {
                    cache.lru_push_head(arena, cand);
                    cache.lru_move_to_head(arena, spawned);
                    return Ok(EvictOutcome::Resident(arena.entry_ref(spawned)));
                }
                Self::unpin_index(arena, spawned);
            }
        }

        let parent = self.arena.slot_raw(cand).parent;
        let (cache, arena) = self.cache_pair(which);
        cache.remove_from_order(cand);
        if let Some(p) = parent {
            debug_assert!(arena.slot(p).pin_count > 0);
            arena.slot_mut(p).pin_count -= 1;
        }
        Ok(EvictOutcome::Reused(cand))
    }

    /// As [`cache_insert`](Self::cache_insert), but filled from storage when
    /// the slot is genuinely new. Before touching flash the other cache of
    /// the pair is probed: the writer cache adopts the reader's copy by slot
    /// handoff, while the reader simply borrows the writer's entry. Either
    /// way a range never has two in-memory copies whose dirty state could
    /// diverge.
    pub(crate) fn acquire_from_storage(
        &mut self,
        which: CacheId,
        start: u64,
        end: u64,
        storage_address: u64,
        parent: Option<EntryRef>,
        clean_tail: bool,
    ) -> Result<EntryRef> {
        if storage_address == INVALID_ADDRESS {
            return Err(FlashMapError::InvariantViolated {
                message: format!("acquire of [{start}, {end}) from an unallocated address"),
            });
        }

        // Level 0 marks a slot that did not exist before this call: no page
        // below the root carries level 0, so a nonzero header level means
        // the range was already resident here.
        let entry = self.cache_insert(which, start, end, 0, parent, clean_tail)?;
        let fresh = BlockHeader::read_from(self.arena.block(entry))
            .map(|h| h.level == 0)
            .unwrap_or(true);
        if !fresh {
            return Ok(entry);
        }

        let mut out = entry;
        let mut read_from_flash = true;
        match which {
            CacheId::Table => {
                let probe = self.reader_cache.get_page_entry(&mut self.arena, start, end);
                if let Some(found) = probe {
                    let slot = self.arena.slot_raw(found);
                    if slot.start == start && slot.end == end {
                        debug_assert!(slot.parent.is_none());
                        transfer_ownership(
                            &mut self.arena,
                            &mut self.cache,
                            entry.index,
                            &mut self.reader_cache,
                            found,
                        );
                        // the freed slot's parent hold carries over to the
                        // adopted entry
                        self.arena.slot_raw_mut(found).parent = parent;
                        out = self.arena.entry_ref(found);
                        read_from_flash = false;
                    } else {
                        Self::unpin_index(&mut self.arena, found);
                    }
                }
            }
            CacheId::Reader => {
                let probe = self.cache.get_page_entry(&mut self.arena, start, end);
                if let Some(found) = probe {
                    let slot = self.arena.slot_raw(found);
                    if slot.start == start && slot.end == end {
                        // use the writer cache's copy and hand the slot we
                        // just allocated straight back
                        self.discard_fresh(CacheId::Reader, entry);
                        out = self.arena.entry_ref(found);
                        read_from_flash = false;
                    } else {
                        Self::unpin_index(&mut self.arena, found);
                    }
                }
            }
        }

        if read_from_flash {
            let mut buf = vec![0u8; self.arena.block_size()];
            self.lss_read(storage_address, &mut buf)?;
            self.arena.block_mut(out).copy_from_slice(&buf);
        }

        let header = BlockHeader::read_from(self.arena.block(out));
        if !matches!(header, Some(h) if h.kind == BlockKind::Mt && h.start == start) {
            return Err(FlashMapError::InvariantViolated {
                message: format!(
                    "block at {storage_address} does not describe mapping range [{start}, {end})"
                ),
            });
        }
        debug_assert!(!self.arena.slot(out).dirty);
        Ok(out)
    }

    /// Drop a just-allocated entry that turned out to be redundant: detach
    /// it from its cache and return the slot to the free list.
    fn discard_fresh(&mut self, which: CacheId, entry: EntryRef) {
        let parent = self.arena.slot(entry).parent;
        let (cache, arena) = self.cache_pair(which);
        cache.lru_remove(arena, entry.index);
        cache.remove_from_order(entry.index);
        if let Some(p) = parent {
            debug_assert!(arena.slot(p).pin_count > 0);
            arena.slot_mut(p).pin_count -= 1;
        }
        cache.free(arena, entry.index);
    }

    /// Write one entry out through the log store and repoint the parent's
    /// child slot at the new address. An absent parent means the slot lives
    /// in the always-resident root page.
    pub(crate) fn flush_entry(&mut self, entry: EntryRef, clean_tail: bool) -> Result<()> {
        // The append's housekeeping (checkpoint, relocation drain) can
        // rewrite this very block, so its bytes are captured only after the
        // address is reserved.
        let storage_address = self.prepare_append(self.granularity(), clean_tail)?;
        let payload = self.arena.block_raw(entry.index).to_vec();
        self.dev.write(storage_address, &payload)?;

        // A checkpoint inside the append may already have written this entry
        // back (and possibly recycled the slot); the copy just appended is
        // then dead in the log and there is nothing left to repoint.
        if !self.arena.is_current(entry) || !self.arena.slot(entry).dirty {
            return Ok(());
        }
        self.arena.slot_mut(entry).dirty = false;

        let (start, parent) = {
            let slot = self.arena.slot(entry);
            (slot.start, slot.parent)
        };
        let fanout = u64::from(self.fanout);
        match parent {
            Some(p) => {
                let parent_range = {
                    let parent_slot = self.arena.slot(p);
                    parent_slot.end - parent_slot.start
                };
                let sub_range = parent_range / fanout;
                let index = ((start % parent_range) / sub_range) as usize;
                self.arena.slot_mut(p).dirty = true;
                block::set_entry_slot(self.arena.block_mut(p), index, storage_address);
            }
            None => {
                let parent_range = self.padded;
                let sub_range = parent_range / fanout;
                let index = ((start % parent_range) / sub_range) as usize;
                block::set_entry_slot(&mut self.root, index, storage_address);
            }
        }
        Ok(())
    }

    /// Write back every dirty entry, deepest level first: flushing a child
    /// repoints (and dirties) its parent, so parents must come later. The
    /// root is not written here; the log store emits it at checkpoints.
    pub(crate) fn flush_all(&mut self, which: CacheId, clean_tail: bool) -> Result<u32> {
        let max_level = {
            let (cache, arena) = self.cache_pair(which);
            let mut max_level = 0u8;
            for &index in cache.resident() {
                if let Some(header) = BlockHeader::read_from(arena.block_raw(index)) {
                    max_level = max_level.max(header.level);
                }
            }
            max_level
        };

        let mut flushed = 0u32;
        for level in (0..=max_level).rev() {
            let snapshot: Vec<EntryRef> = {
                let (cache, arena) = self.cache_pair(which);
                cache
                    .resident()
                    .iter()
                    .map(|&index| arena.entry_ref(index))
                    .collect()
            };
            for entry in snapshot {
                // entries can be recycled by nested checkpoints mid-sweep
                if !self.arena.is_current(entry) || !self.arena.slot(entry).dirty {
                    continue;
                }
                let header = BlockHeader::read_from(self.arena.block(entry));
                if header.map(|h| h.level) != Some(level) {
                    continue;
                }
                self.flush_entry(entry, clean_tail)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

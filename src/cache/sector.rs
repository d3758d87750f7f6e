/// One shard of the cache inside the shared segment.
///
/// A sector owns a header, a mutex, a directory of [`CacheEntry`] slots, a
/// block successor array and the data blocks. All structural access goes
/// through a [`SectorGuard`], which holds the sector mutex. Payload bytes
/// are reached through [`Sector::block_ptr`] and may be copied without the
/// mutex under the reader/writer protocol implemented by the cache.
use std::sync::Arc;

use hashbrown::HashSet;

use super::layout::{
    bytes_in_portion, data_blocks_for_size, BlockNum, CacheEntry, EntryNum, SectorHeader,
    SectorLayout, SectorStats, INVALID_BLOCK, INVALID_ENTRY,
};
use crate::error::{Error, IntegrityError, Result};
use crate::key::HASH_SIZE;
use crate::shm::{SharedMemSegment, SharedMutex};

pub struct Sector<const BLOCK_SIZE: usize> {
    _segment: Arc<dyn SharedMemSegment>,
    base: *mut u8,
    mutex: Box<dyn SharedMutex>,
    layout: SectorLayout,
    num_entries: usize,
    num_blocks: usize,
}

// Safety: every access to the shared bytes is coordinated either by the
// sector mutex or by the `creating`/`open_count` protocol of the cache.
unsafe impl<const BLOCK_SIZE: usize> Send for Sector<BLOCK_SIZE> {}
unsafe impl<const BLOCK_SIZE: usize> Sync for Sector<BLOCK_SIZE> {}

impl<const BLOCK_SIZE: usize> Sector<BLOCK_SIZE> {
    pub fn required_size(mutex_size: usize, entries_per_sector: usize, blocks_per_sector: usize) -> usize {
        SectorLayout::new(mutex_size, entries_per_sector, blocks_per_sector, BLOCK_SIZE).total_size
    }

    pub const fn data_blocks_for_size(byte_size: usize) -> usize {
        data_blocks_for_size(byte_size, BLOCK_SIZE)
    }

    pub fn bytes_in_portion(total_bytes: usize, b: usize, total_blocks: usize) -> usize {
        bytes_in_portion(total_bytes, b, total_blocks, BLOCK_SIZE)
    }

    /// Lays out a fresh sector at `offset`. Called once, by the creator,
    /// before any other process attaches.
    pub fn initialize(
        segment: Arc<dyn SharedMemSegment>,
        offset: usize,
        mutex_size: usize,
        entries_per_sector: usize,
        blocks_per_sector: usize,
    ) -> Result<Self> {
        let layout = Self::checked_layout(&segment, offset, mutex_size, entries_per_sector, blocks_per_sector)?;
        let mutex = segment.initialize_shared_mutex(offset + layout.mutex_offset)?;
        let sector = Self::from_parts(segment, offset, mutex, layout, entries_per_sector, blocks_per_sector);
        sector.lock().reset();
        Ok(sector)
    }

    /// Binds to a sector some other process already initialized.
    pub fn attach(
        segment: Arc<dyn SharedMemSegment>,
        offset: usize,
        mutex_size: usize,
        entries_per_sector: usize,
        blocks_per_sector: usize,
    ) -> Result<Self> {
        let layout = Self::checked_layout(&segment, offset, mutex_size, entries_per_sector, blocks_per_sector)?;
        let mutex = segment.attach_to_shared_mutex(offset + layout.mutex_offset)?;
        Ok(Self::from_parts(segment, offset, mutex, layout, entries_per_sector, blocks_per_sector))
    }

    fn checked_layout(
        segment: &Arc<dyn SharedMemSegment>,
        offset: usize,
        mutex_size: usize,
        entries_per_sector: usize,
        blocks_per_sector: usize,
    ) -> Result<SectorLayout> {
        if BLOCK_SIZE == 0 {
            return Err(Error::Config("block size must be positive".to_string()));
        }
        if entries_per_sector > i32::MAX as usize || blocks_per_sector > i32::MAX as usize {
            return Err(Error::Config(format!(
                "sector of {entries_per_sector} entries and {blocks_per_sector} blocks exceeds 32-bit numbering"
            )));
        }
        let layout = SectorLayout::new(mutex_size, entries_per_sector, blocks_per_sector, BLOCK_SIZE);
        let fits = offset
            .checked_add(layout.total_size)
            .is_some_and(|end| end <= segment.size());
        if offset % 8 != 0 || !fits {
            return Err(Error::Config(format!(
                "sector at offset {offset} needs {} bytes, segment `{}` has {}",
                layout.total_size,
                segment.name(),
                segment.size()
            )));
        }
        Ok(layout)
    }

    fn from_parts(
        segment: Arc<dyn SharedMemSegment>,
        offset: usize,
        mutex: Box<dyn SharedMutex>,
        layout: SectorLayout,
        num_entries: usize,
        num_blocks: usize,
    ) -> Self {
        let base = unsafe { segment.base().add(offset) };
        Sector {
            _segment: segment,
            base,
            mutex,
            layout,
            num_entries,
            num_blocks,
        }
    }

    pub fn lock(&self) -> SectorGuard<'_, BLOCK_SIZE> {
        self.mutex.lock();
        SectorGuard { sector: self }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Start of data block `b`; `BLOCK_SIZE` bytes are valid from there.
    pub fn block_ptr(&self, b: BlockNum) -> *mut u8 {
        assert!(
            b >= 0 && (b as usize) < self.num_blocks,
            "block {b} out of range"
        );
        unsafe { self.base.add(self.layout.blocks_offset + b as usize * BLOCK_SIZE) }
    }

    fn header_ptr(&self) -> *mut SectorHeader {
        self.base as *mut SectorHeader
    }

    fn entry_ptr(&self, e: EntryNum) -> *mut CacheEntry {
        assert!(
            e >= 0 && (e as usize) < self.num_entries,
            "entry {e} out of range"
        );
        unsafe { (self.base.add(self.layout.entries_offset) as *mut CacheEntry).add(e as usize) }
    }

    fn successor_ptr(&self, b: BlockNum) -> *mut BlockNum {
        assert!(
            b >= 0 && (b as usize) < self.num_blocks,
            "block {b} out of range"
        );
        unsafe { (self.base.add(self.layout.successors_offset) as *mut BlockNum).add(b as usize) }
    }

    fn in_block_range(&self, b: BlockNum) -> bool {
        b >= 0 && (b as usize) < self.num_blocks
    }
}

/// Holds the sector mutex; every structural accessor lives here.
pub struct SectorGuard<'a, const BLOCK_SIZE: usize> {
    sector: &'a Sector<BLOCK_SIZE>,
}

impl<const BLOCK_SIZE: usize> Drop for SectorGuard<'_, BLOCK_SIZE> {
    fn drop(&mut self) {
        unsafe { self.sector.mutex.unlock() }
    }
}

/// Reacquires the mutex when the unlocked section ends, even on unwind.
struct Relock<'a>(&'a dyn SharedMutex);

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        self.0.lock();
    }
}

impl<'a, const BLOCK_SIZE: usize> SectorGuard<'a, BLOCK_SIZE> {
    pub fn sector(&self) -> &'a Sector<BLOCK_SIZE> {
        self.sector
    }

    /// Runs `f` with the sector mutex released.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        unsafe { self.sector.mutex.unlock() };
        let _relock = Relock(self.sector.mutex.as_ref());
        f()
    }

    fn header(&self) -> &SectorHeader {
        unsafe { &*self.sector.header_ptr() }
    }

    fn header_mut(&mut self) -> &mut SectorHeader {
        unsafe { &mut *self.sector.header_ptr() }
    }

    pub fn stats(&self) -> &SectorStats {
        &self.header().stats
    }

    pub fn stats_mut(&mut self) -> &mut SectorStats {
        &mut self.header_mut().stats
    }

    pub fn entry(&self, e: EntryNum) -> &CacheEntry {
        unsafe { &*self.sector.entry_ptr(e) }
    }

    pub fn entry_mut(&mut self, e: EntryNum) -> &mut CacheEntry {
        unsafe { &mut *self.sector.entry_ptr(e) }
    }

    pub fn block_successor(&self, b: BlockNum) -> BlockNum {
        unsafe { *self.sector.successor_ptr(b) }
    }

    pub fn set_block_successor(&mut self, b: BlockNum, next: BlockNum) {
        assert!(
            next == INVALID_BLOCK || self.sector.in_block_range(next),
            "successor {next} out of range"
        );
        unsafe { *self.sector.successor_ptr(b) = next }
    }

    pub fn free_list_front(&self) -> BlockNum {
        self.header().free_list_front
    }

    pub fn lru_front(&self) -> EntryNum {
        self.header().lru_front
    }

    pub fn oldest_entry_num(&self) -> EntryNum {
        self.header().lru_rear
    }

    /// Zeroes the directory, threads every block onto the free list and
    /// empties the LRU.
    fn reset(&mut self) {
        let num_entries = self.sector.num_entries as EntryNum;
        let num_blocks = self.sector.num_blocks as BlockNum;

        for e in 0..num_entries {
            let entry = self.entry_mut(e);
            entry.hash_bytes = [0; HASH_SIZE];
            entry.last_use_timestamp_ms = 0;
            entry.byte_size = 0;
            entry.lru_prev = INVALID_ENTRY;
            entry.lru_next = INVALID_ENTRY;
            entry.first_block = INVALID_BLOCK;
            entry.open_count = 0;
            entry.creating = 0;
            entry.pending_delete = 0;
        }

        for b in 0..num_blocks {
            let next = if b + 1 < num_blocks { b + 1 } else { INVALID_BLOCK };
            self.set_block_successor(b, next);
        }

        let header = self.header_mut();
        header.free_list_front = if num_blocks > 0 { 0 } else { INVALID_BLOCK };
        header.lru_front = INVALID_ENTRY;
        header.lru_rear = INVALID_ENTRY;
        header._pad = 0;
        header.stats = SectorStats::default();
    }

    /// Pops up to `goal` blocks off the free list into `blocks`. Returns how
    /// many were delivered. Successors of the delivered blocks are left for
    /// the caller to relink.
    pub fn alloc_blocks_from_free_list(&mut self, goal: usize, blocks: &mut Vec<BlockNum>) -> usize {
        let mut got = 0;
        while got < goal {
            let front = self.header().free_list_front;
            if front == INVALID_BLOCK {
                break;
            }
            let next = self.block_successor(front);
            self.header_mut().free_list_front = next;
            blocks.push(front);
            got += 1;
        }
        self.stats_mut().used_blocks += got as i64;
        got
    }

    pub fn return_blocks_to_free_list(&mut self, blocks: &[BlockNum]) {
        for &b in blocks {
            let front = self.header().free_list_front;
            self.set_block_successor(b, front);
            self.header_mut().free_list_front = b;
        }
        self.stats_mut().used_blocks -= blocks.len() as i64;
    }

    pub fn link_block_successors(&mut self, blocks: &[BlockNum]) {
        for pair in blocks.windows(2) {
            self.set_block_successor(pair[0], pair[1]);
        }
        if let Some(&last) = blocks.last() {
            self.set_block_successor(last, INVALID_BLOCK);
        }
    }

    /// Appends the chain of entry `e` to `blocks`. The chain must hold
    /// exactly as many blocks as `byte_size` requires and end in
    /// `INVALID_BLOCK`; otherwise nothing is appended.
    pub fn block_list_for_entry(
        &self,
        e: EntryNum,
        blocks: &mut Vec<BlockNum>,
    ) -> std::result::Result<usize, IntegrityError> {
        let entry = self.entry(e);
        let expected = Sector::<BLOCK_SIZE>::data_blocks_for_size(entry.byte_size as usize);

        let start = blocks.len();
        let mut cur = entry.first_block;
        for walked in 0..expected {
            if cur == INVALID_BLOCK {
                blocks.truncate(start);
                return Err(IntegrityError::ChainLength {
                    entry: e,
                    expected,
                    walked,
                });
            }
            if !self.sector.in_block_range(cur) {
                blocks.truncate(start);
                return Err(IntegrityError::BlockOutOfRange { entry: e, block: cur });
            }
            blocks.push(cur);
            cur = self.block_successor(cur);
        }

        if cur != INVALID_BLOCK {
            blocks.truncate(start);
            return Err(IntegrityError::ChainLength {
                entry: e,
                expected,
                walked: expected + 1,
            });
        }
        Ok(expected)
    }

    /// Follows successors from `e`'s first block regardless of `byte_size`,
    /// stopping at `INVALID_BLOCK`, at an out-of-range block or when a block
    /// repeats.
    pub fn chain_prefix(&self, e: EntryNum, blocks: &mut Vec<BlockNum>) {
        let mut seen = HashSet::new();
        let mut cur = self.entry(e).first_block;
        while self.sector.in_block_range(cur) && seen.insert(cur) {
            blocks.push(cur);
            cur = self.block_successor(cur);
        }
    }

    fn in_lru(&self, e: EntryNum) -> bool {
        let entry = self.entry(e);
        entry.lru_prev != INVALID_ENTRY
            || entry.lru_next != INVALID_ENTRY
            || self.header().lru_front == e
    }

    /// Links `e` at the front of the LRU. `e` must not be linked already.
    pub fn insert_entry_into_lru(&mut self, e: EntryNum) {
        debug_assert!(!self.in_lru(e), "entry {e} already in LRU");
        let front = self.header().lru_front;
        {
            let entry = self.entry_mut(e);
            entry.lru_prev = INVALID_ENTRY;
            entry.lru_next = front;
        }
        if front != INVALID_ENTRY {
            self.entry_mut(front).lru_prev = e;
        } else {
            self.header_mut().lru_rear = e;
        }
        let header = self.header_mut();
        header.lru_front = e;
        header.stats.used_entries += 1;
    }

    /// Removes `e` from the LRU; a no-op if it is not linked.
    pub fn unlink_entry_from_lru(&mut self, e: EntryNum) {
        if !self.in_lru(e) {
            return;
        }
        let (prev, next) = {
            let entry = self.entry(e);
            (entry.lru_prev, entry.lru_next)
        };

        if prev != INVALID_ENTRY {
            self.entry_mut(prev).lru_next = next;
        } else {
            self.header_mut().lru_front = next;
        }

        if next != INVALID_ENTRY {
            self.entry_mut(next).lru_prev = prev;
        } else {
            self.header_mut().lru_rear = prev;
        }

        let entry = self.entry_mut(e);
        entry.lru_prev = INVALID_ENTRY;
        entry.lru_next = INVALID_ENTRY;
        self.stats_mut().used_entries -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::thread;

    use super::*;
    use crate::shm::in_process::InProcessSharedMem;
    use crate::shm::SharedMemRuntime;

    const BLOCK: usize = 512;
    const BLOCKS: usize = 20;
    const ENTRIES: usize = 25;
    // Sector starts past this many bytes so the offset is really honored.
    const EXTRA: usize = 8192;

    type TestSector = Sector<BLOCK>;

    fn segment_size(shm: &InProcessSharedMem) -> usize {
        EXTRA + TestSector::required_size(shm.shared_mutex_size(), ENTRIES, BLOCKS)
    }

    fn parent_init(shm: &InProcessSharedMem) -> TestSector {
        let seg = shm.create_segment("cache", segment_size(shm)).unwrap();
        TestSector::initialize(seg, EXTRA, shm.shared_mutex_size(), ENTRIES, BLOCKS).unwrap()
    }

    fn child_init(shm: &InProcessSharedMem) -> TestSector {
        let seg = shm.attach_to_segment("cache", segment_size(shm)).unwrap();
        TestSector::attach(seg, EXTRA, shm.shared_mutex_size(), ENTRIES, BLOCKS).unwrap()
    }

    fn check_block_vector(blocks: &[BlockNum], min_valid: BlockNum, max_valid: BlockNum) {
        let distinct: BTreeSet<_> = blocks.iter().copied().collect();
        assert_eq!(distinct.len(), blocks.len());
        for &b in blocks {
            assert!(min_valid <= b && b <= max_valid, "block {b}");
        }
    }

    /// Returns the LRU newest-first, checking both link directions.
    fn extract_lru(guard: &SectorGuard<'_, BLOCK>) -> Vec<EntryNum> {
        let mut lru = Vec::new();
        let mut e = guard.oldest_entry_num();
        while e != INVALID_ENTRY {
            lru.push(e);
            e = guard.entry(e).lru_prev;
        }
        lru.reverse();

        for (p, &e) in lru.iter().enumerate() {
            let entry = guard.entry(e);
            let prev = if p == 0 { INVALID_ENTRY } else { lru[p - 1] };
            let next = lru.get(p + 1).copied().unwrap_or(INVALID_ENTRY);
            assert_eq!(entry.lru_prev, prev);
            assert_eq!(entry.lru_next, next);
        }
        assert_eq!(lru.len() as i64, guard.stats().used_entries);
        lru
    }

    #[test]
    fn free_list() {
        let shm = InProcessSharedMem::new();
        let sector = parent_init(&shm);

        let mut blocks = Vec::new();
        {
            let mut g = sector.lock();
            assert_eq!(g.stats().used_blocks, 0);
            // Ask for more than there is; get exactly what there is.
            assert_eq!(g.alloc_blocks_from_free_list(BLOCKS * 2, &mut blocks), BLOCKS);
            assert_eq!(blocks.len(), BLOCKS);
            check_block_vector(&blocks, 0, BLOCKS as BlockNum - 1);
            assert_eq!(g.stats().used_blocks, BLOCKS as i64);

            // Nothing left, and the caller's vector is untouched.
            assert_eq!(g.alloc_blocks_from_free_list(5, &mut blocks), 0);
            assert_eq!(blocks.len(), BLOCKS);

            g.return_blocks_to_free_list(&[0, 1, 2]);
            assert_eq!(g.stats().used_blocks, BLOCKS as i64 - 3);

            blocks.clear();
            assert_eq!(g.alloc_blocks_from_free_list(2, &mut blocks), 2);
            check_block_vector(&blocks, 0, 2);
            assert_eq!(g.alloc_blocks_from_free_list(1, &mut blocks), 1);
            check_block_vector(&blocks, 0, 2);
            assert_eq!(g.stats().used_blocks, BLOCKS as i64);
        }

        // Another participant frees everything except 0, 1, 2.
        thread::scope(|s| {
            s.spawn(|| {
                let child = child_init(&shm);
                let to_free: Vec<BlockNum> = (3..BLOCKS as BlockNum).collect();
                child.lock().return_blocks_to_free_list(&to_free);
            });
        });

        let mut g = sector.lock();
        assert_eq!(g.stats().used_blocks, 3);
        assert_eq!(g.alloc_blocks_from_free_list(BLOCKS - 3, &mut blocks), BLOCKS - 3);
        assert_eq!(blocks.len(), BLOCKS);
        check_block_vector(&blocks, 0, BLOCKS as BlockNum - 1);
        assert_eq!(g.stats().used_blocks, BLOCKS as i64);
    }

    #[test]
    fn lru() {
        let shm = InProcessSharedMem::new();
        let sector = parent_init(&shm);
        let mut g = sector.lock();

        assert!(extract_lru(&g).is_empty());
        assert_eq!(g.stats().used_entries, 0);

        // Unlinking entries that were never linked is harmless.
        g.unlink_entry_from_lru(0);
        g.unlink_entry_from_lru(1);
        assert_eq!(g.stats().used_entries, 0);

        for e in (0..5).rev() {
            g.insert_entry_into_lru(e);
        }
        assert_eq!(g.stats().used_entries, 5);
        assert_eq!(extract_lru(&g), vec![0, 1, 2, 3, 4]);
        assert_eq!(g.oldest_entry_num(), 4);

        // Middle and both endpoints.
        g.unlink_entry_from_lru(2);
        g.unlink_entry_from_lru(0);
        g.unlink_entry_from_lru(4);
        g.unlink_entry_from_lru(4);
        assert_eq!(g.stats().used_entries, 2);
        assert_eq!(extract_lru(&g), vec![1, 3]);

        g.unlink_entry_from_lru(1);
        g.unlink_entry_from_lru(3);
        assert!(extract_lru(&g).is_empty());
        assert_eq!(g.lru_front(), INVALID_ENTRY);
        assert_eq!(g.oldest_entry_num(), INVALID_ENTRY);
    }

    #[test]
    fn block_lists() {
        assert_eq!(TestSector::data_blocks_for_size(0), 0);
        assert_eq!(TestSector::data_blocks_for_size(1), 1);
        assert_eq!(TestSector::data_blocks_for_size(BLOCK), 1);
        assert_eq!(TestSector::data_blocks_for_size(BLOCK + 1), 2);
        assert_eq!(TestSector::data_blocks_for_size(BLOCK * 2), 2);
        assert_eq!(TestSector::data_blocks_for_size(BLOCK * 2 + 1), 3);

        assert_eq!(TestSector::bytes_in_portion(1, 0, 1), 1);
        assert_eq!(TestSector::bytes_in_portion(BLOCK - 1, 0, 1), BLOCK - 1);
        assert_eq!(TestSector::bytes_in_portion(BLOCK, 0, 1), BLOCK);
        assert_eq!(TestSector::bytes_in_portion(BLOCK + 1, 0, 2), BLOCK);
        assert_eq!(TestSector::bytes_in_portion(BLOCK + 1, 1, 2), 1);
        assert_eq!(TestSector::bytes_in_portion(2 * BLOCK, 1, 2), BLOCK);

        let shm = InProcessSharedMem::new();
        let sector = parent_init(&shm);
        let mut g = sector.lock();

        const TEST_BLOCKS: usize = 10;
        let mut blocks = Vec::new();
        assert_eq!(g.alloc_blocks_from_free_list(TEST_BLOCKS, &mut blocks), TEST_BLOCKS);
        g.link_block_successors(&blocks);
        {
            let entry = g.entry_mut(0);
            entry.byte_size = (TEST_BLOCKS * BLOCK) as u64;
            entry.first_block = blocks[0];
        }

        let mut extracted = Vec::new();
        assert_eq!(g.block_list_for_entry(0, &mut extracted), Ok(TEST_BLOCKS));
        assert_eq!(extracted, blocks);

        // A byte size that disagrees with the chain is caught.
        g.entry_mut(0).byte_size = (TEST_BLOCKS * BLOCK + 1) as u64;
        let mut bad = vec![7];
        assert_eq!(
            g.block_list_for_entry(0, &mut bad),
            Err(IntegrityError::ChainLength {
                entry: 0,
                expected: TEST_BLOCKS + 1,
                walked: TEST_BLOCKS,
            })
        );
        assert_eq!(bad, vec![7]);

        g.entry_mut(0).byte_size = ((TEST_BLOCKS - 1) * BLOCK) as u64;
        assert!(matches!(
            g.block_list_for_entry(0, &mut bad),
            Err(IntegrityError::ChainLength { .. })
        ));
    }

    #[test]
    fn unlocked_section_releases_mutex() {
        let shm = InProcessSharedMem::new();
        let sector = parent_init(&shm);
        let mut g = sector.lock();
        assert!(!sector.mutex.try_lock());
        g.unlocked(|| {
            assert!(sector.mutex.try_lock());
            unsafe { sector.mutex.unlock() };
        });
        assert!(!sector.mutex.try_lock());
    }

    #[test]
    fn sector_must_fit_in_segment() {
        let shm = InProcessSharedMem::new();
        let seg = shm.create_segment("tiny", 64).unwrap();
        assert!(matches!(
            TestSector::initialize(seg, 0, shm.shared_mutex_size(), ENTRIES, BLOCKS),
            Err(Error::Config(_))
        ));
    }
}

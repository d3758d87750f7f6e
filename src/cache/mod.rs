//! Set-associative, sector-sharded key-value cache in shared memory.
//!
//! The segment is split into `num_sectors` equally sized [`Sector`]s. A key
//! is reduced to a 16-byte raw hash, which picks a sector and a set of
//! [`ASSOCIATIVITY`] consecutive directory slots in it. Payloads are stored
//! in chains of `BLOCK_SIZE`-byte blocks.
//!
//! Payload bytes are copied without holding the sector mutex. A writer
//! first marks the entry `creating`, which hides it from readers and other
//! writers; a reader bumps `open_count`, which keeps writers away from the
//! blocks until it is done.

pub mod config;
pub mod layout;
pub mod sector;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hashbrown::{HashMap, HashSet};

use crate::error::{Error, IntegrityError, Result};
use crate::interface::{validate_and_report_result, CacheInterface, Callback, KeyState};
use crate::key::{is_all_nil, to_raw_hash, KeyHasher, RawHash, HASH_SIZE};
use crate::shm::{SharedMemRuntime, SharedMemSegment};
use crate::timer::Timer;

pub use config::{Dimensions, SharedMemCacheConfig};
use layout::{BlockNum, CacheEntry, EntryNum, SectorStats, ASSOCIATIVITY, INVALID_BLOCK, INVALID_ENTRY};
use sector::{Sector, SectorGuard};
pub use snapshot::{SharedMemCacheDump, SharedMemCacheDumpEntry};

/// Where a raw hash lives: its sector and the first of its candidate slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    sector: usize,
    first_entry: EntryNum,
}

impl Position {
    fn candidates(&self) -> std::ops::Range<EntryNum> {
        self.first_entry..self.first_entry + ASSOCIATIVITY as EntryNum
    }
}

#[inline]
fn writeable(entry: &CacheEntry) -> bool {
    entry.open_count == 0 && entry.creating == 0
}

#[inline]
fn key_match(entry: &CacheEntry, raw_hash: &RawHash) -> bool {
    entry.hash_bytes == *raw_hash
}

pub struct SharedMemCache<const BLOCK_SIZE: usize> {
    runtime: Arc<dyn SharedMemRuntime>,
    filename: String,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn KeyHasher>,
    config: SharedMemCacheConfig,
    segment: Option<Arc<dyn SharedMemSegment>>,
    sectors: Vec<Sector<BLOCK_SIZE>>,
    shut_down: AtomicBool,
    oversize_logged: AtomicBool,
}

impl<const BLOCK_SIZE: usize> SharedMemCache<BLOCK_SIZE> {
    /// Nothing is mapped until [`initialize`](Self::initialize) (root
    /// process) or [`attach`](Self::attach) (every other process) succeeds.
    /// Until then Get misses and Put does nothing.
    pub fn new(
        runtime: Arc<dyn SharedMemRuntime>,
        filename: impl Into<String>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn KeyHasher>,
        config: SharedMemCacheConfig,
    ) -> Self {
        SharedMemCache {
            runtime,
            filename: filename.into(),
            timer,
            hasher,
            config,
            segment: None,
            sectors: Vec::new(),
            shut_down: AtomicBool::new(false),
            oversize_logged: AtomicBool::new(false),
        }
    }

    pub fn format_name() -> String {
        format!("SharedMemCache<{BLOCK_SIZE}>")
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn config(&self) -> &SharedMemCacheConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.segment.is_some()
    }

    /// Values larger than an eighth of a sector are refused.
    pub fn max_value_size(&self) -> usize {
        self.config.blocks_per_sector * BLOCK_SIZE / 8
    }

    pub fn compute_dimensions(total_bytes: usize, block_entry_ratio: usize, sectors: usize) -> Dimensions {
        config::compute_dimensions(total_bytes, block_entry_ratio, sectors, BLOCK_SIZE)
    }

    fn sector_size(&self) -> usize {
        Sector::<BLOCK_SIZE>::required_size(
            self.runtime.shared_mutex_size(),
            self.config.entries_per_sector,
            self.config.blocks_per_sector,
        )
    }

    /// Total bytes of the backing segment.
    pub fn segment_size(&self) -> usize {
        self.sector_size() * self.config.num_sectors
    }

    /// Root process: creates the segment and lays out every sector.
    pub fn initialize(&mut self) -> Result<()> {
        self.init_cache(true)
    }

    /// Child process: binds to a segment the root already created.
    pub fn attach(&mut self) -> Result<()> {
        self.init_cache(false)
    }

    fn init_cache(&mut self, parent: bool) -> Result<()> {
        let action = if parent { "create" } else { "attach" };
        if let Err(err) = self.config.validate() {
            tracing::error!(filename = %self.filename, %err, "SharedMemCache: bad configuration");
            return Err(err);
        }

        let sector_size = self.sector_size();
        let size = sector_size
            .checked_mul(self.config.num_sectors)
            .ok_or_else(|| Error::Config("segment size overflows usize".to_string()))?;

        let segment = if parent {
            self.runtime.create_segment(&self.filename, size)
        } else {
            self.runtime.attach_to_segment(&self.filename, size)
        };
        let segment = match segment {
            Ok(segment) => segment,
            Err(err) => {
                tracing::error!(filename = %self.filename, size, %err, "SharedMemCache: can't {action} segment");
                return Err(err);
            }
        };

        let mutex_size = self.runtime.shared_mutex_size();
        let mut sectors = Vec::with_capacity(self.config.num_sectors);
        for s in 0..self.config.num_sectors {
            let sector = if parent {
                Sector::<BLOCK_SIZE>::initialize(
                    segment.clone(),
                    s * sector_size,
                    mutex_size,
                    self.config.entries_per_sector,
                    self.config.blocks_per_sector,
                )
            } else {
                Sector::<BLOCK_SIZE>::attach(
                    segment.clone(),
                    s * sector_size,
                    mutex_size,
                    self.config.entries_per_sector,
                    self.config.blocks_per_sector,
                )
            };
            match sector {
                Ok(sector) => sectors.push(sector),
                Err(err) => {
                    tracing::error!(filename = %self.filename, sector = s, %err, "SharedMemCache: can't {action} sector");
                    return Err(err);
                }
            }
        }

        self.sectors = sectors;
        self.segment = Some(segment);

        if parent {
            tracing::info!(
                filename = %self.filename,
                sectors = self.config.num_sectors,
                entries_per_sector = self.config.entries_per_sector,
                block_size = BLOCK_SIZE,
                blocks_per_sector = self.config.blocks_per_sector,
                footprint = size,
                "SharedMemCache: created"
            );
        }
        Ok(())
    }

    /// Root process, at exit: removes the segment.
    pub fn global_cleanup(runtime: &dyn SharedMemRuntime, filename: &str) -> Result<()> {
        runtime.destroy_segment(filename)
    }

    fn extract_position(&self, raw_hash: &RawHash) -> Position {
        let word = |i: usize| u32::from_le_bytes([raw_hash[i], raw_hash[i + 1], raw_hash[i + 2], raw_hash[i + 3]]);
        let sector = word(12) as usize % self.sectors.len();
        let sets = self.config.entries_per_sector / ASSOCIATIVITY;
        let first_entry = (word(0) as usize % sets) * ASSOCIATIVITY;
        Position {
            sector,
            first_entry: first_entry as EntryNum,
        }
    }

    // ---- Put ----

    fn put_raw_hash(&self, raw_hash: &RawHash, last_use_timestamp_ms: i64, value: &[u8]) {
        if self.sectors.is_empty() {
            tracing::debug!(filename = %self.filename, "put on uninitialized cache ignored");
            return;
        }

        let max_size = self.max_value_size();
        if value.len() > max_size {
            if !self.oversize_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(size = value.len(), limit = max_size, "unable to insert object, over cache size limit");
            } else {
                tracing::debug!(size = value.len(), limit = max_size, "unable to insert object, over cache size limit");
            }
            return;
        }

        let pos = self.extract_position(raw_hash);
        let mut guard = self.sectors[pos.sector].lock();
        guard.stats_mut().num_put += 1;

        // If the key is already present we always stop here, so that a
        // second copy can never appear in the set.
        if let Some(e) = pos.candidates().find(|&e| key_match(guard.entry(e), raw_hash)) {
            if guard.entry(e).creating != 0 {
                guard.stats_mut().num_put_concurrent_create += 1;
                return;
            }
            guard.stats_mut().num_put_update += 1;
            if self.ensure_ready_for_writing(&mut guard, e) {
                self.put_into_entry(&mut guard, e, raw_hash, last_use_timestamp_ms, value);
            }
            return;
        }

        // Otherwise take a free slot, or the stalest one nobody is using.
        let rank = |c: &CacheEntry| (!is_all_nil(&c.hash_bytes), c.last_use_timestamp_ms);
        let mut best: Option<EntryNum> = None;
        for e in pos.candidates() {
            let cand = guard.entry(e);
            if !writeable(cand) {
                continue;
            }
            match best {
                Some(b) if rank(guard.entry(b)) <= rank(cand) => {}
                _ => best = Some(e),
            }
        }
        let Some(best) = best else {
            guard.stats_mut().num_put_concurrent_full_set += 1;
            return;
        };

        {
            let victim = guard.entry(best);
            if victim.byte_size != 0 || !is_all_nil(&victim.hash_bytes) {
                guard.stats_mut().num_put_replace += 1;
            }
        }
        guard.unlink_entry_from_lru(best);
        let entry = guard.entry_mut(best);
        entry.creating = 1;
        entry.hash_bytes = *raw_hash;
        self.put_into_entry(&mut guard, best, raw_hash, last_use_timestamp_ms, value);
    }

    /// Claims live entry `e` for writing: marks it `creating` so no new
    /// reader joins, then waits a bounded time for current readers to leave.
    /// On timeout the entry goes back to the LRU untouched and `false` is
    /// returned, unless a Delete arrived meanwhile; then the entry is left
    /// for its last reader to free.
    fn ensure_ready_for_writing(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum) -> bool {
        guard.unlink_entry_from_lru(e);
        guard.entry_mut(e).creating = 1;

        let mut spins = 0;
        while guard.entry(e).open_count > 0 {
            if spins >= self.config.max_put_spins {
                guard.entry_mut(e).creating = 0;
                if guard.entry(e).pending_delete != 0 {
                    guard.entry_mut(e).hash_bytes = [0; HASH_SIZE];
                } else {
                    guard.insert_entry_into_lru(e);
                }
                guard.stats_mut().num_put_concurrent_full_set += 1;
                tracing::debug!(entry = e, spins, "readers did not drain, abandoning put");
                return false;
            }
            spins += 1;
            guard.stats_mut().num_put_spins += 1;
            let timer = &self.timer;
            let sleep_us = self.config.put_spin_sleep_us;
            guard.unlocked(|| timer.sleep_us(sleep_us));
        }
        true
    }

    /// Stores `value` into entry `e`, which the caller has marked
    /// `creating` and removed from the LRU.
    fn put_into_entry(
        &self,
        guard: &mut SectorGuard<'_, BLOCK_SIZE>,
        e: EntryNum,
        raw_hash: &RawHash,
        last_use_timestamp_ms: i64,
        value: &[u8],
    ) {
        debug_assert!(guard.entry(e).creating != 0);
        debug_assert_eq!(guard.entry(e).open_count, 0);

        let want_blocks = Sector::<BLOCK_SIZE>::data_blocks_for_size(value.len());
        let mut blocks = Vec::with_capacity(want_blocks);
        if let Err(err) = guard.block_list_for_entry(e, &mut blocks) {
            tracing::error!(filename = %self.filename, %err, "dropping corrupt block chain on put");
            self.reclaim_corrupt_chain(guard, e, &[]);
        }

        if blocks.len() < want_blocks {
            let goal = want_blocks - blocks.len();
            if !self.try_allocate_blocks(guard, goal, &mut blocks) {
                // Give everything back and drop the write.
                guard.return_blocks_to_free_list(&blocks);
                guard.entry_mut(e).creating = 0;
                self.mark_entry_free(guard, e);
                guard.stats_mut().num_put_dropped += 1;
                tracing::warn!(size = value.len(), "no room for value even after eviction, dropping put");
                return;
            }
        }

        if blocks.len() > want_blocks {
            let extras = blocks.split_off(want_blocks);
            guard.return_blocks_to_free_list(&extras);
        }

        guard.link_block_successors(&blocks);
        let first_block = blocks.first().copied().unwrap_or(INVALID_BLOCK);
        {
            let entry = guard.entry_mut(e);
            entry.byte_size = value.len() as u64;
            entry.first_block = first_block;
            entry.last_use_timestamp_ms = last_use_timestamp_ms;
        }

        // The blocks are off the free list and the entry is hidden behind
        // `creating`, so the copy can run unlocked.
        let sector = guard.sector();
        guard.unlocked(|| copy_into_blocks(sector, &blocks, value));

        debug_assert!(key_match(guard.entry(e), raw_hash));
        // A Delete that raced the copy is ordered before this Put.
        let entry = guard.entry_mut(e);
        entry.creating = 0;
        entry.pending_delete = 0;
        guard.insert_entry_into_lru(e);
    }

    /// Gathers `goal` more blocks into `blocks`, first from the free list,
    /// then by evicting unused entries from the LRU rear.
    fn try_allocate_blocks(
        &self,
        guard: &mut SectorGuard<'_, BLOCK_SIZE>,
        goal: usize,
        blocks: &mut Vec<BlockNum>,
    ) -> bool {
        let mut got = guard.alloc_blocks_from_free_list(goal, blocks);

        let mut e = guard.oldest_entry_num();
        while e != INVALID_ENTRY && got < goal {
            if writeable(guard.entry(e)) {
                match guard.block_list_for_entry(e, blocks) {
                    Ok(n) => got += n,
                    Err(err) => {
                        tracing::error!(filename = %self.filename, %err, "evicting corrupt entry");
                        self.reclaim_corrupt_chain(guard, e, blocks);
                        self.mark_entry_free(guard, e);
                        got += guard.alloc_blocks_from_free_list(goal - got, blocks);
                        e = guard.oldest_entry_num();
                        continue;
                    }
                }
                self.mark_entry_free(guard, e);
                e = guard.oldest_entry_num();
            } else {
                e = guard.entry(e).lru_prev;
            }
        }
        got >= goal
    }

    /// Gives back the blocks of `e`'s damaged chain that are neither free,
    /// in `held`, nor reachable from another entry, and detaches the chain
    /// from `e`.
    fn reclaim_corrupt_chain(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum, held: &[BlockNum]) {
        let sector = guard.sector();
        let mut owned: HashSet<BlockNum> = held.iter().copied().collect();
        let mut free = HashSet::new();
        let mut b = guard.free_list_front();
        while b >= 0 && (b as usize) < sector.num_blocks() && free.insert(b) {
            b = guard.block_successor(b);
        }
        owned.extend(free);

        let mut chain = Vec::new();
        for other in (0..sector.num_entries() as EntryNum).filter(|&other| other != e) {
            guard.chain_prefix(other, &mut chain);
        }
        owned.extend(chain.drain(..));

        guard.chain_prefix(e, &mut chain);
        chain.retain(|b| !owned.contains(b));
        guard.return_blocks_to_free_list(&chain);
        let entry = guard.entry_mut(e);
        entry.first_block = INVALID_BLOCK;
        entry.byte_size = 0;
        tracing::warn!(filename = %self.filename, entry = e, reclaimed = chain.len(), "reclaimed corrupt block chain");

        let violations = check_sector(guard);
        if !violations.is_empty() {
            tracing::error!(
                filename = %self.filename,
                violations = violations.len(),
                "sector still damaged after reclaiming corrupt chain"
            );
        }
    }

    /// Resets the slot; its blocks must already be accounted for.
    fn mark_entry_free(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum) {
        guard.unlink_entry_from_lru(e);
        let entry = guard.entry_mut(e);
        debug_assert!(writeable(entry));
        entry.hash_bytes = [0; HASH_SIZE];
        entry.last_use_timestamp_ms = 0;
        entry.byte_size = 0;
        entry.first_block = INVALID_BLOCK;
        entry.pending_delete = 0;
    }

    fn touch_entry(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, last_use_timestamp_ms: i64, e: EntryNum) {
        guard.unlink_entry_from_lru(e);
        guard.insert_entry_into_lru(e);
        guard.entry_mut(e).last_use_timestamp_ms = last_use_timestamp_ms;
    }

    // ---- Get ----

    fn get_raw_hash(&self, raw_hash: &RawHash) -> Option<Bytes> {
        if self.sectors.is_empty() {
            return None;
        }
        let pos = self.extract_position(raw_hash);
        let mut guard = self.sectors[pos.sector].lock();
        guard.stats_mut().num_get += 1;

        let e = pos.candidates().find(|&e| {
            let cand = guard.entry(e);
            key_match(cand, raw_hash) && cand.creating == 0
        })?;
        guard.stats_mut().num_get_hit += 1;
        self.get_from_entry(&mut guard, e)
    }

    fn get_from_entry(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum) -> Option<Bytes> {
        let mut blocks = Vec::new();
        if let Err(err) = guard.block_list_for_entry(e, &mut blocks) {
            tracing::error!(filename = %self.filename, %err, "corrupt cache entry, treating as miss");
            if writeable(guard.entry(e)) {
                self.reclaim_corrupt_chain(guard, e, &[]);
                self.mark_entry_free(guard, e);
            }
            return None;
        }

        let byte_size = guard.entry(e).byte_size as usize;
        guard.entry_mut(e).open_count += 1;
        self.touch_entry(guard, self.timer.now_ms(), e);

        // While open_count is held no writer touches these blocks.
        let sector = guard.sector();
        let value = guard.unlocked(|| copy_from_blocks(sector, &blocks, byte_size));

        self.release_reader(guard, e, &blocks);
        Some(value)
    }

    /// Drops one reader reference. The last reader out of an entry whose
    /// delete was deferred frees it, unless a writer has claimed the entry
    /// in the meantime.
    fn release_reader(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum, blocks: &[BlockNum]) {
        let entry = guard.entry_mut(e);
        debug_assert!(entry.open_count > 0);
        entry.open_count -= 1;
        if entry.open_count == 0 && entry.pending_delete != 0 && entry.creating == 0 {
            guard.return_blocks_to_free_list(blocks);
            self.mark_entry_free(guard, e);
        }
    }

    // ---- Delete ----

    fn delete_raw_hash(&self, raw_hash: &RawHash) {
        if self.sectors.is_empty() {
            return;
        }
        let pos = self.extract_position(raw_hash);
        let mut guard = self.sectors[pos.sector].lock();
        if let Some(e) = pos.candidates().find(|&e| key_match(guard.entry(e), raw_hash)) {
            self.delete_entry(&mut guard, e);
        }
    }

    fn delete_entry(&self, guard: &mut SectorGuard<'_, BLOCK_SIZE>, e: EntryNum) {
        let entry = guard.entry(e);
        if entry.creating != 0 {
            // The writer settles it: a finished Put wins, an abandoned one
            // leaves the entry deleted.
            guard.entry_mut(e).pending_delete = 1;
            return;
        }

        if entry.open_count == 0 {
            let mut blocks = Vec::new();
            match guard.block_list_for_entry(e, &mut blocks) {
                Ok(_) => guard.return_blocks_to_free_list(&blocks),
                Err(err) => {
                    tracing::error!(filename = %self.filename, %err, "deleting corrupt entry");
                    self.reclaim_corrupt_chain(guard, e, &[]);
                }
            }
            self.mark_entry_free(guard, e);
        } else {
            // Hide it now, free it when the last reader leaves.
            guard.unlink_entry_from_lru(e);
            let entry = guard.entry_mut(e);
            entry.hash_bytes = [0; HASH_SIZE];
            entry.pending_delete = 1;
        }
    }

    /// Deletes every live entry in every sector.
    pub fn clear(&self) {
        for sector in &self.sectors {
            let mut guard = sector.lock();
            for e in 0..sector.num_entries() as EntryNum {
                if !is_all_nil(&guard.entry(e).hash_bytes) {
                    self.delete_entry(&mut guard, e);
                }
            }
        }
    }

    // ---- Snapshots ----

    pub fn num_sectors(&self) -> usize {
        self.sectors.len()
    }

    /// Checkpoint stamp of `sector_num`, as last set by
    /// [`add_sector_to_snapshot`](Self::add_sector_to_snapshot).
    pub fn last_checkpoint_ms(&self, sector_num: usize) -> Option<i64> {
        let sector = self.sectors.get(sector_num)?;
        let stamp = sector.lock().stats().last_checkpoint_ms;
        Some(stamp)
    }

    pub fn set_last_checkpoint_ms(&self, sector_num: usize, last_checkpoint_ms: i64) {
        if let Some(sector) = self.sectors.get(sector_num) {
            sector.lock().stats_mut().last_checkpoint_ms = last_checkpoint_ms;
        }
    }

    /// Appends the live entries of one sector to `dest`, oldest first.
    ///
    /// Only proceeds if `last_checkpoint_ms` still matches the sector's
    /// stamp, and then re-stamps the sector with the current time. Of
    /// several processes racing to checkpoint a sector exactly one wins;
    /// the others get `false` and leave `dest` untouched.
    pub fn add_sector_to_snapshot(
        &self,
        sector_num: usize,
        last_checkpoint_ms: i64,
        dest: &mut SharedMemCacheDump,
    ) -> bool {
        let Some(sector) = self.sectors.get(sector_num) else {
            tracing::warn!(sector = sector_num, sectors = self.sectors.len(), "snapshot of unknown sector");
            return false;
        };
        let mut guard = sector.lock();
        let stamp = guard.stats().last_checkpoint_ms;
        debug_assert!(last_checkpoint_ms <= stamp);
        if last_checkpoint_ms != stamp {
            // Somebody else checkpointed this sector already.
            return false;
        }
        self.dump_sector(&guard, dest);
        guard.stats_mut().last_checkpoint_ms = self.timer.now_ms();
        true
    }

    fn dump_sector(&self, guard: &SectorGuard<'_, BLOCK_SIZE>, dest: &mut SharedMemCacheDump) {
        let sector = guard.sector();
        let mut e = guard.oldest_entry_num();
        while e != INVALID_ENTRY {
            let entry = guard.entry(e);
            if entry.creating == 0 {
                let mut blocks = Vec::new();
                match guard.block_list_for_entry(e, &mut blocks) {
                    Ok(_) => dest.entries.push(SharedMemCacheDumpEntry {
                        raw_key: entry.hash_bytes,
                        value: copy_from_blocks(sector, &blocks, entry.byte_size as usize),
                        last_use_timestamp_ms: entry.last_use_timestamp_ms,
                    }),
                    Err(err) => tracing::error!(filename = %self.filename, %err, "skipping corrupt entry in snapshot"),
                }
            }
            e = entry.lru_prev;
        }
    }

    /// Every live entry of every sector, without touching checkpoint stamps.
    pub fn snapshot(&self) -> SharedMemCacheDump {
        let mut dump = SharedMemCacheDump::new();
        for sector in &self.sectors {
            let guard = sector.lock();
            self.dump_sector(&guard, &mut dump);
        }
        dump
    }

    /// Re-inserts every entry of `dump` with its recorded timestamp.
    pub fn restore_snapshot(&self, dump: &SharedMemCacheDump) {
        for entry in &dump.entries {
            if is_all_nil(&entry.raw_key) {
                tracing::warn!("skipping snapshot entry with empty hash");
                continue;
            }
            self.put_raw_hash(&entry.raw_key, entry.last_use_timestamp_ms, &entry.value);
        }
    }

    // ---- Diagnostics ----

    pub fn stats(&self) -> SectorStats {
        let mut aggregate = SectorStats::default();
        for sector in &self.sectors {
            aggregate.add(sector.lock().stats());
        }
        aggregate
    }

    pub fn dump_stats(&self) -> String {
        self.stats().dump(
            self.config.entries_per_sector * self.sectors.len(),
            self.config.blocks_per_sector * self.sectors.len(),
        )
    }

    /// Verifies the structural invariants of every sector, logging each
    /// violation. Returns the first damaged sector's report.
    pub fn sanity_check(&self) -> std::result::Result<(), IntegrityError> {
        let mut first_failure = None;
        for (s, sector) in self.sectors.iter().enumerate() {
            let guard = sector.lock();
            let violations = check_sector(&guard);
            if violations.is_empty() {
                continue;
            }
            for violation in &violations {
                tracing::error!(filename = %self.filename, sector = s, "{violation}");
            }
            first_failure.get_or_insert(IntegrityError::Sector { sector: s, violations });
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn copy_into_blocks<const BLOCK_SIZE: usize>(sector: &Sector<BLOCK_SIZE>, blocks: &[BlockNum], value: &[u8]) {
    debug_assert_eq!(blocks.len(), value.len().div_ceil(BLOCK_SIZE));
    for (chunk, &b) in value.chunks(BLOCK_SIZE).zip(blocks) {
        // Safety: `b` is in range (checked by block_ptr) and the chunk is at
        // most BLOCK_SIZE bytes.
        unsafe { std::ptr::copy_nonoverlapping(chunk.as_ptr(), sector.block_ptr(b), chunk.len()) }
    }
}

fn copy_from_blocks<const BLOCK_SIZE: usize>(
    sector: &Sector<BLOCK_SIZE>,
    blocks: &[BlockNum],
    byte_size: usize,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(byte_size);
    let total = blocks.len();
    for (i, &b) in blocks.iter().enumerate() {
        let n = Sector::<BLOCK_SIZE>::bytes_in_portion(byte_size, i, total);
        buf.extend_from_slice(unsafe { std::slice::from_raw_parts(sector.block_ptr(b), n) });
    }
    buf.freeze()
}

fn check_sector<const BLOCK_SIZE: usize>(guard: &SectorGuard<'_, BLOCK_SIZE>) -> Vec<String> {
    let sector = guard.sector();
    let num_entries = sector.num_entries() as EntryNum;
    let num_blocks = sector.num_blocks();
    let mut violations = Vec::new();

    // Every block must be in exactly one chain or on the free list.
    let mut block_occur: HashMap<BlockNum, u32> = HashMap::with_capacity(num_blocks);
    for e in 0..num_entries {
        let mut blocks = Vec::new();
        match guard.block_list_for_entry(e, &mut blocks) {
            Ok(_) => {
                for b in blocks {
                    *block_occur.entry(b).or_default() += 1;
                }
            }
            Err(err) => violations.push(err.to_string()),
        }
    }

    let mut free_blocks = 0usize;
    let mut b = guard.free_list_front();
    while b != INVALID_BLOCK {
        if b < 0 || b as usize >= num_blocks {
            violations.push(format!("free list reaches out-of-range block {b}"));
            break;
        }
        if free_blocks > num_blocks {
            violations.push("free list has a cycle".to_string());
            break;
        }
        *block_occur.entry(b).or_default() += 1;
        free_blocks += 1;
        b = guard.block_successor(b);
    }

    for b in 0..num_blocks as BlockNum {
        match block_occur.get(&b).copied().unwrap_or(0) {
            1 => {}
            0 => violations.push(format!("block {b} is neither free nor in a chain")),
            n => violations.push(format!("block {b} appears {n} times")),
        }
    }

    let used_blocks = guard.stats().used_blocks;
    if used_blocks != (num_blocks - free_blocks.min(num_blocks)) as i64 {
        violations.push(format!(
            "used_blocks is {used_blocks}, but {free_blocks} of {num_blocks} blocks are free"
        ));
    }

    // LRU links, front to rear.
    let mut in_lru = HashSet::new();
    let mut prev = INVALID_ENTRY;
    let mut e = guard.lru_front();
    while e != INVALID_ENTRY {
        if e < 0 || e >= num_entries {
            violations.push(format!("LRU reaches out-of-range entry {e}"));
            break;
        }
        if !in_lru.insert(e) {
            violations.push(format!("LRU has a cycle through entry {e}"));
            break;
        }
        let entry = guard.entry(e);
        if entry.lru_prev != prev {
            violations.push(format!("entry {e}: lru_prev is {}, expected {prev}", entry.lru_prev));
        }
        prev = e;
        e = entry.lru_next;
    }
    if guard.oldest_entry_num() != prev {
        violations.push(format!("LRU rear is {}, walk ended at {prev}", guard.oldest_entry_num()));
    }
    let used_entries = guard.stats().used_entries;
    if used_entries != in_lru.len() as i64 {
        violations.push(format!("used_entries is {used_entries}, LRU holds {}", in_lru.len()));
    }

    for e in 0..num_entries {
        let entry = guard.entry(e);
        let live = !is_all_nil(&entry.hash_bytes) && entry.creating == 0;
        if live != in_lru.contains(&e) {
            violations.push(format!("entry {e}: live is {live} but LRU membership disagrees"));
        }
        if entry.pending_delete != 0
            && entry.creating == 0
            && (!is_all_nil(&entry.hash_bytes) || entry.open_count == 0)
        {
            violations.push(format!("entry {e}: pending delete without readers"));
        }
        if is_all_nil(&entry.hash_bytes) && entry.pending_delete == 0 && entry.first_block != INVALID_BLOCK {
            violations.push(format!("entry {e}: free slot still owns blocks"));
        }
    }

    violations
}

impl<const BLOCK_SIZE: usize> CacheInterface for SharedMemCache<BLOCK_SIZE> {
    fn get(&self, key: &[u8], callback: &mut dyn Callback) {
        let raw_hash = to_raw_hash(self.hasher.as_ref(), key);
        let state = match self.get_raw_hash(&raw_hash) {
            Some(value) => {
                callback.set_value(value);
                KeyState::Available
            }
            None => KeyState::NotFound,
        };
        validate_and_report_result(key, state, callback);
    }

    fn put(&self, key: &[u8], value: Bytes) {
        let raw_hash = to_raw_hash(self.hasher.as_ref(), key);
        self.put_raw_hash(&raw_hash, self.timer.now_ms(), &value);
    }

    fn delete(&self, key: &[u8]) {
        let raw_hash = to_raw_hash(self.hasher.as_ref(), key);
        self.delete_raw_hash(&raw_hash);
    }

    fn name(&self) -> String {
        Self::format_name()
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

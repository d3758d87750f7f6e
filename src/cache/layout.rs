/// `#[repr(C)]` structures that live inside a sector of the shared segment.
///
/// All fields are fixed-size and ordered so that no implicit padding is
/// inserted; every process mapping the segment sees the same layout.
use std::fmt::Write as _;

use crate::key::HASH_SIZE;
use crate::shm::align_up_8;

pub type BlockNum = i32;
pub type EntryNum = i32;

/// Sentinel for "no block" in successor links and `first_block`.
pub const INVALID_BLOCK: BlockNum = -1;

/// Sentinel for "no entry" in LRU links.
pub const INVALID_ENTRY: EntryNum = -1;

/// Candidate directory slots per key.
pub const ASSOCIATIVITY: usize = 4;

/// Per-sector counters. Only touched under the sector mutex.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectorStats {
    pub num_put: i64,
    pub num_put_update: i64,
    pub num_put_replace: i64,
    pub num_put_concurrent_create: i64,
    pub num_put_concurrent_full_set: i64,
    pub num_put_spins: i64,
    pub num_put_dropped: i64,
    pub num_get: i64,
    pub num_get_hit: i64,
    pub used_entries: i64,
    pub used_blocks: i64,
    pub last_checkpoint_ms: i64,
}

const _: () = assert!(std::mem::size_of::<SectorStats>() == 96);

impl SectorStats {
    /// Accumulates `other` into `self`. The checkpoint stamp keeps the most
    /// recent of the two.
    pub fn add(&mut self, other: &SectorStats) {
        self.num_put += other.num_put;
        self.num_put_update += other.num_put_update;
        self.num_put_replace += other.num_put_replace;
        self.num_put_concurrent_create += other.num_put_concurrent_create;
        self.num_put_concurrent_full_set += other.num_put_concurrent_full_set;
        self.num_put_spins += other.num_put_spins;
        self.num_put_dropped += other.num_put_dropped;
        self.num_get += other.num_get;
        self.num_get_hit += other.num_get_hit;
        self.used_entries += other.used_entries;
        self.used_blocks += other.used_blocks;
        self.last_checkpoint_ms = self.last_checkpoint_ms.max(other.last_checkpoint_ms);
    }

    /// Plain-text report; `total_entries` and `total_blocks` are the
    /// capacities the usage counters are compared against.
    pub fn dump(&self, total_entries: usize, total_blocks: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total put operations: {}", self.num_put);
        let _ = writeln!(out, "  updating an existing key: {}", self.num_put_update);
        let _ = writeln!(out, "  replacing another key: {}", self.num_put_replace);
        let _ = writeln!(
            out,
            "  simultaneous same-key insert: {}",
            self.num_put_concurrent_create
        );
        let _ = writeln!(
            out,
            "  dropped since all slots busy: {}",
            self.num_put_concurrent_full_set
        );
        let _ = writeln!(out, "  dropped for lack of space: {}", self.num_put_dropped);
        let _ = writeln!(
            out,
            "  spins waiting for readers: {}",
            self.num_put_spins
        );
        let _ = writeln!(out, "Total get operations: {}", self.num_get);
        let _ = writeln!(out, "  hits: {}", self.num_get_hit);
        let _ = writeln!(
            out,
            "Entries used: {} ({})",
            self.used_entries,
            percent(self.used_entries, total_entries)
        );
        let _ = writeln!(
            out,
            "Blocks used: {} ({})",
            self.used_blocks,
            percent(self.used_blocks, total_blocks)
        );
        out
    }
}

fn percent(used: i64, total: usize) -> String {
    if total == 0 {
        return "n/a".to_string();
    }
    format!("{:.1}%", used as f64 * 100.0 / total as f64)
}

/// Start of every sector. The sector mutex follows immediately after.
#[repr(C)]
#[derive(Debug)]
pub struct SectorHeader {
    pub free_list_front: BlockNum,
    pub lru_front: EntryNum,
    pub lru_rear: EntryNum,
    pub _pad: i32,
    pub stats: SectorStats,
}

pub const SECTOR_HEADER_SIZE: usize = std::mem::size_of::<SectorHeader>();

const _: () = assert!(SECTOR_HEADER_SIZE % 8 == 0);

/// One directory slot.
///
/// `lru_prev` points toward the LRU front (more recently used), `lru_next`
/// toward the rear. An all-zero `hash_bytes` marks a free slot, or a slot
/// whose deletion waits for its last reader (`pending_delete`).
#[repr(C)]
#[derive(Debug)]
pub struct CacheEntry {
    pub hash_bytes: [u8; HASH_SIZE], // 0..16
    pub last_use_timestamp_ms: i64,  // 16..24
    pub byte_size: u64,              // 24..32
    pub lru_prev: EntryNum,          // 32..36
    pub lru_next: EntryNum,          // 36..40
    pub first_block: BlockNum,       // 40..44
    pub open_count: u32,             // 44..48
    pub creating: u32,               // 48..52
    pub pending_delete: u32,         // 52..56
}

pub const CACHE_ENTRY_SIZE: usize = std::mem::size_of::<CacheEntry>();

const _: () = assert!(CACHE_ENTRY_SIZE == 56);

/// Byte offsets of each part of a sector, relative to the sector start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLayout {
    pub mutex_offset: usize,
    pub entries_offset: usize,
    pub successors_offset: usize,
    pub blocks_offset: usize,
    pub total_size: usize,
}

impl SectorLayout {
    pub const fn new(
        mutex_size: usize,
        entries_per_sector: usize,
        blocks_per_sector: usize,
        block_size: usize,
    ) -> Self {
        let mutex_offset = SECTOR_HEADER_SIZE;
        let entries_offset = align_up_8(mutex_offset + mutex_size);
        let successors_offset = entries_offset + align_up_8(entries_per_sector * CACHE_ENTRY_SIZE);
        let blocks_offset = successors_offset
            + align_up_8(blocks_per_sector * std::mem::size_of::<BlockNum>());
        let total_size = align_up_8(blocks_offset + blocks_per_sector * block_size);
        SectorLayout {
            mutex_offset,
            entries_offset,
            successors_offset,
            blocks_offset,
            total_size,
        }
    }
}

#[inline]
pub const fn data_blocks_for_size(byte_size: usize, block_size: usize) -> usize {
    byte_size.div_ceil(block_size)
}

/// Number of payload bytes stored in block `b` (0-based) of a
/// `total_blocks`-long chain holding `total_bytes` bytes.
#[inline]
pub fn bytes_in_portion(total_bytes: usize, b: usize, total_blocks: usize, block_size: usize) -> usize {
    if b + 1 != total_blocks {
        block_size
    } else {
        let rem = total_bytes % block_size;
        if rem == 0 {
            block_size
        } else {
            rem
        }
    }
}

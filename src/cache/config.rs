use crate::error::{Error, Result};

use super::layout::{BlockNum, ASSOCIATIVITY, CACHE_ENTRY_SIZE};

/// Geometry and write-retry policy of a [`super::SharedMemCache`].
///
/// Every process attaching to the same segment must use the same geometry
/// (`num_sectors`, `entries_per_sector`, `blocks_per_sector`); the spin
/// settings are per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemCacheConfig {
    pub num_sectors: usize,
    /// Directory slots per sector; a positive multiple of the associativity.
    pub entries_per_sector: usize,
    pub blocks_per_sector: usize,
    /// How many times a Put re-checks for readers before giving up.
    pub max_put_spins: u32,
    pub put_spin_sleep_us: u64,
}

impl Default for SharedMemCacheConfig {
    fn default() -> Self {
        SharedMemCacheConfig {
            num_sectors: 64,
            entries_per_sector: 1024,
            blocks_per_sector: 4096,
            max_put_spins: 100,
            put_spin_sleep_us: 50,
        }
    }
}

impl SharedMemCacheConfig {
    pub fn new(num_sectors: usize, entries_per_sector: usize, blocks_per_sector: usize) -> Self {
        SharedMemCacheConfig {
            num_sectors,
            entries_per_sector,
            blocks_per_sector,
            ..Default::default()
        }
    }

    pub fn with_num_sectors(mut self, num_sectors: usize) -> Self {
        self.num_sectors = num_sectors;
        self
    }

    pub fn with_entries_per_sector(mut self, entries_per_sector: usize) -> Self {
        self.entries_per_sector = entries_per_sector;
        self
    }

    pub fn with_blocks_per_sector(mut self, blocks_per_sector: usize) -> Self {
        self.blocks_per_sector = blocks_per_sector;
        self
    }

    pub fn with_max_put_spins(mut self, max_put_spins: u32) -> Self {
        self.max_put_spins = max_put_spins;
        self
    }

    pub fn with_put_spin_sleep_us(mut self, put_spin_sleep_us: u64) -> Self {
        self.put_spin_sleep_us = put_spin_sleep_us;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_sectors == 0 {
            return Err(Error::Config("num_sectors must be positive".to_string()));
        }
        if self.entries_per_sector == 0 || self.entries_per_sector % ASSOCIATIVITY != 0 {
            return Err(Error::Config(format!(
                "entries_per_sector must be a positive multiple of {ASSOCIATIVITY}, got {}",
                self.entries_per_sector
            )));
        }
        if self.blocks_per_sector == 0 {
            return Err(Error::Config("blocks_per_sector must be positive".to_string()));
        }
        let max = BlockNum::MAX as usize;
        if self.entries_per_sector > max || self.blocks_per_sector > max {
            return Err(Error::Config(format!(
                "entries_per_sector and blocks_per_sector must not exceed {max}"
            )));
        }
        Ok(())
    }
}

/// Parameters suggested by [`compute_dimensions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub entries_per_sector: usize,
    pub blocks_per_sector: usize,
    /// Largest value the resulting cache will store.
    pub max_value_size: usize,
}

/// Splits `total_bytes` over `sectors` sectors holding `block_entry_ratio`
/// blocks per entry on average.
///
/// Each entry costs one directory slot, each block `block_size` bytes plus
/// its successor link; sector headers are ignored. Entries are rounded down
/// to a multiple of the associativity.
pub fn compute_dimensions(
    total_bytes: usize,
    block_entry_ratio: usize,
    sectors: usize,
    block_size: usize,
) -> Dimensions {
    let per_sector = total_bytes / sectors.max(1);
    let bytes_per_entry =
        (block_size + std::mem::size_of::<BlockNum>()) * block_entry_ratio + CACHE_ENTRY_SIZE;
    let entries_per_sector = (per_sector / bytes_per_entry) / ASSOCIATIVITY * ASSOCIATIVITY;
    let blocks_per_sector = entries_per_sector * block_entry_ratio;
    Dimensions {
        entries_per_sector,
        blocks_per_sector,
        max_value_size: blocks_per_sector * block_size / 8,
    }
}

//! Named locks shared between processes.
//!
//! Lock names hash into a fixed number of buckets inside one segment. Each
//! bucket has its own shared mutex, which only guards a handful of slot
//! records; the named lock itself is a slot owned by a [`SharedMemLock`].
//! Holders are identified by an owner id drawn from a counter in the
//! segment header, so ids are unique across processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::key::KeyHasher;
use crate::shm::{align_up_8, ScopedMutex, SharedMemRuntime, SharedMemSegment, SharedMutex};
use crate::timer::Timer;

const LOCK_SLEEP_US: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemLockManagerConfig {
    pub num_buckets: usize,
    /// Names that may be held at once within one bucket.
    pub slots_per_bucket: usize,
}

impl Default for SharedMemLockManagerConfig {
    fn default() -> Self {
        SharedMemLockManagerConfig {
            num_buckets: 64,
            slots_per_bucket: 16,
        }
    }
}

impl SharedMemLockManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 || self.slots_per_bucket == 0 {
            return Err(Error::Config(format!(
                "lock manager needs at least one bucket and slot, got {} x {}",
                self.num_buckets, self.slots_per_bucket
            )));
        }
        Ok(())
    }
}

#[repr(C)]
struct LockHeader {
    next_owner: AtomicU64,
}

/// `hash == 0` marks a free slot.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct LockSlot {
    hash: u64,
    owner: u64,
    acquired_at_ms: i64,
}

const HEADER_SIZE: usize = align_up_8(std::mem::size_of::<LockHeader>());
const SLOT_SIZE: usize = std::mem::size_of::<LockSlot>();

const _: () = assert!(SLOT_SIZE == 24);

struct Bucket {
    mutex: Box<dyn SharedMutex>,
    slots: *mut LockSlot,
    num_slots: usize,
}

// Safety: slots are only touched while `mutex` is held.
unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

impl Bucket {
    /// # Safety
    /// The caller must hold `self.mutex`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots(&self) -> &mut [LockSlot] {
        std::slice::from_raw_parts_mut(self.slots, self.num_slots)
    }
}

enum Acquire {
    Free,
    Steal { held_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refused {
    Held,
    BucketFull,
    Uninitialized,
}

pub struct SharedMemLockManager {
    runtime: Arc<dyn SharedMemRuntime>,
    filename: String,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn KeyHasher>,
    config: SharedMemLockManagerConfig,
    segment: Option<Arc<dyn SharedMemSegment>>,
    buckets: Vec<Bucket>,
}

impl SharedMemLockManager {
    pub fn new(
        runtime: Arc<dyn SharedMemRuntime>,
        filename: impl Into<String>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn KeyHasher>,
        config: SharedMemLockManagerConfig,
    ) -> Self {
        SharedMemLockManager {
            runtime,
            filename: filename.into(),
            timer,
            hasher,
            config,
            segment: None,
            buckets: Vec::new(),
        }
    }

    fn bucket_size(&self) -> usize {
        align_up_8(self.runtime.shared_mutex_size()) + self.config.slots_per_bucket * SLOT_SIZE
    }

    pub fn segment_size(&self) -> usize {
        HEADER_SIZE + self.config.num_buckets * self.bucket_size()
    }

    pub fn is_initialized(&self) -> bool {
        self.segment.is_some()
    }

    /// Root process: creates the segment and every bucket mutex.
    pub fn initialize(&mut self) -> Result<()> {
        self.init(true)
    }

    pub fn attach(&mut self) -> Result<()> {
        self.init(false)
    }

    fn init(&mut self, parent: bool) -> Result<()> {
        self.config.validate()?;
        let size = self.segment_size();
        let segment = if parent {
            self.runtime.create_segment(&self.filename, size)
        } else {
            self.runtime.attach_to_segment(&self.filename, size)
        }
        .inspect_err(|err| tracing::error!(filename = %self.filename, %err, "SharedMemLockManager: segment setup failed"))?;

        let bucket_size = self.bucket_size();
        let slots_offset = align_up_8(self.runtime.shared_mutex_size());
        let mut buckets = Vec::with_capacity(self.config.num_buckets);
        for b in 0..self.config.num_buckets {
            let offset = HEADER_SIZE + b * bucket_size;
            let mutex = if parent {
                segment.initialize_shared_mutex(offset)?
            } else {
                segment.attach_to_shared_mutex(offset)?
            };
            // Safety: offset + bucket_size <= segment size and the offset is 8-aligned.
            let slots = unsafe { segment.base().add(offset + slots_offset) } as *mut LockSlot;
            buckets.push(Bucket {
                mutex,
                slots,
                num_slots: self.config.slots_per_bucket,
            });
        }

        // The segment is zero-filled on creation: every slot starts free and
        // owner ids start at 0.
        self.buckets = buckets;
        self.segment = Some(segment);
        Ok(())
    }

    pub fn global_cleanup(runtime: &dyn SharedMemRuntime, filename: &str) -> Result<()> {
        runtime.destroy_segment(filename)
    }

    pub fn create_lock(&self, name: impl Into<String>) -> SharedMemLock<'_> {
        let name = name.into();
        let raw = self.hasher.raw_hash(name.as_bytes());
        let mut hash = u64::from_le_bytes([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]);
        if hash == 0 {
            hash = 1;
        }
        SharedMemLock {
            manager: self,
            name,
            hash,
            owner: self.next_owner(),
            held: false,
        }
    }

    fn next_owner(&self) -> u64 {
        match &self.segment {
            // Safety: the header sits at offset 0 of a segment at least
            // HEADER_SIZE long, aligned to 8.
            Some(segment) => {
                let header = unsafe { &*(segment.base() as *const LockHeader) };
                header.next_owner.fetch_add(1, Ordering::Relaxed) + 1
            }
            None => 0,
        }
    }

    fn bucket_for(&self, hash: u64) -> Option<&Bucket> {
        if self.buckets.is_empty() {
            return None;
        }
        self.buckets.get((hash % self.buckets.len() as u64) as usize)
    }

    /// Takes the slot for `hash` if it is free, or if `steal_ms` is given and
    /// the holder has had it at least that long.
    fn acquire(&self, hash: u64, owner: u64, steal_ms: Option<i64>) -> std::result::Result<Acquire, Refused> {
        let bucket = self.bucket_for(hash).ok_or(Refused::Uninitialized)?;
        let _lock = ScopedMutex::new(bucket.mutex.as_ref());
        // Safety: bucket mutex held.
        let slots = unsafe { bucket.slots() };
        let now = self.timer.now_ms();

        if let Some(slot) = slots.iter_mut().find(|s| s.hash == hash) {
            let held_ms = now - slot.acquired_at_ms;
            return match steal_ms {
                Some(steal_ms) if slot.owner != owner && held_ms >= steal_ms => {
                    slot.owner = owner;
                    slot.acquired_at_ms = now;
                    Ok(Acquire::Steal { held_ms })
                }
                _ => Err(Refused::Held),
            };
        }

        match slots.iter_mut().find(|s| s.hash == 0) {
            Some(slot) => {
                *slot = LockSlot {
                    hash,
                    owner,
                    acquired_at_ms: now,
                };
                Ok(Acquire::Free)
            }
            None => Err(Refused::BucketFull),
        }
    }

    /// Frees the slot for `hash` if `owner` holds it; `false` otherwise.
    fn release(&self, hash: u64, owner: u64) -> bool {
        let Some(bucket) = self.bucket_for(hash) else {
            return false;
        };
        let _lock = ScopedMutex::new(bucket.mutex.as_ref());
        // Safety: bucket mutex held.
        let slots = unsafe { bucket.slots() };
        match slots.iter_mut().find(|s| s.hash == hash && s.owner == owner) {
            Some(slot) => {
                *slot = LockSlot {
                    hash: 0,
                    owner: 0,
                    acquired_at_ms: 0,
                };
                true
            }
            None => false,
        }
    }

    fn holder(&self, hash: u64) -> Option<u64> {
        let bucket = self.bucket_for(hash)?;
        let _lock = ScopedMutex::new(bucket.mutex.as_ref());
        // Safety: bucket mutex held.
        let slots = unsafe { bucket.slots() };
        slots.iter().find(|s| s.hash == hash).map(|s| s.owner)
    }
}

/// One process's handle on a named lock. Released on drop if still held.
pub struct SharedMemLock<'a> {
    manager: &'a SharedMemLockManager,
    name: String,
    hash: u64,
    owner: u64,
    held: bool,
}

impl SharedMemLock<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle currently owns the lock. A lock stolen by
    /// someone else reads as not held.
    pub fn held(&self) -> bool {
        self.held && self.manager.holder(self.hash) == Some(self.owner)
    }

    pub fn try_lock(&mut self) -> bool {
        self.try_acquire(None, &mut false)
    }

    /// Like [`try_lock`](Self::try_lock), but takes over a lock whose holder
    /// acquired it `steal_ms` or more milliseconds ago.
    pub fn try_lock_steal_old(&mut self, steal_ms: i64) -> bool {
        self.try_acquire(Some(steal_ms), &mut false)
    }

    /// Waits as long as it takes.
    pub fn lock(&mut self) {
        let mut warned = false;
        while !self.try_acquire(None, &mut warned) {
            self.manager.timer.sleep_us(LOCK_SLEEP_US);
        }
    }

    pub fn lock_timed_wait(&mut self, wait_ms: i64) -> bool {
        self.wait_for(wait_ms, None)
    }

    pub fn lock_timed_wait_steal_old(&mut self, wait_ms: i64, steal_ms: i64) -> bool {
        self.wait_for(wait_ms, Some(steal_ms))
    }

    pub fn unlock(&mut self) {
        if !self.held {
            tracing::warn!(name = %self.name, "unlock of a lock that is not held");
            return;
        }
        self.held = false;
        if !self.manager.release(self.hash, self.owner) {
            tracing::warn!(name = %self.name, "lock was stolen before unlock");
        }
    }

    /// `warned` carries across the retries of one wait, so a full bucket is
    /// reported once per wait rather than once per attempt.
    fn try_acquire(&mut self, steal_ms: Option<i64>, warned: &mut bool) -> bool {
        if self.owner == 0 {
            tracing::debug!(name = %self.name, "lock manager not initialized");
            return false;
        }
        if self.held() {
            return false;
        }
        match self.manager.acquire(self.hash, self.owner, steal_ms) {
            Ok(Acquire::Free) => {}
            Ok(Acquire::Steal { held_ms }) => {
                tracing::warn!(name = %self.name, held_ms, "stealing lock from old holder");
            }
            Err(Refused::BucketFull) if !*warned => {
                *warned = true;
                tracing::warn!(
                    filename = %self.manager.filename,
                    name = %self.name,
                    "SharedMemLockManager: bucket full, lock unavailable"
                );
                return false;
            }
            Err(refused) => {
                tracing::trace!(name = %self.name, ?refused, "lock not acquired");
                return false;
            }
        }
        self.held = true;
        true
    }

    /// Sleeps are counted rather than measured, so a frozen test clock still
    /// bounds the wait.
    fn wait_for(&mut self, wait_ms: i64, steal_ms: Option<i64>) -> bool {
        let budget_us = wait_ms.max(0) as u64 * 1_000;
        let mut waited_us = 0;
        let mut warned = false;
        loop {
            if self.try_acquire(steal_ms, &mut warned) {
                return true;
            }
            if waited_us >= budget_us {
                return false;
            }
            self.manager.timer.sleep_us(LOCK_SLEEP_US);
            waited_us += LOCK_SLEEP_US;
        }
    }
}

impl Drop for SharedMemLock<'_> {
    fn drop(&mut self) {
        if self.held {
            self.held = false;
            self.manager.release(self.hash, self.owner);
        }
    }
}

//! Shared-memory runtime.
//!
//! A runtime hands out named, fixed-size segments and places cross-process
//! mutexes inside them. One process (the root) creates a segment and
//! initializes the mutexes in it; every other participant attaches by name.
//!
//! Two runtimes are provided: [`region::PosixSharedMem`] maps files under
//! `/dev/shm` and uses process-shared pthread mutexes, and
//! [`in_process::InProcessSharedMem`] keeps segments on the heap and is meant
//! for threads of a single process (tests mostly).
pub mod in_process;
#[cfg(not(target_os = "windows"))]
pub mod lock;
#[cfg(not(target_os = "windows"))]
pub mod region;

use std::sync::Arc;

use crate::error::{Error, Result};

/// A mutex whose state lives inside a shared segment.
pub trait SharedMutex: Send + Sync {
    fn lock(&self);
    fn try_lock(&self) -> bool;

    /// # Safety
    /// The calling thread must currently hold the lock.
    unsafe fn unlock(&self);
}

/// An attachment to a named segment. Dropping it detaches; the segment
/// itself survives until the runtime destroys it.
pub trait SharedMemSegment: Send + Sync {
    fn name(&self) -> &str;
    fn base(&self) -> *mut u8;
    fn size(&self) -> usize;

    /// Places a fresh mutex at `offset`. Called exactly once per mutex, by
    /// the creator, before anyone attaches to it.
    fn initialize_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>>;

    fn attach_to_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>>;
}

pub trait SharedMemRuntime: Send + Sync {
    /// Bytes a mutex occupies inside a segment (always a multiple of 8).
    fn shared_mutex_size(&self) -> usize;

    /// Creates a zero-filled segment. Fails if `name` already exists.
    fn create_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>>;

    /// Fails if `name` does not exist or was created with another size.
    fn attach_to_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>>;

    /// After this, attach attempts fail until the name is created again.
    /// Existing attachments stay valid.
    fn destroy_segment(&self, name: &str) -> Result<()>;
}

/// Holds a [`SharedMutex`] for the lifetime of the guard.
pub struct ScopedMutex<'a> {
    mutex: &'a dyn SharedMutex,
}

impl<'a> ScopedMutex<'a> {
    pub fn new(mutex: &'a dyn SharedMutex) -> Self {
        mutex.lock();
        ScopedMutex { mutex }
    }
}

impl Drop for ScopedMutex<'_> {
    fn drop(&mut self) {
        // SAFETY: acquired in `new`.
        unsafe { self.mutex.unlock() }
    }
}

#[inline]
pub const fn align_up_8(n: usize) -> usize {
    (n + 7) & !7
}

pub(crate) fn check_mutex_placement(
    segment_size: usize,
    offset: usize,
    mutex_size: usize,
) -> Result<()> {
    if offset % 8 != 0 || offset.checked_add(mutex_size).map_or(true, |end| end > segment_size) {
        return Err(Error::MutexOutOfRange {
            offset,
            size: segment_size,
        });
    }
    Ok(())
}

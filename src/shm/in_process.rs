//! Heap-backed runtime for a single process.
//!
//! Segments are zeroed heap allocations registered by name; mutexes are
//! `parking_lot` raw mutexes written into the segment bytes. Segment lifetime
//! is explicit: `destroy_segment` only unregisters the name, memory is freed
//! once the last attachment goes away.

use std::alloc::{self, Layout};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

use super::{check_mutex_placement, SharedMemRuntime, SharedMemSegment, SharedMutex};
use crate::error::{Error, Result};

const MUTEX_SIZE: usize = 8;
const REGION_ALIGN: usize = 64;

const _: () = assert!(std::mem::size_of::<RawMutex>() <= MUTEX_SIZE);
const _: () = assert!(std::mem::align_of::<RawMutex>() <= 8);

struct Region {
    ptr: *mut u8,
    layout: Layout,
    size: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(8), REGION_ALIGN)
            .map_err(|e| Error::Config(format!("bad segment size {size}: {e}")))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Ok(Region { ptr, layout, size })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) }
    }
}

#[derive(Default)]
pub struct InProcessSharedMem {
    segments: Mutex<HashMap<String, Arc<Region>>>,
}

impl InProcessSharedMem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.lock().len()
    }
}

impl SharedMemRuntime for InProcessSharedMem {
    fn shared_mutex_size(&self) -> usize {
        MUTEX_SIZE
    }

    fn create_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>> {
        let mut segments = self.segments.lock();
        if segments.contains_key(name) {
            tracing::error!(name, "shared memory segment already exists");
            return Err(Error::SegmentExists(name.to_string()));
        }
        let region = Arc::new(Region::new(size)?);
        segments.insert(name.to_string(), region.clone());
        Ok(Arc::new(InProcessSegment {
            name: name.to_string(),
            region,
        }))
    }

    fn attach_to_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>> {
        let segments = self.segments.lock();
        let Some(region) = segments.get(name) else {
            tracing::error!(name, "attach to missing shared memory segment");
            return Err(Error::SegmentNotFound(name.to_string()));
        };
        if region.size != size {
            tracing::error!(name, expected = size, actual = region.size, "segment size mismatch");
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual: region.size,
            });
        }
        Ok(Arc::new(InProcessSegment {
            name: name.to_string(),
            region: region.clone(),
        }))
    }

    fn destroy_segment(&self, name: &str) -> Result<()> {
        match self.segments.lock().remove(name) {
            Some(_) => Ok(()),
            None => {
                tracing::warn!(name, "destroying shared memory segment that does not exist");
                Err(Error::SegmentNotFound(name.to_string()))
            }
        }
    }
}

struct InProcessSegment {
    name: String,
    region: Arc<Region>,
}

impl InProcessSegment {
    fn mutex_at(&self, offset: usize) -> Result<Box<dyn SharedMutex>> {
        check_mutex_placement(self.region.size, offset, MUTEX_SIZE)?;
        Ok(Box::new(InProcessMutex {
            raw: unsafe { self.region.ptr.add(offset) } as *const RawMutex,
            _region: self.region.clone(),
        }))
    }
}

impl SharedMemSegment for InProcessSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> *mut u8 {
        self.region.ptr
    }

    fn size(&self) -> usize {
        self.region.size
    }

    fn initialize_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>> {
        check_mutex_placement(self.region.size, offset, MUTEX_SIZE)?;
        // Safety: in range and 8-aligned (region base is 64-aligned).
        unsafe {
            std::ptr::write_bytes(self.region.ptr.add(offset), 0, MUTEX_SIZE);
            std::ptr::write(self.region.ptr.add(offset) as *mut RawMutex, RawMutex::INIT);
        }
        self.mutex_at(offset)
    }

    fn attach_to_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>> {
        self.mutex_at(offset)
    }
}

struct InProcessMutex {
    raw: *const RawMutex,
    _region: Arc<Region>,
}

unsafe impl Send for InProcessMutex {}
unsafe impl Sync for InProcessMutex {}

impl SharedMutex for InProcessMutex {
    fn lock(&self) {
        unsafe { (*self.raw).lock() }
    }

    fn try_lock(&self) -> bool {
        unsafe { (*self.raw).try_lock() }
    }

    unsafe fn unlock(&self) {
        (*self.raw).unlock()
    }
}

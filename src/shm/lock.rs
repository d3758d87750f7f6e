/// Process-shared pthread mutex stored inside a mapped segment.
///
/// The mutex occupies `MUTEX_SIZE` bytes at an 8-aligned offset. The root
/// process initializes it once with `PTHREAD_PROCESS_SHARED`; every other
/// attachment just points at the same bytes.
use std::io;
use std::sync::Arc;

use super::region::Mapping;
use super::{align_up_8, SharedMutex};

/// Bytes reserved for one mutex in the segment.
pub const MUTEX_SIZE: usize = align_up_8(std::mem::size_of::<libc::pthread_mutex_t>());

pub struct PthreadMutex {
    ptr: *mut libc::pthread_mutex_t,
    // Keeps the mapping alive for as long as the mutex is reachable.
    _mapping: Arc<Mapping>,
}

unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl PthreadMutex {
    /// Initialize a new process-shared mutex at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `MUTEX_SIZE` writable bytes inside
    /// `mapping` that no other process is using yet.
    pub unsafe fn init(ptr: *mut u8, mapping: Arc<Mapping>) -> io::Result<Self> {
        std::ptr::write_bytes(ptr, 0, MUTEX_SIZE);
        let mutex = ptr as *mut libc::pthread_mutex_t;

        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr))?;
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(rc));
        }
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        check(rc)?;

        Ok(PthreadMutex {
            ptr: mutex,
            _mapping: mapping,
        })
    }

    /// Attach to an already-initialized mutex.
    ///
    /// # Safety
    /// `ptr` must point to a mutex previously set up with [`PthreadMutex::init`].
    pub unsafe fn from_existing(ptr: *mut u8, mapping: Arc<Mapping>) -> Self {
        PthreadMutex {
            ptr: ptr as *mut libc::pthread_mutex_t,
            _mapping: mapping,
        }
    }
}

impl SharedMutex for PthreadMutex {
    fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.ptr) };
        if rc != 0 {
            tracing::error!(rc, "pthread_mutex_lock failed");
        }
    }

    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.ptr) == 0 }
    }

    unsafe fn unlock(&self) {
        let rc = libc::pthread_mutex_unlock(self.ptr);
        if rc != 0 {
            tracing::error!(rc, "pthread_mutex_unlock failed");
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

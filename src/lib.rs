//! A fixed-size key-value cache living in shared memory, usable from every
//! process attached to the same segment.
//!
//! See [`SharedMemCache`] for the cache itself and [`SharedMemLockManager`]
//! for named cross-process locks. Both run on a [`shm::SharedMemRuntime`]:
//! [`shm::region::PosixSharedMem`] in production,
//! [`shm::in_process::InProcessSharedMem`] for single-process use and tests.

pub mod cache;
pub mod error;
pub mod interface;
pub mod key;
pub mod lock_manager;
pub mod shm;
pub mod timer;

pub use cache::{Dimensions, SharedMemCache, SharedMemCacheConfig, SharedMemCacheDump, SharedMemCacheDumpEntry};
pub use error::{Error, IntegrityError, Result, SnapshotError};
pub use interface::{CacheInterface, Callback, KeyState, SynchronousCallback};
pub use key::{KeyHasher, RawHash, SeededHasher};
pub use lock_manager::{SharedMemLock, SharedMemLockManager, SharedMemLockManagerConfig};
pub use timer::{MockTimer, SystemTimer, Timer};

/// OS-backed shared memory runtime using mmap.
///
/// Each segment is a file in a shared-memory directory (`/dev/shm` on
/// Linux) mapped `MAP_SHARED`, so every process that maps the same name sees
/// the same bytes. Mutexes inside a segment are process-shared pthread
/// mutexes (see [`super::lock`]).
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;

use super::lock::{PthreadMutex, MUTEX_SIZE};
use super::{check_mutex_placement, SharedMemRuntime, SharedMemSegment, SharedMutex};
use crate::error::{Error, Result};

/// Where to store the segment files.
fn default_shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("shm_sector_cache")
    }
}

/// A live mapping. Shared by the segment handle and every mutex placed in
/// it, so the memory stays mapped while any of them is alive.
pub struct Mapping {
    mmap: MmapMut,
    base: *mut u8,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(file: &fs::File) -> io::Result<Self> {
        // Safety: the file is only ever accessed through mappings; all
        // structured access is coordinated by mutexes inside the mapping.
        let mut mmap = unsafe { MmapMut::map_mut(file)? };
        let base = mmap.as_mut_ptr();
        Ok(Mapping { mmap, base })
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }
}

#[derive(Debug, Clone)]
pub struct PosixSharedMem {
    dir: PathBuf,
}

impl PosixSharedMem {
    pub fn new() -> Self {
        PosixSharedMem {
            dir: default_shm_dir(),
        }
    }

    /// Keep segment files in `dir` instead of the platform default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        PosixSharedMem { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment names are often path-like; flatten them into one file name.
    fn segment_path(&self, name: &str) -> PathBuf {
        let flat: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{flat}.shm"))
    }
}

impl Default for PosixSharedMem {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemRuntime for PosixSharedMem {
    fn shared_mutex_size(&self) -> usize {
        MUTEX_SIZE
    }

    fn create_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>> {
        let path = self.segment_path(name);
        let result = (|| -> Result<PosixSegment> {
            fs::create_dir_all(&self.dir)?;
            let file = match fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(Error::SegmentExists(name.to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            // Extending the file zero-fills it.
            file.set_len(size as u64)?;
            let mapping = Mapping::new(&file)?;
            Ok(PosixSegment {
                name: name.to_string(),
                mapping: Arc::new(mapping),
            })
        })();

        match result {
            Ok(segment) => Ok(Arc::new(segment)),
            Err(err) => {
                tracing::error!(name, size, path = %path.display(), %err, "failed to create shared memory segment");
                Err(err)
            }
        }
    }

    fn attach_to_segment(&self, name: &str, size: usize) -> Result<Arc<dyn SharedMemSegment>> {
        let path = self.segment_path(name);
        let result = (|| -> Result<PosixSegment> {
            let file = match fs::OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::SegmentNotFound(name.to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            let actual = file.metadata()?.len() as usize;
            if actual != size {
                return Err(Error::SizeMismatch {
                    name: name.to_string(),
                    expected: size,
                    actual,
                });
            }
            let mapping = Mapping::new(&file)?;
            Ok(PosixSegment {
                name: name.to_string(),
                mapping: Arc::new(mapping),
            })
        })();

        match result {
            Ok(segment) => Ok(Arc::new(segment)),
            Err(err) => {
                tracing::error!(name, size, %err, "failed to attach to shared memory segment");
                Err(err)
            }
        }
    }

    fn destroy_segment(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.segment_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(name, "destroying shared memory segment that does not exist");
                Err(Error::SegmentNotFound(name.to_string()))
            }
            Err(e) => {
                tracing::error!(name, err = %e, "failed to destroy shared memory segment");
                Err(e.into())
            }
        }
    }
}

pub struct PosixSegment {
    name: String,
    mapping: Arc<Mapping>,
}

impl SharedMemSegment for PosixSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> *mut u8 {
        self.mapping.base
    }

    fn size(&self) -> usize {
        self.mapping.len()
    }

    fn initialize_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>> {
        check_mutex_placement(self.size(), offset, MUTEX_SIZE)?;
        // Safety: placement checked above; the creator initializes each
        // mutex exactly once before anyone attaches.
        let mutex = unsafe { PthreadMutex::init(self.base().add(offset), self.mapping.clone()) }
            .map_err(|err| {
                tracing::error!(segment = %self.name, offset, %err, "failed to initialize shared mutex");
                Error::MutexInit(err)
            })?;
        Ok(Box::new(mutex))
    }

    fn attach_to_shared_mutex(&self, offset: usize) -> Result<Box<dyn SharedMutex>> {
        check_mutex_placement(self.size(), offset, MUTEX_SIZE)?;
        let mutex = unsafe { PthreadMutex::from_existing(self.base().add(offset), self.mapping.clone()) };
        Ok(Box::new(mutex))
    }
}

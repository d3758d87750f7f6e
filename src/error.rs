use std::io;

/// Errors raised while creating or attaching shared state.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("shared memory segment `{0}` already exists")]
    SegmentExists(String),
    #[error("shared memory segment `{0}` does not exist")]
    SegmentNotFound(String),
    #[error("shared memory segment `{name}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("shared mutex at offset {offset} does not fit in a {size}-byte segment")]
    MutexOutOfRange { offset: usize, size: usize },
    #[error("failed to initialize shared mutex: {0}")]
    MutexInit(io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Snapshot decoding failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot is empty")]
    Empty,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("{0} trailing bytes after the last snapshot record")]
    TrailingBytes(usize),
}

/// Structural damage detected inside a sector.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("entry {entry}: block chain has {walked} blocks, byte size needs {expected}")]
    ChainLength {
        entry: i32,
        expected: usize,
        walked: usize,
    },
    #[error("entry {entry}: block {block} is out of range")]
    BlockOutOfRange { entry: i32, block: i32 },
    #[error("sector {sector}: {} invariant violation(s)", .violations.len())]
    Sector {
        sector: usize,
        violations: Vec<String>,
    },
}

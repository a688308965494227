//! Error type shared by every fallible heap operation.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::config::RegionIndex;

/// Errors reported by the persistent heap.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An OS call on a backing file failed.
    Io {
        /// The file being operated on.
        path: PathBuf,
        /// The underlying OS error.
        source: io::Error,
    },
    /// The region has no room left for the request. Not retryable.
    OutOfSpace {
        /// The exhausted region.
        region: RegionIndex,
        /// Requested size in bytes.
        requested: usize,
    },
    /// Alignment is not a power of two or is smaller than a pointer.
    InvalidAlignment(usize),
    /// Configured heap size is outside the supported range.
    InvalidHeapSize(usize),
    /// A size computation overflowed.
    SizeOverflow,
    /// A backing file does not hold a heap of the expected shape.
    Corrupted {
        /// The offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// Another live session holds the heap.
    HeapBusy(PathBuf),
    /// The heap was found dirty and `recover` has not run yet.
    RecoveryPending,
    /// The global heap has not been initialised.
    NotInitialized,
    /// The global heap is already initialised.
    AlreadyInitialized,
    /// The pointer does not point into the superblock arena.
    ForeignPointer(usize),
    /// The pointer is inside the arena but is not a live block.
    InvalidFree(usize),
    /// Root index is not below `MAX_ROOTS`.
    RootIndexOutOfRange(usize),
    /// No region has this index.
    InvalidRegion(usize),
    /// The heap has been closed.
    Closed,
}

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::OutOfSpace { region, requested } => {
                write!(f, "{region:?} region cannot fit {requested} more bytes")
            }
            Self::InvalidAlignment(align) => {
                write!(f, "alignment {align} is not a power of two of at least pointer size")
            }
            Self::InvalidHeapSize(size) => write!(f, "heap size {size} is out of range"),
            Self::SizeOverflow => f.write_str("allocation size overflows"),
            Self::Corrupted { path, reason } => {
                write!(f, "{} is corrupted: {reason}", path.display())
            }
            Self::HeapBusy(path) => write!(f, "{} is held by another session", path.display()),
            Self::RecoveryPending => f.write_str("heap was not shut down cleanly; call recover() first"),
            Self::NotInitialized => f.write_str("heap is not initialized"),
            Self::AlreadyInitialized => f.write_str("heap is already initialized"),
            Self::ForeignPointer(addr) => write!(f, "{addr:#x} is not inside the heap"),
            Self::InvalidFree(addr) => write!(f, "{addr:#x} is not a live allocation"),
            Self::RootIndexOutOfRange(i) => write!(f, "root index {i} is out of range"),
            Self::InvalidRegion(i) => write!(f, "no region with index {i}"),
            Self::Closed => f.write_str("heap is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

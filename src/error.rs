use thiserror::Error;

use crate::offset::{Off, NIL};

/// Errors raised by the region substrate (mapping, allocator, journal,
/// epoch reclamation, façade). One variant per error kind named in the
/// design: `io`, `out_of_memory`, `out_of_region`, `invalid_argument`,
/// `corruption`, plus the I/O-adjacent failures specific to file-backed
/// regions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegionError {
    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),

    /// Couldn't take the exclusive advisory lock on the backing file.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),

    /// Couldn't synchronize to the backing file.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),

    /// Couldn't resize the backing file or the mapping.
    #[error("can't resize the region: have {current} bytes, wanted {requested} bytes")]
    ResizeFailed {
        current: usize,
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    /// The mapping or the backing store is exhausted and `grow` failed.
    #[error("out of region space: tried to get {requested} more bytes")]
    OutOfRegion {
        requested: usize,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A process-heap allocation (defer node, journal buffer, thread record)
    /// failed.
    #[error("out of memory allocating {context}")]
    OutOfMemory { context: &'static str },

    /// Zero length, nil offset, bad option combination, or similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Magic/version mismatch, bad journal trailer, corrupted checksum.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),

    /// An access fell outside the mapped extent.
    #[error("invalid access at offset {offset:#x} with length {len:#x}")]
    InvalidAccess { offset: Off, len: usize },

    /// Forking or waiting on the journal-writer child failed.
    #[error("journal child process failed")]
    Journal(#[source] std::io::Error),
}

impl RegionError {
    /// True for conditions the design classifies as unrecoverable: mapping
    /// failures, persistence-path corruption, lock syscall failures. The
    /// façade aborts the process after logging these rather than returning
    /// them to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegionError::Lock(_) | RegionError::Corruption(_) | RegionError::InvalidAccess { .. }
        )
    }
}

/// Result code returned alongside a value by every hash table operation,
/// matching the `{code, prev_value}` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCode {
    Ok,
    NotFound,
    /// A `cmp_xchg`/`cmp_del` lost its compare, or the probe window was
    /// exhausted with no further table to fall back on.
    Stop,
    Error,
}

/// The `{code, prev_value}` pair every hash operation returns.
#[derive(Debug, Clone, Copy)]
pub struct HashRet {
    pub code: HashCode,
    pub prev_value: Off,
}

impl HashRet {
    pub const fn ok(value: Off) -> Self {
        Self { code: HashCode::Ok, prev_value: value }
    }

    pub const fn not_found() -> Self {
        Self { code: HashCode::NotFound, prev_value: NIL }
    }

    pub const fn stop(value: Off) -> Self {
        Self { code: HashCode::Stop, prev_value: value }
    }

    pub const fn error() -> Self {
        Self { code: HashCode::Error, prev_value: NIL }
    }
}

pub type Result<T> = std::result::Result<T, RegionError>;

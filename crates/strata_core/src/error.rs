//! # Allocator Error Types
//!
//! All errors that can occur in the allocator, from the allocation hot path
//! to the snapshot file boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the world allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No free block is large enough, even after defragmentation.
    #[error("out of memory: requested {requested} bytes, largest free block is {largest_free}")]
    OutOfMemory {
        /// The aligned size that was requested.
        requested: usize,
        /// The largest free block at the time of failure.
        largest_free: usize,
    },

    /// The block table is full; the arena is too fragmented to split further.
    #[error("block table exhausted: {max_blocks} blocks in use")]
    MaxBlocksReached {
        /// Capacity of the block table.
        max_blocks: usize,
    },

    /// Free was given an offset that matches no used block.
    #[error("deallocation failed: no used block at offset {offset}")]
    DeallocationFailed {
        /// The offset carried by the rejected handle.
        offset: u32,
    },

    /// The element type needs a stricter alignment than the arena provides.
    #[error("unsupported alignment {align}, arena blocks are 16-byte aligned")]
    UnsupportedAlignment {
        /// Alignment of the rejected type.
        align: usize,
    },

    /// An access reached past the end of the arena.
    #[error("access out of bounds: offset {offset}, length {len}")]
    OutOfBounds {
        /// Starting offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
    },

    /// The block table no longer satisfies its invariants.
    #[error("corrupt block table: {0}")]
    CorruptBlockTable(String),

    /// A snapshot buffer could not be decoded.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// The snapshot file does not exist.
    #[error("snapshot file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Any other I/O failure at the file boundary.
    #[error("i/o error: {0}")]
    Io(String),

    /// The compressed snapshot stream could not be decompressed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Invalid allocator configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AllocError::OutOfMemory {
            requested: 128,
            largest_free: 64,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: requested 128 bytes, largest free block is 64"
        );

        let err = AllocError::FileNotFound(PathBuf::from("world.snap"));
        assert_eq!(err.to_string(), "snapshot file not found: world.snap");
    }
}

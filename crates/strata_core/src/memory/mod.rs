//! # Memory Management
//!
//! One pre-allocated arena per world, carved into blocks by a first-fit
//! heap, addressed by relocatable offsets.
//!
//! ## Design Philosophy
//!
//! All memory is allocated once at startup. During simulation:
//! - Allocation never touches the system allocator
//! - Every reference into the arena is an offset, never an address
//! - The whole world can be snapshotted and restored elsewhere

mod allocator;
mod arena;
mod block;
mod handle;
mod persistence;
mod vec;

pub use allocator::{MemoryStats, WorldAllocator};
pub use arena::Arena;
pub use block::{Block, BlockTable};
pub use handle::{revalidate_all, Handle, Revalidate, TypedPtr};
pub use persistence::{BLOCK_DESCRIPTOR_SIZE, SNAPSHOT_HEADER_SIZE};
pub use vec::{ArenaVec, ArenaVecIter, RawArenaVec};

/// Block alignment in bytes. Every block offset and size is a multiple.
pub const ALIGNMENT: usize = 16;

/// Cache line size assumed for arena alignment and container growth.
pub const CACHE_LINE_SIZE: usize = 64;

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(16));
        assert_eq!(align_up(16), Some(16));
        assert_eq!(align_up(100), Some(112));
        assert_eq!(align_up(usize::MAX), None);
    }
}

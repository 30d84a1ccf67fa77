//! # World Allocator
//!
//! First-fit heap over a single fixed arena, shared by every worker thread.
//!
//! ## Allocation path
//!
//! ```text
//! allocate_raw(100)
//!   │  align_up(100, 16) = 112
//!   ▼
//! [ Spinlock ] ── first-fit scan from block 0
//!   │               ├─ fits exactly  → mark used
//!   │               ├─ fits, larger  → split, tail stays free
//!   │               └─ nothing fits  → coalesce, retry once
//!   ▼
//! Handle { block_index, offset }
//! ```
//!
//! Every allocate, free and defragment runs entirely inside one spinlock
//! section. The arena bytes themselves are never locked: a thread owns the
//! bytes of the blocks it allocated.

use std::fmt::Write as _;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;

use crate::config::{AllocatorConfig, DefragPolicy};
use crate::error::{AllocError, AllocResult};
use crate::sync::{SpinMutex, SpinMutexGuard};

use super::arena::Arena;
use super::block::{Block, BlockTable};
use super::handle::{Handle, TypedPtr};
use super::{align_up, ALIGNMENT};

/// Diagnostic snapshot of the allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Arena size in bytes.
    pub total_size: usize,
    /// Bytes in used blocks.
    pub used_size: usize,
    /// Bytes in free blocks.
    pub free_size: usize,
    /// Number of defragment passes run so far.
    pub defragmentation_cycles: u64,
    /// Live entries in the block table.
    pub block_count: usize,
    /// Largest free block in bytes.
    pub largest_free_block: usize,
}

/// Fixed-capacity, relocatable allocator backing a whole simulation world.
///
/// Hands out [`Handle`]s (byte offsets) rather than addresses, so everything
/// allocated here survives [`serialize`](Self::serialize) /
/// [`deserialize`](Self::deserialize) into an arena at a different address.
///
/// # Thread Safety
///
/// `WorldAllocator` is `Send + Sync`. Allocate, free and defragment take
/// `&self` and serialize on an internal [`Spinlock`](crate::Spinlock).
/// Operations that move the arena take `&mut self`.
///
/// # Example
///
/// ```rust,ignore
/// let allocator = WorldAllocator::new(AllocatorConfig::small_world())?;
///
/// let handle = allocator.allocate_raw(100)?;
/// let pos: TypedPtr<[f32; 3]> = allocator.allocate_ptr()?;
///
/// allocator.free(handle)?;
/// allocator.free(pos)?;
/// ```
pub struct WorldAllocator {
    /// The byte arena.
    pub(super) arena: Arena,
    /// Block bookkeeping, guarded by the spinlock.
    pub(super) table: SpinMutex<BlockTable>,
    /// Coalescing policy on the allocation path.
    defrag_policy: DefragPolicy,
    /// Configured block table capacity.
    pub(super) max_blocks: usize,
    /// Number of defragment passes.
    defragmentation_count: AtomicU64,
}

impl WorldAllocator {
    /// Creates an allocator with its arena and block table.
    ///
    /// All memory is allocated here, once.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if the configuration is invalid,
    /// or [`AllocError::OutOfMemory`] if the arena cannot be allocated.
    pub fn new(config: AllocatorConfig) -> AllocResult<Self> {
        config.validate()?;

        let arena = Arena::new(config.total_size)?;
        let total = Self::total_u32(config.total_size)?;

        tracing::debug!(
            total_size = config.total_size,
            max_blocks = config.max_blocks,
            "world allocator created"
        );

        Ok(Self {
            arena,
            table: SpinMutex::new(BlockTable::new(total, config.max_blocks)),
            defrag_policy: config.defrag_policy,
            max_blocks: config.max_blocks,
            defragmentation_count: AtomicU64::new(0),
        })
    }

    /// Creates an allocator with `total_size` bytes and default settings.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new).
    pub fn with_capacity(total_size: usize) -> AllocResult<Self> {
        Self::new(AllocatorConfig::default().with_total_size(total_size))
    }

    pub(super) fn total_u32(total_size: usize) -> AllocResult<u32> {
        u32::try_from(total_size).map_err(|_| {
            AllocError::InvalidConfig(format!("total_size {total_size} does not fit in u32"))
        })
    }

    /// Base address of the arena. Changes only through `&mut self` reloads.
    #[inline]
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.arena.base()
    }

    /// Arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Configured block table capacity.
    #[inline]
    #[must_use]
    pub const fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Coalescing policy on the allocation path.
    #[inline]
    #[must_use]
    pub const fn defrag_policy(&self) -> DefragPolicy {
        self.defrag_policy
    }

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub(super) fn lock_table(&self) -> SpinMutexGuard<'_, BlockTable> {
        self.table.lock()
    }

    /// Allocates at least `size` bytes.
    ///
    /// The request is rounded up to 16 bytes; a zero-byte request takes one
    /// 16-byte unit. The first free block that fits is used, split if larger.
    ///
    /// # Errors
    ///
    /// - [`AllocError::OutOfMemory`] if no free block fits, even after
    ///   coalescing.
    /// - [`AllocError::MaxBlocksReached`] if the split needs a table slot and
    ///   none is left.
    ///
    /// On error the block table is unchanged apart from any coalescing.
    pub fn allocate_raw(&self, size: usize) -> AllocResult<Handle> {
        let result = self.allocate_aligned(size);
        if let Err(err) = &result {
            tracing::warn!(size, error = %err, "allocation failed");
        }
        result
    }

    fn allocate_aligned(&self, size: usize) -> AllocResult<Handle> {
        let aligned = align_up(size.max(1)).ok_or(AllocError::OutOfMemory {
            requested: size,
            largest_free: 0,
        })?;
        let Ok(aligned32) = u32::try_from(aligned) else {
            return Err(AllocError::OutOfMemory {
                requested: aligned,
                largest_free: self.lock_table().largest_free(),
            });
        };

        let mut table = self.lock_table();

        if self.defrag_policy == DefragPolicy::Eager {
            self.defragment_locked(&mut table);
        }

        match Self::claim_first_fit(&mut table, aligned32) {
            Err(err) if self.defrag_policy == DefragPolicy::OnExhaustion => {
                if self.defragment_locked(&mut table) > 0 {
                    Self::claim_first_fit(&mut table, aligned32)
                } else {
                    Err(err)
                }
            }
            result => result,
        }
    }

    fn claim_first_fit(table: &mut BlockTable, size: u32) -> AllocResult<Handle> {
        let index = table
            .first_fit(size)
            .ok_or_else(|| AllocError::OutOfMemory {
                requested: size as usize,
                largest_free: table.largest_free(),
            })?;

        table.claim(index, size)?;

        let offset = table.as_slice()[index].offset;
        Ok(Handle::new(Self::index_u32(index), offset))
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn index_u32(index: usize) -> u32 {
        // Table capacity is bounded by the arena size / 16, itself < 2^31.
        index as u32
    }

    /// Allocates a zeroed `T` and returns a validated typed pointer.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnsupportedAlignment`] if `T` needs more than 16-byte
    /// alignment, otherwise as [`allocate_raw`](Self::allocate_raw).
    pub fn allocate_ptr<T: Pod>(&self) -> AllocResult<TypedPtr<T>> {
        let handle = self.allocate_zeroed::<T>(mem::size_of::<T>())?;
        Ok(TypedPtr::from_handle(handle, self))
    }

    /// Allocates a `T` initialised to `value`.
    ///
    /// # Errors
    ///
    /// As for [`allocate_ptr`](Self::allocate_ptr).
    pub fn allocate_value<T: Pod>(&self, value: T) -> AllocResult<TypedPtr<T>> {
        let handle = self.allocate_raw_for::<T>(mem::size_of::<T>())?;
        self.arena
            .write_from(handle.offset() as usize, bytemuck::bytes_of(&value))?;
        Ok(TypedPtr::from_handle(handle, self))
    }

    /// Allocates a zeroed array of `len` elements of `T`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if `len * size_of::<T>()` overflows,
    /// otherwise as [`allocate_ptr`](Self::allocate_ptr).
    pub fn allocate_slice<T: Pod>(&self, len: usize) -> AllocResult<TypedPtr<T>> {
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::OutOfMemory {
                requested: usize::MAX,
                largest_free: 0,
            })?;
        let handle = self.allocate_zeroed::<T>(bytes)?;
        Ok(TypedPtr::from_handle(handle, self))
    }

    fn allocate_raw_for<T>(&self, bytes: usize) -> AllocResult<Handle> {
        let align = mem::align_of::<T>();
        if align > ALIGNMENT {
            return Err(AllocError::UnsupportedAlignment { align });
        }
        self.allocate_raw(bytes)
    }

    fn allocate_zeroed<T>(&self, bytes: usize) -> AllocResult<Handle> {
        let handle = self.allocate_raw_for::<T>(bytes)?;
        // Freed blocks keep their old bytes.
        self.arena.zero(handle.offset() as usize, bytes)?;
        Ok(handle)
    }

    /// Releases the block addressed by `handle`.
    ///
    /// Accepts a [`Handle`] or a [`TypedPtr`]. The handle (and every typed
    /// pointer sharing its offset) is dangling afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::DeallocationFailed`] if no used block starts at
    /// the handle's offset: a double free, a handle from another allocator,
    /// or a corrupted handle. The block table is left unchanged.
    pub fn free(&self, handle: impl Into<Handle>) -> AllocResult<()> {
        let handle = handle.into();

        let result = {
            let mut table = self.lock_table();
            match table.find_used(handle.offset(), handle.block_index() as usize) {
                Some(index) => {
                    table.mark_free(index);
                    Ok(())
                }
                None => Err(AllocError::DeallocationFailed {
                    offset: handle.offset(),
                }),
            }
        };

        if let Err(err) = &result {
            tracing::warn!(offset = handle.offset(), error = %err, "free rejected");
        }
        result
    }

    /// Merges adjacent free blocks. Returns the number of blocks removed.
    ///
    /// One forward pass over the table; calling it again right after is a
    /// no-op apart from the cycle counter.
    pub fn defragment(&self) -> usize {
        let mut table = self.lock_table();
        self.defragment_locked(&mut table)
    }

    fn defragment_locked(&self, table: &mut BlockTable) -> usize {
        let merged = table.coalesce();
        self.defragmentation_count.fetch_add(1, Ordering::Relaxed);
        if merged > 0 {
            tracing::debug!(merged, blocks = table.len(), "defragmented block table");
        }
        merged
    }

    /// Number of defragment passes run so far.
    #[inline]
    #[must_use]
    pub fn defragmentation_count(&self) -> u64 {
        self.defragmentation_count.load(Ordering::Relaxed)
    }

    /// Snapshot of usage counters.
    #[must_use]
    pub fn memory_info(&self) -> MemoryStats {
        let table = self.lock_table();
        MemoryStats {
            total_size: self.arena.len(),
            used_size: table.used_size(),
            free_size: table.free_size(),
            defragmentation_cycles: self.defragmentation_count(),
            block_count: table.len(),
            largest_free_block: table.largest_free(),
        }
    }

    /// Copy of the live block table, in offset order.
    #[must_use]
    pub fn blocks(&self) -> Vec<Block> {
        self.lock_table().as_slice().to_vec()
    }

    /// Checks the block table invariants.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::CorruptBlockTable`] on the first violation.
    pub fn validate(&self) -> AllocResult<()> {
        self.lock_table().validate(self.arena.len())
    }

    /// Frees everything: one free block spanning the arena.
    ///
    /// Every outstanding handle becomes dangling. The arena bytes are kept.
    pub fn reset(&mut self) {
        let total = self.arena.len();
        if let Ok(total) = Self::total_u32(total) {
            self.table.get_mut().reset(total);
        }
    }

    /// Reads a `T` stored at `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the value would leave the
    /// arena.
    pub fn read<T: Pod>(&self, handle: Handle) -> AllocResult<T> {
        let mut value = T::zeroed();
        self.arena
            .read_into(handle.offset() as usize, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Writes a `T` at `handle`.
    ///
    /// Takes `&mut self`: for exclusive phases such as building or patching
    /// a world right after a load. Hot-path writes go through
    /// [`TypedPtr`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the value would leave the
    /// arena.
    pub fn write<T: Pod>(&mut self, handle: Handle, value: &T) -> AllocResult<()> {
        self.arena
            .write_from(handle.offset() as usize, bytemuck::bytes_of(value))
    }

    /// Copies `len` bytes starting at `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the range leaves the arena.
    pub fn bytes(&self, handle: Handle, len: usize) -> AllocResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.arena.read_into(handle.offset() as usize, &mut out)?;
        Ok(out)
    }

    /// Exclusive view of `len` bytes starting at `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the range leaves the arena.
    pub fn bytes_mut(&mut self, handle: Handle, len: usize) -> AllocResult<&mut [u8]> {
        let offset = handle.offset() as usize;
        self.arena.check_range(offset, len)?;
        Ok(&mut self.arena.as_mut_slice()[offset..offset + len])
    }

    /// Human-readable dump of the block table.
    ///
    /// ```text
    /// WorldAllocator: 1024 bytes, 2/16 blocks, 112 used, 912 free, 0 defrag cycles
    ///   [   0] offset        0  size      112  used
    ///   [   1] offset      112  size      912  free
    /// ```
    #[must_use]
    pub fn debug_view(&self) -> String {
        let table = self.lock_table();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "WorldAllocator: {} bytes, {}/{} blocks, {} used, {} free, {} defrag cycles",
            self.arena.len(),
            table.len(),
            table.capacity(),
            table.used_size(),
            table.free_size(),
            self.defragmentation_count(),
        );
        for (index, block) in table.as_slice().iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{index:>4}] offset {:>8}  size {:>8}  {}",
                block.offset,
                block.size,
                if block.used { "used" } else { "free" }
            );
        }
        out
    }
}

impl std::fmt::Debug for WorldAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldAllocator")
            .field("arena", &self.arena)
            .field("stats", &self.memory_info())
            .finish()
    }
}

//! # Arena-Backed Dynamic Array
//!
//! A growable array of `Pod` elements whose storage is one arena block.
//!
//! ```text
//! ArenaVec<u32> { data: Handle @128, len: 3, capacity: 16 }
//!                            │
//!  arena: ... [128] 07 00 00 00 | 09 00 00 00 | 0b 00 00 00 | ...
//! ```
//!
//! The header itself ([`RawArenaVec`]) is `Pod`, so a vector can be stored
//! inside the arena next to the structures that reference it and survives a
//! snapshot untouched.
//!
//! Dropping an `ArenaVec` does not release its block; call
//! [`ArenaVec::free`] or reset the allocator.

use std::fmt;
use std::marker::PhantomData;
use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::error::{AllocError, AllocResult};

use super::allocator::WorldAllocator;
use super::handle::{Handle, Revalidate, TypedPtr};
use super::CACHE_LINE_SIZE;

/// Growable array stored in a [`WorldAllocator`] arena.
///
/// Every element access goes through the owning allocator and panics if the
/// cached address is stale, i.e. the arena moved and
/// [`revalidate`](Self::revalidate) was not called.
///
/// Not `Clone`: two copies would both believe they own the block.
pub struct ArenaVec<T: Pod> {
    data: Option<TypedPtr<T>>,
    len: u32,
    capacity: u32,
}

impl<T: Pod> ArenaVec<T> {
    const STALE: &'static str = "stale arena pointer: revalidate after reload";

    /// Creates an empty vector. No block is allocated until the first push.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: None,
            len: 0,
            capacity: 0,
        }
    }

    /// Creates an empty vector with room for `capacity` elements.
    ///
    /// # Errors
    ///
    /// As for [`WorldAllocator::allocate_slice`].
    pub fn with_capacity(allocator: &WorldAllocator, capacity: usize) -> AllocResult<Self> {
        let mut vec = Self::new();
        vec.resize(allocator, capacity)?;
        Ok(vec)
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Number of elements the current block can hold.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// True if the vector holds no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the backing block, `None` before the first allocation.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.data.map(|ptr| ptr.handle())
    }

    /// Typed pointer to the first element, for hot loops.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> Option<TypedPtr<T>> {
        self.data
    }

    /// Appends `item`, growing the block if it is full.
    ///
    /// Growth goes to the next power of two of at least one cache line's
    /// worth of elements: allocate, bulk copy, free the old block.
    ///
    /// # Errors
    ///
    /// As for [`resize`](Self::resize). `item` is not written on error.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    pub fn push(&mut self, allocator: &WorldAllocator, item: T) -> AllocResult<()> {
        if self.len == self.capacity {
            let per_line = CACHE_LINE_SIZE / mem::size_of::<T>().max(1);
            let target = (self.len() + 1).max(per_line).next_power_of_two();
            self.resize(allocator, target)?;
        }

        let offset = self.element_offset(allocator, self.len());
        allocator
            .arena()
            .write_from(offset, bytemuck::bytes_of(&item))?;
        self.len += 1;
        Ok(())
    }

    /// Grows the backing block to hold `new_capacity` elements.
    ///
    /// Does nothing if `new_capacity` does not exceed the current capacity.
    ///
    /// # Errors
    ///
    /// As for [`WorldAllocator::allocate_slice`]; the vector is unchanged.
    /// Returns [`AllocError::DeallocationFailed`] if the old block was no
    /// longer live. The vector has already moved to the new block then.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    pub fn resize(&mut self, allocator: &WorldAllocator, new_capacity: usize) -> AllocResult<()> {
        if new_capacity <= self.capacity() {
            return Ok(());
        }
        let capacity = u32::try_from(new_capacity).map_err(|_| AllocError::OutOfMemory {
            requested: new_capacity.saturating_mul(mem::size_of::<T>()),
            largest_free: 0,
        })?;

        let grown = allocator.allocate_slice::<T>(new_capacity)?;

        if let Some(old) = self.data {
            assert!(old.is_valid_for(allocator), "{}", Self::STALE);
            let bytes = self.len() * mem::size_of::<T>();
            let copied = allocator.arena().copy_within(
                old.offset() as usize,
                grown.offset() as usize,
                bytes,
            );
            if let Err(err) = copied {
                allocator.free(grown)?;
                return Err(err);
            }
        }

        // The vector owns `grown` from here on, even if releasing the old
        // block is rejected below.
        let old = self.data.replace(grown);
        self.capacity = capacity;
        match old {
            Some(old) => allocator.free(old),
            None => Ok(()),
        }
    }

    /// Returns a copy of the element at `index`, or `None` if out of range.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    #[must_use]
    pub fn get(&self, allocator: &WorldAllocator, index: usize) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        read_element(allocator, self.element_offset(allocator, index))
    }

    /// Replaces the element at `index`, returning the old value.
    ///
    /// Returns `None` and writes nothing if `index` is out of range.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    pub fn set(&mut self, allocator: &WorldAllocator, index: usize, value: T) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        let offset = self.element_offset(allocator, index);
        let old = read_element(allocator, offset)?;
        allocator
            .arena()
            .write_from(offset, bytemuck::bytes_of(&value))
            .ok()?;
        Some(old)
    }

    /// Removes and returns the last element.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    pub fn pop(&mut self, allocator: &WorldAllocator) -> Option<T> {
        let last = self.len().checked_sub(1)?;
        let value = self.get(allocator, last)?;
        self.len -= 1;
        Some(value)
    }

    /// Drops every element. The block is kept.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Iterates over copies of the elements.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    pub fn iter<'a>(&'a self, allocator: &'a WorldAllocator) -> ArenaVecIter<'a, T> {
        if let Some(ptr) = self.data {
            assert!(ptr.is_valid_for(allocator), "{}", Self::STALE);
        }
        ArenaVecIter {
            allocator,
            offset: self.data.map_or(0, |ptr| ptr.offset() as usize),
            remaining: self.len(),
            _marker: PhantomData,
        }
    }

    /// Copies the elements out into a `Vec`.
    ///
    /// # Panics
    ///
    /// Panics if the cached address is stale for `allocator`.
    #[must_use]
    pub fn to_vec(&self, allocator: &WorldAllocator) -> Vec<T> {
        self.iter(allocator).collect()
    }

    /// Recomputes the cached address after the arena moved.
    #[inline]
    pub fn revalidate(&mut self, allocator: &WorldAllocator) {
        self.data.revalidate(allocator);
    }

    /// Releases the backing block.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::DeallocationFailed`] if the block is not live in
    /// `allocator`.
    pub fn free(self, allocator: &WorldAllocator) -> AllocResult<()> {
        match self.data {
            Some(ptr) => allocator.free(ptr),
            None => Ok(()),
        }
    }

    /// Plain-data header, suitable for storing inside the arena.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> RawArenaVec {
        RawArenaVec {
            data: self.handle().unwrap_or_default(),
            len: self.len,
            capacity: self.capacity,
        }
    }

    /// Converts the vector into its plain-data header.
    #[inline]
    #[must_use]
    pub fn into_raw(self) -> RawArenaVec {
        self.raw()
    }

    /// Rebuilds a vector from a header, validated for `allocator`.
    ///
    /// The caller takes over ownership of the block: only one live
    /// `ArenaVec` may be rebuilt from a given header.
    #[must_use]
    pub fn from_raw(raw: RawArenaVec, allocator: &WorldAllocator) -> Self {
        if raw.capacity == 0 {
            return Self::new();
        }
        Self {
            data: Some(raw.data.typed(allocator)),
            len: raw.len.min(raw.capacity),
            capacity: raw.capacity,
        }
    }

    fn element_offset(&self, allocator: &WorldAllocator, index: usize) -> usize {
        let base = match self.data {
            Some(ptr) => {
                assert!(ptr.is_valid_for(allocator), "{}", Self::STALE);
                ptr.offset() as usize
            }
            None => 0,
        };
        base + index * mem::size_of::<T>()
    }
}

fn read_element<T: Pod>(allocator: &WorldAllocator, offset: usize) -> Option<T> {
    let mut value = T::zeroed();
    allocator
        .arena()
        .read_into(offset, bytemuck::bytes_of_mut(&mut value))
        .ok()?;
    Some(value)
}

impl<T: Pod> Default for ArenaVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod> Revalidate for ArenaVec<T> {
    fn revalidate(&mut self, allocator: &WorldAllocator) {
        ArenaVec::revalidate(self, allocator);
    }
}

impl<T: Pod> fmt::Debug for ArenaVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaVec")
            .field("data", &self.handle())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Iterator over copies of an [`ArenaVec`]'s elements.
pub struct ArenaVecIter<'a, T> {
    allocator: &'a WorldAllocator,
    offset: usize,
    remaining: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> Iterator for ArenaVecIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        let value = read_element(self.allocator, self.offset)?;
        self.offset += mem::size_of::<T>();
        self.remaining -= 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T: Pod> ExactSizeIterator for ArenaVecIter<'_, T> {}

/// Plain-data header of an [`ArenaVec`].
///
/// Holds the block handle and the element counts, nothing address-dependent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RawArenaVec {
    /// Backing block. Meaningless while `capacity` is zero.
    pub data: Handle,
    /// Number of elements.
    pub len: u32,
    /// Number of elements the block can hold.
    pub capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> WorldAllocator {
        WorldAllocator::with_capacity(4096).unwrap()
    }

    #[test]
    fn test_new_is_empty() {
        let vec: ArenaVec<u32> = ArenaVec::new();
        assert!(vec.is_empty());
        assert_eq!(vec.capacity(), 0);
        assert!(vec.handle().is_none());
        assert_eq!(vec.raw(), RawArenaVec::default());
        assert_eq!(RawArenaVec::default().data, Handle::new(0, 0));
    }

    #[test]
    fn test_push_and_get() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        for value in [7u32, 9, 11] {
            vec.push(&alloc, value).unwrap();
        }

        assert_eq!(vec.len(), 3);
        assert_eq!(vec.get(&alloc, 0), Some(7));
        assert_eq!(vec.get(&alloc, 2), Some(11));
        assert_eq!(vec.get(&alloc, 3), None);
        assert_eq!(vec.to_vec(&alloc), vec![7, 9, 11]);
    }

    #[test]
    fn test_first_growth_fills_a_cache_line() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        vec.push(&alloc, 1u32).unwrap();
        assert_eq!(vec.capacity(), 16);

        let mut wide = ArenaVec::new();
        wide.push(&alloc, [0u64; 16]).unwrap();
        assert_eq!(wide.capacity(), 1);
    }

    #[test]
    fn test_growth_copies_and_frees() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        for value in 0..16u32 {
            vec.push(&alloc, value).unwrap();
        }
        let old = vec.handle().unwrap();

        vec.push(&alloc, 16).unwrap();
        assert_eq!(vec.capacity(), 32);
        assert_ne!(vec.handle().unwrap(), old);
        assert_eq!(vec.to_vec(&alloc), (0..17).collect::<Vec<_>>());

        // The old block went back to the allocator.
        assert!(alloc.free(old).is_err());
        assert_eq!(alloc.memory_info().used_size, 32 * 4);
    }

    #[test]
    fn test_resize_never_shrinks() {
        let alloc = allocator();
        let mut vec: ArenaVec<u64> = ArenaVec::with_capacity(&alloc, 10).unwrap();
        assert_eq!(vec.capacity(), 10);

        vec.resize(&alloc, 4).unwrap();
        assert_eq!(vec.capacity(), 10);
    }

    #[test]
    fn test_set_pop_clear() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        for value in [1i64, 2, 3] {
            vec.push(&alloc, value).unwrap();
        }

        assert_eq!(vec.set(&alloc, 1, 20), Some(2));
        assert_eq!(vec.set(&alloc, 5, 0), None);
        assert_eq!(vec.pop(&alloc), Some(3));
        assert_eq!(vec.to_vec(&alloc), vec![1, 20]);

        vec.clear();
        assert!(vec.is_empty());
        assert_eq!(vec.pop(&alloc), None);
        assert_eq!(vec.capacity(), CACHE_LINE_SIZE / mem::size_of::<i64>());
    }

    #[test]
    fn test_push_out_of_memory_leaves_vec_intact() {
        let alloc = WorldAllocator::with_capacity(64).unwrap();
        let mut vec = ArenaVec::new();
        for value in 0..16u32 {
            vec.push(&alloc, value).unwrap();
        }

        let result = vec.push(&alloc, 16);
        assert!(matches!(result, Err(AllocError::OutOfMemory { .. })));
        assert_eq!(vec.len(), 16);
        assert_eq!(vec.get(&alloc, 15), Some(15));
    }

    #[test]
    fn test_free_releases_block() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        vec.push(&alloc, 5u8).unwrap();
        vec.free(&alloc).unwrap();
        assert_eq!(alloc.memory_info().used_size, 0);
    }

    #[test]
    fn test_shared_header_growth_does_not_leak() {
        let alloc = allocator();
        let mut first = ArenaVec::new();
        for value in 0..16u32 {
            first.push(&alloc, value).unwrap();
        }
        let mut second = ArenaVec::<u32>::from_raw(first.raw(), &alloc);

        first.push(&alloc, 16).unwrap();
        let shared = second.handle().unwrap();
        assert_eq!(
            second.push(&alloc, 99),
            Err(AllocError::DeallocationFailed {
                offset: shared.offset(),
            })
        );

        // Each vector owns exactly one 32-element block.
        assert_ne!(second.handle().unwrap(), shared);
        assert_eq!(second.capacity(), 32);
        assert_eq!(alloc.memory_info().used_size, 2 * 32 * 4);
        assert_eq!(second.to_vec(&alloc), (0..16).collect::<Vec<_>>());

        first.free(&alloc).unwrap();
        second.free(&alloc).unwrap();
        assert_eq!(alloc.memory_info().used_size, 0);
    }

    #[test]
    #[should_panic(expected = "stale arena pointer")]
    fn test_stale_pointer_panics() {
        let first = allocator();
        let second = allocator();
        let mut vec = ArenaVec::new();
        vec.push(&first, 1u32).unwrap();

        let _ = vec.get(&second, 0);
    }

    #[test]
    fn test_survives_snapshot_after_revalidate() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        for value in [7u32, 9, 11] {
            vec.push(&alloc, value).unwrap();
        }

        let mut restored = allocator();
        restored.deserialize(&alloc.serialize()).unwrap();

        vec.revalidate(&restored);
        assert_eq!(vec.to_vec(&restored), vec![7, 9, 11]);
    }

    #[test]
    fn test_header_stored_in_arena() {
        let alloc = allocator();
        let mut vec = ArenaVec::new();
        for value in [7u32, 9, 11] {
            vec.push(&alloc, value).unwrap();
        }
        let header = alloc.allocate_value(vec.into_raw()).unwrap().handle();

        let restored = WorldAllocator::from_snapshot(&alloc.serialize()).unwrap();
        let raw: RawArenaVec = restored.read(header).unwrap();
        let vec = ArenaVec::<u32>::from_raw(raw, &restored);

        assert_eq!(vec.len(), 3);
        assert_eq!(vec.to_vec(&restored), vec![7, 9, 11]);
    }
}

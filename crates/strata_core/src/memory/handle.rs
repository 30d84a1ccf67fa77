//! # Offset Handles and Typed Pointers
//!
//! A [`Handle`] names an allocation by its byte offset inside the arena, so
//! it stays valid when the arena moves: reloaded from disk, restored into a
//! fresh allocator, rebuilt at another base address.
//!
//! A [`TypedPtr`] adds a cached raw address for O(1) dereference in hot
//! loops. The cache is derived state. After any relocation the owner calls
//! [`TypedPtr::revalidate`], which recomputes it from the unchanged offset.
//!
//! ```text
//!  before reload                      after reload
//!  base = 0x7f00_0000                 base = 0x5500_1000
//!  Handle { offset: 112 }   ───────▶  Handle { offset: 112 }   (unchanged)
//!  cached = 0x7f00_0070     ───────▶  cached = 0x5500_1070     (revalidate)
//! ```
//!
//! Because a handle is plain data, it can be stored inside the very arena it
//! points into. Self-referential and cyclic structures survive snapshots
//! untouched.

#![allow(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr;

use bytemuck::{Pod, Zeroable};

use super::allocator::WorldAllocator;

/// Relocation-stable identity of an allocation.
///
/// Equality and hashing use the offset only. The block index is a lookup
/// hint recorded at allocation time and may go stale as the table shifts.
#[repr(C)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
pub struct Handle {
    /// Table slot at allocation time.
    block_index: u32,
    /// Byte offset from the arena base.
    offset: u32,
}

impl Handle {
    /// Creates a handle.
    #[inline]
    #[must_use]
    pub const fn new(block_index: u32, offset: u32) -> Self {
        Self {
            block_index,
            offset,
        }
    }

    /// Byte offset from the arena base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    /// Block table slot recorded at allocation time.
    #[inline]
    #[must_use]
    pub const fn block_index(self) -> u32 {
        self.block_index
    }

    /// Computes the current address of this allocation in `allocator`.
    ///
    /// Computing the address is always safe; dereferencing it is only valid
    /// while the block is live.
    #[inline]
    #[must_use]
    pub fn as_ptr(self, allocator: &WorldAllocator) -> *mut u8 {
        allocator.base().wrapping_add(self.offset as usize)
    }

    /// Builds a typed pointer to this allocation, validated for `allocator`.
    #[inline]
    #[must_use]
    pub fn typed<T>(self, allocator: &WorldAllocator) -> TypedPtr<T> {
        TypedPtr::from_handle(self, allocator)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(#{} @{})", self.block_index, self.offset)
    }
}

/// A [`Handle`] with a cached, typed raw address.
///
/// The cached address equals `arena_base + offset` for the allocator it was
/// last validated against. It is never authoritative.
pub struct TypedPtr<T> {
    handle: Handle,
    cached: *mut T,
    _marker: PhantomData<T>,
}

// SAFETY: a typed pointer is an offset plus an address; sending it is as
// safe as sending the `T` it designates.
unsafe impl<T: Send> Send for TypedPtr<T> {}
// SAFETY: shared access only reads the offset and the cached address.
unsafe impl<T: Sync> Sync for TypedPtr<T> {}

impl<T> TypedPtr<T> {
    /// Builds a typed pointer from a stored handle, validated for
    /// `allocator`.
    #[inline]
    #[must_use]
    pub fn from_handle(handle: Handle, allocator: &WorldAllocator) -> Self {
        Self {
            handle,
            cached: handle.as_ptr(allocator).cast(),
            _marker: PhantomData,
        }
    }

    /// The relocation-stable handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Byte offset from the arena base.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.handle.offset
    }

    /// The cached address. Stale after a relocation until revalidated.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut T {
        self.cached
    }

    /// Recomputes the cached address against `allocator`'s current base.
    #[inline]
    pub fn revalidate(&mut self, allocator: &WorldAllocator) {
        self.cached = self.handle.as_ptr(allocator).cast();
    }

    /// True if the cached address matches `allocator`'s current base.
    #[inline]
    #[must_use]
    pub fn is_valid_for(&self, allocator: &WorldAllocator) -> bool {
        self.cached == self.handle.as_ptr(allocator).cast()
    }

    /// Reads the value through the cached address.
    ///
    /// # Safety
    ///
    /// The pointer must be validated for the allocator that owns the block,
    /// the block must not have been freed, and no other thread may be
    /// writing the same bytes.
    #[inline]
    #[must_use]
    pub unsafe fn read(&self) -> T
    where
        T: Pod,
    {
        ptr::read_unaligned(self.cached)
    }

    /// Writes the value through the cached address.
    ///
    /// # Safety
    ///
    /// As for [`read`](Self::read), and no other thread may be reading or
    /// writing the same bytes.
    #[inline]
    pub unsafe fn write(&self, value: T)
    where
        T: Pod,
    {
        ptr::write_unaligned(self.cached, value);
    }

    /// Borrows the value in place.
    ///
    /// # Safety
    ///
    /// As for [`read`](Self::read); the block must stay live and unwritten
    /// for `'a`, and the offset must be aligned for `T` (always true for
    /// handles produced by the allocator).
    #[inline]
    #[must_use]
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        debug_assert_eq!(self.cached as usize % std::mem::align_of::<T>(), 0);
        &*self.cached
    }

    /// Mutably borrows the value in place.
    ///
    /// # Safety
    ///
    /// As for [`as_ref`](Self::as_ref), and no other reference to the block
    /// may exist for `'a`.
    #[inline]
    #[must_use]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut T {
        debug_assert_eq!(self.cached as usize % std::mem::align_of::<T>(), 0);
        &mut *self.cached
    }
}

impl<T> Clone for TypedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedPtr<T> {}

impl<T> PartialEq for TypedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for TypedPtr<T> {}

impl<T> Hash for TypedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl<T> fmt::Debug for TypedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedPtr")
            .field("handle", &self.handle)
            .field("cached", &self.cached)
            .finish()
    }
}

impl<T> From<TypedPtr<T>> for Handle {
    fn from(ptr: TypedPtr<T>) -> Self {
        ptr.handle
    }
}

impl<T> From<&TypedPtr<T>> for Handle {
    fn from(ptr: &TypedPtr<T>) -> Self {
        ptr.handle
    }
}

/// Owners of typed pointers that must be rebuilt after the arena moves.
///
/// Every structure caching raw arena addresses implements this and is swept
/// after [`WorldAllocator::deserialize`] or
/// [`WorldAllocator::load_from_file`].
pub trait Revalidate {
    /// Recomputes every cached address against `allocator`.
    fn revalidate(&mut self, allocator: &WorldAllocator);
}

impl<T> Revalidate for TypedPtr<T> {
    fn revalidate(&mut self, allocator: &WorldAllocator) {
        TypedPtr::revalidate(self, allocator);
    }
}

impl<R: Revalidate> Revalidate for Option<R> {
    fn revalidate(&mut self, allocator: &WorldAllocator) {
        if let Some(inner) = self {
            inner.revalidate(allocator);
        }
    }
}

impl<R: Revalidate> Revalidate for [R] {
    fn revalidate(&mut self, allocator: &WorldAllocator) {
        for owner in self {
            owner.revalidate(allocator);
        }
    }
}

impl<R: Revalidate> Revalidate for Vec<R> {
    fn revalidate(&mut self, allocator: &WorldAllocator) {
        self.as_mut_slice().revalidate(allocator);
    }
}

/// Revalidates every owner in `owners`. Call once after a reload.
pub fn revalidate_all<R: Revalidate>(owners: &mut [R], allocator: &WorldAllocator) {
    tracing::debug!(owners = owners.len(), "revalidating arena pointers");
    owners.revalidate(allocator);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_handle_equality_ignores_index() {
        let a = Handle::new(0, 64);
        let b = Handle::new(7, 64);
        let c = Handle::new(0, 128);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Handle> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_handle_is_pod() {
        let handle = Handle::new(3, 4096);
        let bytes = bytemuck::bytes_of(&handle);
        assert_eq!(bytes.len(), 8);

        let back: Handle = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back.offset(), 4096);
        assert_eq!(back.block_index(), 3);
    }

    #[test]
    fn test_typed_ptr_revalidate_across_allocators() {
        let first = WorldAllocator::with_capacity(1024).unwrap();
        let second = WorldAllocator::with_capacity(1024).unwrap();

        let mut ptr: TypedPtr<u64> = first.allocate_ptr().unwrap();
        assert!(ptr.is_valid_for(&first));
        assert!(!ptr.is_valid_for(&second));

        ptr.revalidate(&second);
        assert!(ptr.is_valid_for(&second));
        assert_eq!(ptr.as_ptr().cast::<u8>(), ptr.handle().as_ptr(&second));
    }

    #[test]
    fn test_typed_ptr_read_write() {
        let allocator = WorldAllocator::with_capacity(1024).unwrap();
        let ptr: TypedPtr<[u32; 4]> = allocator.allocate_ptr().unwrap();

        // SAFETY: freshly allocated, validated, single-threaded.
        unsafe {
            assert_eq!(ptr.read(), [0; 4]);
            ptr.write([1, 2, 3, 4]);
            assert_eq!(ptr.read(), [1, 2, 3, 4]);
            ptr.as_mut()[0] = 9;
            assert_eq!(ptr.as_ref()[0], 9);
        }
    }

    #[test]
    fn test_revalidate_collection() {
        let first = WorldAllocator::with_capacity(1024).unwrap();
        let second = WorldAllocator::with_capacity(1024).unwrap();

        let mut owners: Vec<Option<TypedPtr<u32>>> = vec![
            Some(first.allocate_ptr().unwrap()),
            None,
            Some(first.allocate_ptr().unwrap()),
        ];

        revalidate_all(&mut owners, &second);
        for ptr in owners.iter().flatten() {
            assert!(ptr.is_valid_for(&second));
        }
    }
}

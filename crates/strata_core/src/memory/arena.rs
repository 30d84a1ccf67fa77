//! # Arena
//!
//! One fixed-size, contiguous byte buffer holding the whole world's state.
//!
//! The buffer is allocated once, zeroed, and never resized in place. Its base
//! address is aligned to a cache line so that any 16-aligned offset inside it
//! is a valid address for every element type the allocator accepts.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use crate::error::{AllocError, AllocResult};

use super::CACHE_LINE_SIZE;

/// A fixed-capacity byte arena.
///
/// The arena hands out raw addresses; it does no bookkeeping of its own.
/// All access goes through raw pointers so that threads owning disjoint
/// blocks can write concurrently without ever forming overlapping `&mut`
/// references.
///
/// # Thread Safety
///
/// The arena itself is `Send + Sync`. Which bytes a thread may touch is
/// decided by the block table; the arena trusts its callers on that.
pub struct Arena {
    /// Start of the buffer.
    ptr: NonNull<u8>,
    /// Size in bytes.
    len: usize,
}

// SAFETY: the arena owns its buffer exclusively; concurrent access to
// disjoint ranges is coordinated by the allocator's block table.
unsafe impl Send for Arena {}
// SAFETY: see above. Every `&self` accessor goes through raw pointers.
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocates a zeroed arena of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if `len` is zero or too large
    /// for a layout, and [`AllocError::OutOfMemory`] if the system
    /// allocator refuses the request.
    pub fn new(len: usize) -> AllocResult<Self> {
        let layout = Self::layout(len)?;

        // SAFETY: `layout` has non-zero size (checked by `layout`).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory {
            requested: len,
            largest_free: 0,
        })?;

        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> AllocResult<Layout> {
        if len == 0 {
            return Err(AllocError::InvalidConfig(
                "arena size must be greater than zero".to_string(),
            ));
        }
        Layout::from_size_align(len, CACHE_LINE_SIZE)
            .map_err(|e| AllocError::InvalidConfig(format!("arena layout: {e}")))
    }

    /// Returns the arena size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; an arena has at least one byte.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the base address of the buffer.
    ///
    /// Stable for the lifetime of this arena. A different arena (after a
    /// reload) has a different base.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Checks that `[offset, offset + len)` lies inside the arena.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] otherwise.
    #[inline]
    pub fn check_range(&self, offset: usize, len: usize) -> AllocResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(AllocError::OutOfBounds { offset, len }),
        }
    }

    /// Copies bytes out of the arena into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the range leaves the arena.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> AllocResult<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: range checked above; `dst` is a distinct allocation.
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copies `src` into the arena at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the range leaves the arena.
    pub fn write_from(&self, offset: usize, src: &[u8]) -> AllocResult<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: range checked above; `src` is a distinct allocation.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
        Ok(())
    }

    /// Zeroes `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if the range leaves the arena.
    pub fn zero(&self, offset: usize, len: usize) -> AllocResult<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above.
        unsafe {
            ptr::write_bytes(self.base().add(offset), 0, len);
        }
        Ok(())
    }

    /// Copies `len` bytes between two ranges of the arena. Ranges may overlap.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfBounds`] if either range leaves the arena.
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> AllocResult<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        // SAFETY: both ranges checked above; `ptr::copy` handles overlap.
        unsafe {
            ptr::copy(self.base().add(src), self.base().add(dst), len);
        }
        Ok(())
    }

    /// Returns a verbatim copy of the whole arena.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.len];
        // SAFETY: `image` holds exactly `len` bytes.
        unsafe {
            ptr::copy_nonoverlapping(self.base(), image.as_mut_ptr(), self.len);
        }
        image
    }

    /// Exclusive view of the whole arena.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` rules out any other access for the borrow.
        unsafe { std::slice::from_raw_parts_mut(self.base(), self.len) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout; `len` never
        // changes, so `layout` cannot fail here.
        if let Ok(layout) = Self::layout(self.len) {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_is_zeroed_and_aligned() {
        let mut arena = Arena::new(1024).unwrap();
        assert_eq!(arena.len(), 1024);
        assert_eq!(arena.base() as usize % CACHE_LINE_SIZE, 0);
        assert!(arena.as_mut_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_arena_read_write() {
        let arena = Arena::new(256).unwrap();
        arena.write_from(16, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        arena.read_into(16, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        arena.copy_within(16, 32, 4).unwrap();
        arena.read_into(32, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        arena.zero(16, 4).unwrap();
        arena.read_into(16, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_arena_bounds() {
        let arena = Arena::new(64).unwrap();
        assert!(arena.check_range(0, 64).is_ok());
        assert!(arena.check_range(60, 8).is_err());
        assert!(arena.check_range(usize::MAX, 2).is_err());
        assert!(arena.write_from(63, &[0, 0]).is_err());
    }

    #[test]
    fn test_zero_sized_arena_rejected() {
        assert!(matches!(Arena::new(0), Err(AllocError::InvalidConfig(_))));
    }
}

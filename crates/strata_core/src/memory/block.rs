//! # Block Table
//!
//! Ordered, fixed-capacity partition of the arena into used and free blocks.
//!
//! ```text
//! offset:  0          112                                   1024
//!          ┌──────────┬──────────────────────────────────────┐
//! arena:   │   used   │                 free                 │
//!          └──────────┴──────────────────────────────────────┘
//! table:   [{0,112,U}, {112,912,F}]
//! ```
//!
//! Invariants, for every reachable state:
//! - blocks are sorted by offset, contiguous and non-overlapping;
//! - the first block starts at 0 and the sizes sum to the arena size;
//! - no block is empty.

use std::fmt;

use crate::error::{AllocError, AllocResult};

use super::ALIGNMENT;

/// One contiguous region of the arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Block {
    /// Byte offset from the arena base.
    pub offset: u32,
    /// Size in bytes. Always a multiple of the block alignment.
    pub size: u32,
    /// Whether the block is handed out.
    pub used: bool,
}

impl Block {
    /// Creates a free block.
    #[inline]
    #[must_use]
    pub const fn free(offset: u32, size: u32) -> Self {
        Self {
            offset,
            size,
            used: false,
        }
    }

    /// Creates a used block.
    #[inline]
    #[must_use]
    pub const fn used(offset: u32, size: u32) -> Self {
        Self {
            offset,
            size,
            used: true,
        }
    }

    /// One past the last byte of the block.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    /// Returns true if the block is free.
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        !self.used
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}, {}, {}}}",
            self.offset,
            self.size,
            if self.used { "used" } else { "free" }
        )
    }
}

/// Fixed-capacity ordered array of [`Block`]s.
///
/// The backing slice is allocated once at full capacity. Inserting past it
/// fails with [`AllocError::MaxBlocksReached`]; the table never grows on
/// its own.
#[derive(Clone)]
pub struct BlockTable {
    /// Backing storage, `capacity` slots.
    slots: Box<[Block]>,
    /// Number of live blocks at the front of `slots`.
    count: usize,
}

impl BlockTable {
    /// Creates a table holding one free block spanning `total_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(total_size: u32, capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");

        let mut slots = vec![Block::default(); capacity].into_boxed_slice();
        slots[0] = Block::free(0, total_size);

        Self { slots, count: 1 }
    }

    /// Rebuilds a table from a list of blocks.
    ///
    /// Capacity is `max(capacity, blocks.len())` so a snapshot taken with a
    /// larger table still fits.
    #[must_use]
    pub fn from_blocks(blocks: &[Block], capacity: usize) -> Self {
        let capacity = capacity.max(blocks.len()).max(1);
        let mut slots = vec![Block::default(); capacity].into_boxed_slice();
        slots[..blocks.len()].copy_from_slice(blocks);

        Self {
            slots,
            count: blocks.len(),
        }
    }

    /// Number of live blocks.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// True if the table tracks no blocks.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Maximum number of blocks.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// True if no further block can be inserted.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Live blocks in offset order.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Block] {
        &self.slots[..self.count]
    }

    /// Gets a live block by index.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Block> {
        self.as_slice().get(index)
    }

    /// Inserts a block at `index`, shifting later blocks right.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::MaxBlocksReached`] if the table is full. The
    /// table is left unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert(&mut self, index: usize, block: Block) -> AllocResult<()> {
        assert!(index <= self.count, "insert index out of range");
        if self.is_full() {
            return Err(AllocError::MaxBlocksReached {
                max_blocks: self.capacity(),
            });
        }

        self.slots.copy_within(index..self.count, index + 1);
        self.slots[index] = block;
        self.count += 1;
        Ok(())
    }

    /// Removes the block at `index`, shifting later blocks left.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn remove(&mut self, index: usize) -> Block {
        assert!(index < self.count, "remove index out of range");

        let block = self.slots[index];
        self.slots.copy_within(index + 1..self.count, index);
        self.count -= 1;
        self.slots[self.count] = Block::default();
        block
    }

    /// Index of the first free block of at least `size` bytes.
    #[must_use]
    pub fn first_fit(&self, size: u32) -> Option<usize> {
        self.as_slice()
            .iter()
            .position(|block| block.is_free() && block.size >= size)
    }

    /// Claims `size` bytes at the head of the free block at `index`.
    ///
    /// A larger block is split: the tail becomes a new free block right
    /// after it.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::MaxBlocksReached`] if a split is needed and the
    /// table is full. The table is left unchanged.
    pub fn claim(&mut self, index: usize, size: u32) -> AllocResult<()> {
        let block = self.slots[index];
        debug_assert!(block.is_free() && block.size >= size);

        if block.size > size {
            let tail = Block::free(block.offset + size, block.size - size);
            self.insert(index + 1, tail)?;
        }

        self.slots[index] = Block::used(block.offset, size);
        Ok(())
    }

    /// Marks the block at `index` free. Neighbours are not merged.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn mark_free(&mut self, index: usize) {
        assert!(index < self.count, "block index out of range");
        self.slots[index].used = false;
    }

    /// Finds the used block starting at `offset`.
    ///
    /// `hint` is checked first; on a miss the table is scanned linearly.
    #[must_use]
    pub fn find_used(&self, offset: u32, hint: usize) -> Option<usize> {
        let matches = |block: &Block| block.used && block.offset == offset;

        if self.get(hint).is_some_and(matches) {
            return Some(hint);
        }
        self.as_slice().iter().position(matches)
    }

    /// Merges every run of adjacent free blocks in one forward pass.
    ///
    /// Each merged block is compared again with its next neighbour, so a run
    /// of any length collapses in a single call. Returns the number of
    /// blocks removed.
    pub fn coalesce(&mut self) -> usize {
        let mut write = 0;

        for read in 0..self.count {
            let block = self.slots[read];
            if write > 0 && block.is_free() && self.slots[write - 1].is_free() {
                self.slots[write - 1].size += block.size;
            } else {
                self.slots[write] = block;
                write += 1;
            }
        }

        let merged = self.count - write;
        for slot in &mut self.slots[write..self.count] {
            *slot = Block::default();
        }
        self.count = write;
        merged
    }

    /// Sum of used block sizes.
    #[must_use]
    pub fn used_size(&self) -> usize {
        self.as_slice()
            .iter()
            .filter(|b| b.used)
            .map(|b| b.size as usize)
            .sum()
    }

    /// Sum of free block sizes.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.as_slice()
            .iter()
            .filter(|b| b.is_free())
            .map(|b| b.size as usize)
            .sum()
    }

    /// Size of the largest free block, 0 if none.
    #[must_use]
    pub fn largest_free(&self) -> usize {
        self.as_slice()
            .iter()
            .filter(|b| b.is_free())
            .map(|b| b.size as usize)
            .max()
            .unwrap_or(0)
    }

    /// Resets the table to one free block spanning `total_size` bytes.
    pub fn reset(&mut self, total_size: u32) {
        for slot in &mut self.slots[..self.count] {
            *slot = Block::default();
        }
        self.slots[0] = Block::free(0, total_size);
        self.count = 1;
    }

    /// Checks every table invariant against an arena of `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::CorruptBlockTable`] describing the first
    /// violation found.
    pub fn validate(&self, total_size: usize) -> AllocResult<()> {
        let mut expected: u64 = 0;

        for (index, block) in self.as_slice().iter().enumerate() {
            if u64::from(block.offset) != expected {
                return Err(AllocError::CorruptBlockTable(format!(
                    "block {index} starts at {} but previous block ends at {expected}",
                    block.offset
                )));
            }
            if block.size == 0 {
                return Err(AllocError::CorruptBlockTable(format!(
                    "block {index} is empty"
                )));
            }
            if block.size as usize % ALIGNMENT != 0 {
                return Err(AllocError::CorruptBlockTable(format!(
                    "block {index} size {} is not {ALIGNMENT}-aligned",
                    block.size
                )));
            }
            expected = block.end();
        }

        if expected != total_size as u64 {
            return Err(AllocError::CorruptBlockTable(format!(
                "blocks cover {expected} bytes, arena holds {total_size}"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BlockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTable")
            .field("blocks", &self.as_slice())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_creation() {
        let table = BlockTable::new(1024, 8);
        assert_eq!(table.len(), 1);
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.as_slice(), &[Block::free(0, 1024)]);
        assert!(table.validate(1024).is_ok());
    }

    #[test]
    fn test_claim_splits() {
        let mut table = BlockTable::new(1024, 8);
        table.claim(0, 112).unwrap();

        assert_eq!(
            table.as_slice(),
            &[Block::used(0, 112), Block::free(112, 912)]
        );
        assert!(table.validate(1024).is_ok());
    }

    #[test]
    fn test_claim_exact_fit_needs_no_slot() {
        let mut table = BlockTable::new(64, 1);
        table.claim(0, 64).unwrap();
        assert_eq!(table.as_slice(), &[Block::used(0, 64)]);
    }

    #[test]
    fn test_claim_full_table_unchanged() {
        let mut table = BlockTable::new(1024, 1);
        let before = table.as_slice().to_vec();

        let result = table.claim(0, 16);
        assert_eq!(result, Err(AllocError::MaxBlocksReached { max_blocks: 1 }));
        assert_eq!(table.as_slice(), before.as_slice());
    }

    #[test]
    fn test_insert_remove_keep_order() {
        let mut table = BlockTable::from_blocks(
            &[Block::used(0, 16), Block::free(16, 48)],
            4,
        );
        table.insert(1, Block::free(16, 16)).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2), Some(&Block::free(16, 48)));

        let removed = table.remove(1);
        assert_eq!(removed, Block::free(16, 16));
        assert_eq!(
            table.as_slice(),
            &[Block::used(0, 16), Block::free(16, 48)]
        );
    }

    #[test]
    fn test_coalesce_collapses_runs() {
        let mut table = BlockTable::from_blocks(
            &[
                Block::free(0, 16),
                Block::free(16, 16),
                Block::free(32, 32),
                Block::used(64, 16),
                Block::free(80, 16),
                Block::free(96, 32),
            ],
            8,
        );

        assert_eq!(table.coalesce(), 3);
        assert_eq!(
            table.as_slice(),
            &[Block::free(0, 64), Block::used(64, 16), Block::free(80, 48)]
        );
        assert!(table.validate(128).is_ok());

        // Nothing left to merge.
        assert_eq!(table.coalesce(), 0);
    }

    #[test]
    fn test_find_used_with_stale_hint() {
        let table = BlockTable::from_blocks(
            &[Block::used(0, 16), Block::free(16, 16), Block::used(32, 32)],
            4,
        );

        assert_eq!(table.find_used(32, 2), Some(2));
        assert_eq!(table.find_used(32, 0), Some(2));
        assert_eq!(table.find_used(32, 99), Some(2));
        assert_eq!(table.find_used(16, 1), None);
        assert_eq!(table.find_used(48, 0), None);
    }

    #[test]
    fn test_validate_detects_gap() {
        let table = BlockTable::from_blocks(&[Block::used(0, 16), Block::free(32, 32)], 4);
        assert!(matches!(
            table.validate(64),
            Err(AllocError::CorruptBlockTable(_))
        ));
    }

    #[test]
    fn test_sizes() {
        let table = BlockTable::from_blocks(
            &[Block::used(0, 16), Block::free(16, 16), Block::free(32, 96)],
            4,
        );
        assert_eq!(table.used_size(), 16);
        assert_eq!(table.free_size(), 112);
        assert_eq!(table.largest_free(), 96);
    }
}

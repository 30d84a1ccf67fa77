//! # World Snapshots
//!
//! Packs the block table and the arena into one buffer, and restores it into
//! an allocator whose arena may live at a completely different address.
//!
//! ## Format
//!
//! ```text
//! [8 bytes: total_size, i64 LE]
//! [4 bytes: block_count, i32 LE]
//!
//! block_count descriptors, 8 bytes each:
//! [4 bytes: size, i32 LE]
//! [1 byte:  used (0 or 1)]
//! [3 bytes: padding]
//!
//! [total_size bytes: raw arena]
//! ```
//!
//! Block offsets are not stored; they are the running sum of sizes.
//!
//! On disk the whole buffer is LZ4-compressed with its uncompressed size
//! prepended.
//!
//! ## Relocation
//!
//! After [`WorldAllocator::deserialize`] or [`WorldAllocator::load_from_file`]
//! every [`Handle`](super::Handle) is still valid, but every cached address
//! in a [`TypedPtr`](super::TypedPtr) is stale. Owners must run a
//! [`Revalidate`](super::Revalidate) pass before touching arena memory.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};

use crate::config::{AllocatorConfig, DEFAULT_MAX_BLOCKS};
use crate::error::{AllocError, AllocResult};

use super::allocator::WorldAllocator;
use super::arena::Arena;
use super::block::{Block, BlockTable};
use super::ALIGNMENT;

/// Size of the fixed snapshot header: total size plus block count.
pub const SNAPSHOT_HEADER_SIZE: usize = 12;

/// Size of one serialized block descriptor.
pub const BLOCK_DESCRIPTOR_SIZE: usize = 8;

/// Largest packed snapshot: an `i32::MAX` arena split into 16-byte blocks.
const MAX_PACKED_SIZE: u64 = SNAPSHOT_HEADER_SIZE as u64
    + (i32::MAX as u64 / ALIGNMENT as u64) * BLOCK_DESCRIPTOR_SIZE as u64
    + i32::MAX as u64;

/// An LZ4 block never expands to more than this many bytes per input byte.
const LZ4_MAX_EXPANSION: u64 = 256;

/// On-wire form of a block. The offset is implied by its position.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct BlockDescriptor {
    /// Block size, little-endian.
    size: i32,
    /// 1 if used, 0 if free.
    used: u8,
    /// Padding to a 4-byte boundary.
    _pad: [u8; 3],
}

impl BlockDescriptor {
    #[allow(clippy::cast_possible_wrap)]
    fn from_block(block: &Block) -> Self {
        // Block sizes never exceed the arena, itself capped at i32::MAX.
        Self {
            size: (block.size as i32).to_le(),
            used: u8::from(block.used),
            _pad: [0; 3],
        }
    }
}

/// A validated snapshot borrowing its arena bytes from the input buffer.
struct DecodedSnapshot<'a> {
    total_size: usize,
    blocks: Vec<Block>,
    arena: &'a [u8],
}

fn corrupt(reason: impl Into<String>) -> AllocError {
    AllocError::CorruptSnapshot(reason.into())
}

fn io_error(path: &Path, err: &std::io::Error) -> AllocError {
    match err.kind() {
        std::io::ErrorKind::NotFound => AllocError::FileNotFound(path.to_path_buf()),
        _ => AllocError::Io(format!("{}: {err}", path.display())),
    }
}

/// Parses and checks a packed snapshot without touching any allocator.
fn decode(bytes: &[u8]) -> AllocResult<DecodedSnapshot<'_>> {
    if bytes.len() < SNAPSHOT_HEADER_SIZE {
        return Err(corrupt(format!(
            "snapshot is {} bytes, header needs {SNAPSHOT_HEADER_SIZE}",
            bytes.len()
        )));
    }

    let raw_total = i64::from_le(bytemuck::pod_read_unaligned(&bytes[0..8]));
    let raw_count = i32::from_le(bytemuck::pod_read_unaligned(&bytes[8..12]));

    let total_size = usize::try_from(raw_total)
        .ok()
        .filter(|&t| t > 0 && t % ALIGNMENT == 0 && i32::try_from(t).is_ok())
        .ok_or_else(|| corrupt(format!("invalid total size {raw_total}")))?;
    let block_count = usize::try_from(raw_count)
        .ok()
        .filter(|&c| c > 0)
        .ok_or_else(|| corrupt(format!("invalid block count {raw_count}")))?;

    let table_end = block_count
        .checked_mul(BLOCK_DESCRIPTOR_SIZE)
        .and_then(|n| n.checked_add(SNAPSHOT_HEADER_SIZE))
        .ok_or_else(|| corrupt("block table length overflows"))?;
    let expected = table_end
        .checked_add(total_size)
        .ok_or_else(|| corrupt("snapshot length overflows"))?;
    if bytes.len() != expected {
        return Err(corrupt(format!(
            "header describes {expected} bytes, buffer holds {}",
            bytes.len()
        )));
    }

    let mut blocks = Vec::with_capacity(block_count);
    let mut offset: u32 = 0;
    for (index, chunk) in bytes[SNAPSHOT_HEADER_SIZE..table_end]
        .chunks_exact(BLOCK_DESCRIPTOR_SIZE)
        .enumerate()
    {
        let descriptor: BlockDescriptor = bytemuck::pod_read_unaligned(chunk);
        let size = i32::from_le(descriptor.size);
        let size = u32::try_from(size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| corrupt(format!("block {index} has size {size}")))?;
        let used = match descriptor.used {
            0 => false,
            1 => true,
            other => return Err(corrupt(format!("block {index} has used flag {other}"))),
        };

        blocks.push(Block { offset, size, used });
        offset = offset
            .checked_add(size)
            .ok_or_else(|| corrupt(format!("block {index} overflows the arena")))?;
    }

    BlockTable::from_blocks(&blocks, block_count)
        .validate(total_size)
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(DecodedSnapshot {
        total_size,
        blocks,
        arena: &bytes[table_end..],
    })
}

impl WorldAllocator {
    /// Verbatim copy of the whole arena, free space included.
    ///
    /// Holds the lock while copying so no allocation or free races the
    /// image. Writers through typed pointers should be quiesced first.
    #[must_use]
    pub fn arena_image(&self) -> Vec<u8> {
        let _table = self.lock_table();
        self.arena.to_vec()
    }

    /// Packs the block table and arena into one buffer.
    ///
    /// The lock is held only while the table and bytes are copied.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn serialize(&self) -> Vec<u8> {
        let table = self.lock_table();
        let blocks = table.as_slice();

        let mut buf = Vec::with_capacity(
            SNAPSHOT_HEADER_SIZE + blocks.len() * BLOCK_DESCRIPTOR_SIZE + self.arena.len(),
        );
        // Both fit: the arena is capped at i32::MAX and so is its block count.
        buf.extend_from_slice(&(self.arena.len() as i64).to_le_bytes());
        buf.extend_from_slice(&(blocks.len() as i32).to_le_bytes());
        for block in blocks {
            buf.extend_from_slice(bytemuck::bytes_of(&BlockDescriptor::from_block(block)));
        }
        let arena_start = buf.len();
        buf.resize(arena_start + self.arena.len(), 0);
        // The buffer was sized to the arena just above.
        let copied = self.arena.read_into(0, &mut buf[arena_start..]);
        drop(table);
        debug_assert!(copied.is_ok());

        buf
    }

    /// Restores a buffer produced by [`serialize`](Self::serialize).
    ///
    /// The arena is reallocated if the snapshot's size differs from the
    /// current one. Either way, every [`TypedPtr`](super::TypedPtr) must be
    /// revalidated afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::CorruptSnapshot`] if the buffer is truncated,
    /// has trailing bytes, or describes an inconsistent block table. The
    /// allocator is left untouched on error.
    pub fn deserialize(&mut self, bytes: &[u8]) -> AllocResult<()> {
        let snapshot = decode(bytes)?;
        self.restore(&snapshot)
    }

    fn restore(&mut self, snapshot: &DecodedSnapshot<'_>) -> AllocResult<()> {
        if snapshot.total_size != self.arena.len() {
            let old_base = self.arena.base();
            self.arena = Arena::new(snapshot.total_size)?;
            tracing::debug!(
                old_base = ?old_base,
                new_base = ?self.arena.base(),
                total_size = snapshot.total_size,
                "arena reallocated for snapshot"
            );
        }

        self.arena.as_mut_slice().copy_from_slice(snapshot.arena);

        let table = BlockTable::from_blocks(&snapshot.blocks, self.max_blocks);
        self.max_blocks = table.capacity();
        *self.table.get_mut() = table;

        tracing::debug!(
            blocks = snapshot.blocks.len(),
            total_size = snapshot.total_size,
            "world snapshot restored"
        );
        Ok(())
    }

    /// Builds a fresh allocator from a packed snapshot.
    ///
    /// # Errors
    ///
    /// As for [`deserialize`](Self::deserialize).
    pub fn from_snapshot(bytes: &[u8]) -> AllocResult<Self> {
        let snapshot = decode(bytes)?;
        let config = AllocatorConfig::default()
            .with_total_size(snapshot.total_size)
            .with_max_blocks(DEFAULT_MAX_BLOCKS.max(snapshot.blocks.len()));

        let mut allocator = Self::new(config)?;
        allocator.restore(&snapshot)?;
        Ok(allocator)
    }

    /// Writes a compressed snapshot to `path`.
    ///
    /// The snapshot is taken under the lock; compression and file I/O happen
    /// after it is released. The file is written next to `path` and renamed
    /// into place.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Io`] if the file cannot be written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> AllocResult<()> {
        let path = path.as_ref();

        let packed = self.serialize();
        let compressed = lz4_flex::compress_prepend_size(&packed);

        let tmp = temp_path(path);
        {
            let file = File::create(&tmp).map_err(|e| io_error(&tmp, &e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&compressed)
                .map_err(|e| io_error(&tmp, &e))?;
            let file = writer
                .into_inner()
                .map_err(|e| io_error(&tmp, e.error()))?;
            file.sync_all().map_err(|e| io_error(&tmp, &e))?;
        }
        fs::rename(&tmp, path).map_err(|e| io_error(path, &e))?;

        tracing::info!(
            path = %path.display(),
            packed = packed.len(),
            compressed = compressed.len(),
            "world snapshot saved"
        );
        Ok(())
    }

    /// Replaces this allocator's state with the snapshot stored at `path`.
    ///
    /// Every [`TypedPtr`](super::TypedPtr) must be revalidated afterwards.
    ///
    /// # Errors
    ///
    /// - [`AllocError::FileNotFound`] if `path` does not exist.
    /// - [`AllocError::Io`] on any other read failure.
    /// - [`AllocError::Decompression`] if the stream is not valid LZ4.
    /// - [`AllocError::CorruptSnapshot`] as for
    ///   [`deserialize`](Self::deserialize).
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> AllocResult<()> {
        let path = path.as_ref();
        let packed = read_snapshot_file(path)?;
        self.deserialize(&packed)?;

        tracing::info!(
            path = %path.display(),
            packed = packed.len(),
            "world snapshot loaded"
        );
        Ok(())
    }

    /// Builds a fresh allocator from the snapshot stored at `path`.
    ///
    /// # Errors
    ///
    /// As for [`load_from_file`](Self::load_from_file).
    pub fn open(path: impl AsRef<Path>) -> AllocResult<Self> {
        let path = path.as_ref();
        let packed = read_snapshot_file(path)?;
        Self::from_snapshot(&packed)
    }
}

fn read_snapshot_file(path: &Path) -> AllocResult<Vec<u8>> {
    let compressed = fs::read(path).map_err(|e| io_error(path, &e))?;
    check_size_prefix(&compressed)?;
    lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| AllocError::Decompression(e.to_string()))
}

/// Rejects a size prefix no valid snapshot could have, before the
/// decompressor allocates for it.
fn check_size_prefix(compressed: &[u8]) -> AllocResult<()> {
    let Some(prefix) = compressed.get(..4) else {
        return Err(AllocError::Decompression(format!(
            "stream is {} bytes, size prefix needs 4",
            compressed.len()
        )));
    };
    let claimed = u64::from(u32::from_le(bytemuck::pod_read_unaligned(prefix)));
    let limit = MAX_PACKED_SIZE.min((compressed.len() as u64).saturating_mul(LZ4_MAX_EXPANSION));

    if claimed > limit {
        return Err(AllocError::Decompression(format!(
            "stream claims {claimed} bytes, at most {limit} possible"
        )));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

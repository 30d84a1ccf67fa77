//! # STRATA Core
//!
//! Relocatable, fixed-capacity world allocator designed for:
//! - Allocation without touching the system heap after startup
//! - Sub-microsecond allocate and free from any worker thread
//! - Whole-world snapshots that reload at any address
//!
//! ## Architecture Rules
//!
//! 1. **One arena per world** - All memory is allocated once, up front
//! 2. **Offsets, not addresses** - Handles stay valid across relocation
//! 3. **Addresses are a cache** - Typed pointers are revalidated after a load
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_core::{AllocatorConfig, ArenaVec, Revalidate, WorldAllocator};
//!
//! let world = WorldAllocator::new(AllocatorConfig::small_world())?;
//!
//! let mut ids = ArenaVec::new();
//! ids.push(&world, 7u32)?;
//! world.save_to_file("world.snap")?;
//!
//! let restored = WorldAllocator::open("world.snap")?;
//! ids.revalidate(&restored);
//! assert_eq!(ids.get(&restored, 0), Some(7));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::{AllocatorConfig, DefragPolicy};
pub use error::{AllocError, AllocResult};
pub use memory::{
    revalidate_all, ArenaVec, Handle, MemoryStats, RawArenaVec, Revalidate, TypedPtr,
    WorldAllocator, ALIGNMENT, CACHE_LINE_SIZE,
};
pub use sync::{SpinMutex, Spinlock};

//! # Synchronization Primitives
//!
//! The allocator runs on worker threads that must not park in the kernel.
//!
//! ```text
//! Worker 1:  allocate ──┐
//! Worker 2:  free ──────┼──▶ [ Spinlock ] ──▶ Block Table
//! Worker 3:  allocate ──┘
//! ```
//!
//! One coarse lock around the whole block table. No per-block locking, no
//! partially updated tables visible to anyone.

mod spinlock;

pub use spinlock::{Spinlock, SpinlockGuard, SpinMutex, SpinMutexGuard};

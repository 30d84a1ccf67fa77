//! Integration test for concurrent allocation on a shared world.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use strata_core::{AllocatorConfig, Handle, WorldAllocator};

const THREADS: usize = 8;
const ALLOCS_PER_THREAD: usize = 1000;
const PAYLOAD: usize = 32;

fn shared_world(max_blocks: usize) -> Arc<WorldAllocator> {
    let config = AllocatorConfig::default()
        .with_total_size(1024 * 1024)
        .with_max_blocks(max_blocks);
    Arc::new(WorldAllocator::new(config).unwrap())
}

#[test]
fn test_parallel_allocations_are_disjoint() {
    let world = shared_world(THREADS * ALLOCS_PER_THREAD + 16);
    let start = Instant::now();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let pattern = [u8::try_from(t + 1).unwrap(); PAYLOAD];
                (0..ALLOCS_PER_THREAD)
                    .map(|_| world.allocate_value(pattern).unwrap().handle())
                    .collect::<Vec<Handle>>()
            })
        })
        .collect();

    let per_thread: Vec<Vec<Handle>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let elapsed = start.elapsed();

    // Every region still holds the pattern its owner wrote.
    for (t, handles) in per_thread.iter().enumerate() {
        let expected = [u8::try_from(t + 1).unwrap(); PAYLOAD];
        for handle in handles {
            assert_eq!(world.read::<[u8; PAYLOAD]>(*handle).unwrap(), expected);
        }
    }

    // No two regions overlap.
    let mut offsets: Vec<u32> = per_thread.iter().flatten().map(|h| h.offset()).collect();
    offsets.sort_unstable();
    for pair in offsets.windows(2) {
        assert!(pair[1] - pair[0] >= PAYLOAD as u32, "overlap at {pair:?}");
    }

    let info = world.memory_info();
    assert_eq!(info.used_size, THREADS * ALLOCS_PER_THREAD * PAYLOAD);
    assert_eq!(info.used_size + info.free_size, info.total_size);
    assert!(world.validate().is_ok());

    println!(
        "{} allocations across {THREADS} threads in {elapsed:?}",
        THREADS * ALLOCS_PER_THREAD
    );
}

#[test]
fn test_parallel_churn_returns_to_empty() {
    // Live blocks interleave with freed holes, so leave room for both.
    let world = shared_world(4 * THREADS * ALLOCS_PER_THREAD);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..ALLOCS_PER_THREAD {
                    live.push(world.allocate_raw(16 * (1 + (i + t) % 4)).unwrap());
                    if i % 3 == 2 {
                        world.free(live.swap_remove(0)).unwrap();
                    }
                    if i % 100 == 0 {
                        world.defragment();
                    }
                }
                for handle in live {
                    world.free(handle).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    world.defragment();
    let info = world.memory_info();
    assert_eq!(info.used_size, 0);
    assert_eq!(info.block_count, 1);
    assert_eq!(info.largest_free_block, info.total_size);
    assert!(world.validate().is_ok());
}

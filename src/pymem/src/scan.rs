//! Parallel address-space scanner.
//!
//! Every region is tiled into fixed-size blocks; worker threads claim blocks
//! from a shared atomic counter and walk stride-spaced offsets within them.
//! The predicate sees a borrowed byte window, the mapped address it starts
//! at, and a stable thread index usable for shard-local accumulators.
//!
//! Coverage guarantee: for every region and every stride-aligned offset whose
//! window fits inside the region, the predicate runs exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::addr::MappedAddr;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotStore;

/// Blocks are one page; stride must divide into this.
const BLOCK_SIZE: u64 = 0x1000;

/// Default thread count: one per hardware thread.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct RegionPlan<'s> {
    start: u64,
    bytes: &'s [u8],
    /// Index of this region's first block in the global block space.
    first_block: u64,
}

/// Visit every stride-aligned offset of every region in parallel.
///
/// `predicate(window, addr, thread_index)` receives `object_size` bytes
/// borrowed from the snapshot. Invocations are unordered; the predicate must
/// be safe for concurrent calls.
pub fn scan<F>(
    store: &SnapshotStore,
    object_size: u64,
    stride: u64,
    num_threads: usize,
    predicate: F,
) -> Result<()>
where
    F: Fn(&[u8], MappedAddr, usize) + Sync,
{
    if stride == 0 || stride & (stride - 1) != 0 || stride > BLOCK_SIZE {
        return Err(Error::BadStride(stride, BLOCK_SIZE));
    }
    let num_threads = if num_threads == 0 {
        default_threads()
    } else {
        num_threads
    };

    let mut plans: Vec<RegionPlan> = Vec::new();
    let mut next_block = 0u64;
    for (start, size) in store.all_regions() {
        let bytes = store.read(start, size)?;
        plans.push(RegionPlan {
            start: start.raw(),
            bytes,
            first_block: next_block,
        });
        next_block += size.div_ceil(BLOCK_SIZE);
    }
    let total_blocks = next_block;
    let counter = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for thread_index in 0..num_threads {
            let counter = &counter;
            let plans = &plans;
            let predicate = &predicate;
            scope.spawn(move || {
                let mut region = 0usize;
                loop {
                    let block = counter.fetch_add(1, Ordering::Relaxed);
                    if block >= total_blocks {
                        break;
                    }
                    // Blocks are handed out in order, so the region cursor
                    // only ever moves forward within one thread.
                    while region + 1 < plans.len() && block >= plans[region + 1].first_block {
                        region += 1;
                    }
                    let plan = &plans[region];
                    let block_off = (block - plan.first_block) * BLOCK_SIZE;
                    let region_size = plan.bytes.len() as u64;
                    let mut off = block_off;
                    while off < block_off + BLOCK_SIZE {
                        if off + object_size > region_size {
                            break;
                        }
                        let window = &plan.bytes[off as usize..(off + object_size) as usize];
                        predicate(window, MappedAddr::new(plan.start + off), thread_index);
                        off += stride;
                    }
                }
            });
        }

        // The spawning thread doubles as the progress reporter.
        let total_bytes = store.total_bytes();
        loop {
            let done_blocks = counter.load(Ordering::Relaxed).min(total_blocks);
            if done_blocks >= total_blocks {
                break;
            }
            let region = plans
                .partition_point(|p| p.first_block <= done_blocks)
                .saturating_sub(1);
            let plan = &plans[region];
            let addr = MappedAddr::<()>::new(
                plan.start + (done_blocks - plan.first_block) * BLOCK_SIZE,
            );
            let done_bytes = (done_blocks * BLOCK_SIZE).min(total_bytes);
            eprint!(
                "\r... {} ({}/{} regions, {}/{}, {:.1}%)\x1b[K",
                addr,
                region,
                plans.len(),
                format_size(done_bytes),
                format_size(total_bytes),
                done_bytes as f64 / total_bytes as f64 * 100.0,
            );
            std::thread::sleep(Duration::from_millis(100));
        }
    });
    Ok(())
}

/// Human-readable byte count, e.g. "1.5 GB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open_snapshot(regions: &[(u64, usize)]) -> (TempDir, SnapshotStore) {
        let dir = TempDir::new().unwrap();
        for &(start, size) in regions {
            let name = format!("mem.{:016x}.{:016x}.bin", start, start + size as u64);
            std::fs::write(dir.path().join(name), vec![0u8; size]).unwrap();
        }
        let store = SnapshotStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_stride_validation() {
        let (_dir, store) = open_snapshot(&[(0x1000, 0x100)]);
        assert!(matches!(
            scan(&store, 8, 3, 1, |_, _, _| {}),
            Err(Error::BadStride(3, _))
        ));
        assert!(matches!(
            scan(&store, 8, 0x2000, 1, |_, _, _| {}),
            Err(Error::BadStride(_, _))
        ));
        assert!(scan(&store, 8, 8, 1, |_, _, _| {}).is_ok());
    }

    #[test]
    fn test_exactly_once_coverage() {
        // Region sizes chosen to exercise partial trailing blocks.
        let (_dir, store) = open_snapshot(&[(0x10000, 0x2508), (0x40000, 0x1000), (0x80000, 0x18)]);
        let object_size = 16u64;
        let stride = 8u64;

        let hits: Mutex<HashMap<u64, usize>> = Mutex::new(HashMap::new());
        scan(&store, object_size, stride, 4, |window, addr, _| {
            assert_eq!(window.len(), object_size as usize);
            *hits.lock().unwrap().entry(addr.raw()).or_insert(0) += 1;
        })
        .unwrap();

        let hits = hits.into_inner().unwrap();
        let mut expected = 0usize;
        for (start, size) in store.all_regions() {
            let mut off = 0u64;
            while off + object_size <= size {
                assert_eq!(
                    hits.get(&(start.raw() + off)),
                    Some(&1),
                    "offset {:#x} in region {} visited wrong number of times",
                    off,
                    start
                );
                expected += 1;
                off += stride;
            }
        }
        assert_eq!(hits.len(), expected);
    }

    #[test]
    fn test_thread_index_in_range() {
        let (_dir, store) = open_snapshot(&[(0x1000, 0x4000)]);
        let num_threads = 3;
        let seen = Mutex::new(Vec::new());
        scan(&store, 8, 8, num_threads, |_, _, ti| {
            seen.lock().unwrap().push(ti);
        })
        .unwrap();
        assert!(seen.into_inner().unwrap().iter().all(|&ti| ti < num_threads));
    }

    #[test]
    fn test_shard_local_accumulators_merge() {
        let (_dir, store) = open_snapshot(&[(0x1000, 0x3000)]);
        let num_threads = 4;
        let shards: Vec<Mutex<u64>> = (0..num_threads).map(|_| Mutex::new(0)).collect();
        scan(&store, 8, 8, num_threads, |_, _, ti| {
            *shards[ti].lock().unwrap() += 1;
        })
        .unwrap();
        let total: u64 = shards.iter().map(|s| *s.lock().unwrap()).sum();
        assert_eq!(total, 0x3000 / 8); // every aligned offset with room for 8 bytes
    }

    #[test]
    fn test_object_size_larger_than_stride_skips_region_tail() {
        let (_dir, store) = open_snapshot(&[(0x1000, 0x20)]);
        let hits = Mutex::new(Vec::new());
        scan(&store, 24, 8, 1, |_, addr, _| {
            hits.lock().unwrap().push(addr.raw());
        })
        .unwrap();
        let mut hits = hits.into_inner().unwrap();
        hits.sort_unstable();
        // 0x20-byte region, 24-byte windows: offsets 0 and 8 fit, 0x10 does not.
        assert_eq!(hits, vec![0x1000, 0x1008]);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(17), "17 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(1536 * 1024 * 1024), "1.5 GB");
    }
}

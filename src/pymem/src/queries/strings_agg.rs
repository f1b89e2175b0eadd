//! String-length aggregation.

use std::sync::Mutex;

use crate::args::Args;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{ObjHeader, PyBytesObject, PyStrObject};
use crate::scan::{format_size, scan};
use crate::traverse::{ReprOptions, Traversal};
use crate::CLEAR_LINE;

use super::Session;

/// Log-scaled histogram bucket boundaries; an object of size N lands in the
/// first bucket whose boundary is >= N.
pub const SIZE_BUCKETS: [u64; 29] = [
    0,
    1,
    2,
    5,
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    1_000_000,
    2_000_000,
    5_000_000,
    10_000_000,
    20_000_000,
    50_000_000,
    100_000_000,
    200_000_000,
    500_000_000,
    1_000_000_000,
];

/// Index of the histogram bucket that `size` falls in.
pub fn bucket_index(size: u64) -> usize {
    SIZE_BUCKETS.partition_point(|&boundary| boundary < size)
}

#[derive(Debug, Default)]
pub struct StringAggregate {
    pub total_objects: u64,
    pub total_size: u64,
    /// Counts indexed by bucket; one slot past the table for oversized.
    pub histogram: Vec<u64>,
    /// Reprs of objects inside the requested print window.
    pub printed: Vec<String>,
}

/// Histogram the lengths of all str (or bytes) objects. Objects whose size
/// is in `[print_larger_than, print_smaller_than)` are repr'd as well.
pub fn aggregate_strings(
    env: &Environment,
    max_threads: usize,
    over_bytes: bool,
    print_larger_than: u64,
    print_smaller_than: u64,
    repr_args: &Args,
) -> Result<StringAggregate> {
    let type_name = if over_bytes { "bytes" } else { "str" };
    let type_addr = env.get_type(type_name)?;
    let opts = ReprOptions::from_args(repr_args)?;

    let num_threads = if max_threads == 0 {
        crate::scan::default_threads()
    } else {
        max_threads
    };
    // Shard-local accumulators, merged after the scan.
    let shards: Vec<Mutex<StringAggregate>> = (0..num_threads)
        .map(|_| Mutex::new(StringAggregate::default()))
        .collect();

    scan(&env.store, ObjHeader::SIZE, 8, num_threads, |window, addr, ti| {
        let header = ObjHeader::parse(window);
        if header.ob_type != type_addr || env.invalid_reason(addr).is_some() {
            return;
        }

        // Size-only fast path; no payload decode.
        let data_size = if over_bytes {
            match PyBytesObject::read(env, addr.cast()) {
                Ok(bytes) => bytes.header.ob_size.max(0) as u64,
                Err(_) => return,
            }
        } else {
            match PyStrObject::read(env, addr.cast()) {
                Ok(s) => s.char_len().max(0) as u64,
                Err(_) => return,
            }
        };

        let mut shard = shards[ti].lock().unwrap();
        let bucket = bucket_index(data_size);
        if shard.histogram.len() <= bucket {
            shard.histogram.resize(bucket + 1, 0);
        }
        shard.histogram[bucket] += 1;
        shard.total_objects += 1;
        shard.total_size += data_size;
        if data_size >= print_larger_than && data_size < print_smaller_than {
            let mut t = Traversal::with_options(env, &opts);
            shard.printed.push(t.repr(addr));
        }
    })?;

    let mut merged = StringAggregate::default();
    for shard in shards {
        let shard = shard.into_inner().unwrap();
        if merged.histogram.len() < shard.histogram.len() {
            merged.histogram.resize(shard.histogram.len(), 0);
        }
        for (bucket, count) in shard.histogram.iter().enumerate() {
            merged.histogram[bucket] += count;
        }
        merged.total_objects += shard.total_objects;
        merged.total_size += shard.total_size;
        merged.printed.extend(shard.printed);
    }
    merged.printed.sort_unstable();
    Ok(merged)
}

pub fn cmd_aggregate_strings(session: &mut Session, args: &Args) -> Result<()> {
    let over_bytes = args.get_flag("bytes");
    let print_smaller_than = args.get_u64("print-smaller-than", 0)?;
    let print_larger_than = args.get_u64("print-larger-than", 0)?;

    let agg = aggregate_strings(
        &session.env,
        session.max_threads,
        over_bytes,
        print_larger_than,
        print_smaller_than,
        args,
    )?;

    for repr in &agg.printed {
        println!("{CLEAR_LINE}{repr}");
    }
    println!(
        "Found {} objects with {} data bytes overall ({})",
        agg.total_objects,
        agg.total_size,
        format_size(agg.total_size)
    );
    for (bucket, count) in agg.histogram.iter().enumerate() {
        let label = match SIZE_BUCKETS.get(bucket) {
            Some(boundary) => boundary.to_string(),
            None => format!(">{}", SIZE_BUCKETS[SIZE_BUCKETS.len() - 1]),
        };
        println!("Length <= {label}: {count} objects");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SnapshotBuilder;

    #[test]
    fn test_bucket_index_boundaries() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 1);
        assert_eq!(bucket_index(7), 4); // first boundary >= 7 is 10
        assert_eq!(bucket_index(10), 4);
        assert_eq!(bucket_index(11), 5);
        assert_eq!(bucket_index(300), 9); // lands in the 500 bucket
        assert_eq!(bucket_index(2_000_000_000), SIZE_BUCKETS.len());
    }

    #[test]
    fn test_histogram_counts() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        // Several length-7 strings and one length-300 string.
        for i in 0..4u64 {
            b.str_ascii(0x2000 + i * 0x80, ty.str_, "sevench");
        }
        let long = "x".repeat(300);
        b.str_ascii(0x4000, ty.str_, &long);
        let (_dir, env) = b.build_env();

        let args = Args::parse("aggregate-strings");
        let agg = aggregate_strings(&env, 2, false, 0, 0, &args).unwrap();

        // Type names in the type region are C strings, not str objects, so
        // only our five objects count.
        assert_eq!(agg.total_objects, 5);
        assert_eq!(agg.total_size, 4 * 7 + 300);
        assert_eq!(agg.histogram[bucket_index(7)], 4);
        assert_eq!(agg.histogram[bucket_index(300)], 1);
        assert!(agg.printed.is_empty());
    }

    #[test]
    fn test_print_window() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        b.str_ascii(0x2000, ty.str_, "tiny");
        b.str_ascii(0x2080, ty.str_, "this one is long enough");
        let (_dir, env) = b.build_env();

        let args = Args::parse("aggregate-strings");
        let agg = aggregate_strings(&env, 2, false, 10, 1000, &args).unwrap();
        assert_eq!(agg.printed, vec!["'this one is long enough'".to_string()]);
    }

    #[test]
    fn test_bytes_aggregation() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        b.bytes_obj(0x2000, ty.bytes, b"abc");
        b.bytes_obj(0x2080, ty.bytes, &[0u8; 60]);
        let (_dir, env) = b.build_env();

        let args = Args::parse("aggregate-strings --bytes");
        let agg = aggregate_strings(&env, 2, true, 0, 0, &args).unwrap();
        assert_eq!(agg.total_objects, 2);
        assert_eq!(agg.total_size, 63);
        assert_eq!(agg.histogram[bucket_index(3)], 1);
        assert_eq!(agg.histogram[bucket_index(60)], 1);
    }
}

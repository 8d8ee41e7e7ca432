//! Bucketed free-list pool of recyclable segments
//!
//! Bucket `i` covers segment sizes in `[2^(MIN+i), 2^(MIN+i+1))`. The two
//! rounding rules are deliberately asymmetric: lookups round the request
//! *up* to the next power of two, insertions round the segment size *down*.
//! Together they guarantee that any segment sitting in bucket `p` has
//! `size >= 2^p`, so it satisfies every request that mapped to that bucket.
//! Changing only one side breaks that guarantee.

use crate::segment::Segment;

/// Smallest poolable segment size, as a power of two (8 KB).
pub const MIN_SEGMENT_SIZE_POWER: u32 = 13;

/// Largest poolable segment size, as a power of two (256 KB). Requests
/// above `2^MAX_SEGMENT_SIZE_POWER` bypass the pool entirely.
pub const MAX_SEGMENT_SIZE_POWER: u32 = 18;

/// Number of size-class buckets.
pub const NUM_BUCKETS: usize = (MAX_SEGMENT_SIZE_POWER - MIN_SEGMENT_SIZE_POWER + 1) as usize;

/// Cap on how many segments a single bucket retains; returns beyond the
/// cap fall through to a system free.
pub const MAX_SEGMENTS_PER_BUCKET: usize = 8;

/// Maps a requested byte count to `(bucket, rounded_size)` using ceiling
/// rounding, or `None` when the request is too large to be pooled.
///
/// `rounded_size` is the bucket's representative size `2^power`; fresh
/// segments for poolable requests are allocated at exactly this size so a
/// later floor-rounded insertion lands them back in the same bucket.
pub(crate) fn request_bucket(bytes: usize) -> Option<(usize, usize)> {
    if bytes > 1usize << MAX_SEGMENT_SIZE_POWER {
        return None;
    }

    let mut power = MIN_SEGMENT_SIZE_POWER;
    while bytes > 1usize << power {
        power += 1;
    }

    Some(((power - MIN_SEGMENT_SIZE_POWER) as usize, 1usize << power))
}

/// Maps an actual segment size to its bucket using floor rounding, or
/// `None` when the size falls outside the poolable range.
pub(crate) fn segment_bucket(size: usize) -> Option<usize> {
    if size >= 1usize << (MAX_SEGMENT_SIZE_POWER + 1) {
        return None;
    }
    if size < 1usize << MIN_SEGMENT_SIZE_POWER {
        return None;
    }

    let mut power = MAX_SEGMENT_SIZE_POWER;
    while size < 1usize << power {
        power -= 1;
    }

    Some((power - MIN_SEGMENT_SIZE_POWER) as usize)
}

struct Bucket {
    head: Option<Box<Segment>>,
    count: usize,
}

/// The bucket array. Not internally synchronized; the accounting allocator
/// wraps it in a single coarse mutex.
pub(crate) struct SegmentPool {
    buckets: [Bucket; NUM_BUCKETS],
}

impl SegmentPool {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Bucket {
                head: None,
                count: 0,
            }),
        }
    }

    /// Pops the LIFO head of `bucket`, if any.
    pub(crate) fn pop(&mut self, bucket: usize) -> Option<Box<Segment>> {
        let slot = &mut self.buckets[bucket];
        let mut segment = slot.head.take()?;
        slot.head = segment.take_next();
        slot.count -= 1;
        Some(segment)
    }

    /// Links `segment` at the head of `bucket`.
    ///
    /// Ownership transfers to the pool on success; a bucket at its cap
    /// rejects the segment and hands it back to the caller.
    pub(crate) fn push(
        &mut self,
        bucket: usize,
        mut segment: Box<Segment>,
    ) -> Result<(), Box<Segment>> {
        debug_assert!(!segment.has_next());

        let slot = &mut self.buckets[bucket];
        if slot.count >= MAX_SEGMENTS_PER_BUCKET {
            return Err(segment);
        }

        segment.set_next(slot.head.take());
        slot.head = Some(segment);
        slot.count += 1;
        Ok(())
    }

    /// Empties every bucket, returning the retained segments so the caller
    /// can account for and free them.
    pub(crate) fn drain(&mut self) -> Vec<Box<Segment>> {
        let mut drained = Vec::new();
        for slot in &mut self.buckets {
            let mut current = slot.head.take();
            while let Some(mut segment) = current {
                current = segment.take_next();
                drained.push(segment);
            }
            slot.count = 0;
        }
        drained
    }

    /// Number of segments currently held in `bucket`.
    pub(crate) fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets[bucket].count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lookup_rounds_up() {
        assert_eq!(request_bucket(1), Some((0, 8192)));
        assert_eq!(request_bucket(8192), Some((0, 8192)));
        assert_eq!(request_bucket(8193), Some((1, 16384)));
        assert_eq!(request_bucket(10_000), Some((1, 16384)));
        assert_eq!(request_bucket(1 << 18), Some((5, 1 << 18)));
        assert_eq!(request_bucket((1 << 18) + 1), None);
    }

    #[test]
    fn insertion_rounds_down() {
        assert_eq!(segment_bucket(8191), None);
        assert_eq!(segment_bucket(8192), Some(0));
        assert_eq!(segment_bucket(10_000), Some(0));
        assert_eq!(segment_bucket(16384), Some(1));
        assert_eq!(segment_bucket((1 << 19) - 1), Some(5));
        assert_eq!(segment_bucket(1 << 19), None);
    }

    #[test]
    fn push_respects_bucket_cap() {
        let mut pool = SegmentPool::new();
        for _ in 0..MAX_SEGMENTS_PER_BUCKET {
            let segment = Segment::allocate(8192).unwrap();
            assert!(pool.push(0, segment).is_ok());
        }
        assert_eq!(pool.bucket_len(0), MAX_SEGMENTS_PER_BUCKET);

        let overflow = Segment::allocate(8192).unwrap();
        let rejected = pool.push(0, overflow);
        assert!(rejected.is_err());
        assert_eq!(pool.bucket_len(0), MAX_SEGMENTS_PER_BUCKET);
    }

    #[test]
    fn pop_is_lifo() {
        let mut pool = SegmentPool::new();
        let first = Segment::allocate(8192).unwrap();
        let second = Segment::allocate(8192).unwrap();
        let (first_start, second_start) = (first.start() as usize, second.start() as usize);

        pool.push(0, first).unwrap();
        pool.push(0, second).unwrap();

        assert_eq!(pool.pop(0).unwrap().start() as usize, second_start);
        assert_eq!(pool.pop(0).unwrap().start() as usize, first_start);
        assert!(pool.pop(0).is_none());
    }

    #[test]
    fn drain_empties_all_buckets() {
        let mut pool = SegmentPool::new();
        pool.push(0, Segment::allocate(8192).unwrap()).unwrap();
        pool.push(0, Segment::allocate(8192).unwrap()).unwrap();
        pool.push(1, Segment::allocate(16384).unwrap()).unwrap();

        let drained = pool.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.bucket_len(0), 0);
        assert_eq!(pool.bucket_len(1), 0);
    }

    proptest! {
        // The asymmetric rounding pair: a fresh segment allocated at the
        // lookup's rounded size must floor back into the same bucket, and
        // anything sitting in a bucket covers every request mapped there.
        #[test]
        fn rounding_pair_preserves_reuse(bytes in 1usize..=(1 << 18)) {
            let (bucket, rounded) = request_bucket(bytes).unwrap();
            prop_assert!(rounded >= bytes);
            prop_assert_eq!(segment_bucket(rounded), Some(bucket));
        }

        #[test]
        fn pooled_size_covers_bucket_requests(size in (1usize << 13)..(1 << 19)) {
            let bucket = segment_bucket(size).unwrap();
            prop_assert!(size >= 1usize << (MIN_SEGMENT_SIZE_POWER + bucket as u32));
        }
    }
}

//! Allocation-free latency histograms.
//!
//! The bucket layout is HdrHistogram's: values are grouped into exponentially
//! growing buckets, each split into linear sub-buckets fine enough to keep
//! `SIGNIFICANT_FIGURES` decimal digits of precision.  Counts live in a fixed
//! array of atomics, so recording is a pair of relaxed increments that can be
//! done from any thread, inside `malloc`, without locks.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    config::{HIGHEST_TRACKABLE_NS, LOWEST_TRACKABLE_NS, SIGNIFICANT_FIGURES},
    symbols::Operation,
};

/// Bucket geometry derived from the trackable range and precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketLayout {
    pub lowest: u64,
    pub highest: u64,
    pub sigfigs: u8,
    unit_magnitude: u32,
    sub_bucket_half_count_magnitude: u32,
    sub_bucket_half_count: u64,
    sub_bucket_mask: u64,
    leading_zero_count_base: u32,
    pub bucket_count: u32,
    pub sub_bucket_count: u64,
    pub counts_len: usize,
}

impl BucketLayout {
    pub const fn new(lowest: u64, highest: u64, sigfigs: u8) -> Self {
        assert!(lowest >= 1);
        assert!(highest >= 2 * lowest);
        assert!(sigfigs <= 5);

        let largest_value_with_single_unit_resolution = 2 * 10u64.pow(sigfigs as u32);
        // ceil(log2(..))
        let mut sub_bucket_count_magnitude = 0;
        while (1u64 << sub_bucket_count_magnitude) < largest_value_with_single_unit_resolution {
            sub_bucket_count_magnitude += 1;
        }
        let sub_bucket_half_count_magnitude = if sub_bucket_count_magnitude > 1 {
            sub_bucket_count_magnitude - 1
        } else {
            0
        };
        // floor(log2(lowest))
        let unit_magnitude = 63 - lowest.leading_zeros();

        let sub_bucket_count = 1u64 << (sub_bucket_half_count_magnitude + 1);
        let sub_bucket_half_count = sub_bucket_count / 2;
        let sub_bucket_mask = (sub_bucket_count - 1) << unit_magnitude;

        let mut smallest_untrackable_value = sub_bucket_count << unit_magnitude;
        let mut bucket_count = 1;
        while smallest_untrackable_value <= highest {
            if smallest_untrackable_value > u64::MAX / 2 {
                bucket_count += 1;
                break;
            }
            smallest_untrackable_value <<= 1;
            bucket_count += 1;
        }

        BucketLayout {
            lowest,
            highest,
            sigfigs,
            unit_magnitude,
            sub_bucket_half_count_magnitude,
            sub_bucket_half_count,
            sub_bucket_mask,
            leading_zero_count_base: 64 - unit_magnitude - sub_bucket_half_count_magnitude - 1,
            bucket_count,
            sub_bucket_count,
            counts_len: ((bucket_count + 1) as usize) * (sub_bucket_half_count as usize),
        }
    }

    /// Index of the counter that `value` is recorded in.
    #[inline]
    pub fn index_of(&self, value: u64) -> usize {
        let bucket = self.leading_zero_count_base - (value | self.sub_bucket_mask).leading_zeros();
        let sub_bucket = value >> (bucket + self.unit_magnitude);
        let bucket_base = ((bucket + 1) as usize) << self.sub_bucket_half_count_magnitude;
        // Bucket 0 also uses the lower half of its sub-buckets.
        bucket_base + sub_bucket as usize - self.sub_bucket_half_count as usize
    }

    /// Lowest value that is recorded in counter `index`.
    pub fn value_at(&self, index: usize) -> u64 {
        let mut bucket = (index >> self.sub_bucket_half_count_magnitude) as i64 - 1;
        let mut sub_bucket =
            (index as u64 & (self.sub_bucket_half_count - 1)) + self.sub_bucket_half_count;
        if bucket < 0 {
            sub_bucket -= self.sub_bucket_half_count;
            bucket = 0;
        }
        sub_bucket << (bucket as u32 + self.unit_magnitude)
    }

    /// Clamp `value` into the trackable range.
    #[inline]
    pub fn clamp(&self, value: u64) -> u64 {
        value.clamp(self.lowest, self.highest)
    }
}

/// Layout shared by every latency histogram.
pub const LAYOUT: BucketLayout =
    BucketLayout::new(LOWEST_TRACKABLE_NS, HIGHEST_TRACKABLE_NS, SIGNIFICANT_FIGURES);

const COUNTS_LEN: usize = LAYOUT.counts_len;

/// A histogram whose storage is sized at compile time.
pub struct AtomicHistogram {
    counts: [AtomicU64; COUNTS_LEN],
    total: AtomicU64,
}

impl AtomicHistogram {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        AtomicHistogram {
            counts: [ZERO; COUNTS_LEN],
            total: AtomicU64::new(0),
        }
    }

    /// Record one sample, clamped into `[LOWEST_TRACKABLE_NS, HIGHEST_TRACKABLE_NS]`.
    #[inline]
    pub fn record(&self, nanos: u64) {
        let index = LAYOUT.index_of(LAYOUT.clamp(nanos));
        self.counts[index].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples recorded.
    pub fn len(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(lowest value in bucket, count)` for every nonempty bucket, in value order.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        self.counts
            .iter()
            .enumerate()
            .filter_map(|(index, count)| match count.load(Ordering::Relaxed) {
                0 => None,
                n => Some((LAYOUT.value_at(index), n)),
            })
            .collect()
    }
}

impl Default for AtomicHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// One histogram per intercepted [`Operation`].
pub struct HistogramSet {
    histograms: [AtomicHistogram; Operation::COUNT],
}

impl HistogramSet {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicHistogram = AtomicHistogram::new();
        HistogramSet {
            histograms: [EMPTY; Operation::COUNT],
        }
    }

    #[inline]
    pub fn record(&self, op: Operation, nanos: u64) {
        self.histograms[op.index()].record(nanos);
    }

    pub fn get(&self, op: Operation) -> &AtomicHistogram {
        &self.histograms[op.index()]
    }
}

impl Default for HistogramSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdrhistogram::Histogram;
    use std::thread;

    #[test]
    fn layout_matches_configured_precision() {
        // 2 * 10^3 distinct values need 2048 sub-buckets; 5ns..50ms spans 14 buckets.
        assert_eq!(LAYOUT.sub_bucket_count, 2048);
        assert_eq!(LAYOUT.bucket_count, 14);
        assert_eq!(LAYOUT.counts_len, 15 * 1024);
    }

    #[test]
    fn layout_agrees_with_hdrhistogram() {
        let reference =
            Histogram::<u64>::new_with_bounds(LAYOUT.lowest, LAYOUT.highest, LAYOUT.sigfigs)
                .unwrap();
        for value in [5, 6, 100, 4095, 4096, 12_345, 999_999, 50_000_000] {
            let index = LAYOUT.index_of(value);
            let bucket_value = LAYOUT.value_at(index);
            assert!(bucket_value <= value);
            assert!(reference.equivalent(bucket_value, value));
            assert_eq!(LAYOUT.index_of(bucket_value), index);
        }
        assert!(LAYOUT.index_of(LAYOUT.highest) < LAYOUT.counts_len);
    }

    #[test]
    fn clamps_out_of_range_values() {
        static HIST: AtomicHistogram = AtomicHistogram::new();
        let hist = &HIST;
        hist.record(0);
        hist.record(u64::MAX);
        assert_eq!(hist.len(), 2);

        let buckets = hist.buckets();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], (LAYOUT.value_at(LAYOUT.index_of(LAYOUT.lowest)), 1));
        assert_eq!(
            buckets[1],
            (LAYOUT.value_at(LAYOUT.index_of(LAYOUT.highest)), 1)
        );
    }

    #[test]
    fn low_range_has_finest_buckets() {
        static HIST: AtomicHistogram = AtomicHistogram::new();
        let hist = &HIST;
        for v in 5..2048 {
            hist.record(v);
        }
        // Below 2048 << unit_magnitude every bucket is 4ns wide.
        let buckets = hist.buckets();
        assert!(buckets.iter().all(|(_, count)| *count <= 4));
        assert_eq!(buckets.iter().map(|(_, c)| c).sum::<u64>(), 2043);
    }

    #[test]
    fn concurrent_recording_is_not_lost() {
        static SET: HistogramSet = HistogramSet::new();
        thread::scope(|s| {
            for t in 0..8u64 {
                s.spawn(move || {
                    for i in 0..10_000u64 {
                        SET.record(Operation::Malloc, 100 + t * 1000 + i);
                    }
                });
            }
        });
        assert_eq!(SET.get(Operation::Malloc).len(), 80_000);
        assert_eq!(
            SET.get(Operation::Malloc)
                .buckets()
                .iter()
                .map(|(_, count)| count)
                .sum::<u64>(),
            80_000
        );
        assert!(SET.get(Operation::Free).is_empty());
    }
}

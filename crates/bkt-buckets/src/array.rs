//! Per-device bucket arrays and the compact generation table.
//!
//! Both are indexed by bucket number. Slots below `first_bucket` exist so
//! that indexing stays a plain offset, but touching them is a bug.

use crate::mark::{Bucket, BucketMark};
use bkt_types::{BucketIdx, Gen};
use std::sync::atomic::{AtomicU8, Ordering};

/// Marks for every bucket of one device.
#[derive(Debug)]
pub struct BucketArray {
    first_bucket: u64,
    nbuckets: u64,
    buckets: Box<[Bucket]>,
}

fn slot(first_bucket: u64, nbuckets: u64, b: BucketIdx) -> usize {
    assert!(
        b.0 >= first_bucket && b.0 < nbuckets,
        "bucket {} outside [{first_bucket}, {nbuckets})",
        b.0
    );
    usize::try_from(b.0).expect("bucket index fits in usize")
}

fn alloc_len(nbuckets: u64) -> usize {
    usize::try_from(nbuckets).expect("bucket count fits in usize")
}

impl BucketArray {
    /// All buckets empty at generation zero.
    #[must_use]
    pub fn new(first_bucket: u64, nbuckets: u64) -> Self {
        let buckets = (0..alloc_len(nbuckets)).map(|_| Bucket::default()).collect();
        Self {
            first_bucket,
            nbuckets,
            buckets,
        }
    }

    /// A larger array carrying over every mark and `oldest_gen` from `old`.
    #[must_use]
    pub fn grown_from(old: &Self, nbuckets: u64) -> Self {
        assert!(nbuckets >= old.nbuckets, "bucket arrays only grow");
        let new = Self::new(old.first_bucket, nbuckets);
        for (idx, bucket) in old.iter() {
            let dst = new.bucket(idx);
            dst.mark.set(bucket.mark.read());
            dst.set_oldest_gen(bucket.oldest_gen());
        }
        new
    }

    /// A GC shadow of `live`: same gens, zeroed counters.
    ///
    /// `oldest_gen` starts at the current gen and is pulled back by every
    /// pointer GC marks.
    #[must_use]
    pub fn gc_shadow_of(live: &Self) -> Self {
        let shadow = Self::new(live.first_bucket, live.nbuckets);
        for (idx, bucket) in live.iter() {
            let gen = bucket.mark.read().gen;
            let dst = shadow.bucket(idx);
            dst.mark.set(BucketMark {
                gen,
                ..BucketMark::default()
            });
            dst.set_oldest_gen(gen);
        }
        shadow
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    #[must_use]
    pub fn contains(&self, b: BucketIdx) -> bool {
        b.0 >= self.first_bucket && b.0 < self.nbuckets
    }

    /// Panics if `b` is outside `[first_bucket, nbuckets)`.
    #[must_use]
    pub fn bucket(&self, b: BucketIdx) -> &Bucket {
        &self.buckets[slot(self.first_bucket, self.nbuckets, b)]
    }

    /// Usable buckets in index order.
    pub fn iter(&self) -> impl Iterator<Item = (BucketIdx, &Bucket)> + '_ {
        (self.first_bucket..self.nbuckets).map(move |b| (BucketIdx(b), self.bucket(BucketIdx(b))))
    }
}

/// Generation byte per bucket, mirrored from the marks for lock-free
/// staleness checks.
#[derive(Debug)]
pub struct BucketGens {
    first_bucket: u64,
    nbuckets: u64,
    gens: Box<[AtomicU8]>,
}

impl BucketGens {
    #[must_use]
    pub fn new(first_bucket: u64, nbuckets: u64) -> Self {
        let gens = (0..alloc_len(nbuckets)).map(|_| AtomicU8::new(0)).collect();
        Self {
            first_bucket,
            nbuckets,
            gens,
        }
    }

    /// Build from the gens currently recorded in `array`.
    #[must_use]
    pub fn from_array(array: &BucketArray) -> Self {
        let gens = Self::new(array.first_bucket(), array.nbuckets());
        for (idx, bucket) in array.iter() {
            gens.set(idx, bucket.mark.read().gen);
        }
        gens
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    /// Panics if `b` is outside `[first_bucket, nbuckets)`.
    #[must_use]
    pub fn get(&self, b: BucketIdx) -> Gen {
        Gen(self.gens[slot(self.first_bucket, self.nbuckets, b)].load(Ordering::Acquire))
    }

    pub fn set(&self, b: BucketIdx, gen: Gen) {
        self.gens[slot(self.first_bucket, self.nbuckets, b)].store(gen.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkt_types::DataType;

    fn dirty(gen: u8, sectors: u16) -> BucketMark {
        BucketMark {
            gen: Gen(gen),
            data_type: DataType::User,
            dirty_sectors: sectors,
            ..BucketMark::default()
        }
    }

    #[test]
    fn iter_starts_at_first_bucket() {
        let a = BucketArray::new(3, 8);
        let idx: Vec<u64> = a.iter().map(|(b, _)| b.0).collect();
        assert_eq!(idx, vec![3, 4, 5, 6, 7]);
        assert!(!a.contains(BucketIdx(2)));
        assert!(a.contains(BucketIdx(7)));
        assert!(!a.contains(BucketIdx(8)));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn below_first_bucket_panics() {
        let a = BucketArray::new(3, 8);
        let _ = a.bucket(BucketIdx(1));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn past_end_panics() {
        let g = BucketGens::new(0, 4);
        let _ = g.get(BucketIdx(4));
    }

    #[test]
    fn grow_preserves_marks_and_oldest_gen() {
        let a = BucketArray::new(1, 4);
        a.bucket(BucketIdx(2)).mark.set(dirty(7, 100));
        a.bucket(BucketIdx(2)).set_oldest_gen(Gen(5));

        let b = BucketArray::grown_from(&a, 10);
        assert_eq!(b.nbuckets(), 10);
        assert_eq!(b.bucket(BucketIdx(2)).mark.read(), dirty(7, 100));
        assert_eq!(b.bucket(BucketIdx(2)).oldest_gen(), Gen(5));
        assert_eq!(b.bucket(BucketIdx(9)).mark.read(), BucketMark::default());
    }

    #[test]
    fn gc_shadow_keeps_gens_only() {
        let a = BucketArray::new(0, 2);
        a.bucket(BucketIdx(1)).mark.set(dirty(42, 9));
        let s = BucketArray::gc_shadow_of(&a);
        let m = s.bucket(BucketIdx(1)).mark.read();
        assert_eq!(m.gen, Gen(42));
        assert_eq!(m.dirty_sectors, 0);
        assert_eq!(m.data_type, DataType::None);
        assert_eq!(s.bucket(BucketIdx(1)).oldest_gen(), Gen(42));
    }

    #[test]
    fn gens_mirror_array() {
        let a = BucketArray::new(0, 3);
        a.bucket(BucketIdx(0)).mark.set(dirty(9, 1));
        let g = BucketGens::from_array(&a);
        assert_eq!(g.get(BucketIdx(0)), Gen(9));
        assert_eq!(g.get(BucketIdx(2)), Gen(0));
        g.set(BucketIdx(2), Gen(4));
        assert_eq!(g.get(BucketIdx(2)), Gen(4));
    }
}

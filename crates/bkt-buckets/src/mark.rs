//! Packed per-bucket state word and its compare-and-swap update protocol.
//!
//! A [`BucketMark`] fits in one `u64`:
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..8 | `gen` |
//! | 8..16 | `data_type` |
//! | 16 | `owned_by_allocator` |
//! | 17 | `stripe` |
//! | 32..48 | `dirty_sectors` |
//! | 48..64 | `cached_sectors` |
//!
//! Updates read the word, compute a new one in a closure, and
//! `compare_exchange` it back, retrying from the observed value on conflict.
//! No lock is held, so concurrent updaters of one bucket are linearizable.

use bkt_types::{DataType, Gen, gen_cmp};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::trace;

/// Largest distance a bucket's gen may run ahead of the oldest pointer into it.
pub const BUCKET_GC_GEN_MAX: i32 = 96;

const OWNED_BIT: u64 = 1 << 16;
const STRIPE_BIT: u64 = 1 << 17;

/// Unpacked view of a bucket's state word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketMark {
    pub gen: Gen,
    pub data_type: DataType,
    pub owned_by_allocator: bool,
    pub stripe: bool,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
}

impl BucketMark {
    #[must_use]
    pub fn pack(self) -> u64 {
        let mut v = u64::from(self.gen.0);
        v |= u64::from(self.data_type.as_u8()) << 8;
        if self.owned_by_allocator {
            v |= OWNED_BIT;
        }
        if self.stripe {
            v |= STRIPE_BIT;
        }
        v |= u64::from(self.dirty_sectors) << 32;
        v |= u64::from(self.cached_sectors) << 48;
        v
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn unpack(v: u64) -> Self {
        Self {
            gen: Gen(v as u8),
            // Only `pack` writes this field, so an unknown tag cannot appear.
            data_type: DataType::from_u8((v >> 8) as u8).unwrap_or_default(),
            owned_by_allocator: v & OWNED_BIT != 0,
            stripe: v & STRIPE_BIT != 0,
            dirty_sectors: (v >> 32) as u16,
            cached_sectors: (v >> 48) as u16,
        }
    }

    /// No dirty data and not part of a stripe: may be reclaimed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.dirty_sectors == 0 && !self.stripe
    }

    #[must_use]
    pub fn sectors_used(&self) -> u32 {
        u32::from(self.dirty_sectors) + u32::from(self.cached_sectors)
    }

    /// Type a bucket is accounted under. Buckets holding only cached data
    /// count as cached whatever their tag says.
    #[must_use]
    pub fn bucket_type(&self) -> DataType {
        if self.cached_sectors != 0 && self.dirty_sectors == 0 {
            DataType::Cached
        } else {
            self.data_type
        }
    }

    /// Unused space in a partially filled bucket.
    #[must_use]
    pub fn fragmented(&self, bucket_size: u16) -> u64 {
        let used = self.sectors_used();
        if used == 0 {
            0
        } else {
            u64::from(u32::from(bucket_size).saturating_sub(used))
        }
    }

    /// Start a new generation: nothing written under the old one is live.
    pub fn bump_gen(&mut self) {
        self.gen = self.gen.next();
        self.dirty_sectors = 0;
        self.cached_sectors = 0;
        self.stripe = false;
        self.data_type = DataType::None;
    }
}

/// Atomically updatable [`BucketMark`].
#[derive(Debug, Default)]
pub struct AtomicMark(AtomicU64);

impl AtomicMark {
    #[must_use]
    pub fn new(mark: BucketMark) -> Self {
        Self(AtomicU64::new(mark.pack()))
    }

    #[must_use]
    pub fn read(&self) -> BucketMark {
        BucketMark::unpack(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally overwrite the word. Only valid while the caller has
    /// exclusive use of the array this mark lives in.
    pub fn set(&self, mark: BucketMark) {
        self.0.store(mark.pack(), Ordering::Release);
    }

    /// Apply `f` with the CAS retry loop. Returns the old and new marks.
    pub fn update(&self, mut f: impl FnMut(&mut BucketMark)) -> (BucketMark, BucketMark) {
        match self.try_update::<std::convert::Infallible>(|m| {
            f(m);
            Ok(true)
        }) {
            Ok(Some(pair)) => pair,
            Ok(None) => unreachable!("closure always applies"),
            Err(never) => match never {},
        }
    }

    /// Like [`update`](Self::update), but `f` may veto the change.
    ///
    /// `f` returns `Ok(true)` to publish, `Ok(false)` to leave the bucket
    /// untouched (yielding `Ok(None)`), or an error to abort. `f` may run
    /// several times and must compute from its argument alone.
    pub fn try_update<E>(
        &self,
        mut f: impl FnMut(&mut BucketMark) -> Result<bool, E>,
    ) -> Result<Option<(BucketMark, BucketMark)>, E> {
        let mut current = self.0.load(Ordering::Acquire);
        let mut retries = 0_u32;
        loop {
            let old = BucketMark::unpack(current);
            let mut new = old;
            if !f(&mut new)? {
                return Ok(None);
            }
            match self.0.compare_exchange_weak(
                current,
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if retries > 0 {
                        trace!(target: "bkt::mark", retries, "mark_cmpxchg_contended");
                    }
                    return Ok(Some((old, new)));
                }
                Err(observed) => {
                    current = observed;
                    retries = retries.saturating_add(1);
                }
            }
        }
    }
}

/// One bucket: its mark plus the oldest pointer gen GC has seen into it.
#[derive(Debug, Default)]
pub struct Bucket {
    pub mark: AtomicMark,
    oldest_gen: AtomicU8,
}

impl Bucket {
    #[must_use]
    pub fn with_gen(gen: Gen) -> Self {
        Self {
            mark: AtomicMark::new(BucketMark {
                gen,
                ..BucketMark::default()
            }),
            oldest_gen: AtomicU8::new(gen.0),
        }
    }

    #[must_use]
    pub fn oldest_gen(&self) -> Gen {
        Gen(self.oldest_gen.load(Ordering::Acquire))
    }

    pub fn set_oldest_gen(&self, gen: Gen) {
        self.oldest_gen.store(gen.0, Ordering::Release);
    }

    /// Lower `oldest_gen` to `gen` if `gen` is older.
    pub fn observe_ptr_gen(&self, gen: Gen) {
        let _ = self
            .oldest_gen
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (gen_cmp(Gen(cur), gen) > 0).then_some(gen.0)
            });
    }
}

/// Distance between a bucket's gen and the oldest live pointer into it.
#[must_use]
pub fn bucket_gc_gen(bucket: &Bucket) -> u8 {
    bucket.mark.read().gen.0.wrapping_sub(bucket.oldest_gen().0)
}

//! Sharded accumulators standing in for per-CPU counters.
//!
//! Each thread is assigned a shard on first use (round-robin), so writers
//! on different threads mostly touch different cache lines. Deltas land in
//! the shard; [`Percpu::acc_to_base`] folds every shard into the base value
//! and zeroes it, locking one shard at a time.
//!
//! Counters are `u64` updated with wrapping arithmetic, so a shard may
//! transiently hold a "negative" value. Only the sum across base and
//! shards is meaningful.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A value that can absorb another of the same shape.
pub trait Accumulate: Default {
    fn accumulate(&mut self, other: &Self);
}

/// Apply a signed delta to a wrapping counter.
#[inline]
pub(crate) fn add(counter: &mut u64, delta: i64) {
    *counter = counter.wrapping_add_signed(delta);
}

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| {
        hint.get().unwrap_or_else(|| {
            let h = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        })
    })
}

/// Padded so neighbouring shards do not share a cache line.
#[derive(Debug, Default)]
#[repr(align(64))]
struct Shard<T>(Mutex<T>);

#[derive(Debug)]
pub struct Percpu<T> {
    base: Mutex<T>,
    shards: Box<[Shard<T>]>,
}

impl<T: Accumulate + Clone> Percpu<T> {
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self::with_base(shards, T::default())
    }

    #[must_use]
    pub fn with_base(shards: usize, base: T) -> Self {
        let shards = (0..shards.max(1)).map(|_| Shard::default()).collect();
        Self {
            base: Mutex::new(base),
            shards,
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The calling thread's shard.
    pub fn local(&self) -> MutexGuard<'_, T> {
        self.shards[shard_hint() % self.shards.len()].0.lock()
    }

    pub fn with_local<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.local())
    }

    /// Fold all shards into the base. Afterwards the base alone is
    /// authoritative for everything accumulated before the call.
    pub fn acc_to_base(&self) {
        let mut base = self.base.lock();
        for shard in &*self.shards {
            let mut s = shard.0.lock();
            base.accumulate(&s);
            *s = T::default();
        }
    }

    /// Base plus every shard, without folding.
    #[must_use]
    pub fn read(&self) -> T {
        let mut sum = self.base.lock().clone();
        for shard in &*self.shards {
            sum.accumulate(&shard.0.lock());
        }
        sum
    }

    #[must_use]
    pub fn read_base(&self) -> T {
        self.base.lock().clone()
    }

    /// Replace the base and zero every shard.
    pub fn reset(&self, value: T) {
        let mut base = self.base.lock();
        for shard in &*self.shards {
            *shard.0.lock() = T::default();
        }
        *base = value;
    }

    /// Run `f` over the base and each shard, holding each lock in turn.
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut T)) {
        let mut base = self.base.lock();
        f(&mut base);
        for shard in &*self.shards {
            f(&mut shard.0.lock());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Counter(u64);

    impl Accumulate for Counter {
        fn accumulate(&mut self, other: &Self) {
            self.0 = self.0.wrapping_add(other.0);
        }
    }

    #[test]
    fn fold_moves_shards_into_base() {
        let p: Percpu<Counter> = Percpu::new(4);
        p.with_local(|c| c.0 += 5);
        assert_eq!(p.read_base(), Counter(0));
        assert_eq!(p.read(), Counter(5));
        p.acc_to_base();
        assert_eq!(p.read_base(), Counter(5));
        assert_eq!(p.read(), Counter(5));
    }

    #[test]
    fn negative_deltas_wrap_back() {
        let p: Percpu<Counter> = Percpu::with_base(2, Counter(10));
        p.with_local(|c| add(&mut c.0, -4));
        assert_eq!(p.read(), Counter(6));
        p.acc_to_base();
        assert_eq!(p.read_base(), Counter(6));
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        let p: Arc<Percpu<Counter>> = Arc::new(Percpu::new(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        p.with_local(|c| c.0 += 1);
                        if i % 100 == 0 {
                            p.acc_to_base();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        p.acc_to_base();
        assert_eq!(p.read_base(), Counter(8_000));
    }

    #[test]
    fn reset_clears_shards() {
        let p: Percpu<Counter> = Percpu::new(2);
        p.with_local(|c| c.0 = 9);
        p.reset(Counter(1));
        assert_eq!(p.read(), Counter(1));
    }

    #[test]
    fn zero_shards_rounds_up_to_one() {
        let p: Percpu<Counter> = Percpu::new(0);
        assert_eq!(p.shard_count(), 1);
        p.with_local(|c| c.0 = 2);
        assert_eq!(p.read(), Counter(2));
    }
}

//! One member device: geometry, bucket arrays and usage shards.
//!
//! The live bucket array is reached through [`Device::buckets`], which
//! demands proof that the caller holds a lock excluding array replacement:
//! the filesystem mark lock (read or write), the GC lock, or this device's
//! bucket lock. Before a device is shared, [`Device::buckets_init`] gives
//! the single owner direct access instead.
//!
//! Arrays are swapped in whole on resize; a reader that loaded the previous
//! one keeps it until its `Arc` drops.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::rcu`: `bucket_array_published`

use crate::array::{BucketArray, BucketGens};
use crate::percpu::Percpu;
use crate::usage::DevUsage;
use arc_swap::{ArcSwap, ArcSwapOption};
use bkt_error::{BktError, Result};
use bkt_types::{BucketIdx, DeviceIdx, Gen, Member, MemberState};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

// ── Lock proofs ────────────────────────────────────────────────────────────

mod sealed {
    pub trait Sealed {}
}

/// Proof that array replacement is excluded for the guard's lifetime.
pub trait ArrayGuard: sealed::Sealed {}

/// Filesystem mark lock held for read: the normal I/O path.
pub struct MarkReadGuard<'a> {
    pub(crate) _held: RwLockReadGuard<'a, ()>,
}
/// Filesystem mark lock held for write: array publish, GC finish.
pub struct MarkWriteGuard<'a> {
    pub(crate) _held: RwLockWriteGuard<'a, ()>,
}
/// GC lock: serializes GC passes and resize.
pub struct GcGuard<'a> {
    pub(crate) _held: MutexGuard<'a, ()>,
}
/// Per-device structural lock.
pub struct BucketLockGuard<'a> {
    pub(crate) _held: MutexGuard<'a, ()>,
}

impl sealed::Sealed for MarkReadGuard<'_> {}
impl sealed::Sealed for MarkWriteGuard<'_> {}
impl sealed::Sealed for GcGuard<'_> {}
impl sealed::Sealed for BucketLockGuard<'_> {}
impl ArrayGuard for MarkReadGuard<'_> {}
impl ArrayGuard for MarkWriteGuard<'_> {}
impl ArrayGuard for GcGuard<'_> {}
impl ArrayGuard for BucketLockGuard<'_> {}

// ── Metadata layout ────────────────────────────────────────────────────────

/// Where superblock copies and journal buckets live on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataLayout {
    /// Start sector of each superblock copy.
    pub sb_offsets: Vec<u64>,
    /// Size of one superblock copy in sectors.
    pub sb_sectors: u64,
    pub journal_buckets: Vec<BucketIdx>,
}

// ── Device ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Device {
    idx: DeviceIdx,
    member: RwLock<Member>,
    buckets: ArcSwap<BucketArray>,
    gc_buckets: ArcSwapOption<BucketArray>,
    gens: ArcSwap<BucketGens>,
    pub(crate) usage: Percpu<DevUsage>,
    pub(crate) bucket_lock: Mutex<()>,
    warned_unavailable: AtomicBool,
    layout: Mutex<Option<MetadataLayout>>,
}

impl Device {
    /// Size arrays for `member`. Fails on unusable geometry.
    pub fn new(idx: DeviceIdx, member: Member, shards: usize) -> Result<Self> {
        member
            .validate()
            .map_err(|e| BktError::InvalidGeometry(format!("device {idx}: {e}")))?;
        let first = u64::from(member.first_bucket);
        Ok(Self {
            idx,
            member: RwLock::new(member),
            buckets: ArcSwap::from_pointee(BucketArray::new(first, member.nbuckets)),
            gc_buckets: ArcSwapOption::empty(),
            gens: ArcSwap::from_pointee(BucketGens::new(first, member.nbuckets)),
            usage: Percpu::new(shards),
            bucket_lock: Mutex::new(()),
            warned_unavailable: AtomicBool::new(false),
            layout: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.idx
    }

    #[must_use]
    pub fn member(&self) -> Member {
        *self.member.read()
    }

    #[must_use]
    pub fn state(&self) -> MemberState {
        self.member.read().state
    }

    #[must_use]
    pub fn bucket_size(&self) -> u16 {
        self.member.read().bucket_size
    }

    pub(crate) fn set_state(&self, state: MemberState) -> MemberState {
        std::mem::replace(&mut self.member.write().state, state)
    }

    pub(crate) fn set_nbuckets(&self, nbuckets: u64) {
        self.member.write().nbuckets = nbuckets;
    }

    /// The live array. Valid for as long as the returned handle is held,
    /// even across a later resize.
    pub fn buckets(&self, _held: &impl ArrayGuard) -> Arc<BucketArray> {
        self.buckets.load_full()
    }

    /// Direct access for the single owner before the device is shared.
    pub fn buckets_init(&mut self) -> Arc<BucketArray> {
        self.buckets.load_full()
    }

    /// The GC shadow, if a pass is running.
    pub fn gc_buckets(&self, _held: &impl ArrayGuard) -> Option<Arc<BucketArray>> {
        self.gc_buckets.load_full()
    }

    pub(crate) fn set_gc_buckets(&self, shadow: Option<Arc<BucketArray>>) {
        self.gc_buckets.store(shadow);
    }

    /// Generation table. Lock-free: meant for staleness checks only.
    pub fn gens(&self) -> Arc<BucketGens> {
        self.gens.load_full()
    }

    pub(crate) fn publish_arrays(
        &self,
        _held: &MarkWriteGuard<'_>,
        buckets: BucketArray,
        gens: BucketGens,
    ) {
        let nbuckets = buckets.nbuckets();
        let retired = self.buckets.swap(Arc::new(buckets));
        self.gens.store(Arc::new(gens));
        // Readers still holding the old array keep it alive until they drop it.
        debug!(
            target: "bkt::rcu",
            dev = self.idx.0,
            nbuckets,
            retired_readers = Arc::strong_count(&retired) - 1,
            "bucket_array_published"
        );
    }

    /// Current gen of `b`, from the generation table.
    #[must_use]
    pub fn bucket_gen(&self, b: BucketIdx) -> Gen {
        self.gens.load().get(b)
    }

    /// True the first time an unavailable-bucket overflow is reported.
    pub(crate) fn first_unavailable_warning(&self) -> bool {
        !self.warned_unavailable.swap(true, Ordering::Relaxed)
    }

    #[must_use]
    pub fn layout(&self) -> Option<MetadataLayout> {
        self.layout.lock().clone()
    }

    pub(crate) fn set_layout(&self, layout: MetadataLayout) {
        *self.layout.lock() = Some(layout);
    }

    /// Point-in-time usage: base plus every shard.
    #[must_use]
    pub fn usage_read(&self) -> DevUsage {
        self.usage.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_bucket_size() {
        let err = Device::new(DeviceIdx(0), Member::new(16, 0), 1).unwrap_err();
        assert!(matches!(err, BktError::InvalidGeometry(_)));
        assert!(err.to_string().contains("device 0"));
    }

    #[test]
    fn init_access_sees_first_bucket() {
        let mut member = Member::new(16, 128);
        member.first_bucket = 2;
        let mut dev = Device::new(DeviceIdx(1), member, 2).expect("device");
        let array = dev.buckets_init();
        assert_eq!(array.first_bucket(), 2);
        assert_eq!(array.nbuckets(), 16);
        assert_eq!(dev.gens().nbuckets(), 16);
        assert_eq!(dev.bucket_gen(BucketIdx(2)), Gen(0));
    }

    #[test]
    fn bucket_lock_is_an_array_guard() {
        let dev = Device::new(DeviceIdx(0), Member::new(8, 64), 1).expect("device");
        let held = BucketLockGuard {
            _held: dev.bucket_lock.lock(),
        };
        assert_eq!(dev.buckets(&held).nbuckets(), 8);
        assert!(dev.gc_buckets(&held).is_none());
    }

    #[test]
    fn reader_keeps_retired_array_across_publish() {
        let lock = parking_lot::RwLock::new(());
        let dev = Device::new(DeviceIdx(0), Member::new(8, 64), 1).expect("device");
        let before = {
            let held = BucketLockGuard {
                _held: dev.bucket_lock.lock(),
            };
            dev.buckets(&held)
        };
        before.bucket(BucketIdx(3)).mark.update(|m| m.dirty_sectors = 7);

        let write = MarkWriteGuard { _held: lock.write() };
        let grown = BucketArray::grown_from(&before, 32);
        let gens = BucketGens::from_array(&grown);
        dev.publish_arrays(&write, grown, gens);
        drop(write);

        let held = BucketLockGuard {
            _held: dev.bucket_lock.lock(),
        };
        let after = dev.buckets(&held);
        assert_eq!(before.nbuckets(), 8);
        assert_eq!(after.nbuckets(), 32);
        assert_eq!(after.bucket(BucketIdx(3)).mark.read().dirty_sectors, 7);
        assert_eq!(dev.gens().nbuckets(), 32);
        // The retired array is only referenced from here now.
        assert_eq!(Arc::strong_count(&before), 1);
    }

    #[test]
    fn unavailable_warning_fires_once() {
        let dev = Device::new(DeviceIdx(0), Member::new(8, 64), 1).expect("device");
        assert!(dev.first_unavailable_warning());
        assert!(!dev.first_unavailable_warning());
    }

    #[test]
    fn state_swap_returns_previous() {
        let dev = Device::new(DeviceIdx(0), Member::new(8, 64), 1).expect("device");
        assert_eq!(dev.set_state(MemberState::Ro), MemberState::Rw);
        assert_eq!(dev.state(), MemberState::Ro);
    }
}

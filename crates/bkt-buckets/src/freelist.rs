//! Per-device free lists and the reclaim pipeline.
//!
//! Buckets flow: live array → `free_inc` (found reclaimable, owned by the
//! allocator) → generation bump → a free tier → open for writing →
//! released back to the live array. While a bucket sits anywhere in that
//! pipeline its mark has `owned_by_allocator` set, so the scan never picks
//! it twice.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::freelist`: `reclaim_scan`, `buckets_invalidated`,
//!   `bucket_alloc`
//! - **TRACE** `bkt::freelist`: `open_bucket_put`
//! - **WARN** `bkt::freelist`: `reclaim_bucket_dropped` (a queued bucket
//!   gained data before invalidation)

use crate::mark::BUCKET_GC_GEN_MAX;
use crate::{Filesystem, FsOptions};
use bkt_error::{BktError, Result};
use bkt_types::{BucketIdx, DeviceIdx};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Free-list tiers, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocReserve {
    /// Copying GC: must make progress even when the normal tier is empty.
    MovingGc = 0,
    Normal = 1,
}

pub const RESERVE_NR: usize = 2;

impl AllocReserve {
    /// Tiers this reserve may draw from, in order.
    fn tiers(self) -> &'static [usize] {
        match self {
            Self::MovingGc => &[0, 1],
            Self::Normal => &[1],
        }
    }
}

#[derive(Debug)]
pub(crate) struct FreeLists {
    free: [VecDeque<BucketIdx>; RESERVE_NR],
    free_cap: [usize; RESERVE_NR],
    free_inc: VecDeque<BucketIdx>,
    free_inc_cap: usize,
    nr_open_buckets: u64,
}

impl FreeLists {
    pub(crate) fn new(opts: &FsOptions) -> Self {
        Self {
            free: [VecDeque::new(), VecDeque::new()],
            free_cap: opts.reserve_capacity,
            free_inc: VecDeque::new(),
            free_inc_cap: usize::try_from(opts.free_inc_capacity).unwrap_or(usize::MAX),
            nr_open_buckets: 0,
        }
    }

    /// Buckets somewhere in the allocator pipeline.
    fn pending(&self) -> u64 {
        let queued: usize = self.free.iter().map(VecDeque::len).sum::<usize>() + self.free_inc.len();
        queued as u64 + self.nr_open_buckets
    }

    fn pop(&mut self, reserve: AllocReserve) -> Option<BucketIdx> {
        reserve
            .tiers()
            .iter()
            .find_map(|&tier| self.free[tier].pop_front())
    }

    fn has_room(&self) -> bool {
        (0..RESERVE_NR).any(|t| self.free[t].len() < self.free_cap[t])
    }

    /// Push into the first tier with room. Callers check `has_room` first
    /// while holding the device's bucket lock.
    fn push_free(&mut self, b: BucketIdx) {
        if let Some(tier) = (0..RESERVE_NR).find(|&t| self.free[t].len() < self.free_cap[t]) {
            self.free[tier].push_back(b);
        }
    }
}

/// Counts reported by [`Filesystem::freelist_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FreeListStats {
    pub free: [usize; RESERVE_NR],
    pub free_inc: usize,
    pub nr_open_buckets: u64,
}

fn lists(map: &mut BTreeMap<DeviceIdx, FreeLists>, dev: DeviceIdx) -> Result<&mut FreeLists> {
    map.get_mut(&dev)
        .ok_or_else(|| BktError::NotFound(format!("device {dev}")))
}

impl Filesystem {
    pub fn freelist_stats(&self, dev: DeviceIdx) -> Result<FreeListStats> {
        let mut map = self.freelists.lock();
        let fl = lists(&mut map, dev)?;
        Ok(FreeListStats {
            free: [fl.free[0].len(), fl.free[1].len()],
            free_inc: fl.free_inc.len(),
            nr_open_buckets: fl.nr_open_buckets,
        })
    }

    /// Available buckets not already queued or open. Read under the free
    /// list lock so the queues are seen at one instant.
    pub fn dev_buckets_reclaimable(&self, dev: DeviceIdx) -> Result<u64> {
        let mut map = self.freelists.lock();
        let available = self.dev_buckets_available(dev)?;
        let pending = lists(&mut map, dev)?.pending();
        Ok(available.saturating_sub(pending))
    }

    /// Scan the live array for reclaimable buckets and move them onto
    /// `free_inc`. Returns how many were found.
    pub fn find_reclaimable_buckets(&self, idx: DeviceIdx) -> Result<usize> {
        let dev = self.dev(idx)?;
        let mark = self.mark_read();
        let buckets = dev.buckets(&mark);
        let mut map = self.freelists.lock();
        let fl = lists(&mut map, idx)?;

        let mut found = 0;
        for (b, bucket) in buckets.iter() {
            if fl.free_inc.len() >= fl.free_inc_cap {
                break;
            }
            if i32::from(crate::mark::bucket_gc_gen(bucket)) >= BUCKET_GC_GEN_MAX {
                continue;
            }
            let claimed = bucket
                .mark
                .try_update::<std::convert::Infallible>(|m| {
                    if m.owned_by_allocator || !m.is_available() {
                        return Ok(false);
                    }
                    m.owned_by_allocator = true;
                    Ok(true)
                })
                .unwrap_or_else(|never| match never {});
            if claimed.is_some() {
                fl.free_inc.push_back(b);
                found += 1;
            }
        }
        debug!(target: "bkt::freelist", dev = idx.0, found, "reclaim_scan");
        Ok(found)
    }

    /// Bump the generation of every bucket on `free_inc` and move it to a
    /// free tier, filling the copying-GC tier first. Stops when the tiers
    /// are full. Returns how many were moved.
    pub fn invalidate_buckets(&self, idx: DeviceIdx) -> Result<usize> {
        let dev = self.dev(idx)?;
        let _serialize = dev.bucket_lock.lock();
        let mut moved = 0;
        loop {
            let next = {
                let mut map = self.freelists.lock();
                let fl = lists(&mut map, idx)?;
                if fl.has_room() {
                    fl.free_inc.front().copied()
                } else {
                    None
                }
            };
            let Some(b) = next else { break };

            let invalidated = match self.invalidate_bucket(idx, b) {
                Ok(_) => true,
                // Picked up data after the scan: give it back and move on.
                Err(err @ BktError::Inconsistent { .. }) => {
                    warn!(
                        target: "bkt::freelist",
                        dev = idx.0,
                        bucket = b.0,
                        error = %err,
                        "reclaim_bucket_dropped"
                    );
                    self.note_anomaly();
                    self.mark_alloc_bucket(idx, b, false)?;
                    false
                }
                Err(err) => return Err(err),
            };

            let mut map = self.freelists.lock();
            let fl = lists(&mut map, idx)?;
            fl.free_inc.pop_front();
            if invalidated {
                fl.push_free(b);
                moved += 1;
            }
        }
        if moved > 0 {
            self.freelist_wait.notify_all();
        }
        debug!(target: "bkt::freelist", dev = idx.0, moved, "buckets_invalidated");
        Ok(moved)
    }

    /// Take a free bucket for writing. Only read-write devices allocate.
    pub fn bucket_alloc(&self, dev: DeviceIdx, reserve: AllocReserve) -> Result<BucketIdx> {
        let mut map = self.freelists.lock();
        self.try_alloc_locked(&mut map, dev, reserve)
    }

    /// Like [`bucket_alloc`](Self::bucket_alloc), but waits up to
    /// `timeout` for reclaim to refill the free list.
    pub fn bucket_alloc_wait(
        &self,
        dev: DeviceIdx,
        reserve: AllocReserve,
        timeout: Duration,
    ) -> Result<BucketIdx> {
        let deadline = Instant::now() + timeout;
        let mut map = self.freelists.lock();
        loop {
            match self.try_alloc_locked(&mut map, dev, reserve) {
                Err(BktError::NoSpace) => {
                    if self.freelist_wait.wait_until(&mut map, deadline).timed_out() {
                        return self.try_alloc_locked(&mut map, dev, reserve);
                    }
                }
                other => return other,
            }
        }
    }

    fn try_alloc_locked(
        &self,
        map: &mut BTreeMap<DeviceIdx, FreeLists>,
        idx: DeviceIdx,
        reserve: AllocReserve,
    ) -> Result<BucketIdx> {
        if !self.dev(idx)?.state().allocates() {
            return Err(BktError::ReadOnly);
        }
        let fl = lists(map, idx)?;
        if fl.nr_open_buckets >= self.opts.open_buckets_max {
            return Err(BktError::NoSpace);
        }
        let b = fl.pop(reserve).ok_or(BktError::NoSpace)?;
        fl.nr_open_buckets += 1;
        debug!(
            target: "bkt::freelist",
            dev = idx.0,
            bucket = b.0,
            reserve = ?reserve,
            "bucket_alloc"
        );
        Ok(b)
    }

    /// Close an open bucket: it stops being owned by the allocator and its
    /// marks alone decide its fate.
    pub fn open_bucket_put(&self, dev: DeviceIdx, b: BucketIdx) -> Result<()> {
        {
            let mut map = self.freelists.lock();
            let fl = lists(&mut map, dev)?;
            assert!(fl.nr_open_buckets > 0, "open_bucket_put without open bucket");
            fl.nr_open_buckets -= 1;
        }
        self.mark_alloc_bucket(dev, b, false)?;
        trace!(target: "bkt::freelist", dev = dev.0, bucket = b.0, "open_bucket_put");
        Ok(())
    }

    /// Open one bucket on each of `nr_replicas` distinct read-write devices,
    /// preferring devices with the most available buckets.
    pub fn alloc_replicas(
        &self,
        nr_replicas: usize,
        reserve: AllocReserve,
    ) -> Result<Vec<(DeviceIdx, BucketIdx)>> {
        let mut candidates: Vec<(u64, DeviceIdx)> = self
            .rw_devices()
            .into_iter()
            .filter_map(|d| self.dev_buckets_available(d).ok().map(|a| (a, d)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut got = Vec::with_capacity(nr_replicas);
        for (_, dev) in candidates {
            if got.len() == nr_replicas {
                break;
            }
            match self.bucket_alloc(dev, reserve) {
                Ok(b) => got.push((dev, b)),
                Err(BktError::NoSpace | BktError::ReadOnly) => {}
                Err(e) => return Err(self.release_all(got, e)),
            }
        }
        if got.len() < nr_replicas {
            return Err(self.release_all(got, BktError::NoSpace));
        }
        Ok(got)
    }

    fn release_all(&self, got: Vec<(DeviceIdx, BucketIdx)>, err: BktError) -> BktError {
        for (dev, b) in got {
            if let Err(e) = self.open_bucket_put(dev, b) {
                return e;
            }
        }
        err
    }
}

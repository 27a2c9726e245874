//! Applying key changes to bucket marks and usage.
//!
//! [`Filesystem::mark_update`] takes the old and new versions of a key and
//! moves every affected bucket mark by the difference, all or nothing: if
//! any pointer fails its checks, the marks already moved are moved back.
//!
//! Usage is kept consistent with the marks rather than with the outcome.
//! Every mark transition, forward or rolled back, is accounted to device
//! usage, because another updater may have built on the intermediate value
//! in between. Key-level usage (replicas, data, reservations) is only
//! published when the whole update succeeds.
//!
//! # Logging
//!
//! - **DEBUG** `bkt::mark`: `mark_update_rolled_back`, `bucket_invalidated`
//! - **TRACE** `bkt::mark`: `mark_update`, `metadata_bucket_marked`
//! - **WARN** `bkt::gc`: `gc_mirror_failed` (the live update stands)

use crate::array::BucketArray;
use crate::device::{Device, MarkReadGuard, MetadataLayout};
use crate::key::{BKey, ExtentPtr, KeyVal};
use crate::mark::{BucketMark, BUCKET_GC_GEN_MAX};
use crate::percpu::{add, Accumulate};
use crate::replicas::cached_entry;
use crate::reservation::{to_signed, DiskReservation};
use crate::usage::{dev_usage_update, DevUsage, FsUsage};
use crate::Filesystem;
use bkt_error::{BktError, Result};
use bkt_types::{
    gen_after, gen_cmp, BucketIdx, DataType, DeviceIdx, Gen, Member, ReplicasEntry, REPLICAS_MAX,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

fn inconsistent(dev: DeviceIdx, b: BucketIdx, detail: String) -> BktError {
    BktError::Inconsistent {
        dev: dev.0,
        bucket: b.0,
        detail,
    }
}

/// Validate a pointer against the bucket's current mark.
///
/// Returns `Ok(false)` for a stale cached pointer, which is simply skipped.
fn check_bucket_ref(
    dev: DeviceIdx,
    b: BucketIdx,
    m: &BucketMark,
    ptr: &ExtentPtr,
    sectors: i64,
    ptr_type: DataType,
) -> Result<bool> {
    if gen_after(ptr.gen, m.gen) > 0 {
        return Err(inconsistent(
            dev,
            b,
            format!("ptr gen {} newer than bucket gen {}", ptr.gen, m.gen),
        ));
    }
    if gen_cmp(m.gen, ptr.gen) > BUCKET_GC_GEN_MAX {
        return Err(inconsistent(
            dev,
            b,
            format!("ptr gen {} too stale (bucket gen {})", ptr.gen, m.gen),
        ));
    }
    if m.gen != ptr.gen {
        if !ptr.cached {
            return Err(inconsistent(
                dev,
                b,
                format!("stale dirty ptr (gen {}, bucket gen {})", ptr.gen, m.gen),
            ));
        }
        return Ok(false);
    }
    if m.data_type != DataType::None && m.data_type != ptr_type {
        return Err(inconsistent(
            dev,
            b,
            format!(
                "different types of data in same bucket: {}, {ptr_type}",
                m.data_type
            ),
        ));
    }
    let current = if ptr.cached {
        m.cached_sectors
    } else {
        m.dirty_sectors
    };
    let next = i64::from(current) + sectors;
    if next > i64::from(u16::MAX) {
        return Err(BktError::SectorOverflow {
            dev: dev.0,
            bucket: b.0,
        });
    }
    if next < 0 {
        return Err(inconsistent(
            dev,
            b,
            format!("sector count underflow: {current} {sectors:+}"),
        ));
    }
    Ok(true)
}

/// Move one sector counter by `delta`, clamping into `u16`.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn shift(counter: u16, delta: i64) -> u16 {
    (i64::from(counter) + delta).clamp(0, i64::from(u16::MAX)) as u16
}

/// A mark change that may have to be undone.
struct Applied {
    dev: Arc<Device>,
    array: Arc<BucketArray>,
    bucket: BucketIdx,
    gen: Gen,
    sectors: i64,
    cached: bool,
    prev_type: DataType,
}

/// Accumulates the effects of marking one or more keys.
pub(crate) struct MarkTx<'a> {
    fs: &'a Filesystem,
    /// Marking into GC shadow arrays rather than the live ones.
    gc: bool,
    applied: Vec<Applied>,
    dev_deltas: Vec<(Arc<Device>, DevUsage)>,
    bucket_fs: FsUsage,
    key_fs: FsUsage,
    /// Pointer errors tolerated while marking for GC.
    pub(crate) errors: u64,
}

impl<'a> MarkTx<'a> {
    pub(crate) fn new(fs: &'a Filesystem, gc: bool) -> Self {
        Self {
            fs,
            gc,
            applied: Vec::new(),
            dev_deltas: Vec::new(),
            bucket_fs: FsUsage::default(),
            key_fs: FsUsage::default(),
            errors: 0,
        }
    }

    fn dev_delta(&mut self, dev: &Arc<Device>) -> &mut DevUsage {
        let pos = match self
            .dev_deltas
            .iter()
            .position(|(d, _)| Arc::ptr_eq(d, dev))
        {
            Some(pos) => pos,
            None => {
                self.dev_deltas.push((Arc::clone(dev), DevUsage::default()));
                self.dev_deltas.len() - 1
            }
        };
        &mut self.dev_deltas[pos].1
    }

    fn account(&mut self, dev: &Arc<Device>, old: BucketMark, new: BucketMark, bucket_size: u16) {
        let mut fs = std::mem::take(&mut self.bucket_fs);
        dev_usage_update(self.dev_delta(dev), &mut fs, old, new, bucket_size);
        self.bucket_fs = fs;
    }

    fn replicas_idx(&self, entry: &ReplicasEntry) -> Result<usize> {
        self.fs
            .replicas
            .read()
            .index_of(entry)
            .ok_or_else(|| BktError::Format(format!("replicas entry not in table: {entry:?}")))
    }

    /// Mark one pointer. Returns whether it was applied (false for a stale
    /// cached pointer, or a missing shadow).
    fn mark_pointer(
        &mut self,
        held: &MarkReadGuard<'_>,
        ptr: &ExtentPtr,
        sectors: i64,
        key_type: DataType,
    ) -> Result<bool> {
        let dev = self.fs.dev(ptr.dev)?;
        let member = dev.member();
        let b = member.sector_to_bucket(ptr.offset);
        let array = if self.gc {
            match dev.gc_buckets(held) {
                Some(shadow) => shadow,
                None => return Ok(false),
            }
        } else {
            dev.buckets(held)
        };
        if !array.contains(b) {
            return Err(inconsistent(ptr.dev, b, "pointer outside device".into()));
        }
        let bucket = array.bucket(b);
        if self.gc {
            bucket.observe_ptr_gen(ptr.gen);
        }

        let ptr_type = if ptr.cached {
            DataType::Cached
        } else {
            key_type
        };
        let changed = bucket.mark.try_update::<BktError>(|m| {
            if !check_bucket_ref(ptr.dev, b, m, ptr, sectors, ptr_type)? {
                return Ok(false);
            }
            if ptr.cached {
                m.cached_sectors = shift(m.cached_sectors, sectors);
            } else {
                m.dirty_sectors = shift(m.dirty_sectors, sectors);
            }
            m.data_type = if m.sectors_used() == 0 {
                DataType::None
            } else {
                ptr_type
            };
            Ok(true)
        })?;

        let Some((old, new)) = changed else {
            return Ok(false);
        };
        self.account(&dev, old, new, member.bucket_size);
        if !self.gc {
            self.applied.push(Applied {
                dev: Arc::clone(&dev),
                array: Arc::clone(&array),
                bucket: b,
                gen: new.gen,
                sectors,
                cached: ptr.cached,
                prev_type: old.data_type,
            });
        }
        Ok(true)
    }

    /// Mark every pointer of `key`, scaled by `sign` (+1 insert, -1 remove).
    pub(crate) fn mark_key(&mut self, held: &MarkReadGuard<'_>, key: &BKey, sign: i64) -> Result<()> {
        match &key.val {
            KeyVal::Extent { ptrs, sectors } | KeyVal::BtreePtr { ptrs, sectors } => {
                let ty = key.data_type();
                let sectors = sign * i64::from(*sectors);
                let mut dirty = 0_i64;
                let mut devs = Vec::new();
                for ptr in ptrs {
                    let applied = match self.mark_pointer(held, ptr, sectors, ty) {
                        Ok(applied) => applied,
                        Err(e) if self.gc => {
                            debug!(target: "bkt::gc", pos = key.pos, error = %e, "gc_ptr_error");
                            self.errors += 1;
                            false
                        }
                        Err(e) => return Err(e),
                    };
                    if ptr.cached {
                        if applied {
                            let idx = self.replicas_idx(&cached_entry(ptr.dev))?;
                            self.key_fs.replicas_add(idx, sectors);
                            self.key_fs.type_add(DataType::Cached, sectors);
                        }
                    } else {
                        // GC keeps the key's full device set so the entry
                        // matches the one the live path charges.
                        if applied || !self.gc {
                            dirty += sectors;
                        }
                        devs.push(ptr.dev);
                    }
                }
                if !devs.is_empty() {
                    let idx = self.replicas_idx(&ReplicasEntry::new(ty, 1, devs))?;
                    self.key_fs.replicas_add(idx, dirty);
                    self.key_fs.type_add(ty, dirty);
                }
            }
            KeyVal::Reservation {
                nr_replicas,
                sectors,
            } => {
                let s = sign * i64::from(*sectors) * i64::from(*nr_replicas);
                let level = usize::from(*nr_replicas).clamp(1, REPLICAS_MAX);
                add(&mut self.key_fs.reserved, s);
                add(&mut self.key_fs.persistent_reserved[level - 1], s);
            }
            KeyVal::Inode => add(&mut self.key_fs.nr_inodes, sign),
            KeyVal::Deleted => {}
        }
        Ok(())
    }

    /// Undo every applied mark change, newest first. A bucket whose gen has
    /// moved on since is left alone.
    fn rollback(&mut self) {
        let applied = std::mem::take(&mut self.applied);
        for a in applied.into_iter().rev() {
            let changed = a
                .array
                .bucket(a.bucket)
                .mark
                .try_update::<std::convert::Infallible>(|m| {
                    if m.gen != a.gen {
                        return Ok(false);
                    }
                    if a.cached {
                        m.cached_sectors = shift(m.cached_sectors, -a.sectors);
                    } else {
                        m.dirty_sectors = shift(m.dirty_sectors, -a.sectors);
                    }
                    if m.sectors_used() == 0 {
                        m.data_type = DataType::None;
                    } else if m.data_type == DataType::None {
                        m.data_type = a.prev_type;
                    }
                    Ok(true)
                })
                .unwrap_or_else(|never| match never {});
            if let Some((old, new)) = changed {
                let bucket_size = a.dev.bucket_size();
                self.account(&a.dev, old, new, bucket_size);
            }
        }
    }

    /// Publish accumulated usage. Key-level usage only when `ok`.
    pub(crate) fn commit(self, ok: bool, res: Option<&mut DiskReservation<'_>>) {
        let fs = self.fs;
        if self.gc {
            if ok {
                fs.gc.usage.lock().accumulate(&self.key_fs);
            }
            return;
        }

        let mut fs_delta = self.bucket_fs;
        if ok {
            fs_delta.accumulate(&self.key_fs);
            let added = to_signed(self.key_fs.data).wrapping_add(to_signed(self.key_fs.reserved));
            if let Ok(added) = u64::try_from(added) {
                let covered = res.map_or(0, |r| r.consume(added));
                if covered < added {
                    fs.reservation_overrun(added - covered);
                }
            }
        }
        for (dev, delta) in &self.dev_deltas {
            dev.usage.with_local(|u| u.accumulate(delta));
        }
        fs.usage.with_local(|u| u.accumulate(&fs_delta));
    }
}

/// Replicas entries a key's pointers will be accounted under.
pub(crate) fn key_replicas(key: &BKey, out: &mut Vec<ReplicasEntry>) {
    out.extend(key.dirty_replicas());
    out.extend(
        key.ptrs()
            .iter()
            .filter(|p| p.cached)
            .map(|p| cached_entry(p.dev)),
    );
}

/// Sectors of metadata per bucket for a device's layout.
fn layout_buckets(member: &Member, layout: &MetadataLayout) -> Result<Vec<(BucketIdx, DataType, u16)>> {
    let bucket_size = u64::from(member.bucket_size);
    let first = u64::from(member.first_bucket);
    let in_range = |b: u64| b >= first && b < member.nbuckets;

    let mut out = Vec::new();
    for &start in &layout.sb_offsets {
        let end = start + layout.sb_sectors;
        let mut s = start;
        while s < end {
            let b = s / bucket_size;
            if !in_range(b) {
                return Err(BktError::InvalidGeometry(format!(
                    "superblock at sector {start} outside usable buckets"
                )));
            }
            let next = end.min((b + 1) * bucket_size);
            let n = u16::try_from(next - s).expect("bounded by bucket_size");
            out.push((BucketIdx(b), DataType::Sb, n));
            s = next;
        }
    }
    for &b in &layout.journal_buckets {
        if !in_range(b.0) {
            return Err(BktError::InvalidGeometry(format!(
                "journal bucket {b} outside usable buckets"
            )));
        }
        out.push((b, DataType::Journal, member.bucket_size));
    }
    Ok(out)
}

/// Add `sectors` of `ty` metadata to bucket `b` of `array`.
fn mark_metadata_in(
    dev: DeviceIdx,
    array: &BucketArray,
    b: BucketIdx,
    ty: DataType,
    sectors: u16,
) -> Result<(BucketMark, BucketMark)> {
    let changed = array.bucket(b).mark.try_update(|m| {
        if m.data_type != DataType::None && m.data_type != ty {
            return Err(inconsistent(
                dev,
                b,
                format!("different types of data in same bucket: {}, {ty}", m.data_type),
            ));
        }
        let next = u32::from(m.dirty_sectors) + u32::from(sectors);
        m.dirty_sectors = u16::try_from(next).map_err(|_| BktError::SectorOverflow {
            dev: dev.0,
            bucket: b.0,
        })?;
        m.data_type = ty;
        Ok(true)
    })?;
    Ok(changed.unwrap_or_else(|| unreachable!("metadata marking never vetoes")))
}

impl Filesystem {
    /// Apply the change from `old` to `new` to bucket marks and usage.
    ///
    /// All or nothing: on error every bucket is back where it started and
    /// no key-level usage was published. Sectors added are taken from
    /// `res`; anything it does not cover is taken from free space directly.
    ///
    /// Must not race with [`GcPass::mark_key`](crate::GcPass::mark_key) for
    /// the same position; the index layer serializes those.
    pub fn mark_update(
        &self,
        old: &BKey,
        new: &BKey,
        res: Option<&mut DiskReservation<'_>>,
    ) -> Result<()> {
        let mut entries = Vec::new();
        key_replicas(old, &mut entries);
        key_replicas(new, &mut entries);
        self.ensure_replicas(&entries);

        let held = self.mark_read();
        let mut tx = MarkTx::new(self, false);
        let result = tx
            .mark_key(&held, old, -1)
            .and_then(|()| tx.mark_key(&held, new, 1));
        match result {
            Ok(()) => {
                trace!(target: "bkt::mark", pos = new.pos, "mark_update");
                tx.commit(true, res);
            }
            Err(err) => {
                tx.rollback();
                tx.commit(false, None);
                debug!(target: "bkt::mark", pos = new.pos, error = %err, "mark_update_rolled_back");
                return Err(err);
            }
        }

        if self.gc_visited(new.pos) {
            let mut gtx = MarkTx::new(self, true);
            let mirrored = gtx
                .mark_key(&held, old, -1)
                .and_then(|()| gtx.mark_key(&held, new, 1));
            if let Err(err) = &mirrored {
                self.note_anomaly();
                warn!(target: "bkt::gc", pos = new.pos, error = %err, "gc_mirror_failed");
            }
            if gtx.errors > 0 {
                self.note_anomaly();
            }
            gtx.commit(mirrored.is_ok(), None);
        }
        Ok(())
    }

    /// Set or clear `owned_by_allocator`. Clearing a bucket the allocator
    /// does not own is a bug.
    pub fn mark_alloc_bucket(&self, idx: DeviceIdx, b: BucketIdx, owned: bool) -> Result<()> {
        let dev = self.dev(idx)?;
        let held = self.mark_read();
        let (old, _) = dev
            .buckets(&held)
            .bucket(b)
            .mark
            .update(|m| m.owned_by_allocator = owned);
        assert!(
            owned || old.owned_by_allocator,
            "bucket {idx}:{b} released but not owned by the allocator"
        );
        Ok(())
    }

    /// Mark `b` as part of an erasure-coded stripe (or not).
    pub fn mark_stripe_bucket(&self, idx: DeviceIdx, b: BucketIdx, stripe: bool) -> Result<()> {
        let dev = self.dev(idx)?;
        let held = self.mark_read();
        let (old, new) = dev.buckets(&held).bucket(b).mark.update(|m| m.stripe = stripe);
        let mut dev_delta = DevUsage::default();
        let mut fs_delta = FsUsage::default();
        dev_usage_update(&mut dev_delta, &mut fs_delta, old, new, dev.bucket_size());
        self.commit_usage(&dev, &dev_delta, &fs_delta);
        Ok(())
    }

    /// Account `sectors` of superblock or journal data in bucket `b`.
    pub fn mark_metadata_bucket(
        &self,
        idx: DeviceIdx,
        b: BucketIdx,
        ty: DataType,
        sectors: u16,
    ) -> Result<()> {
        assert!(ty.is_hidden(), "{ty} is not a metadata bucket type");
        let dev = self.dev(idx)?;
        let held = self.mark_read();
        let (old, new) = mark_metadata_in(idx, &dev.buckets(&held), b, ty, sectors)?;
        let mut dev_delta = DevUsage::default();
        let mut fs_delta = FsUsage::default();
        dev_usage_update(&mut dev_delta, &mut fs_delta, old, new, dev.bucket_size());
        self.commit_usage(&dev, &dev_delta, &fs_delta);

        if self.gc.running.load(std::sync::atomic::Ordering::Acquire) {
            if let Some(shadow) = dev.gc_buckets(&held) {
                if mark_metadata_in(idx, &shadow, b, ty, sectors).is_err() {
                    self.note_anomaly();
                }
            }
        }
        trace!(
            target: "bkt::mark",
            dev = idx.0,
            bucket = b.0,
            data_type = %ty,
            sectors,
            "metadata_bucket_marked"
        );
        Ok(())
    }

    /// Mark a device's superblock copies and journal buckets, and remember
    /// the layout so GC can re-mark it.
    pub fn mark_dev_sb(&self, idx: DeviceIdx, layout: &MetadataLayout) -> Result<()> {
        let dev = self.dev(idx)?;
        let marks = layout_buckets(&dev.member(), layout)?;
        dev.set_layout(layout.clone());
        for (b, ty, sectors) in marks {
            self.mark_metadata_bucket(idx, b, ty, sectors)?;
        }
        Ok(())
    }

    /// Re-mark a device's remembered layout into a GC shadow array.
    pub(crate) fn mark_layout_into(&self, dev: &Device, shadow: &BucketArray) -> Result<()> {
        let Some(layout) = dev.layout() else {
            return Ok(());
        };
        for (b, ty, sectors) in layout_buckets(&dev.member(), &layout)? {
            mark_metadata_in(dev.idx(), shadow, b, ty, sectors)?;
        }
        Ok(())
    }

    /// Start a new generation for `b`, invalidating every pointer into it.
    ///
    /// Refused for buckets still holding dirty or stripe data. Cached data
    /// in the bucket is dropped from usage.
    pub fn invalidate_bucket(&self, idx: DeviceIdx, b: BucketIdx) -> Result<Gen> {
        let dev = self.dev(idx)?;
        let held = self.mark_read();
        let changed = dev.buckets(&held).bucket(b).mark.try_update(|m| {
            if m.dirty_sectors != 0 || m.stripe {
                return Err(inconsistent(
                    idx,
                    b,
                    format!("invalidating bucket with {} dirty sectors", m.dirty_sectors),
                ));
            }
            m.bump_gen();
            Ok(true)
        })?;
        let (old, new) = changed.unwrap_or_else(|| unreachable!("invalidation never vetoes"));
        dev.gens().set(b, new.gen);

        let mut dev_delta = DevUsage::default();
        let mut fs_delta = FsUsage::default();
        dev_usage_update(&mut dev_delta, &mut fs_delta, old, new, dev.bucket_size());
        let cached_idx = self.replicas.read().index_of(&cached_entry(idx));
        drop_cached(&mut fs_delta, cached_idx, old.cached_sectors);
        self.commit_usage(&dev, &dev_delta, &fs_delta);

        if let Some(shadow) = dev.gc_buckets(&held) {
            let (sold, _) = shadow.bucket(b).mark.update(BucketMark::bump_gen);
            drop_cached(&mut self.gc.usage.lock(), cached_idx, sold.cached_sectors);
        }

        debug!(
            target: "bkt::mark",
            dev = idx.0,
            bucket = b.0,
            gen = new.gen.0,
            dropped_cached = old.cached_sectors,
            "bucket_invalidated"
        );
        Ok(new.gen)
    }
}

fn drop_cached(u: &mut FsUsage, idx: Option<usize>, sectors: u16) {
    if sectors == 0 {
        return;
    }
    let s = -i64::from(sectors);
    if let Some(idx) = idx {
        u.replicas_add(idx, s);
    }
    u.type_add(DataType::Cached, s);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::ReserveFlags;
    use crate::FsOptions;

    const BS: u16 = 128;

    fn fs_with(nbuckets: u64) -> (Filesystem, DeviceIdx) {
        let fs = Filesystem::new(FsOptions::default());
        let idx = fs.add_device(Member::new(nbuckets, BS)).expect("add");
        (fs, idx)
    }

    fn ptr(dev: DeviceIdx, bucket: u64, gen: u8, cached: bool) -> ExtentPtr {
        ExtentPtr {
            dev,
            offset: bucket * u64::from(BS),
            gen: Gen(gen),
            cached,
        }
    }

    fn mark_of(fs: &Filesystem, dev: DeviceIdx, b: u64) -> BucketMark {
        let held = fs.mark_read();
        fs.dev(dev)
            .expect("dev")
            .buckets(&held)
            .bucket(BucketIdx(b))
            .mark
            .read()
    }

    #[test]
    fn insert_marks_bucket_and_usage() {
        let (fs, dev) = fs_with(64);
        let k = BKey::extent(10, 32, vec![ptr(dev, 3, 0, false)]);
        fs.mark_update(&BKey::deleted(10), &k, None).expect("mark");

        let m = mark_of(&fs, dev, 3);
        assert_eq!(m.dirty_sectors, 32);
        assert_eq!(m.data_type, DataType::User);

        let u = fs.fs_usage_read().u;
        assert_eq!(u.data, 32);
        assert_eq!(u.replicas, vec![32]);
        let d = fs.dev_usage_read(dev).expect("usage");
        assert_eq!(d.of(DataType::User).buckets, 1);
        assert_eq!(d.buckets_unavailable, 1);
    }

    #[test]
    fn overwrite_moves_sectors_between_buckets() {
        let (fs, dev) = fs_with(64);
        let a = BKey::extent(1, 16, vec![ptr(dev, 3, 0, false)]);
        let b = BKey::extent(1, 16, vec![ptr(dev, 4, 0, false)]);
        fs.mark_update(&BKey::deleted(1), &a, None).expect("insert");
        fs.mark_update(&a, &b, None).expect("overwrite");
        assert_eq!(mark_of(&fs, dev, 3), BucketMark::default());
        assert_eq!(mark_of(&fs, dev, 4).dirty_sectors, 16);
        assert_eq!(fs.fs_usage_read().u.data, 16);
        assert_eq!(fs.dev_usage_read(dev).expect("usage").buckets_unavailable, 1);
    }

    #[test]
    fn failure_rolls_back_every_pointer() {
        let (fs, dev) = fs_with(64);
        // Second pointer claims a gen the bucket has not reached yet.
        let bad = BKey::extent(
            5,
            8,
            vec![ptr(dev, 3, 0, false), ptr(dev, 4, 0, false), ptr(dev, 5, 9, false)],
        );
        let err = fs.mark_update(&BKey::deleted(5), &bad, None).unwrap_err();
        assert!(err.to_string().contains("newer than bucket gen"), "{err}");
        for b in [3, 4, 5] {
            assert_eq!(mark_of(&fs, dev, b), BucketMark::default());
        }
        assert_eq!(fs.dev_usage_read(dev).expect("usage"), DevUsage::default());
        assert_eq!(fs.fs_usage_read().u.data, 0);
    }

    #[test]
    fn sector_overflow_is_reported() {
        let (fs, dev) = fs_with(64);
        let big = BKey::extent(1, 40_000, vec![ptr(dev, 3, 0, false)]);
        fs.mark_update(&BKey::deleted(1), &big, None).expect("first");
        let again = BKey::extent(2, 40_000, vec![ptr(dev, 3, 0, false)]);
        let err = fs.mark_update(&BKey::deleted(2), &again, None).unwrap_err();
        assert!(matches!(err, BktError::SectorOverflow { bucket: 3, .. }));
        assert_eq!(mark_of(&fs, dev, 3).dirty_sectors, 40_000);
    }

    #[test]
    fn stale_cached_pointer_is_skipped() {
        let (fs, dev) = fs_with(64);
        let cached = BKey::extent(1, 8, vec![ptr(dev, 3, 0, true)]);
        fs.mark_update(&BKey::deleted(1), &cached, None).expect("cached");
        assert_eq!(fs.fs_usage_read().u.cached, 8);

        fs.invalidate_bucket(dev, BucketIdx(3)).expect("invalidate");
        assert_eq!(fs.fs_usage_read().u.cached, 0);

        // Removing the now-stale cached pointer touches nothing.
        fs.mark_update(&cached, &BKey::deleted(1), None).expect("remove");
        assert_eq!(fs.fs_usage_read().u.cached, 0);
        assert_eq!(mark_of(&fs, dev, 3).gen, Gen(1));
    }

    #[test]
    fn stale_dirty_pointer_is_inconsistent() {
        let (fs, dev) = fs_with(64);
        fs.invalidate_bucket(dev, BucketIdx(3)).expect("invalidate");
        let k = BKey::extent(1, 8, vec![ptr(dev, 3, 0, false)]);
        let err = fs.mark_update(&BKey::deleted(1), &k, None).unwrap_err();
        assert!(err.to_string().contains("stale dirty ptr"), "{err}");
    }

    #[test]
    fn mixed_data_types_conflict() {
        let (fs, dev) = fs_with(64);
        let user = BKey::extent(1, 8, vec![ptr(dev, 3, 0, false)]);
        let node = BKey::btree_ptr(2, 8, vec![ptr(dev, 3, 0, false)]);
        fs.mark_update(&BKey::deleted(1), &user, None).expect("user");
        let err = fs.mark_update(&BKey::deleted(2), &node, None).unwrap_err();
        assert!(err.to_string().contains("different types"), "{err}");
    }

    #[test]
    fn reservation_is_consumed_on_commit() {
        let (fs, dev) = fs_with(1000);
        let mut res = fs
            .disk_reservation_get(16, 2, ReserveFlags::NONE)
            .expect("reserve");
        let k = BKey::extent(1, 16, vec![ptr(dev, 3, 0, false), ptr(dev, 4, 0, false)]);
        fs.mark_update(&BKey::deleted(1), &k, Some(&mut res)).expect("mark");
        assert_eq!(res.sectors(), 0);
        assert_eq!(fs.online_reserved(), 0);
        assert_eq!(fs.fs_usage_read().u.data, 32);
    }

    #[test]
    fn failed_update_keeps_reservation() {
        let (fs, dev) = fs_with(1000);
        let mut res = fs
            .disk_reservation_get(8, 1, ReserveFlags::NONE)
            .expect("reserve");
        let bad = BKey::extent(1, 8, vec![ptr(dev, 3, 7, false)]);
        assert!(fs.mark_update(&BKey::deleted(1), &bad, Some(&mut res)).is_err());
        assert_eq!(res.sectors(), 8);
        assert_eq!(fs.online_reserved(), 8);
    }

    #[test]
    fn persistent_reservation_and_inodes() {
        let (fs, _) = fs_with(64);
        let r = BKey {
            pos: 1,
            val: KeyVal::Reservation {
                nr_replicas: 2,
                sectors: 10,
            },
        };
        fs.mark_update(&BKey::deleted(1), &r, None).expect("reservation");
        let inode = BKey {
            pos: 2,
            val: KeyVal::Inode,
        };
        fs.mark_update(&BKey::deleted(2), &inode, None).expect("inode");
        let u = fs.fs_usage_read().u;
        assert_eq!(u.reserved, 20);
        assert_eq!(u.persistent_reserved, [0, 20, 0, 0]);
        assert_eq!(u.nr_inodes, 1);
    }

    #[test]
    fn persistent_reservation_charges_free_space_once() {
        let (fs, _) = fs_with(1000);
        let free_before = fs.fs_usage_read_short().free;
        let r = BKey {
            pos: 1,
            val: KeyVal::Reservation {
                nr_replicas: 2,
                sectors: 10,
            },
        };
        fs.mark_update(&BKey::deleted(1), &r, None).expect("reservation");

        // 20 reserved sectors plus slack; the per-level breakdown is not
        // charged again.
        let charged = crate::usage::reserve_factor(20);
        assert_eq!(charged, 21);
        assert_eq!(fs.fs_usage_read_short().free, free_before - charged);
        assert_eq!(fs.fs_sectors_used(&fs.fs_usage_read()), charged);

        fs.mark_update(&r, &BKey::deleted(1), None).expect("release");
        assert_eq!(fs.fs_usage_read_short().free, free_before);
    }

    #[test]
    fn dev_sb_marks_hidden_buckets() {
        let (fs, dev) = fs_with(64);
        let layout = MetadataLayout {
            sb_offsets: vec![8, 120],
            sb_sectors: 16,
            journal_buckets: vec![BucketIdx(10), BucketIdx(11)],
        };
        fs.mark_dev_sb(dev, &layout).expect("sb");
        // Second copy straddles buckets 0 and 1.
        assert_eq!(mark_of(&fs, dev, 0).dirty_sectors, 16 + 8);
        assert_eq!(mark_of(&fs, dev, 1).dirty_sectors, 8);
        assert_eq!(mark_of(&fs, dev, 10).data_type, DataType::Journal);
        let d = fs.dev_usage_read(dev).expect("usage");
        assert_eq!(d.of(DataType::Sb).buckets, 2);
        assert_eq!(d.of(DataType::Journal).buckets, 2);
        assert_eq!(fs.fs_usage_read().u.hidden, 4 * u64::from(BS));
        assert_eq!(fs.dev(dev).expect("dev").layout(), Some(layout));
    }

    #[test]
    fn dev_sb_outside_device_is_rejected() {
        let (fs, dev) = fs_with(64);
        let layout = MetadataLayout {
            sb_offsets: vec![64 * u64::from(BS)],
            sb_sectors: 8,
            journal_buckets: vec![],
        };
        assert!(matches!(
            fs.mark_dev_sb(dev, &layout),
            Err(BktError::InvalidGeometry(_))
        ));
        assert!(fs.dev(dev).expect("dev").layout().is_none());
    }

    #[test]
    fn invalidate_refuses_dirty_bucket() {
        let (fs, dev) = fs_with(64);
        let k = BKey::extent(1, 8, vec![ptr(dev, 3, 0, false)]);
        fs.mark_update(&BKey::deleted(1), &k, None).expect("mark");
        assert!(fs.invalidate_bucket(dev, BucketIdx(3)).is_err());
        assert_eq!(mark_of(&fs, dev, 3).gen, Gen(0));
    }

    #[test]
    fn invalidate_makes_pointer_stale() {
        let (fs, dev) = fs_with(64);
        let gens = fs.dev(dev).expect("dev").gens();
        for _ in 0..5 {
            fs.invalidate_bucket(dev, BucketIdx(7)).expect("bump");
        }
        let p = ptr(dev, 7, 5, false);
        assert_eq!(gens.get(BucketIdx(7)), Gen(5));
        assert!(!fs.ptr_stale(&p).expect("check"));
        assert_eq!(fs.invalidate_bucket(dev, BucketIdx(7)).expect("bump"), Gen(6));
        assert!(fs.ptr_stale(&p).expect("check"));
    }

    #[test]
    #[should_panic(expected = "not owned by the allocator")]
    fn releasing_unowned_bucket_panics() {
        let (fs, dev) = fs_with(64);
        let _ = fs.mark_alloc_bucket(dev, BucketIdx(3), false);
    }

    #[test]
    fn stripe_buckets_are_unavailable() {
        let (fs, dev) = fs_with(64);
        fs.mark_stripe_bucket(dev, BucketIdx(3), true).expect("stripe");
        let d = fs.dev_usage_read(dev).expect("usage");
        assert_eq!(d.buckets_ec, 1);
        assert_eq!(fs.dev_buckets_available(dev).expect("avail"), 63);
        assert!(fs.invalidate_bucket(dev, BucketIdx(3)).is_err());
    }
}

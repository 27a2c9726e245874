//! Mark-and-sweep recomputation of bucket marks and usage.
//!
//! A pass builds a shadow array per device holding only each bucket's gen,
//! re-marks superblock and journal buckets into it, and then has the
//! caller feed it every key in position order. Updates racing with the
//! pass keep marking the live arrays; once GC has walked past a key's
//! position they are mirrored into the shadow as well, so the shadow ends
//! up describing the same keyspace as the live arrays.
//!
//! [`GcPass::finish`] makes the shadow authoritative: live marks that
//! disagree are corrected, `oldest_gen` is refreshed from the pointers
//! seen, and all usage is recomputed from the corrected marks. Dropping an
//! unfinished pass discards the shadows and changes nothing.
//!
//! # Logging
//!
//! - **INFO** `bkt::gc`: `gc_started`, `gc_finished`, `gc_aborted`
//! - **WARN** `bkt::gc`: `gc_bucket_mark_corrected`
//! - **DEBUG** `bkt::gc`: `gc_ptr_error`

use crate::array::BucketArray;
use crate::device::GcGuard;
use crate::key::BKey;
use crate::mark::BucketMark;
use crate::marking::{key_replicas, MarkTx};
use crate::usage::{dev_usage_update, DevUsage, FsUsage};
use crate::Filesystem;
use bkt_error::Result;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a completed GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Keys fed to the pass.
    pub keys: u64,
    /// Pointers that failed their checks and were left out.
    pub errors: u64,
    /// Live bucket marks that disagreed with the recomputation.
    pub buckets_corrected: u64,
}

/// A running GC pass. Holds the GC lock for its lifetime.
#[must_use = "dropping a GC pass aborts it"]
pub struct GcPass<'a> {
    fs: &'a Filesystem,
    _gc: GcGuard<'a>,
    keys: u64,
    errors: u64,
    finished: bool,
}

impl Filesystem {
    /// Start a GC pass. Blocks while another pass or a resize is running.
    pub fn gc_start(&self) -> Result<GcPass<'_>> {
        let gc = self.gc_lock();
        {
            let write = self.mark_write();
            let devices = self.devices();
            let mut shadows = Vec::with_capacity(devices.len());
            for dev in &devices {
                let shadow = BucketArray::gc_shadow_of(&dev.buckets(&write));
                self.mark_layout_into(dev, &shadow)?;
                shadows.push(Arc::new(shadow));
            }
            for (dev, shadow) in devices.iter().zip(shadows) {
                dev.set_gc_buckets(Some(shadow));
            }
            let replicas = self.replicas.read().len();
            *self.gc.usage.lock() = FsUsage {
                replicas: vec![0; replicas],
                ..FsUsage::default()
            };
            self.gc.pos.store(0, Ordering::Release);
            self.gc.running.store(true, Ordering::Release);
        }
        info!(target: "bkt::gc", devices = self.devices().len(), "gc_started");
        Ok(GcPass {
            fs: self,
            _gc: gc,
            keys: 0,
            errors: 0,
            finished: false,
        })
    }

    #[must_use]
    pub fn gc_running(&self) -> bool {
        self.gc.running.load(Ordering::Acquire)
    }

    fn gc_clear_shadows(&self) {
        for dev in self.devices() {
            dev.set_gc_buckets(None);
        }
        self.gc.running.store(false, Ordering::Release);
        self.gc.pos.store(0, Ordering::Release);
    }
}

impl GcPass<'_> {
    /// Position of the next key the pass expects.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.fs.gc.pos.load(Ordering::Acquire)
    }

    /// Mark `key` into the shadow arrays. Keys must arrive in increasing
    /// position order, and must not race with
    /// [`Filesystem::mark_update`] on the same position.
    ///
    /// Pointers that fail their checks are counted and skipped.
    pub fn mark_key(&mut self, key: &BKey) -> Result<()> {
        debug_assert!(key.pos >= self.pos(), "gc keys out of order");
        let mut entries = Vec::new();
        key_replicas(key, &mut entries);
        self.fs.ensure_replicas(&entries);

        let held = self.fs.mark_read();
        let mut tx = MarkTx::new(self.fs, true);
        tx.mark_key(&held, key, 1)?;
        self.errors += tx.errors;
        tx.commit(true, None);
        self.fs
            .gc
            .pos
            .store(key.pos.saturating_add(1), Ordering::Release);
        self.keys += 1;
        Ok(())
    }

    /// Reconcile live marks with the shadow and recompute usage.
    pub fn finish(mut self) -> GcReport {
        let fs = self.fs;
        let write = fs.mark_write();
        let mut buckets_corrected = 0_u64;
        let mut hidden = FsUsage::default();

        for dev in fs.devices() {
            let Some(shadow) = dev.gc_buckets(&write) else {
                continue;
            };
            let live = dev.buckets(&write);
            let bucket_size = dev.bucket_size();
            let mut usage = DevUsage::default();

            for (b, bucket) in live.iter() {
                let cur = bucket.mark.read();
                let mut new = cur;
                if shadow.contains(b) {
                    let g = shadow.bucket(b);
                    let gm = g.mark.read();
                    if gm.gen == cur.gen {
                        new = BucketMark {
                            data_type: gm.data_type,
                            dirty_sectors: gm.dirty_sectors,
                            cached_sectors: gm.cached_sectors,
                            ..cur
                        };
                        bucket.set_oldest_gen(g.oldest_gen());
                    }
                }
                if new != cur {
                    warn!(
                        target: "bkt::gc",
                        dev = dev.idx().0,
                        bucket = b.0,
                        was_type = %cur.data_type,
                        was_dirty = cur.dirty_sectors,
                        was_cached = cur.cached_sectors,
                        now_type = %new.data_type,
                        now_dirty = new.dirty_sectors,
                        now_cached = new.cached_sectors,
                        "gc_bucket_mark_corrected"
                    );
                    bucket.mark.set(new);
                    buckets_corrected += 1;
                }
                dev_usage_update(&mut usage, &mut hidden, BucketMark::default(), new, bucket_size);
            }
            dev.usage.reset(usage);
        }

        let mut usage = std::mem::take(&mut *fs.gc.usage.lock());
        usage.hidden = hidden.hidden;
        fs.usage.reset(usage);
        fs.gc_clear_shadows();
        drop(write);

        self.finished = true;
        let report = GcReport {
            keys: self.keys,
            errors: self.errors,
            buckets_corrected,
        };
        info!(
            target: "bkt::gc",
            keys = report.keys,
            errors = report.errors,
            buckets_corrected,
            "gc_finished"
        );
        report
    }
}

impl Drop for GcPass<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let _write = self.fs.mark_write();
        self.fs.gc_clear_shadows();
        info!(target: "bkt::gc", keys = self.keys, "gc_aborted");
    }
}

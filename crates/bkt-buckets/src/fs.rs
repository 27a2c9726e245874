//! The filesystem-wide accounting context.
//!
//! # Lock order
//!
//! `gc_lock` → device `bucket_lock` → `mark_lock` → `replicas` →
//! `freelists` → usage and reservation shards. Bucket marks take no lock.
//!
//! # Logging
//!
//! - **INFO** `bkt::device`: `device_added`, `device_state_changed`,
//!   `device_resized`, `capacity_recalculated`
//! - **WARN** `bkt::usage`: `buckets_unavailable_overflow` (once per device)

use crate::array::{BucketArray, BucketGens};
use crate::device::{BucketLockGuard, Device, GcGuard, MarkReadGuard, MarkWriteGuard};
use crate::freelist::FreeLists;
use crate::key::ExtentPtr;
use crate::percpu::{Accumulate, Percpu};
use crate::replicas::ReplicasTable;
use crate::reservation::ReserveShard;
use crate::usage::{reserve_factor, DevUsage, FsUsage, FsUsageOnline, FsUsageShort};
use crate::FsOptions;
use bkt_error::{BktError, Result};
use bkt_types::{gen_after, BucketIdx, DeviceIdx, Member, MemberState, MemberTable, ReplicasEntry, MEMBERS_MAX};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of the GC pass, if one is running.
#[derive(Debug, Default)]
pub(crate) struct GcState {
    pub(crate) running: AtomicBool,
    /// Position of the next key GC will visit.
    pub(crate) pos: AtomicU64,
    /// Usage recomputed by GC from the keys it has visited.
    pub(crate) usage: Mutex<FsUsage>,
}

#[derive(Debug)]
pub struct Filesystem {
    pub(crate) opts: FsOptions,
    devices: RwLock<Vec<Option<Arc<Device>>>>,
    mark_lock: RwLock<()>,
    gc_lock: Mutex<()>,
    pub(crate) gc: GcState,
    pub(crate) replicas: RwLock<ReplicasTable>,
    pub(crate) usage: Percpu<FsUsage>,
    pub(crate) reserve: Percpu<ReserveShard>,
    pub(crate) sectors_available: AtomicU64,
    pub(crate) sectors_available_lock: Mutex<()>,
    capacity: AtomicU64,
    pub(crate) freelists: Mutex<BTreeMap<DeviceIdx, FreeLists>>,
    pub(crate) freelist_wait: Condvar,
    anomalies: AtomicU64,
}

impl Filesystem {
    #[must_use]
    pub fn new(opts: FsOptions) -> Self {
        let shards = opts.shards;
        Self {
            opts,
            devices: RwLock::new(Vec::new()),
            mark_lock: RwLock::new(()),
            gc_lock: Mutex::new(()),
            gc: GcState::default(),
            replicas: RwLock::new(ReplicasTable::default()),
            usage: Percpu::new(shards),
            reserve: Percpu::new(shards),
            sectors_available: AtomicU64::new(0),
            sectors_available_lock: Mutex::new(()),
            capacity: AtomicU64::new(0),
            freelists: Mutex::new(BTreeMap::new()),
            freelist_wait: Condvar::new(),
            anomalies: AtomicU64::new(0),
        }
    }

    /// Bring up every member of `table` and seed the replicas table.
    pub fn from_members(opts: FsOptions, table: &MemberTable) -> Result<Self> {
        let fs = Self::new(opts);
        for member in &table.members {
            fs.add_device(*member)?;
        }
        {
            let mut replicas = fs.replicas.write();
            for entry in &table.replicas {
                replicas.push(entry.clone());
            }
        }
        Ok(fs)
    }

    #[must_use]
    pub fn options(&self) -> &FsOptions {
        &self.opts
    }

    // ── Locks ──────────────────────────────────────────────────────────────

    pub fn mark_read(&self) -> MarkReadGuard<'_> {
        MarkReadGuard {
            _held: self.mark_lock.read(),
        }
    }

    pub(crate) fn mark_write(&self) -> MarkWriteGuard<'_> {
        MarkWriteGuard {
            _held: self.mark_lock.write(),
        }
    }

    pub(crate) fn gc_lock(&self) -> GcGuard<'_> {
        GcGuard {
            _held: self.gc_lock.lock(),
        }
    }

    // ── Devices ────────────────────────────────────────────────────────────

    /// Add a member with the next free index.
    pub fn add_device(&self, member: Member) -> Result<DeviceIdx> {
        let idx = {
            let mut devices = self.devices.write();
            if devices.len() >= MEMBERS_MAX {
                return Err(BktError::Format(format!(
                    "too many members (max {MEMBERS_MAX})"
                )));
            }
            let idx = DeviceIdx(u32::try_from(devices.len()).expect("MEMBERS_MAX fits in u32"));
            let dev = Device::new(idx, member, self.opts.shards)?;
            devices.push(Some(Arc::new(dev)));
            idx
        };
        self.freelists
            .lock()
            .insert(idx, FreeLists::new(&self.opts));
        info!(
            target: "bkt::device",
            dev = idx.0,
            nbuckets = member.nbuckets,
            bucket_size = member.bucket_size,
            state = %member.state,
            "device_added"
        );
        self.recalc_capacity();
        Ok(idx)
    }

    pub fn dev(&self, idx: DeviceIdx) -> Result<Arc<Device>> {
        usize::try_from(idx.0)
            .ok()
            .and_then(|i| self.devices.read().get(i).cloned().flatten())
            .ok_or_else(|| BktError::NotFound(format!("device {idx}")))
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().iter().flatten().cloned().collect()
    }

    /// Current geometry and state of every member, in index order.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.devices().iter().map(|d| d.member()).collect()
    }

    #[must_use]
    pub fn replicas_entries(&self) -> Vec<ReplicasEntry> {
        self.replicas.read().entries().to_vec()
    }

    /// Snapshot suitable for persisting.
    #[must_use]
    pub fn member_table(&self, seq: u64) -> MemberTable {
        MemberTable {
            seq,
            members: self.members(),
            replicas: self.replicas_entries(),
        }
    }

    /// Store a state chosen by the caller. Feasibility is the caller's call.
    pub fn set_member_state(&self, idx: DeviceIdx, state: MemberState) -> Result<()> {
        let dev = self.dev(idx)?;
        let prev = dev.set_state(state);
        info!(
            target: "bkt::device",
            dev = idx.0,
            from = %prev,
            to = %state,
            "device_state_changed"
        );
        if prev != state {
            self.recalc_capacity();
            // Waiters on a device that can no longer allocate must re-check.
            self.freelist_wait.notify_all();
        }
        Ok(())
    }

    /// Devices eligible for new allocations.
    #[must_use]
    pub fn rw_devices(&self) -> Vec<DeviceIdx> {
        self.devices()
            .iter()
            .filter(|d| d.state().allocates())
            .map(|d| d.idx())
            .collect()
    }

    // ── Capacity ───────────────────────────────────────────────────────────

    /// Recompute usable capacity from the read-write members, holding back
    /// enough buckets per device to keep the allocator moving.
    pub fn recalc_capacity(&self) -> u64 {
        let per_dev_reserve = (self.opts.free_inc_capacity + self.opts.write_points + 1) * 2;
        let mut capacity = 0_u64;
        let mut reserved = 0_u64;
        for dev in self.devices() {
            let m = dev.member();
            if !m.state.allocates() {
                continue;
            }
            let bucket_size = u64::from(m.bucket_size);
            capacity += m.usable_buckets() * bucket_size;
            reserved += per_dev_reserve * bucket_size;
        }
        let capacity = capacity - reserved.min(capacity);
        self.capacity.store(capacity, Ordering::Release);
        info!(target: "bkt::device", capacity, reserved, "capacity_recalculated");
        capacity
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    // ── Usage reads ────────────────────────────────────────────────────────

    pub fn dev_usage_read(&self, idx: DeviceIdx) -> Result<DevUsage> {
        Ok(self.dev(idx)?.usage_read())
    }

    /// Usable buckets minus those holding dirty or stripe data.
    ///
    /// An unavailable count above the usable total is an accounting bug:
    /// it is warned about once per device, counted, and reported as zero.
    pub fn dev_buckets_available(&self, idx: DeviceIdx) -> Result<u64> {
        let dev = self.dev(idx)?;
        let total = dev.member().usable_buckets();
        let unavailable = dev.usage_read().buckets_unavailable;
        if unavailable > total {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            if dev.first_unavailable_warning() {
                warn!(
                    target: "bkt::usage",
                    dev = idx.0,
                    unavailable,
                    total,
                    "buckets_unavailable_overflow"
                );
            }
            return Ok(0);
        }
        Ok(total - unavailable)
    }

    /// Accounting anomalies clamped so far.
    #[must_use]
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// Committed usage plus sectors held by live reservations.
    #[must_use]
    pub fn fs_usage_read(&self) -> FsUsageOnline {
        FsUsageOnline {
            online_reserved: self.reserve.read().online_reserved,
            u: self.usage.read(),
        }
    }

    #[must_use]
    pub fn fs_usage_read_short(&self) -> FsUsageShort {
        let online = self.fs_usage_read();
        let capacity = self.capacity().saturating_sub(online.u.hidden);
        let data = online.u.data.wrapping_add(online.u.btree);
        let reserved = online.u.reserved.wrapping_add(online.online_reserved);
        let used = capacity.min(data.saturating_add(reserve_factor(reserved)));
        FsUsageShort {
            capacity,
            used,
            free: capacity - used,
            nr_inodes: online.u.nr_inodes,
        }
    }

    /// One summary counter, e.g. `fs.fs_usage_read_one(|u| u.data)`.
    pub fn fs_usage_read_one(&self, field: impl Fn(&FsUsage) -> u64) -> u64 {
        let mut total = 0_u64;
        self.usage.for_each_mut(|u| total = total.wrapping_add(field(u)));
        total
    }

    /// Sectors in use, counting hidden metadata and reservation slack.
    #[must_use]
    pub fn fs_sectors_used(&self, usage: &FsUsageOnline) -> u64 {
        let u = &usage.u;
        let reserved = u.reserved.wrapping_add(usage.online_reserved);
        let used = u
            .hidden
            .wrapping_add(u.btree)
            .wrapping_add(u.data)
            .saturating_add(reserve_factor(reserved));
        self.capacity().min(used)
    }

    /// Fold every usage shard into its base.
    pub fn usage_acc_to_base(&self) {
        for dev in self.devices() {
            dev.usage.acc_to_base();
        }
        self.usage.acc_to_base();
        debug!(target: "bkt::usage", "usage_acc_to_base");
    }

    /// Human-readable usage summary.
    #[must_use]
    pub fn usage_to_text(&self) -> String {
        let online = self.fs_usage_read();
        let short = self.fs_usage_read_short();
        let u = &online.u;
        let mut out = String::new();
        let _ = writeln!(out, "capacity:\t\t{}", self.capacity());
        let _ = writeln!(out, "used:\t\t\t{}", self.fs_sectors_used(&online));
        let _ = writeln!(out, "free:\t\t\t{}", short.free);
        let _ = writeln!(out, "hidden:\t\t\t{}", u.hidden);
        let _ = writeln!(out, "btree:\t\t\t{}", u.btree);
        let _ = writeln!(out, "data:\t\t\t{}", u.data);
        let _ = writeln!(out, "cached:\t\t\t{}", u.cached);
        let _ = writeln!(out, "reserved:\t\t{}", u.reserved);
        let _ = writeln!(out, "nr_inodes:\t\t{}", u.nr_inodes);
        let _ = writeln!(out, "online reserved:\t{}", online.online_reserved);
        for (i, r) in u.persistent_reserved.iter().enumerate() {
            let _ = writeln!(out, "{} replicas:\n\treserved:\t{r}", i + 1);
        }
        for (i, entry) in self.replicas.read().entries().iter().enumerate() {
            let devs: Vec<String> = entry.devs.iter().map(ToString::to_string).collect();
            let sectors = u.replicas.get(i).copied().unwrap_or(0);
            let _ = writeln!(
                out,
                "{}: {}/{} [{}]\t{sectors}",
                entry.data_type,
                entry.nr_required,
                entry.devs.len(),
                devs.join(" ")
            );
        }
        out
    }

    // ── Staleness ──────────────────────────────────────────────────────────

    /// Whether the bucket behind `ptr` has been reused since it was written.
    pub fn ptr_stale(&self, ptr: &ExtentPtr) -> Result<bool> {
        let dev = self.dev(ptr.dev)?;
        let member = dev.member();
        let b = member.sector_to_bucket(ptr.offset);
        if b.0 < u64::from(member.first_bucket) || b.0 >= member.nbuckets {
            return Err(BktError::Inconsistent {
                dev: ptr.dev.0,
                bucket: b.0,
                detail: "pointer outside device".into(),
            });
        }
        Ok(gen_after(dev.gens().get(b), ptr.gen) > 0)
    }

    /// How far `b`'s gen has moved past the oldest pointer GC saw into it.
    pub fn bucket_gc_gen(&self, idx: DeviceIdx, b: BucketIdx) -> Result<u8> {
        let dev = self.dev(idx)?;
        let held = self.mark_read();
        Ok(crate::mark::bucket_gc_gen(dev.buckets(&held).bucket(b)))
    }

    // ── Resize ─────────────────────────────────────────────────────────────

    /// Grow a device to `nbuckets`. Shrinking is refused before anything
    /// is touched.
    pub fn dev_resize(&self, idx: DeviceIdx, nbuckets: u64) -> Result<()> {
        let dev = self.dev(idx)?;
        let gc = self.gc_lock();
        let held = BucketLockGuard {
            _held: dev.bucket_lock.lock(),
        };
        let current = dev.member().nbuckets;
        if nbuckets < current {
            return Err(BktError::ShrinkNotSupported {
                current,
                requested: nbuckets,
            });
        }
        if nbuckets == current {
            return Ok(());
        }

        {
            let write = self.mark_write();
            let old = dev.buckets(&write);
            let grown = BucketArray::grown_from(&old, nbuckets);
            let gens = BucketGens::from_array(&grown);
            dev.publish_arrays(&write, grown, gens);
            dev.set_nbuckets(nbuckets);
        }
        drop(held);
        drop(gc);

        info!(
            target: "bkt::device",
            dev = idx.0,
            from = current,
            to = nbuckets,
            "device_resized"
        );
        self.recalc_capacity();
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────────────

    /// Add usage deltas for one device and the filesystem to this thread's
    /// shards.
    pub(crate) fn commit_usage(&self, dev: &Device, dev_delta: &DevUsage, fs_delta: &FsUsage) {
        dev.usage.with_local(|u| u.accumulate(dev_delta));
        self.usage.with_local(|u| u.accumulate(fs_delta));
    }

    /// Whether a key at `pos` has already been visited by a running GC.
    pub(crate) fn gc_visited(&self, pos: u64) -> bool {
        self.gc.running.load(Ordering::Acquire) && pos < self.gc.pos.load(Ordering::Acquire)
    }

    /// Add any missing `entries` to the replicas table and grow every usage
    /// aggregate to match. Must not be called with the mark lock held.
    pub(crate) fn ensure_replicas(&self, entries: &[ReplicasEntry]) {
        {
            let replicas = self.replicas.read();
            if entries.iter().all(|e| replicas.index_of(e).is_some()) {
                return;
            }
        }
        let _write = self.mark_write();
        let mut replicas = self.replicas.write();
        for entry in entries {
            replicas.push(entry.clone());
        }
        let len = replicas.len();
        self.usage.for_each_mut(|u| {
            if u.replicas.len() < len {
                u.replicas.resize(len, 0);
            }
        });
        let mut gc_usage = self.gc.usage.lock();
        if gc_usage.replicas.len() < len {
            gc_usage.replicas.resize(len, 0);
        }
    }

    pub(crate) fn note_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }
}

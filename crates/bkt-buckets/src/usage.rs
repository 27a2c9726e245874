//! Device and filesystem usage counters and the mark-delta accounting rule.

use crate::mark::BucketMark;
use crate::percpu::{add, Accumulate};
use bkt_types::{DataType, REPLICAS_MAX};
use serde::Serialize;
use std::fmt;

/// Shift used by [`reserve_factor`] and [`avail_factor`].
pub const RESERVE_FACTOR: u32 = 6;

/// Reserved sectors plus the `1/64` slack charged on top.
#[must_use]
pub fn reserve_factor(r: u64) -> u64 {
    r + (r.div_ceil(1 << RESERVE_FACTOR))
}

/// Inverse of [`reserve_factor`]: how much may be reserved out of `r` free.
#[must_use]
pub fn avail_factor(r: u64) -> u64 {
    let scaled = u128::from(r) << RESERVE_FACTOR;
    let factor = (1_u128 << RESERVE_FACTOR) + 1;
    u64::try_from(scaled / factor).unwrap_or(u64::MAX)
}

// ── Device usage ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DevTypeUsage {
    pub buckets: u64,
    pub sectors: u64,
    pub fragmented: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DevUsage {
    pub buckets_ec: u64,
    pub buckets_unavailable: u64,
    pub d: [DevTypeUsage; DataType::COUNT],
}

impl DevUsage {
    #[must_use]
    pub fn of(&self, ty: DataType) -> &DevTypeUsage {
        &self.d[ty.index()]
    }
}

impl Accumulate for DevUsage {
    fn accumulate(&mut self, other: &Self) {
        self.buckets_ec = self.buckets_ec.wrapping_add(other.buckets_ec);
        self.buckets_unavailable = self
            .buckets_unavailable
            .wrapping_add(other.buckets_unavailable);
        for (dst, src) in self.d.iter_mut().zip(&other.d) {
            dst.buckets = dst.buckets.wrapping_add(src.buckets);
            dst.sectors = dst.sectors.wrapping_add(src.sectors);
            dst.fragmented = dst.fragmented.wrapping_add(src.fragmented);
        }
    }
}

impl fmt::Display for DevUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<10}{:>12}{:>14}{:>14}", "", "buckets", "sectors", "fragmented")?;
        for ty in DataType::ALL {
            let u = self.of(ty);
            writeln!(
                f,
                "{:<10}{:>12}{:>14}{:>14}",
                ty.as_str(),
                u.buckets,
                u.sectors,
                u.fragmented
            )?;
        }
        writeln!(f, "{:<10}{:>12}", "ec", self.buckets_ec)?;
        write!(f, "{:<10}{:>12}", "unavail", self.buckets_unavailable)
    }
}

// ── Filesystem usage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsUsage {
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
    /// `reserved` broken down by replica count; not counted on top of it.
    pub persistent_reserved: [u64; REPLICAS_MAX],
    /// Sectors per replicas-table entry, indexed like the table.
    pub replicas: Vec<u64>,
}

impl FsUsage {
    /// Add `delta` sectors to replicas entry `idx`, growing the vector.
    pub fn replicas_add(&mut self, idx: usize, delta: i64) {
        if self.replicas.len() <= idx {
            self.replicas.resize(idx + 1, 0);
        }
        add(&mut self.replicas[idx], delta);
    }

    /// Charge `delta` sectors of `ty` to the matching summary counter.
    pub fn type_add(&mut self, ty: DataType, delta: i64) {
        match ty {
            DataType::Btree => add(&mut self.btree, delta),
            DataType::User | DataType::Parity | DataType::StripeParity => add(&mut self.data, delta),
            DataType::Cached => add(&mut self.cached, delta),
            DataType::Sb | DataType::Journal => add(&mut self.hidden, delta),
            DataType::None => {}
        }
    }
}

impl Accumulate for FsUsage {
    fn accumulate(&mut self, other: &Self) {
        self.hidden = self.hidden.wrapping_add(other.hidden);
        self.btree = self.btree.wrapping_add(other.btree);
        self.data = self.data.wrapping_add(other.data);
        self.cached = self.cached.wrapping_add(other.cached);
        self.reserved = self.reserved.wrapping_add(other.reserved);
        self.nr_inodes = self.nr_inodes.wrapping_add(other.nr_inodes);
        for (dst, src) in self
            .persistent_reserved
            .iter_mut()
            .zip(&other.persistent_reserved)
        {
            *dst = dst.wrapping_add(*src);
        }
        if self.replicas.len() < other.replicas.len() {
            self.replicas.resize(other.replicas.len(), 0);
        }
        for (dst, src) in self.replicas.iter_mut().zip(&other.replicas) {
            *dst = dst.wrapping_add(*src);
        }
    }
}

/// Committed usage plus sectors held by outstanding reservations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsUsageOnline {
    pub online_reserved: u64,
    pub u: FsUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsUsageShort {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub nr_inodes: u64,
}

// ── Mark delta accounting ──────────────────────────────────────────────────

fn account_bucket(
    dev: &mut DevUsage,
    fs: &mut FsUsage,
    ty: DataType,
    nr: i64,
    size: i64,
) {
    if ty.is_hidden() {
        add(&mut fs.hidden, size);
    }
    add(&mut dev.d[ty.index()].buckets, nr);
}

/// Account the transition of one bucket from `old` to `new`.
///
/// Bucket counts follow `bucket_type`, sector counts follow `data_type`,
/// and cached sectors always land under [`DataType::Cached`].
#[expect(clippy::cast_possible_wrap)]
pub fn dev_usage_update(
    dev: &mut DevUsage,
    fs: &mut FsUsage,
    old: BucketMark,
    new: BucketMark,
    bucket_size: u16,
) {
    let size = i64::from(bucket_size);

    if old.bucket_type() != DataType::None {
        account_bucket(dev, fs, old.bucket_type(), -1, -size);
    }
    if new.bucket_type() != DataType::None {
        account_bucket(dev, fs, new.bucket_type(), 1, size);
    }

    add(
        &mut dev.buckets_ec,
        i64::from(new.stripe) - i64::from(old.stripe),
    );
    add(
        &mut dev.buckets_unavailable,
        i64::from(!new.is_available()) - i64::from(!old.is_available()),
    );

    add(
        &mut dev.d[old.data_type.index()].sectors,
        -i64::from(old.dirty_sectors),
    );
    add(
        &mut dev.d[new.data_type.index()].sectors,
        i64::from(new.dirty_sectors),
    );
    add(
        &mut dev.d[DataType::Cached.index()].sectors,
        i64::from(new.cached_sectors) - i64::from(old.cached_sectors),
    );

    add(
        &mut dev.d[old.data_type.index()].fragmented,
        -(old.fragmented(bucket_size) as i64),
    );
    add(
        &mut dev.d[new.data_type.index()].fragmented,
        new.fragmented(bucket_size) as i64,
    );
}

//! Disk reservations: admission control for writes.
//!
//! A reservation charges `sectors × nr_replicas` against free space before
//! a write is issued. Each shard keeps a small stock of pre-claimed sectors
//! so most reservations never touch the shared pool; when the pool runs
//! dry, a serialized recalculation re-derives it from current usage.
//!
//! A [`DiskReservation`] releases whatever it still holds when dropped, so
//! every exit path of the owning operation gives the space back exactly
//! once. [`DiskReservation::put`] consumes the ticket, which makes a second
//! release a compile error:
//!
//! ```compile_fail
//! # use bkt_buckets::{Filesystem, FsOptions, ReserveFlags};
//! # let fs = Filesystem::new(FsOptions::default());
//! let res = fs.disk_reservation_get(8, 1, ReserveFlags::NONE).unwrap();
//! res.put();
//! res.put();
//! ```
//!
//! # Logging
//!
//! - **TRACE** `bkt::reserve`: `reservation_get`, `reservation_put`
//! - **DEBUG** `bkt::reserve`: `reservation_recalculate`, `reservation_overrun`

use crate::percpu::{add, Accumulate};
use crate::usage::avail_factor;
use crate::Filesystem;
use bkt_error::{BktError, Result};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Per-shard reservation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ReserveShard {
    /// Sectors claimed from the pool but not yet handed out.
    pub(crate) sectors_available: u64,
    /// Sectors held by outstanding reservations (wrapping; may go
    /// "negative" in a shard that releases what another charged).
    pub(crate) online_reserved: u64,
}

impl Accumulate for ReserveShard {
    fn accumulate(&mut self, other: &Self) {
        self.sectors_available = self.sectors_available.wrapping_add(other.sectors_available);
        self.online_reserved = self.online_reserved.wrapping_add(other.online_reserved);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveFlags(u32);

impl ReserveFlags {
    pub const NONE: Self = Self(0);
    /// Never fail: overcommit instead. For metadata that must be written.
    pub const NOFAIL: Self = Self(1 << 0);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A charge against free space. Released on drop.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct DiskReservation<'a> {
    fs: &'a Filesystem,
    sectors: u64,
    nr_replicas: u8,
}

impl DiskReservation<'_> {
    /// Sectors currently held, already multiplied by the replica count.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    #[must_use]
    pub fn nr_replicas(&self) -> u8 {
        self.nr_replicas
    }

    /// Reserve `sectors × nr_replicas` more on this ticket.
    pub fn add(&mut self, sectors: u64, flags: ReserveFlags) -> Result<()> {
        let total = sectors.saturating_mul(u64::from(self.nr_replicas));
        self.fs.reservation_charge(total, flags)?;
        self.sectors += total;
        Ok(())
    }

    /// Release the ticket now.
    pub fn put(self) {}

    /// Hand `sectors` of this ticket over to committed usage.
    pub(crate) fn consume(&mut self, sectors: u64) -> u64 {
        let taken = sectors.min(self.sectors);
        self.sectors -= taken;
        self.fs
            .reserve
            .with_local(|s| add(&mut s.online_reserved, -to_signed(taken)));
        taken
    }
}

impl Drop for DiskReservation<'_> {
    fn drop(&mut self) {
        if self.sectors == 0 {
            return;
        }
        let sectors = std::mem::take(&mut self.sectors);
        self.fs
            .reserve
            .with_local(|s| add(&mut s.online_reserved, -to_signed(sectors)));
        trace!(target: "bkt::reserve", sectors, "reservation_put");
    }
}

#[expect(clippy::cast_possible_wrap)]
pub(crate) fn to_signed(v: u64) -> i64 {
    v as i64
}

impl Filesystem {
    /// An empty ticket for `nr_replicas` copies.
    pub fn disk_reservation_init(&self, nr_replicas: u8) -> DiskReservation<'_> {
        DiskReservation {
            fs: self,
            sectors: 0,
            nr_replicas: nr_replicas.max(1),
        }
    }

    /// Reserve `sectors × nr_replicas`. Fails with `NoSpace` unless
    /// `NOFAIL` is set.
    pub fn disk_reservation_get(
        &self,
        sectors: u64,
        nr_replicas: u8,
        flags: ReserveFlags,
    ) -> Result<DiskReservation<'_>> {
        let mut res = self.disk_reservation_init(nr_replicas);
        if sectors > 0 {
            res.add(sectors, flags)?;
        }
        Ok(res)
    }

    /// Charge `sectors` (already multiplied out) to online_reserved.
    fn reservation_charge(&self, sectors: u64, flags: ReserveFlags) -> Result<()> {
        let _mark = self.mark_read();

        let fast = {
            let mut shard = self.reserve.local();
            if sectors <= shard.sectors_available || self.refill_shard(&mut shard, sectors) {
                shard.sectors_available -= sectors;
                add(&mut shard.online_reserved, to_signed(sectors));
                true
            } else {
                false
            }
        };
        if fast {
            trace!(target: "bkt::reserve", sectors, "reservation_get");
            return Ok(());
        }
        self.reservation_recalculate(sectors, flags)
    }

    /// Pull `sectors` plus a cache's worth from the pool into `shard`.
    fn refill_shard(&self, shard: &mut ReserveShard, sectors: u64) -> bool {
        let cache = self.opts.sectors_cache;
        let claimed = self.sectors_available.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |pool| {
                let get = sectors.saturating_add(cache).min(pool);
                (get >= sectors).then_some(pool - get)
            },
        );
        match claimed {
            Ok(pool) => {
                shard.sectors_available += sectors.saturating_add(cache).min(pool);
                true
            }
            Err(_) => false,
        }
    }

    fn reservation_recalculate(&self, sectors: u64, flags: ReserveFlags) -> Result<()> {
        let _serialize = self.sectors_available_lock.lock();

        self.reserve.for_each_mut(|s| s.sectors_available = 0);
        let available = avail_factor(self.fs_usage_read_short().free);

        let ok = sectors <= available || flags.contains(ReserveFlags::NOFAIL);
        if ok {
            self.sectors_available
                .store(available.saturating_sub(sectors), Ordering::Release);
            self.reserve
                .with_local(|s| add(&mut s.online_reserved, to_signed(sectors)));
        } else {
            self.sectors_available.store(available, Ordering::Release);
        }
        debug!(
            target: "bkt::reserve",
            sectors,
            available,
            nofail = flags.contains(ReserveFlags::NOFAIL),
            ok,
            "reservation_recalculate"
        );
        if ok {
            Ok(())
        } else {
            Err(BktError::NoSpace)
        }
    }

    /// Sectors currently held by outstanding reservations.
    #[must_use]
    pub fn online_reserved(&self) -> u64 {
        self.reserve.read().online_reserved
    }

    /// Take `sectors` from the shared pool for usage committed without a
    /// covering reservation.
    pub(crate) fn reservation_overrun(&self, sectors: u64) {
        let _ = self
            .sectors_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pool| {
                Some(pool.saturating_sub(sectors))
            });
        debug!(target: "bkt::reserve", sectors, "reservation_overrun");
    }
}

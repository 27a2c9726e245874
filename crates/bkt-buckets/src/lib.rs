#![forbid(unsafe_code)]
//! Bucket marks, usage accounting and disk reservations.
//!
//! Every device is cut into fixed-size buckets. Each bucket carries an
//! atomically updated [`BucketMark`] recording how many sectors of what
//! kind of data it holds and which generation it is on; pointers in the
//! index name a bucket and a generation, so a pointer into a bucket that
//! has since been reused is recognisably stale.
//!
//! ## Design
//!
//! The engine is layered:
//!
//! 1. **Marks** ([`mark`]): a packed `u64` per bucket, updated with a
//!    compare-and-swap retry loop. No per-bucket lock.
//! 2. **Arrays** ([`array`], [`device`]): per-device bucket arrays and a
//!    gen-only table, published by atomic swap and freed only when the last
//!    reader lets go. GC builds a second, shadow array alongside.
//! 3. **Usage** ([`usage`], [`percpu`]): device and filesystem counters kept
//!    in shards, folded into a base on demand.
//! 4. **Admission** ([`reservation`]): tickets charging sectors × replicas
//!    against free space before a write, released on drop.
//! 5. **Allocation** ([`freelist`]): reclaim scan, generation bump, tiered
//!    free lists and open-bucket accounting.
//! 6. **Marking and GC** ([`marking`], [`gc`]): applying key changes to
//!    marks and usage all-or-nothing, and recomputing both from the keys.
//!
//! [`Filesystem`] ties them together.

pub mod array;
pub mod device;
pub mod freelist;
pub mod fs;
pub mod gc;
pub mod key;
pub mod mark;
pub mod marking;
pub mod percpu;
pub mod replicas;
pub mod reservation;
pub mod usage;

use bkt_error::BktError;
use bkt_types::ParseError;
use serde::{Deserialize, Serialize};

pub use device::{Device, MetadataLayout};
pub use freelist::{AllocReserve, FreeListStats};
pub use fs::Filesystem;
pub use gc::{GcPass, GcReport};
pub use key::{BKey, ExtentPtr, KeyVal};
pub use mark::{bucket_gc_gen, BucketMark, BUCKET_GC_GEN_MAX};
pub use replicas::ReplicasTable;
pub use reservation::{DiskReservation, ReserveFlags};
pub use usage::{DevUsage, FsUsage, FsUsageOnline, FsUsageShort};

// ── Options ────────────────────────────────────────────────────────────────

/// Tunables for one filesystem instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Usage and reservation shards. Roughly one per concurrent writer.
    pub shards: usize,
    /// Sectors a shard claims from the shared pool beyond what it needs.
    pub sectors_cache: u64,
    /// Buckets a device may hold waiting for a generation bump.
    pub free_inc_capacity: u64,
    /// Capacity of each free tier, indexed by [`AllocReserve`].
    pub reserve_capacity: [usize; freelist::RESERVE_NR],
    /// Buckets a device may have open for writing at once.
    pub open_buckets_max: u64,
    /// Concurrent write streams; each pins buckets out of capacity.
    pub write_points: u64,
}

impl Default for FsOptions {
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(64);
        Self {
            shards,
            sectors_cache: 1024,
            free_inc_capacity: 64,
            reserve_capacity: [8, 32],
            open_buckets_max: 256,
            write_points: 32,
        }
    }
}

/// Lift a member-table decoding failure into the engine's error type.
#[must_use]
pub fn parse_error(e: ParseError) -> BktError {
    BktError::Parse(e.to_string())
}

/// Decode a member-table image.
pub fn read_member_table(data: &[u8]) -> bkt_error::Result<bkt_types::MemberTable> {
    bkt_types::MemberTable::parse_from_bytes(data).map_err(parse_error)
}

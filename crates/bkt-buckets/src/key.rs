//! The narrow view of index keys that bucket marking needs.
//!
//! The index layer owns the real key format; it hands old and new versions
//! of a key to [`Filesystem::mark_update`](crate::Filesystem::mark_update)
//! in this shape.

use bkt_types::{DataType, DeviceIdx, Gen, ReplicasEntry};
use serde::{Deserialize, Serialize};

/// A pointer into a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Start sector on `dev`.
    pub offset: u64,
    /// Generation of the bucket when the pointer was written.
    pub gen: Gen,
    /// Cached copies may go stale without harm.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyVal {
    Deleted,
    /// User data: each pointer covers `sectors` sectors.
    Extent { ptrs: Vec<ExtentPtr>, sectors: u32 },
    /// A btree node; `sectors` is the node size.
    BtreePtr { ptrs: Vec<ExtentPtr>, sectors: u32 },
    /// Space persistently reserved at a replication level.
    Reservation { nr_replicas: u8, sectors: u32 },
    Inode,
}

/// Position plus value. Positions order keys for GC progress tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BKey {
    pub pos: u64,
    pub val: KeyVal,
}

impl BKey {
    #[must_use]
    pub fn deleted(pos: u64) -> Self {
        Self {
            pos,
            val: KeyVal::Deleted,
        }
    }

    #[must_use]
    pub fn extent(pos: u64, sectors: u32, ptrs: Vec<ExtentPtr>) -> Self {
        Self {
            pos,
            val: KeyVal::Extent { ptrs, sectors },
        }
    }

    #[must_use]
    pub fn btree_ptr(pos: u64, sectors: u32, ptrs: Vec<ExtentPtr>) -> Self {
        Self {
            pos,
            val: KeyVal::BtreePtr { ptrs, sectors },
        }
    }

    #[must_use]
    pub fn ptrs(&self) -> &[ExtentPtr] {
        match &self.val {
            KeyVal::Extent { ptrs, .. } | KeyVal::BtreePtr { ptrs, .. } => ptrs,
            _ => &[],
        }
    }

    /// Sectors each pointer covers.
    #[must_use]
    pub fn sectors(&self) -> u32 {
        match &self.val {
            KeyVal::Extent { sectors, .. }
            | KeyVal::BtreePtr { sectors, .. }
            | KeyVal::Reservation { sectors, .. } => *sectors,
            KeyVal::Deleted | KeyVal::Inode => 0,
        }
    }

    /// Data type dirty pointers of this key are accounted under.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self.val {
            KeyVal::BtreePtr { .. } => DataType::Btree,
            KeyVal::Extent { .. } => DataType::User,
            _ => DataType::None,
        }
    }

    /// Replicas entry for the dirty pointers, if the key has any.
    #[must_use]
    pub fn dirty_replicas(&self) -> Option<ReplicasEntry> {
        let devs: Vec<DeviceIdx> = self
            .ptrs()
            .iter()
            .filter(|p| !p.cached)
            .map(|p| p.dev)
            .collect();
        if devs.is_empty() {
            return None;
        }
        Some(ReplicasEntry::new(self.data_type(), 1, devs))
    }
}

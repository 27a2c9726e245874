//! Table of replication configurations in use.
//!
//! Filesystem usage keeps one sector counter per entry, so the table only
//! grows: entries are appended when a key with a new device set is first
//! marked and never removed while the filesystem is live.

use bkt_error::{BktError, Result};
use bkt_types::{DataType, DeviceIdx, ForceFlags, MemberState, ReplicasEntry};
use std::fmt::Write as _;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicasTable {
    entries: Vec<ReplicasEntry>,
}

impl ReplicasTable {
    #[must_use]
    pub fn from_entries(entries: Vec<ReplicasEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.push(entry);
        }
        table
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[ReplicasEntry] {
        &self.entries
    }

    #[must_use]
    pub fn index_of(&self, entry: &ReplicasEntry) -> Option<usize> {
        self.entries.iter().position(|e| e == entry)
    }

    /// Append `entry` unless present; returns its index either way.
    pub fn push(&mut self, entry: ReplicasEntry) -> usize {
        if let Some(idx) = self.index_of(&entry) {
            return idx;
        }
        debug!(
            target: "bkt::usage",
            data_type = %entry.data_type,
            nr_required = entry.nr_required,
            nr_devs = entry.devs.len(),
            idx = self.entries.len(),
            "replicas_entry_added"
        );
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Force flags the given device states would need to stay mounted.
    ///
    /// An entry whose devices have all failed is ignored: that data is
    /// already gone and nothing can be done about it here.
    #[must_use]
    pub fn flags_needed(&self, state_of: impl Fn(DeviceIdx) -> Option<MemberState>) -> ForceFlags {
        let mut needed = ForceFlags::NONE;
        for entry in &self.entries {
            needed = needed.union(entry_flags(entry, &state_of));
        }
        needed
    }

    /// Fail unless the device states leave every entry readable, or the
    /// shortfall is covered by `flags`.
    pub fn have_enough_devs(
        &self,
        state_of: impl Fn(DeviceIdx) -> Option<MemberState>,
        flags: ForceFlags,
    ) -> Result<()> {
        for entry in &self.entries {
            let needed = entry_flags(entry, &state_of);
            if !flags.contains(needed) {
                let mut msg = String::new();
                let _ = write!(
                    msg,
                    "{} replicas on [{}] need {} of {} devices",
                    entry.data_type,
                    entry
                        .devs
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" "),
                    entry.nr_required,
                    entry.devs.len()
                );
                return Err(BktError::InsufficientDevices(msg));
            }
        }
        Ok(())
    }

    /// Entries that include `dev`.
    pub fn entries_on(&self, dev: DeviceIdx) -> impl Iterator<Item = (usize, &ReplicasEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.devs.contains(&dev))
    }
}

fn entry_flags(
    entry: &ReplicasEntry,
    state_of: &impl Fn(DeviceIdx) -> Option<MemberState>,
) -> ForceFlags {
    let mut online = 0_usize;
    let mut failed = 0_usize;
    for dev in &entry.devs {
        match state_of(*dev) {
            Some(state) if state.holds_replicas() => online += 1,
            Some(MemberState::Failed) | None => failed += 1,
            Some(_) => {}
        }
    }
    if failed == entry.devs.len() {
        return ForceFlags::NONE;
    }

    let mut flags = ForceFlags::NONE;
    if online < usize::from(entry.nr_required) {
        flags = flags.union(if entry.is_metadata() {
            ForceFlags::METADATA_LOST
        } else {
            ForceFlags::DATA_LOST
        });
    }
    if online < entry.devs.len() {
        flags = flags.union(ForceFlags::DEGRADED);
    }
    flags
}

/// Replicas entry for a cached pointer: one copy, never required.
#[must_use]
pub fn cached_entry(dev: DeviceIdx) -> ReplicasEntry {
    ReplicasEntry::new(DataType::Cached, 1, vec![dev])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(v: &[MemberState]) -> impl Fn(DeviceIdx) -> Option<MemberState> + '_ {
        move |d| v.get(d.0 as usize).copied()
    }

    fn mirrored() -> ReplicasTable {
        ReplicasTable::from_entries(vec![
            ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(0), DeviceIdx(1)]),
            ReplicasEntry::new(DataType::Btree, 1, vec![DeviceIdx(0), DeviceIdx(1)]),
        ])
    }

    #[test]
    fn push_is_idempotent() {
        let mut t = ReplicasTable::default();
        let a = t.push(ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(1), DeviceIdx(0)]));
        let b = t.push(ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(0), DeviceIdx(1)]));
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
        assert_eq!(t.push(cached_entry(DeviceIdx(0))), 1);
    }

    #[test]
    fn losing_one_mirror_is_degraded() {
        let t = mirrored();
        let s = [MemberState::Rw, MemberState::Failed];
        assert_eq!(t.flags_needed(states(&s)), ForceFlags::DEGRADED);
        assert!(t.have_enough_devs(states(&s), ForceFlags::NONE).is_err());
        assert!(t.have_enough_devs(states(&s), ForceFlags::DEGRADED).is_ok());
    }

    #[test]
    fn losing_sole_copy_needs_lost_flags() {
        let t = ReplicasTable::from_entries(vec![
            ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(0)]),
            ReplicasEntry::new(DataType::Btree, 2, vec![DeviceIdx(0), DeviceIdx(1)]),
        ]);
        let s = [MemberState::Spare, MemberState::Rw];
        let needed = t.flags_needed(states(&s));
        assert!(needed.contains(ForceFlags::DATA_LOST));
        assert!(needed.contains(ForceFlags::METADATA_LOST));
        assert!(needed.contains(ForceFlags::DEGRADED));
        let err = t
            .have_enough_devs(states(&s), ForceFlags::DEGRADED)
            .unwrap_err();
        assert!(err.to_string().contains("user replicas on [0]"));
    }

    #[test]
    fn all_failed_entry_is_ignored() {
        let t = ReplicasTable::from_entries(vec![ReplicasEntry::new(
            DataType::User,
            1,
            vec![DeviceIdx(0)],
        )]);
        let s = [MemberState::Failed];
        assert_eq!(t.flags_needed(states(&s)), ForceFlags::NONE);
    }

    #[test]
    fn ro_devices_still_hold_replicas() {
        let t = mirrored();
        let s = [MemberState::Ro, MemberState::Ro];
        assert!(t.have_enough_devs(states(&s), ForceFlags::NONE).is_ok());
        assert_eq!(t.entries_on(DeviceIdx(1)).count(), 2);
    }
}

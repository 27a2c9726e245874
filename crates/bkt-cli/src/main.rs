#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bkt_buckets::{Filesystem, FsOptions, ReplicasTable};
use bkt_types::{DeviceIdx, ForceFlags, MemberState, MemberTable};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
struct MemberRow {
    dev: u32,
    state: MemberState,
    nbuckets: u64,
    first_bucket: u16,
    bucket_size: u16,
    sectors: u64,
}

#[derive(Debug, Serialize)]
struct ShowOutput {
    seq: u64,
    members: Vec<MemberRow>,
    replicas: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DeviceUsageRow {
    dev: u32,
    state: MemberState,
    buckets_available: u64,
    buckets_reclaimable: u64,
}

#[derive(Debug, Serialize)]
struct UsageOutput {
    capacity: u64,
    used: u64,
    free: u64,
    devices: Vec<DeviceUsageRow>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "show" => {
            let Some(path) = positional(&rest).first().copied() else {
                bail!("show requires a member-table path");
            };
            show(Path::new(path), has_flag(&rest, "--json"))
        }
        "usage" => {
            let Some(path) = positional(&rest).first().copied() else {
                bail!("usage requires a member-table path");
            };
            usage(Path::new(path), has_flag(&rest, "--json"))
        }
        "set-state" => {
            let pos = positional(&rest);
            let [state, dev, path] = pos.as_slice() else {
                bail!("set-state requires <rw|ro|failed|spare> <devid> <table>");
            };
            let Some(state) = MemberState::parse(state) else {
                bail!("invalid state: {state} (expected rw, ro, failed or spare)");
            };
            let mut flags = ForceFlags::NONE;
            if has_flag(&rest, "--force") {
                flags = flags.union(ForceFlags::DEGRADED);
            }
            if has_flag(&rest, "--force-if-data-lost") {
                flags = flags.union(ForceFlags::DEGRADED).union(ForceFlags::LOST);
            }
            set_state(Path::new(path), parse_dev(dev)?, state, flags)
        }
        "resize" => {
            let pos = positional(&rest);
            let [dev, nbuckets, path] = pos.as_slice() else {
                bail!("resize requires <devid> <nbuckets> <table>");
            };
            let nbuckets: u64 = nbuckets
                .parse()
                .with_context(|| format!("invalid bucket count: {nbuckets}"))?;
            resize(Path::new(path), parse_dev(dev)?, nbuckets)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("bkt\n");
    println!("USAGE:");
    println!("  bkt show <table> [--json]");
    println!("  bkt usage <table> [--json]");
    println!("  bkt set-state <rw|ro|failed|spare> <devid> <table> [--force] [--force-if-data-lost]");
    println!("  bkt resize <devid> <nbuckets> <table>");
}

fn positional(args: &[String]) -> Vec<&str> {
    args.iter()
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_dev(s: &str) -> Result<DeviceIdx> {
    let idx: u32 = s
        .parse()
        .with_context(|| format!("invalid device index: {s}"))?;
    Ok(DeviceIdx(idx))
}

fn load(path: &Path) -> Result<MemberTable> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    bkt_buckets::read_member_table(&bytes)
        .with_context(|| format!("failed to parse member table {}", path.display()))
}

fn store(path: &Path, table: &MemberTable) -> Result<()> {
    let bytes = table.to_bytes().context("failed to encode member table")?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn open(table: &MemberTable) -> Result<Filesystem> {
    Filesystem::from_members(FsOptions::default(), table).context("failed to bring up members")
}

fn member_of(table: &MemberTable, dev: DeviceIdx) -> Result<usize> {
    let i = usize::try_from(dev.0)?;
    if i >= table.members.len() {
        bail!("no device {dev} (table has {})", table.members.len());
    }
    Ok(i)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn show(path: &Path, json: bool) -> Result<()> {
    let table = load(path)?;
    let output = ShowOutput {
        seq: table.seq,
        members: table
            .members
            .iter()
            .zip(0_u32..)
            .map(|(m, dev)| MemberRow {
                dev,
                state: m.state,
                nbuckets: m.nbuckets,
                first_bucket: m.first_bucket,
                bucket_size: m.bucket_size,
                sectors: m.usable_buckets() * u64::from(m.bucket_size),
            })
            .collect(),
        replicas: table
            .replicas
            .iter()
            .map(|e| {
                let devs: Vec<String> = e.devs.iter().map(ToString::to_string).collect();
                format!("{}: {}/{} [{}]", e.data_type, e.nr_required, e.devs.len(), devs.join(" "))
            })
            .collect(),
    };

    if json {
        return print_json(&output);
    }
    println!("seq: {}", output.seq);
    for m in &output.members {
        println!(
            "dev {}: state={} nbuckets={} first_bucket={} bucket_size={} sectors={}",
            m.dev, m.state, m.nbuckets, m.first_bucket, m.bucket_size, m.sectors
        );
    }
    for r in &output.replicas {
        println!("replicas {r}");
    }
    Ok(())
}

fn usage(path: &Path, json: bool) -> Result<()> {
    let table = load(path)?;
    let fs = open(&table)?;
    let short = fs.fs_usage_read_short();
    let mut devices = Vec::new();
    for dev in fs.devices() {
        let idx = dev.idx();
        devices.push(DeviceUsageRow {
            dev: idx.0,
            state: dev.state(),
            buckets_available: fs.dev_buckets_available(idx)?,
            buckets_reclaimable: fs.dev_buckets_reclaimable(idx)?,
        });
    }

    if json {
        return print_json(&UsageOutput {
            capacity: short.capacity,
            used: short.used,
            free: short.free,
            devices,
        });
    }
    print!("{}", fs.usage_to_text());
    for d in &devices {
        println!(
            "dev {} ({}): available {} reclaimable {}",
            d.dev, d.state, d.buckets_available, d.buckets_reclaimable
        );
    }
    Ok(())
}

/// Whether moving `dev` to `state` leaves the filesystem usable, given the
/// force flags the operator passed.
fn state_allowed(
    table: &MemberTable,
    dev: DeviceIdx,
    state: MemberState,
    flags: ForceFlags,
) -> Result<()> {
    let i = member_of(table, dev)?;
    let current = table.members[i].state;
    match state {
        MemberState::Rw => Ok(()),
        MemberState::Ro => {
            let other_rw = table
                .members
                .iter()
                .enumerate()
                .any(|(j, m)| j != i && m.state.allocates());
            if current.allocates() && !other_rw && !flags.contains(ForceFlags::DEGRADED) {
                bail!("no other read-write device would remain (use --force)");
            }
            Ok(())
        }
        MemberState::Failed | MemberState::Spare => {
            let replicas = ReplicasTable::from_entries(table.replicas.clone());
            let state_of = |d: DeviceIdx| {
                if d == dev {
                    return Some(state);
                }
                usize::try_from(d.0)
                    .ok()
                    .and_then(|j| table.members.get(j))
                    .map(|m| m.state)
            };
            replicas
                .have_enough_devs(state_of, flags)
                .with_context(|| {
                    let needed = replicas.flags_needed(state_of);
                    let hint = if needed.contains(ForceFlags::DATA_LOST)
                        || needed.contains(ForceFlags::METADATA_LOST)
                    {
                        "--force-if-data-lost"
                    } else {
                        "--force"
                    };
                    format!("setting device {dev} {state} would lose redundancy (use {hint})")
                })?;
            Ok(())
        }
    }
}

fn set_state(path: &Path, dev: DeviceIdx, state: MemberState, flags: ForceFlags) -> Result<()> {
    let table = load(path)?;
    state_allowed(&table, dev, state, flags)?;

    let fs = open(&table)?;
    fs.set_member_state(dev, state)?;
    store(path, &fs.member_table(table.seq + 1))?;
    eprintln!("device {dev}: {} -> {state}", table.members[member_of(&table, dev)?].state);
    Ok(())
}

fn resize(path: &Path, dev: DeviceIdx, nbuckets: u64) -> Result<()> {
    let table = load(path)?;
    member_of(&table, dev)?;
    let fs = open(&table)?;
    fs.dev_resize(dev, nbuckets)
        .with_context(|| format!("failed to resize device {dev}"))?;
    store(path, &fs.member_table(table.seq + 1))?;
    eprintln!("device {dev}: {nbuckets} buckets");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkt_types::{DataType, Member, ReplicasEntry};

    fn write_table(dir: &tempfile::TempDir, table: &MemberTable) -> std::path::PathBuf {
        let path = dir.path().join("members.bin");
        store(&path, table).expect("store");
        path
    }

    fn mirrored() -> MemberTable {
        MemberTable {
            seq: 3,
            members: vec![Member::new(1000, 128), Member::new(1000, 128)],
            replicas: vec![
                ReplicasEntry::new(DataType::User, 1, vec![DeviceIdx(0), DeviceIdx(1)]),
                ReplicasEntry::new(DataType::Btree, 2, vec![DeviceIdx(0), DeviceIdx(1)]),
            ],
        }
    }

    #[test]
    fn resize_grows_and_bumps_seq() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_table(&dir, &mirrored());
        resize(&path, DeviceIdx(1), 1500).expect("grow");
        let table = load(&path).expect("load");
        assert_eq!(table.seq, 4);
        assert_eq!(table.members[1].nbuckets, 1500);
        assert_eq!(table.replicas, mirrored().replicas);
    }

    #[test]
    fn resize_refuses_shrink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_table(&dir, &mirrored());
        let err = resize(&path, DeviceIdx(0), 10).unwrap_err();
        assert!(format!("{err:#}").contains("shrink"), "{err:#}");
        assert_eq!(load(&path).expect("load").seq, 3);
    }

    #[test]
    fn failing_a_mirror_needs_data_lost_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_table(&dir, &mirrored());

        let err = set_state(&path, DeviceIdx(1), MemberState::Failed, ForceFlags::NONE)
            .unwrap_err();
        assert!(format!("{err:#}").contains("--force-if-data-lost"), "{err:#}");
        // Degraded alone does not cover btree needing both copies.
        assert!(set_state(&path, DeviceIdx(1), MemberState::Failed, ForceFlags::DEGRADED).is_err());

        let flags = ForceFlags::DEGRADED.union(ForceFlags::LOST);
        set_state(&path, DeviceIdx(1), MemberState::Failed, flags).expect("forced");
        let table = load(&path).expect("load");
        assert_eq!(table.members[1].state, MemberState::Failed);
        assert_eq!(table.seq, 4);
    }

    #[test]
    fn last_rw_device_needs_force_to_go_ro() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut table = mirrored();
        table.members[1].state = MemberState::Ro;
        let path = write_table(&dir, &table);
        assert!(set_state(&path, DeviceIdx(0), MemberState::Ro, ForceFlags::NONE).is_err());
        set_state(&path, DeviceIdx(0), MemberState::Ro, ForceFlags::DEGRADED).expect("forced");
        set_state(&path, DeviceIdx(0), MemberState::Rw, ForceFlags::NONE).expect("back to rw");
    }

    #[test]
    fn unknown_device_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_table(&dir, &mirrored());
        let err = resize(&path, DeviceIdx(9), 2000).unwrap_err();
        assert!(err.to_string().contains("no device 9"), "{err}");
    }

    #[test]
    fn show_and_usage_run_on_a_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_table(&dir, &mirrored());
        show(&path, false).expect("show");
        show(&path, true).expect("show json");
        usage(&path, true).expect("usage json");
    }
}

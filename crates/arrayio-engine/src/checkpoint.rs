//! Checkpoint tracker.
//!
//! Per (drive, partition, kind) progress markers for rebuild, verify, zero
//! and expansion, plus the dirty-region bookkeeping that lets a drive which
//! was briefly out rebuild only what changed while it was gone.
//!
//! The `*_in` functions operate inside an open store transaction so other
//! components can compose them with their own record changes; the
//! [`CheckpointTracker`] methods wrap each in a transaction of its own.

use crate::store::{ObjectStore, ObjectView, Txn};
use arrayio_common::{
    BackgroundService, CheckpointEntry, CheckpointKind, Error, FruId, Lba, OpState,
    PartitionRecord, RaidGroupId, Result, SpareKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn partition<'v>(view: &'v impl ObjectView, fru: FruId, index: u8) -> Result<&'v PartitionRecord> {
    view.fru(fru)?.partition(index)
}

/// Move a checkpoint forward to `new_offset`.
///
/// Reaching the partition end completes the operation and clears whatever
/// flag was waiting on it. Returns whether the operation completed.
pub fn advance_in(
    txn: &mut Txn<'_>,
    kind: CheckpointKind,
    fru: FruId,
    index: u8,
    new_offset: Lba,
) -> Result<bool> {
    let drive = txn.fru(fru)?;
    if !drive.is_ready() {
        return Err(Error::invalid_transition(format!(
            "{fru} is {}, cannot advance {kind}",
            drive.state
        )));
    }
    let p = drive.partition(index)?;
    let (current, end) = (p.normalized(kind), p.end);
    if p.checkpoint(kind).is_complete() && new_offset == end {
        return Ok(true);
    }
    if new_offset < current || new_offset > end {
        return Err(Error::invalid_transition(format!(
            "{fru} partition {index} {kind}: {current} -> {new_offset} (end {end})"
        )));
    }

    let p = txn.fru_mut(fru)?.partition_mut(index)?;
    *p.checkpoint_mut(kind) = CheckpointEntry {
        value: new_offset,
        state: OpState::InProgress,
    };
    if kind == CheckpointKind::Rebuild {
        p.dirty.clear_below(new_offset);
    }
    let raid_group = p.raid_group;

    let completed = new_offset == end;
    if completed {
        complete_in(txn, kind, fru, index)?;
    }
    if kind == CheckpointKind::Expansion {
        update_expansion_in(txn, raid_group)?;
    }
    Ok(completed)
}

/// Mark a partition's operation complete and run the owning flag's
/// completion check
fn complete_in(txn: &mut Txn<'_>, kind: CheckpointKind, fru: FruId, index: u8) -> Result<()> {
    let drive = txn.fru_mut(fru)?;
    let p = drive.partition_mut(index)?;
    *p.checkpoint_mut(kind) = CheckpointEntry::COMPLETE;
    let raid_group = p.raid_group;
    if kind == CheckpointKind::Rebuild {
        p.needs_rebuild = false;
        p.dirty.clear();
        p.rebuild_from = p.end;
        drive.logging.remove(&index);
        info!("{} partition {}: rebuild complete", fru, index);
    } else {
        debug!("{} partition {}: {} complete", fru, index, kind);
    }

    match kind {
        CheckpointKind::Rebuild => {}
        CheckpointKind::Verify => {
            if all_members_complete(txn, raid_group, kind)? {
                let lus = txn.raid_group(raid_group)?.record.lus.clone();
                for lu in lus {
                    txn.lu_mut(lu)?.record.flags.needs_background_verify = false;
                }
            }
        }
        CheckpointKind::Zero => {
            if all_members_complete(txn, raid_group, kind)? {
                txn.raid_group_mut(raid_group)?.record.flags.zeroing = false;
            }
        }
        CheckpointKind::Expansion => update_expansion_in(txn, raid_group)?,
    }
    Ok(())
}

/// Every member partition of the group has finished `kind`
pub fn all_members_complete(
    view: &impl ObjectView,
    raid_group: RaidGroupId,
    kind: CheckpointKind,
) -> Result<bool> {
    let group = view.raid_group(raid_group)?;
    Ok(group.record.members.iter().all(|member| {
        view.fru(*member).is_ok_and(|f| {
            f.record
                .partition_for(raid_group)
                .is_some_and(|p| p.checkpoint(kind).is_complete())
        })
    }))
}

/// Fold member expansion progress into the group's expansion checkpoints
fn update_expansion_in(txn: &mut Txn<'_>, raid_group: RaidGroupId) -> Result<()> {
    let group = txn.raid_group(raid_group)?;
    if !group.record.flags.expanding {
        return Ok(());
    }
    let offset = group.record.address_offset;
    let data_disks = group.record.raid_type.data_disks(group.record.width()) as u64;

    let mut physical = Lba::MAX;
    let mut all_complete = true;
    for member in &group.record.members {
        let p = txn
            .fru(*member)?
            .record
            .partition_for(raid_group)
            .ok_or_else(|| Error::not_found(format!("{member} partition for {raid_group}")))?;
        physical = physical.min(p.normalized(CheckpointKind::Expansion));
        all_complete &= p.checkpoint(CheckpointKind::Expansion).is_complete();
    }

    let group = txn.raid_group_mut(raid_group)?;
    if all_complete {
        group.record.flags.expanding = false;
        group.record.expansion = arrayio_common::ExpansionCheckpoints::default();
        group.record.ending_address = physical;
        info!("{}: expansion complete, ending address {}", raid_group, physical);
    } else {
        group.record.expansion.physical = physical;
        group.record.expansion.logical = physical.saturating_sub(offset) * data_disks;
    }
    Ok(())
}

/// Start logging writes for a partition whose drive just left Ready.
///
/// Idempotent; the captured rebuild checkpoint is left where it was.
pub fn start_rebuild_logging_in(txn: &mut Txn<'_>, fru: FruId, index: u8) -> Result<()> {
    let drive = txn.fru_mut(fru)?;
    drive.partition_mut(index)?.needs_rebuild = true;
    if drive.logging.insert(index) {
        debug!("{} partition {}: rebuild logging started", fru, index);
    }
    Ok(())
}

/// Record a completed host write against a RAID group range.
///
/// The range is mapped onto each member's extent and rounded out to
/// `chunk_blocks`; it is marked dirty on every member partition that is
/// logging. Returns the number of partitions marked.
pub fn record_write_in(
    txn: &mut Txn<'_>,
    raid_group: RaidGroupId,
    lba: Lba,
    blocks: u64,
    chunk_blocks: u64,
) -> Result<usize> {
    if blocks == 0 {
        return Ok(0);
    }
    let group = txn.raid_group(raid_group)?;
    let data_disks = (group.record.raid_type.data_disks(group.record.width()) as u64).max(1);
    let chunk = chunk_blocks.max(1);
    let offset = group.record.address_offset;
    let member_start = offset + lba / data_disks;
    let member_end = offset + lba.saturating_add(blocks).div_ceil(data_disks);
    let start = member_start / chunk * chunk;
    let end = member_end.div_ceil(chunk) * chunk;

    let logging: Vec<(FruId, u8)> = group
        .record
        .members
        .iter()
        .filter_map(|member| {
            let f = txn.fru(*member).ok()?;
            let p = f.record.partition_for(raid_group)?;
            f.is_logging(p.index).then_some((*member, p.index))
        })
        .collect();

    for (fru, index) in &logging {
        let p = txn.fru_mut(*fru)?.partition_mut(*index)?;
        let (lo, hi) = (start.max(p.start), end.min(p.end));
        p.dirty.insert(lo, hi);
    }
    Ok(logging.len())
}

/// Restart the rebuild of a logged partition after its drive returned.
///
/// The checkpoint restarts at the lower of the captured checkpoint and the
/// first dirty block; blocks below the captured point are rebuilt only where
/// dirty. The completion check always runs, so an outage with no writes
/// completes at once.
pub fn resume_in(txn: &mut Txn<'_>, fru: FruId, index: u8) -> Result<()> {
    let drive = txn.fru(fru)?;
    if !drive.is_logging(index) {
        return Err(Error::invalid_transition(format!(
            "{fru} partition {index}: rebuild logging not active"
        )));
    }
    if !drive.is_ready() {
        return Err(Error::invalid_transition(format!(
            "{fru} is {}, cannot resume rebuild",
            drive.state
        )));
    }
    let p = drive.partition(index)?;
    let captured = p.normalized(CheckpointKind::Rebuild);
    let restart = p.dirty.first_block().map_or(captured, |d| d.min(captured));
    let end = p.end;

    let drive = txn.fru_mut(fru)?;
    drive.logging.remove(&index);
    let p = drive.partition_mut(index)?;
    p.rebuild_from = p.rebuild_from.max(captured);
    *p.checkpoint_mut(CheckpointKind::Rebuild) = CheckpointEntry::starting_at(restart);
    debug!(
        "{} partition {}: rebuild resumes at {} ({} dirty blocks)",
        fru,
        index,
        restart,
        p.dirty.total_blocks()
    );

    if restart >= end || (p.dirty.is_empty() && p.rebuild_from >= end) {
        complete_in(txn, CheckpointKind::Rebuild, fru, index)?;
    }
    Ok(())
}

/// Rebuild a partition in full; used when no logging covered its outage
pub fn restart_full_rebuild_in(txn: &mut Txn<'_>, fru: FruId, index: u8) -> Result<()> {
    let drive = txn.fru_mut(fru)?;
    drive.logging.remove(&index);
    let p = drive.partition_mut(index)?;
    let start = p.start;
    p.needs_rebuild = true;
    p.rebuild_from = start;
    p.dirty.clear();
    *p.checkpoint_mut(CheckpointKind::Rebuild) = CheckpointEntry::starting_at(start);
    info!("{} partition {}: full rebuild from {}", fru, index, start);
    Ok(())
}

/// Start logging for members that are out while their group is usable but
/// have no logging yet, e.g. a second member lost while the group was
/// broken. Nothing covered their outage, so each rebuilds in full on return.
/// Returns the number of partitions that started logging.
pub fn log_absent_members_in(txn: &mut Txn<'_>, raid_group: RaidGroupId) -> Result<usize> {
    if !txn.is_usable(raid_group) {
        return Ok(0);
    }
    let absent: Vec<(FruId, u8)> = txn
        .raid_group(raid_group)?
        .record
        .members
        .iter()
        .filter_map(|member| {
            let f = txn.fru(*member).ok()?;
            let p = f.record.partition_for(raid_group)?;
            (!f.is_ready() && !p.copy_source && !f.is_logging(p.index))
                .then_some((*member, p.index))
        })
        .collect();
    for (fru, index) in &absent {
        restart_full_rebuild_in(txn, *fru, *index)?;
        txn.fru_mut(*fru)?
            .partition_mut(*index)?
            .checkpoint_mut(CheckpointKind::Rebuild)
            .state = OpState::Idle;
        start_rebuild_logging_in(txn, *fru, *index)?;
        warn!("{} partition {}: outage unlogged, full rebuild on return", fru, index);
    }
    Ok(absent.len())
}

/// Restart a verify or zero pass at the partition start
pub fn request_in(txn: &mut Txn<'_>, kind: CheckpointKind, fru: FruId, index: u8) -> Result<()> {
    if !matches!(kind, CheckpointKind::Verify | CheckpointKind::Zero) {
        return Err(Error::invalid_argument(format!(
            "{kind} cannot be requested directly"
        )));
    }
    let drive = txn.fru_mut(fru)?;
    let ready = drive.is_ready();
    let p = drive.partition_mut(index)?;
    let start = p.start;
    *p.checkpoint_mut(kind) = CheckpointEntry {
        value: start,
        state: if ready {
            OpState::InProgress
        } else {
            OpState::Idle
        },
    };
    Ok(())
}

/// Park every running operation of a drive that left Ready
pub fn suspend_in(txn: &mut Txn<'_>, fru: FruId) -> Result<()> {
    for p in &mut txn.fru_mut(fru)?.record.partitions {
        for entry in &mut p.checkpoints {
            if entry.state == OpState::InProgress {
                entry.state = OpState::Idle;
            }
        }
    }
    Ok(())
}

/// Restart parked operations of a drive that is Ready again
pub fn reactivate_in(txn: &mut Txn<'_>, fru: FruId) -> Result<()> {
    for p in &mut txn.fru_mut(fru)?.record.partitions {
        for entry in &mut p.checkpoints {
            if entry.state == OpState::Idle && !entry.is_complete() {
                entry.state = OpState::InProgress;
            }
        }
    }
    Ok(())
}

/// Next range to process, or `None` when the operation is complete.
///
/// For rebuild, clean blocks below the captured point are skipped: the
/// range is either the next dirty region or the start of the full sweep.
/// The returned range may be empty when all that is left is to move the
/// checkpoint to the end.
pub fn next_work_range(
    view: &impl ObjectView,
    kind: CheckpointKind,
    fru: FruId,
    index: u8,
    max_blocks: u64,
) -> Result<Option<(Lba, Lba)>> {
    let p = partition(view, fru, index)?;
    if p.checkpoint(kind).is_complete() {
        return Ok(None);
    }
    let cp = p.normalized(kind);
    let end = p.end;
    let max = max_blocks.max(1);
    if cp >= end {
        return Ok(Some((end, end)));
    }
    if kind != CheckpointKind::Rebuild || cp >= p.rebuild_from {
        return Ok(Some((cp, (cp + max).min(end))));
    }
    let from = p.rebuild_from.min(end);
    Ok(Some(match p.dirty.first_within(cp, from) {
        Some((start, stop)) => (start, stop.min(start + max)),
        None => (from, (from + max).min(end)),
    }))
}

/// Background service that drives `kind` on this partition
pub fn service_for(
    view: &impl ObjectView,
    kind: CheckpointKind,
    fru: FruId,
    index: u8,
) -> Result<BackgroundService> {
    Ok(match kind {
        CheckpointKind::Rebuild => {
            let raid_group = partition(view, fru, index)?.raid_group;
            let copying = view.fru_ids().into_iter().any(|id| {
                view.fru(id).is_ok_and(|f| {
                    f.record.spare_info.is_some_and(|s| {
                        s.kind == SpareKind::Proactive && s.replacement == fru
                    }) && f
                        .record
                        .partition_for(raid_group)
                        .is_some_and(|p| p.copy_source)
                })
            });
            if copying {
                BackgroundService::ProactiveCopy
            } else if view.raid_group(raid_group)?.record.raid_type.is_mirror() {
                BackgroundService::Equalize
            } else {
                BackgroundService::Rebuild
            }
        }
        CheckpointKind::Verify => BackgroundService::BackgroundVerify,
        CheckpointKind::Zero => BackgroundService::DiskZero,
        CheckpointKind::Expansion => BackgroundService::ExpansionDefrag,
    })
}

/// Service gated per LU for `kind`. Verify and zero passes cover every LU
/// bound on the group, so any one of those LUs can hold the pass off.
#[must_use]
pub const fn lu_service_for(kind: CheckpointKind) -> Option<BackgroundService> {
    match kind {
        CheckpointKind::Verify => Some(BackgroundService::BackgroundVerify),
        CheckpointKind::Zero => Some(BackgroundService::LunZero),
        CheckpointKind::Rebuild | CheckpointKind::Expansion => None,
    }
}

/// Transactional facade over the `*_in` operations
pub struct CheckpointTracker {
    store: Arc<ObjectStore>,
    chunk_blocks: u64,
}

impl CheckpointTracker {
    pub const fn new(store: Arc<ObjectStore>, chunk_blocks: u64) -> Self {
        Self {
            store,
            chunk_blocks,
        }
    }

    pub fn advance(
        &self,
        kind: CheckpointKind,
        fru: FruId,
        index: u8,
        new_offset: Lba,
    ) -> Result<bool> {
        self.store
            .transact(|txn| advance_in(txn, kind, fru, index, new_offset))
    }

    pub fn start_rebuild_logging(&self, fru: FruId, index: u8) -> Result<()> {
        self.store
            .transact(|txn| start_rebuild_logging_in(txn, fru, index))
    }

    pub fn record_write(&self, raid_group: RaidGroupId, lba: Lba, blocks: u64) -> Result<usize> {
        self.store.transact(|txn| {
            record_write_in(txn, raid_group, lba, blocks, self.chunk_blocks)
        })
    }

    pub fn resume(&self, fru: FruId, index: u8) -> Result<()> {
        self.store.transact(|txn| resume_in(txn, fru, index))
    }

    pub fn request(&self, kind: CheckpointKind, fru: FruId, index: u8) -> Result<()> {
        self.store.transact(|txn| request_in(txn, kind, fru, index))
    }

    pub fn next_work_range(
        &self,
        kind: CheckpointKind,
        fru: FruId,
        index: u8,
        max_blocks: u64,
    ) -> Result<Option<(Lba, Lba)>> {
        self.store
            .read(|t| next_work_range(t, kind, fru, index, max_blocks))
    }

    /// Current checkpoint entry
    pub fn checkpoint(&self, kind: CheckpointKind, fru: FruId, index: u8) -> Result<CheckpointEntry> {
        self.store
            .read(|t| partition(t, fru, index).map(|p| *p.checkpoint(kind)))
    }
}

//! Sparing engine.
//!
//! Classifies drives as spare candidates from their flags, picks a spare
//! for a failing or end-of-life member, and swaps it into the member table
//! in one store transaction. Hot sparing replaces a failed member outright;
//! proactive sparing copies a still-working member and detaches it once the
//! copy finishes.

use crate::arbiter::Arbiter;
use crate::checkpoint::{resume_in, start_rebuild_logging_in};
use crate::records::Fru;
use crate::store::{refresh_lus_in, ObjectStore, ObjectView, Txn};
use arrayio_common::config::{SparePolicy, SparingConfig};
use arrayio_common::{
    BackgroundService, CheckpointEntry, CheckpointKind, DeathReason, Error, FruId, FruState, Lba,
    PartitionRecord, ProbationState, RaidGroupId, RaidGroupState, Result, Scope, SpareInfo,
    SpareKind,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sparing role of a drive, derived purely from its flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SpareClass {
    HotSpareCandidate,
    ProactiveSpareCandidate,
    SparedIn,
    NotSpare,
}

#[must_use]
pub fn classify(fru: &Fru) -> SpareClass {
    let flags = &fru.record.flags;
    if flags.spared_in {
        SpareClass::SparedIn
    } else if flags.hot_spare && fru.record.partitions.is_empty() {
        SpareClass::HotSpareCandidate
    } else if flags.end_of_life
        && !fru.record.partitions.is_empty()
        && fru.record.spare_info.is_none()
    {
        SpareClass::ProactiveSpareCandidate
    } else {
        SpareClass::NotSpare
    }
}

/// Ready, not in probation, and not mid-update or mid-swap
#[must_use]
pub fn check_stable(fru: &Fru) -> bool {
    fru.is_ready()
        && fru.probation == ProbationState::Idle
        && !fru.runtime.update_in_progress
        && !fru.runtime.swap_in_progress
}

/// Blocks a replacement must hold to take over every extent of `target`
fn required_capacity(target: &Fru) -> Lba {
    target
        .record
        .partitions
        .iter()
        .map(|p| p.end)
        .max()
        .unwrap_or(0)
}

/// Hard rules a spare must pass to replace `target`
#[must_use]
pub fn is_compatible(spare: &Fru, target: &Fru) -> bool {
    spare.id != target.id
        && classify(spare) == SpareClass::HotSpareCandidate
        && check_stable(spare)
        && spare.record.drive_type == target.record.drive_type
        && spare.record.block_size == target.record.block_size
        && spare.record.capacity >= required_capacity(target)
}

/// Pick a spare for `for_fru` among `candidates`, deterministically
pub fn select_spare(
    view: &impl ObjectView,
    for_fru: FruId,
    candidates: &[FruId],
    policy: SparePolicy,
) -> Result<FruId> {
    let target = view.fru(for_fru)?;
    let mut eligible: Vec<&Fru> = candidates
        .iter()
        .filter_map(|id| view.fru(*id).ok())
        .filter(|spare| is_compatible(spare, target))
        .collect();
    match policy {
        SparePolicy::FirstFit => eligible.sort_by_key(|f| f.id),
        SparePolicy::BestFit => {
            let enclosure = (target.record.location.bus, target.record.location.enclosure);
            eligible.sort_by_key(|f| {
                let location = (f.record.location.bus, f.record.location.enclosure);
                (location != enclosure, f.record.capacity, f.id)
            });
        }
    }
    eligible
        .first()
        .map(|f| f.id)
        .ok_or_else(|| Error::NoCandidate(format!("no compatible spare for {for_fru}")))
}

/// Swap `spare` in for `target` on every group `target` belongs to
pub fn swap_in_in(txn: &mut Txn<'_>, spare: FruId, target: FruId, kind: SpareKind) -> Result<()> {
    if spare == target {
        return Err(Error::invalid_argument(format!("{target} cannot spare itself")));
    }
    let t = txn.fru(target)?;
    if t.record.partitions.is_empty() {
        return Err(Error::invalid_argument(format!(
            "{target} is not a member of any raid group"
        )));
    }
    if t.runtime.swap_in_progress || t.record.spare_info.is_some() {
        return Err(Error::Busy(format!("{target} is already being spared")));
    }
    if kind == SpareKind::Proactive && !t.is_ready() {
        return Err(Error::invalid_transition(format!(
            "{target} is {}, cannot be a copy source",
            t.state
        )));
    }
    for p in &t.record.partitions {
        let group = txn.raid_group(p.raid_group)?;
        if group.is_reconfiguring() {
            return Err(Error::unstable(p.raid_group, "reconfiguration in progress"));
        }
        if txn.raid_group_state(p.raid_group)? == RaidGroupState::Broken {
            return Err(Error::unstable(p.raid_group, "redundancy lost"));
        }
        if group.record.members.get(usize::from(p.position)) != Some(&target) {
            return Err(Error::internal(format!(
                "{target} is not at position {} of {}",
                p.position, p.raid_group
            )));
        }
    }
    if !is_compatible(txn.fru(spare)?, t) {
        return Err(Error::NoCandidate(format!("{spare} cannot replace {target}")));
    }

    let partitions = t.record.partitions.clone();
    let max_partitions = txn.limits().max_partitions;
    for source in &partitions {
        let index = txn
            .fru(spare)?
            .record
            .free_partition_index(max_partitions)
            .ok_or_else(|| Error::ResourceExhausted(format!("{spare}: partition table full")))?;
        let mut partition = PartitionRecord::new(
            index,
            source.raid_group,
            source.position,
            source.start,
            source.end,
        );
        partition.needs_rebuild = true;
        partition.rebuild_from = source.start;
        *partition.checkpoint_mut(CheckpointKind::Rebuild) =
            CheckpointEntry::starting_at(source.start);
        txn.fru_mut(spare)?.record.partitions.push(partition);
        txn.raid_group_mut(source.raid_group)?.record.members[usize::from(source.position)] =
            spare;
        start_rebuild_logging_in(txn, spare, index)?;
        resume_in(txn, spare, index)?;

        let drive = txn.fru_mut(target)?;
        match kind {
            SpareKind::HotSpare => {
                drive.record.partitions.retain(|p| p.index != source.index);
                drive.logging.remove(&source.index);
            }
            SpareKind::Proactive => {
                drive.partition_mut(source.index)?.copy_source = true;
            }
        }
    }

    let drive = txn.fru_mut(spare)?;
    drive.record.flags.spared_in = true;
    drive.record.flags.hot_spare = false;
    txn.fru_mut(target)?.record.spare_info = Some(SpareInfo {
        kind,
        replacement: spare,
    });
    for source in &partitions {
        refresh_lus_in(txn, source.raid_group)?;
    }
    info!("{} swapped in for {} ({})", spare, target, kind);
    Ok(())
}

/// Detach the source of a finished proactive copy at `position`
pub fn swap_out_in(txn: &mut Txn<'_>, raid_group: RaidGroupId, position: usize) -> Result<FruId> {
    let spare = *txn
        .raid_group(raid_group)?
        .record
        .members
        .get(position)
        .ok_or_else(|| Error::not_found(format!("{raid_group} position {position}")))?;
    let source = txn
        .fru_ids()
        .into_iter()
        .find(|id| {
            txn.fru(*id).is_ok_and(|f| {
                f.record.spare_info
                    == Some(SpareInfo {
                        kind: SpareKind::Proactive,
                        replacement: spare,
                    })
                    && f.record
                        .partition_for(raid_group)
                        .is_some_and(|p| p.copy_source)
            })
        })
        .ok_or_else(|| {
            Error::invalid_argument(format!(
                "no proactive copy at {raid_group} position {position}"
            ))
        })?;

    let copied = txn
        .fru(spare)?
        .record
        .partition_for(raid_group)
        .is_some_and(|p| !p.needs_rebuild && p.checkpoint(CheckpointKind::Rebuild).is_complete());
    if !copied {
        return Err(Error::Busy(format!(
            "copy from {source} to {spare} still in progress"
        )));
    }

    let now = txn.now_secs();
    let drive = txn.fru_mut(source)?;
    drive.record.partitions.retain(|p| p.raid_group != raid_group);
    if drive.record.partitions.is_empty() {
        drive.record.death_reason = Some(DeathReason::ProactivelySpared);
        drive.transition(FruState::Faulted, now)?;
    }
    info!("{} detached from {} after proactive copy", source, raid_group);
    Ok(source)
}

/// Move a drive's probation state along a legal edge
pub fn probation_in(txn: &mut Txn<'_>, fru: FruId, next: ProbationState) -> Result<()> {
    let drive = txn.fru_mut(fru)?;
    if !drive.probation.can_transition_to(next) {
        return Err(Error::invalid_transition(format!(
            "{fru} probation {} -> {next}",
            drive.probation
        )));
    }
    debug!("{} probation {} -> {}", fru, drive.probation, next);
    drive.probation = next;
    Ok(())
}

/// Sparing work found by one scan
#[derive(Debug, Default)]
struct SparingScan {
    failed: Vec<(FruId, Vec<RaidGroupId>)>,
    worn: Vec<(FruId, Vec<RaidGroupId>)>,
    copied: Vec<(RaidGroupId, usize)>,
}

pub struct SparingEngine {
    store: Arc<ObjectStore>,
    arbiter: Arc<Arbiter>,
    config: SparingConfig,
}

impl SparingEngine {
    pub const fn new(store: Arc<ObjectStore>, arbiter: Arc<Arbiter>, config: SparingConfig) -> Self {
        Self {
            store,
            arbiter,
            config,
        }
    }

    pub fn classify(&self, fru: FruId) -> Result<SpareClass> {
        self.store.read(|t| t.fru(fru).map(classify))
    }

    pub fn check_stable(&self, fru: FruId) -> Result<bool> {
        self.store.read(|t| t.fru(fru).map(check_stable))
    }

    /// Pick among every drive in the array
    pub fn select_spare(&self, for_fru: FruId) -> Result<FruId> {
        self.store.read(|t| {
            let candidates = t.fru_ids();
            select_spare(t, for_fru, &candidates, self.config.policy)
        })
    }

    pub fn select_spare_from(&self, for_fru: FruId, candidates: &[FruId]) -> Result<FruId> {
        self.store
            .read(|t| select_spare(t, for_fru, candidates, self.config.policy))
    }

    pub fn swap_in(&self, spare: FruId, target: FruId, kind: SpareKind) -> Result<()> {
        self.store
            .transact(|txn| swap_in_in(txn, spare, target, kind))
    }

    /// Select a spare and swap it in within one transaction
    pub fn spare_for(&self, target: FruId, kind: SpareKind) -> Result<FruId> {
        let policy = self.config.policy;
        self.store.transact(|txn| {
            let candidates = txn.fru_ids();
            let spare = select_spare(txn, target, &candidates, policy)?;
            swap_in_in(txn, spare, target, kind)?;
            Ok(spare)
        })
    }

    pub fn swap_out(&self, raid_group: RaidGroupId, position: usize) -> Result<FruId> {
        self.store
            .transact(|txn| swap_out_in(txn, raid_group, position))
    }

    pub fn set_probation(&self, fru: FruId, next: ProbationState) -> Result<()> {
        self.store.transact(|txn| probation_in(txn, fru, next))
    }

    pub fn begin_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::Init)
    }

    pub fn activate_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::Active)
    }

    pub fn power_up_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::PoweringUp)
    }

    pub fn stop_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::Stopping)
    }

    pub fn cancel_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::Cancel)
    }

    pub fn finish_probation(&self, fru: FruId) -> Result<()> {
        self.set_probation(fru, ProbationState::Idle)
    }

    fn scan(&self, now: u64) -> SparingScan {
        let delay = self.config.permanent_spare_delay_secs;
        self.store.read(|t| {
            let mut scan = SparingScan::default();
            for fru in t.frus() {
                if fru.record.partitions.is_empty() {
                    continue;
                }
                let groups: Vec<RaidGroupId> = fru.raid_groups().collect();
                let out = matches!(fru.state, FruState::Removed | FruState::Faulted);
                if out
                    && fru.record.spare_info.is_none()
                    && fru.probation == ProbationState::Idle
                    && now.saturating_sub(fru.state_changed_at) >= delay
                {
                    scan.failed.push((fru.id, groups));
                } else if fru.is_ready() && classify(fru) == SpareClass::ProactiveSpareCandidate {
                    scan.worn.push((fru.id, groups));
                }
                if let Some(SpareInfo {
                    kind: SpareKind::Proactive,
                    replacement,
                }) = fru.record.spare_info
                {
                    for p in fru.record.partitions.iter().filter(|p| p.copy_source) {
                        let done = t.fru(replacement).is_ok_and(|spare| {
                            spare.record.partition_for(p.raid_group).is_some_and(|sp| {
                                !sp.needs_rebuild
                                    && sp.checkpoint(CheckpointKind::Rebuild).is_complete()
                            })
                        });
                        if done {
                            scan.copied.push((p.raid_group, usize::from(p.position)));
                        }
                    }
                }
            }
            scan
        })
    }

    fn try_spare(&self, target: FruId, raid_groups: &[RaidGroupId], kind: SpareKind) -> bool {
        let service = match kind {
            SpareKind::HotSpare => BackgroundService::Swap,
            SpareKind::Proactive => BackgroundService::ProactiveCopy,
        };
        // The swap replaces the drive in every group it belongs to
        let held = raid_groups.iter().any(|rg| {
            !self
                .arbiter
                .is_effective(service, Some(*rg), Some(Scope::Fru(target)))
        });
        if held {
            debug!("{} {} held off for {}", service, kind, target);
            return false;
        }
        match self.spare_for(target, kind) {
            Ok(_) => true,
            Err(e @ Error::NoCandidate(_)) => {
                debug!("{}: {}", target, e);
                false
            }
            Err(e) if e.is_retryable() => {
                debug!("{}: sparing deferred: {}", target, e);
                false
            }
            Err(e) => {
                warn!("{}: sparing failed: {}", target, e);
                false
            }
        }
    }

    /// Automatic sparing: replace members out for longer than the permanent
    /// sparing delay, start proactive copies of worn members, and detach
    /// finished copy sources. Returns the number of swaps performed.
    pub fn auto_pass(&self) -> usize {
        if !self.config.auto_swap {
            return 0;
        }
        let scan = self.scan(self.store.now_secs());
        let mut swaps = 0;
        for (target, raid_groups) in scan.failed {
            swaps += usize::from(self.try_spare(target, &raid_groups, SpareKind::HotSpare));
        }
        for (target, raid_groups) in scan.worn {
            swaps += usize::from(self.try_spare(target, &raid_groups, SpareKind::Proactive));
        }
        for (raid_group, position) in scan.copied {
            match self.swap_out(raid_group, position) {
                Ok(_) => swaps += 1,
                Err(e) => debug!("{} position {}: swap out deferred: {}", raid_group, position, e),
            }
        }
        swaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::advance_in;
    use crate::persist::PersistQueue;
    use crate::records::RaidGroup;
    use crate::testutil::{add_fru, add_group, fru_record, test_store, TestStore};
    use arrayio_common::{DriveType, RaidType, Requestor, SpId};

    const END: Lba = 10_000;

    fn engine(ts: &TestStore, policy: SparePolicy) -> SparingEngine {
        let arbiter = Arc::new(Arbiter::new(Arc::new(PersistQueue::new()), SpId::A, 100));
        SparingEngine::new(
            ts.store.clone(),
            arbiter,
            SparingConfig {
                policy,
                permanent_spare_delay_secs: 300,
                auto_swap: true,
            },
        )
    }

    fn hot_spare(ts: &TestStore, enclosure: u8, slot: u16, capacity: u64) -> FruId {
        let mut record = fru_record(enclosure, slot, capacity);
        record.flags.hot_spare = true;
        add_fru(&ts.store, record)
    }

    fn fail(ts: &TestStore, fru: FruId, state: FruState) {
        ts.store
            .transact(|txn| {
                let now = txn.now_secs();
                txn.fru_mut(fru)?.transition(state, now)
            })
            .unwrap();
    }

    fn finish_rebuild(ts: &TestStore, fru: FruId) {
        ts.store
            .transact(|txn| {
                let index = txn.fru(fru)?.record.partitions[0].index;
                advance_in(txn, CheckpointKind::Rebuild, fru, index, END).map(|_| ())
            })
            .unwrap();
    }

    #[test]
    fn test_classify() {
        let ts = test_store();
        let (_, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        assert_eq!(sparing.classify(spare).unwrap(), SpareClass::HotSpareCandidate);
        assert_eq!(sparing.classify(members[0]).unwrap(), SpareClass::NotSpare);

        ts.store
            .transact(|txn| {
                txn.fru_mut(members[0])?.record.flags.end_of_life = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            sparing.classify(members[0]).unwrap(),
            SpareClass::ProactiveSpareCandidate
        );
    }

    #[test]
    fn test_first_fit_is_deterministic() {
        let ts = test_store();
        let (_, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let small = hot_spare(&ts, 0, 10, END / 2);
        let a = hot_spare(&ts, 1, 11, END * 4);
        let b = hot_spare(&ts, 0, 12, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);

        let forward = sparing
            .select_spare_from(members[0], &[small, b, a])
            .unwrap();
        let reverse = sparing
            .select_spare_from(members[0], &[a, b, small])
            .unwrap();
        assert_eq!(forward, a);
        assert_eq!(reverse, a);

        let best = engine(&ts, SparePolicy::BestFit);
        assert_eq!(best.select_spare(members[0]).unwrap(), b);
    }

    #[test]
    fn test_incompatible_spares_rejected() {
        let ts = test_store();
        let (_, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let mut flash = fru_record(0, 20, END * 2);
        flash.flags.hot_spare = true;
        flash.drive_type = DriveType::Flash;
        let flash = add_fru(&ts.store, flash);
        let busy = hot_spare(&ts, 0, 21, END * 2);
        ts.store
            .transact(|txn| {
                txn.fru_mut(busy)?.runtime.update_in_progress = true;
                Ok(())
            })
            .unwrap();
        let sparing = engine(&ts, SparePolicy::FirstFit);

        let err = sparing.select_spare(members[0]).unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));
        let before = ts.store.fru(members[0]).unwrap();
        let err = sparing
            .swap_in(flash, members[0], SpareKind::HotSpare)
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));
        assert_eq!(ts.store.fru(members[0]).unwrap().record, before.record);
        assert_eq!(ts.store.fru(flash).unwrap().record.partitions.len(), 0);
    }

    #[test]
    fn test_hot_swap_in() {
        let ts = test_store();
        let (rg, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        fail(&ts, members[1], FruState::Faulted);
        let sparing = engine(&ts, SparePolicy::FirstFit);

        sparing
            .swap_in(spare, members[1], SpareKind::HotSpare)
            .unwrap();
        let group = ts.store.raid_group(rg).unwrap();
        assert_eq!(group.record.members[1], spare);

        let target = ts.store.fru(members[1]).unwrap();
        assert!(target.record.partitions.is_empty());
        assert_eq!(
            target.record.spare_info,
            Some(SpareInfo {
                kind: SpareKind::HotSpare,
                replacement: spare
            })
        );

        let drive = ts.store.fru(spare).unwrap();
        assert_eq!(sparing.classify(spare).unwrap(), SpareClass::SparedIn);
        let p = &drive.record.partitions[0];
        assert_eq!(p.position, 1);
        assert!(p.needs_rebuild);
        assert_eq!(p.checkpoint(CheckpointKind::Rebuild).value, 0);
        assert_eq!(ts.store.raid_group_state(rg).unwrap(), RaidGroupState::Ready);
    }

    #[test]
    fn test_swap_in_blocked_while_reconfiguring() {
        let ts = test_store();
        let (rg, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        ts.store
            .transact(|txn| {
                txn.raid_group_mut(rg)?.runtime.unbinding = true;
                Ok(())
            })
            .unwrap();
        let sparing = engine(&ts, SparePolicy::FirstFit);
        let err = sparing
            .swap_in(spare, members[0], SpareKind::HotSpare)
            .unwrap_err();
        assert!(matches!(err, Error::RaidGroupUnstable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_swap_in_blocked_when_broken() {
        let ts = test_store();
        let (_, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        fail(&ts, members[0], FruState::Faulted);
        fail(&ts, members[1], FruState::Removed);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        let err = sparing
            .swap_in(spare, members[0], SpareKind::HotSpare)
            .unwrap_err();
        assert!(matches!(err, Error::RaidGroupUnstable { .. }));
    }

    #[test]
    fn test_proactive_copy_and_swap_out() {
        let ts = test_store();
        let (rg, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);

        sparing
            .swap_in(spare, members[2], SpareKind::Proactive)
            .unwrap();
        let err = sparing
            .swap_in(spare, members[2], SpareKind::Proactive)
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(ts.store.fru(members[2]).unwrap().record.partitions[0].copy_source);

        let err = sparing.swap_out(rg, 2).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        finish_rebuild(&ts, spare);
        assert_eq!(sparing.swap_out(rg, 2).unwrap(), members[2]);
        let source = ts.store.fru(members[2]).unwrap();
        assert_eq!(source.state, FruState::Faulted);
        assert_eq!(source.record.death_reason, Some(DeathReason::ProactivelySpared));
        assert!(source.record.partitions.is_empty());
    }

    #[test]
    fn test_auto_pass_waits_for_permanent_delay() {
        let ts = test_store();
        let (rg, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        fail(&ts, members[0], FruState::Removed);

        ts.clock.advance_secs(299);
        assert_eq!(sparing.auto_pass(), 0);

        sparing.arbiter.disable(
            Scope::RaidGroup(rg),
            BackgroundService::Swap,
            Requestor::User,
        );
        ts.clock.advance_secs(1);
        assert_eq!(sparing.auto_pass(), 0);

        sparing.arbiter.enable(
            Scope::RaidGroup(rg),
            BackgroundService::Swap,
            Requestor::User,
        );
        assert_eq!(sparing.auto_pass(), 1);
        assert_eq!(ts.store.raid_group(rg).unwrap().record.members[0], spare);
    }

    /// A second RAID-5 group whose position 0 is `shared`, over `[END, 2 * END)`
    fn add_group_sharing(ts: &TestStore, shared: FruId) -> RaidGroupId {
        let others: Vec<FruId> = (0..2)
            .map(|i| add_fru(&ts.store, fru_record(1, 20 + i, END * 2)))
            .collect();
        let members = vec![shared, others[0], others[1]];
        ts.store
            .transact(|txn| {
                let now = txn.now_secs();
                let record = arrayio_common::RaidGroupRecord {
                    raid_type: RaidType::Raid5,
                    members: members.clone(),
                    flags: arrayio_common::RaidGroupPersistentFlags {
                        valid: true,
                        ..Default::default()
                    },
                    address_offset: END,
                    ending_address: END * 2,
                    expansion: arrayio_common::ExpansionCheckpoints::default(),
                    lus: Vec::new(),
                    power_policy: arrayio_common::RaidGroupPowerPolicy::default(),
                };
                let rg = txn.insert_raid_group(|id| RaidGroup::new(id, record, now))?;
                for (position, fru) in members.iter().enumerate() {
                    let drive = txn.fru_mut(*fru)?;
                    let index = drive.record.free_partition_index(4).unwrap();
                    drive.record.partitions.push(PartitionRecord::new(
                        index,
                        rg,
                        position as u16,
                        END,
                        END * 2,
                    ));
                }
                Ok(rg)
            })
            .unwrap()
    }

    #[test]
    fn test_auto_pass_gated_by_every_group_of_target() {
        let ts = test_store();
        let (rg_a, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let shared = members[0];
        let rg_b = add_group_sharing(&ts, shared);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        fail(&ts, shared, FruState::Removed);
        ts.clock.advance_secs(300);

        sparing.arbiter.disable(
            Scope::RaidGroup(rg_b),
            BackgroundService::Swap,
            Requestor::User,
        );
        assert_eq!(sparing.auto_pass(), 0);
        assert_eq!(ts.store.raid_group(rg_a).unwrap().record.members[0], shared);

        sparing.arbiter.enable(
            Scope::RaidGroup(rg_b),
            BackgroundService::Swap,
            Requestor::User,
        );
        assert_eq!(sparing.auto_pass(), 1);
        assert_eq!(ts.store.raid_group(rg_a).unwrap().record.members[0], spare);
        assert_eq!(ts.store.raid_group(rg_b).unwrap().record.members[0], spare);
        assert_eq!(ts.store.fru(spare).unwrap().record.partitions.len(), 2);
    }

    #[test]
    fn test_auto_pass_skips_probation() {
        let ts = test_store();
        let (_, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        fail(&ts, members[0], FruState::Removed);
        sparing.begin_probation(members[0]).unwrap();
        ts.clock.advance_secs(600);
        assert_eq!(sparing.auto_pass(), 0);
    }

    #[test]
    fn test_auto_proactive_copy_lifecycle() {
        let ts = test_store();
        let (rg, members) = add_group(&ts.store, RaidType::Raid5, 3, END, false);
        let spare = hot_spare(&ts, 0, 10, END * 2);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        ts.store
            .transact(|txn| {
                txn.fru_mut(members[1])?.record.flags.end_of_life = true;
                Ok(())
            })
            .unwrap();

        assert_eq!(sparing.auto_pass(), 1);
        assert_eq!(ts.store.raid_group(rg).unwrap().record.members[1], spare);
        // Copy still running
        assert_eq!(sparing.auto_pass(), 0);

        finish_rebuild(&ts, spare);
        assert_eq!(sparing.auto_pass(), 1);
        assert_eq!(
            ts.store.fru(members[1]).unwrap().record.death_reason,
            Some(DeathReason::ProactivelySpared)
        );
    }

    #[test]
    fn test_probation_edges() {
        let ts = test_store();
        let fru = hot_spare(&ts, 0, 0, END);
        let sparing = engine(&ts, SparePolicy::FirstFit);
        assert!(sparing.activate_probation(fru).is_err());
        sparing.begin_probation(fru).unwrap();
        assert!(!sparing.check_stable(fru).unwrap());
        sparing.activate_probation(fru).unwrap();
        sparing.power_up_probation(fru).unwrap();
        sparing.finish_probation(fru).unwrap();
        sparing.begin_probation(fru).unwrap();
        sparing.cancel_probation(fru).unwrap();
        sparing.finish_probation(fru).unwrap();
        assert!(sparing.check_stable(fru).unwrap());
    }
}

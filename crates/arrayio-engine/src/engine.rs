//! Array engine facade.
//!
//! Wires the object store, checkpoint tracker, sparing engine, power-state
//! propagator, service arbiter and background runner together, and turns
//! external events (administrative requests, drive events, host I/O and
//! timer ticks) into store transactions.

use crate::arbiter::Arbiter;
use crate::checkpoint::{
    log_absent_members_in, lu_service_for, reactivate_in, record_write_in, request_in,
    restart_full_rebuild_in, resume_in, start_rebuild_logging_in, suspend_in, CheckpointTracker,
};
use crate::clock::Clock;
use crate::events::{EventBus, LifecycleEvent, ObjectTypeMask, StateMask};
use crate::persist::{PeerLink, PersistQueue};
use crate::power::{note_io_in, wake_raid_group_in, PowerPropagator};
use crate::records::{Fru, LogicalUnit, RaidGroup};
use crate::runner::{BackgroundRunner, PendingOp};
use crate::sparing::{SpareClass, SparingEngine};
use crate::store::{refresh_lus_in, ObjectFilter, ObjectStore, ObjectView, Tables, Txn};
use arrayio_common::{
    BackgroundService, CheckpointEntry, CheckpointKind, Config, DeathReason, Error,
    ExpansionCheckpoints, FruId, FruLocation, FruPersistentFlags, FruRecord, FruState, Lba, LuId,
    LuPersistentFlags, LuPowerPolicy, LuRecord, LuState, LuStatus, ObjectRef, PartitionRecord,
    PowerSaveState, RaidGroupId, RaidGroupPersistentFlags, RaidGroupPowerPolicy, RaidGroupRecord,
    RaidGroupState, RaidType, Requestor, Result, Scope, SpId, SpareKind, SystemRecord,
};
use arrayio_meta_store::{CommitRecord, PersistBackend, RecordBody, RecordKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Which drives answered discovery at startup
#[derive(Clone, Debug)]
pub enum Discovery {
    /// Only these drives are present
    Listed(Vec<FruId>),
    /// Trust the last persisted view: drives without a death reason are
    /// present, the rest stay out for the recorded reason
    FromLastKnown,
}

impl Discovery {
    fn initial_state(&self, id: FruId, record: &FruRecord) -> FruState {
        match self {
            Self::Listed(ids) if ids.contains(&id) => FruState::Ready,
            Self::Listed(_) => FruState::Removed,
            Self::FromLastKnown => match record.death_reason {
                None => FruState::Ready,
                Some(DeathReason::Removed) => FruState::Removed,
                Some(_) => FruState::Faulted,
            },
        }
    }
}

/// Parameters of a new RAID group
#[derive(Clone, Debug)]
pub struct RaidGroupSpec {
    pub raid_type: RaidType,
    /// Position order
    pub members: Vec<FruId>,
    /// First block used on every member
    pub address_offset: Lba,
    pub blocks_per_member: u64,
    pub power_policy: RaidGroupPowerPolicy,
    /// Zero every member before use
    pub zero: bool,
}

/// Parameters of a new LU
#[derive(Clone, Debug)]
pub struct LuSpec {
    pub raid_group: RaidGroupId,
    pub capacity: u64,
    pub rebuild_priority: u8,
    pub verify_priority: u8,
    pub needs_background_verify: bool,
    pub sniff_verify_enabled: bool,
    pub power_policy: LuPowerPolicy,
}

impl LuSpec {
    #[must_use]
    pub fn new(raid_group: RaidGroupId, capacity: u64) -> Self {
        Self {
            raid_group,
            capacity,
            rebuild_priority: 0,
            verify_priority: 0,
            needs_background_verify: false,
            sniff_verify_enabled: true,
            power_policy: LuPowerPolicy::default(),
        }
    }
}

/// What one tick did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub swaps: usize,
    pub steps: usize,
    pub completed: usize,
    pub blocks: u64,
    pub flushed: usize,
}

/// Stand-in for a member whose record could not be read
fn placeholder_fru(id: FruId, now: u64) -> Fru {
    let record = FruRecord {
        location: FruLocation::default(),
        capacity: 0,
        drive_type: arrayio_common::DriveType::default(),
        block_size: 0,
        flags: FruPersistentFlags {
            needs_db_rebuild: true,
            ..FruPersistentFlags::default()
        },
        partitions: Vec::new(),
        spare_info: None,
        death_reason: Some(DeathReason::DatabaseMismatch),
    };
    Fru::new(id, record, FruState::Removed, now)
}

/// Restart `kind` on every member partition of a group
fn request_group_in(txn: &mut Txn<'_>, raid_group: RaidGroupId, kind: CheckpointKind) -> Result<()> {
    let members = txn.raid_group(raid_group)?.record.members.clone();
    for member in members {
        let Some(index) = txn
            .fru(member)?
            .record
            .partition_for(raid_group)
            .map(|p| p.index)
        else {
            continue;
        };
        request_in(txn, kind, member, index)?;
    }
    Ok(())
}

/// Re-derive runtime state after recovery: flag drives whose partitions
/// name missing groups and restart logging for members that are not Ready
fn rederive_in(txn: &mut Txn<'_>) -> Result<()> {
    for id in txn.fru_ids() {
        let fru = txn.fru(id)?;
        let ready = fru.is_ready();
        let orphaned = fru
            .record
            .partitions
            .iter()
            .any(|p| txn.raid_group(p.raid_group).is_err());
        let needs_flag = orphaned && !fru.record.flags.needs_db_rebuild;
        let logging: Vec<u8> = if ready {
            Vec::new()
        } else {
            fru.record
                .partitions
                .iter()
                .filter(|p| !p.copy_source && txn.is_usable(p.raid_group))
                .map(|p| p.index)
                .collect()
        };
        if needs_flag {
            warn!("{} has partitions of unknown raid groups", id);
            txn.fru_mut(id)?.record.flags.needs_db_rebuild = true;
        }
        if !ready && txn.fru(id)?.record.death_reason.is_none() {
            txn.fru_mut(id)?.record.death_reason = Some(DeathReason::Removed);
        }
        for index in logging {
            start_rebuild_logging_in(txn, id, index)?;
        }
    }
    Ok(())
}

pub struct ArrayEngine {
    config: Config,
    backend: Arc<dyn PersistBackend>,
    queue: Arc<PersistQueue>,
    events: Arc<EventBus>,
    store: Arc<ObjectStore>,
    arbiter: Arc<Arbiter>,
    tracker: CheckpointTracker,
    sparing: SparingEngine,
    power: PowerPropagator,
    runner: BackgroundRunner,
    system: Mutex<SystemRecord>,
    system_generation: AtomicU64,
    peer_gates: DashMap<Scope, u64>,
}

impl ArrayEngine {
    /// Create an engine with empty tables
    pub fn new(config: Config, backend: Arc<dyn PersistBackend>, clock: Arc<dyn Clock>) -> Self {
        let queue = Arc::new(PersistQueue::new());
        let events = Arc::new(EventBus::new());
        let store = Arc::new(ObjectStore::new(
            &config.engine,
            queue.clone(),
            events.clone(),
            clock.clone(),
        ));
        let scale = config.background.scale_percent.min(100);
        let arbiter = Arc::new(Arbiter::new(queue.clone(), config.engine.local_sp, scale));
        let tracker = CheckpointTracker::new(store.clone(), config.engine.dirty_chunk_blocks);
        let sparing = SparingEngine::new(store.clone(), arbiter.clone(), config.sparing.clone());
        let power = PowerPropagator::new(store.clone(), config.power_save.clone());
        let runner = BackgroundRunner::new(store.clone(), arbiter.clone(), clock, &config.background);
        let system = SystemRecord {
            power_save_enabled: config.power_save.system_enabled,
            wakeup_interval_secs: config.power_save.wakeup_interval_secs,
            scale_percent: scale,
        };
        Self {
            config,
            backend,
            queue,
            events,
            store,
            arbiter,
            tracker,
            sparing,
            power,
            runner,
            system: Mutex::new(system),
            system_generation: AtomicU64::new(0),
            peer_gates: DashMap::new(),
        }
    }

    /// Rebuild the engine from persisted records.
    ///
    /// Drive state comes from `discovery`; rebuild logging, LU state and
    /// power state are re-derived. Contradictions in the persisted records
    /// set `needs_db_rebuild` on the affected drive instead of failing.
    pub fn recover(
        config: Config,
        backend: Arc<dyn PersistBackend>,
        clock: Arc<dyn Clock>,
        discovery: &Discovery,
    ) -> Result<Self> {
        let loaded = backend.load()?;
        let engine = Self::new(config, backend, clock);
        let now = engine.store.now_secs();

        let mut tables = Tables::new();
        for commit in &loaded.records {
            let Some(body) = &commit.body else { continue };
            match (commit.key, body) {
                (RecordKey::Fru(id), RecordBody::Fru(record)) => {
                    let state = discovery.initial_state(id, record);
                    let mut fru = Fru::new(id, record.clone(), state, now);
                    fru.generation = commit.generation;
                    tables.put_fru(fru);
                }
                (RecordKey::RaidGroup(id), RecordBody::RaidGroup(record)) => {
                    let mut group = RaidGroup::new(id, record.clone(), now);
                    group.generation = commit.generation;
                    tables.put_raid_group(group);
                }
                (RecordKey::Lu(id), RecordBody::Lu(record)) => {
                    let mut lu = LogicalUnit::new(id, record.clone(), now);
                    lu.generation = commit.generation;
                    tables.put_lu(lu);
                }
                (RecordKey::ServiceGate(_), RecordBody::ServiceGate(gate)) => {
                    engine.arbiter.install(gate);
                    engine.arbiter.observe_generation(commit.generation);
                }
                (RecordKey::System, RecordBody::System(system)) => {
                    engine.apply_system(*system);
                    engine
                        .system_generation
                        .fetch_max(commit.generation, Ordering::AcqRel);
                }
                (key, _) => warn!("Skipping {:?}: body does not match key", key),
            }
        }

        let mut missing: BTreeSet<FruId> = BTreeSet::new();
        for key in &loaded.corrupt {
            match key {
                RecordKey::Fru(id) => {
                    missing.insert(*id);
                }
                other => error!("Record {:?} is unreadable and was dropped", other),
            }
        }
        for group in tables.raid_groups() {
            for member in &group.record.members {
                if tables.fru(*member).is_err() {
                    missing.insert(*member);
                }
            }
        }
        for id in missing {
            warn!("{} has no readable record, database rebuild required", id);
            tables.put_fru(placeholder_fru(id, now));
        }

        let states: Vec<(LuId, LuState)> = tables
            .lus()
            .map(|lu| {
                let raid_group = lu.record.raid_group;
                let state = if tables.raid_group(raid_group).is_ok_and(RaidGroup::is_valid) {
                    tables.lu_state_for(raid_group).unwrap_or(LuState::Faulted)
                } else {
                    warn!("{}: {} is missing, marking faulted", lu.id, raid_group);
                    LuState::Faulted
                };
                (lu.id, state)
            })
            .collect();
        for (id, state) in states {
            if let Some(lu) = tables.lu_mut(id) {
                lu.state = state;
            }
        }

        engine.store.install(tables);
        engine.store.transact(rederive_in)?;
        info!(
            "Recovered {} records ({} unreadable)",
            loaded.records.len(),
            loaded.corrupt.len()
        );
        Ok(engine)
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub const fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    pub const fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    pub const fn sparing(&self) -> &SparingEngine {
        &self.sparing
    }

    pub const fn power(&self) -> &PowerPropagator {
        &self.power
    }

    pub fn subscribe(
        &self,
        types: ObjectTypeMask,
        states: StateMask,
    ) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.events.subscribe(types, states)
    }

    /// Forward every flushed commit to the peer controller
    pub fn set_peer(&self, peer: Arc<dyn PeerLink>) {
        self.queue.set_peer(peer);
    }

    // ---- drives ----

    /// Register a present drive
    pub fn add_fru(&self, record: FruRecord) -> Result<FruId> {
        let location = record.location;
        let id = self.store.transact(|txn| {
            let now = txn.now_secs();
            txn.insert_fru(|id| Fru::new(id, record, FruState::Ready, now))
        })?;
        info!("{} added at {}", id, location);
        Ok(id)
    }

    pub fn set_hot_spare(&self, fru: FruId, hot_spare: bool) -> Result<()> {
        self.store.transact(|txn| {
            let drive = txn.fru_mut(fru)?;
            if hot_spare && !drive.record.partitions.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "{fru} belongs to a raid group"
                )));
            }
            drive.record.flags.hot_spare = hot_spare;
            Ok(())
        })
    }

    /// Request proactive sparing of a worn drive
    pub fn mark_end_of_life(&self, fru: FruId) -> Result<()> {
        self.store.transact(|txn| {
            txn.fru_mut(fru)?.record.flags.end_of_life = true;
            Ok(())
        })?;
        warn!("{} flagged end of life", fru);
        Ok(())
    }

    fn take_out(&self, fru: FruId, state: FruState, reason: DeathReason) -> Result<()> {
        self.store.transact(|txn| {
            let now = txn.now_secs();
            let drive = txn.fru_mut(fru)?;
            drive.transition(state, now)?;
            drive.record.death_reason = Some(reason);
            suspend_in(txn, fru)?;
            let partitions: Vec<(u8, RaidGroupId, bool)> = txn
                .fru(fru)?
                .record
                .partitions
                .iter()
                .map(|p| (p.index, p.raid_group, p.copy_source))
                .collect();
            for (index, raid_group, copy_source) in partitions {
                if copy_source {
                    continue;
                }
                if txn.is_usable(raid_group) {
                    start_rebuild_logging_in(txn, fru, index)?;
                } else {
                    warn!("{}: redundancy lost with {} out", raid_group, fru);
                }
                refresh_lus_in(txn, raid_group)?;
            }
            Ok(())
        })?;
        warn!("{} is {} ({})", fru, state, reason);
        Ok(())
    }

    pub fn fru_removed(&self, fru: FruId) -> Result<()> {
        self.take_out(fru, FruState::Removed, DeathReason::Removed)
    }

    pub fn fru_faulted(&self, fru: FruId, reason: DeathReason) -> Result<()> {
        self.take_out(fru, FruState::Faulted, reason)
    }

    /// A drive was reinserted and is spinning up
    pub fn fru_inserted(&self, fru: FruId) -> Result<()> {
        self.store.transact(|txn| {
            let now = txn.now_secs();
            txn.fru_mut(fru)?.transition(FruState::PoweringUp, now)
        })
    }

    /// A drive finished powering up. Logged partitions resume a
    /// differential rebuild; partitions that need a rebuild without any
    /// logged history rebuild in full.
    pub fn fru_ready(&self, fru: FruId) -> Result<()> {
        self.store.transact(|txn| {
            let now = txn.now_secs();
            let drive = txn.fru_mut(fru)?;
            drive.transition(FruState::Ready, now)?;
            drive.record.death_reason = None;

            let drive = txn.fru(fru)?;
            let partitions: Vec<(u8, RaidGroupId, bool, bool)> = drive
                .record
                .partitions
                .iter()
                .map(|p| {
                    (
                        p.index,
                        p.raid_group,
                        drive.is_logging(p.index),
                        p.needs_rebuild && p.checkpoint(CheckpointKind::Rebuild).is_complete(),
                    )
                })
                .collect();
            for (index, raid_group, logging, full) in partitions {
                if logging {
                    resume_in(txn, fru, index)?;
                } else if full {
                    restart_full_rebuild_in(txn, fru, index)?;
                }
                refresh_lus_in(txn, raid_group)?;
                log_absent_members_in(txn, raid_group)?;
            }
            reactivate_in(txn, fru)
        })?;
        info!("{} is Ready", fru);
        Ok(())
    }

    // ---- raid groups and LUs ----

    pub fn bind_raid_group(&self, spec: &RaidGroupSpec) -> Result<RaidGroupId> {
        let width = spec.members.len();
        if !spec.raid_type.is_valid_width(width) {
            return Err(Error::invalid_argument(format!(
                "{} cannot be {width} wide",
                spec.raid_type
            )));
        }
        if spec.blocks_per_member == 0 {
            return Err(Error::invalid_argument("raid group needs a non-zero extent"));
        }
        if spec.members.iter().collect::<BTreeSet<_>>().len() != width {
            return Err(Error::invalid_argument("duplicate member drive"));
        }
        let start = spec.address_offset;
        let end = start.checked_add(spec.blocks_per_member).ok_or_else(|| {
            Error::invalid_argument(format!(
                "extent of {} blocks at {start} overflows",
                spec.blocks_per_member
            ))
        })?;

        let id = self.store.transact(|txn| {
            for member in &spec.members {
                let drive = txn.fru(*member)?;
                if !drive.is_ready() {
                    return Err(Error::invalid_transition(format!(
                        "{member} is {}",
                        drive.state
                    )));
                }
                if drive.record.flags.hot_spare {
                    return Err(Error::invalid_argument(format!("{member} is a hot spare")));
                }
                if drive.record.capacity < end {
                    return Err(Error::invalid_argument(format!(
                        "{member} holds {} blocks, {end} needed",
                        drive.record.capacity
                    )));
                }
                if let Some(p) = drive
                    .record
                    .partitions
                    .iter()
                    .find(|p| p.start < end && p.end > start)
                {
                    return Err(Error::invalid_argument(format!(
                        "{member} extent overlaps {}",
                        p.raid_group
                    )));
                }
            }

            let now = txn.now_secs();
            let record = RaidGroupRecord {
                raid_type: spec.raid_type,
                members: spec.members.clone(),
                flags: RaidGroupPersistentFlags {
                    valid: true,
                    zeroing: spec.zero,
                    ..RaidGroupPersistentFlags::default()
                },
                address_offset: start,
                ending_address: end,
                expansion: ExpansionCheckpoints::default(),
                lus: Vec::new(),
                power_policy: spec.power_policy,
            };
            let raid_group = txn.insert_raid_group(|id| RaidGroup::new(id, record, now))?;

            let max_partitions = txn.limits().max_partitions;
            for (position, member) in spec.members.iter().enumerate() {
                let drive = txn.fru_mut(*member)?;
                let index = drive
                    .record
                    .free_partition_index(max_partitions)
                    .ok_or_else(|| {
                        Error::ResourceExhausted(format!("{member}: partition table full"))
                    })?;
                let position = u16::try_from(position)
                    .map_err(|_| Error::invalid_argument("member table too wide"))?;
                drive
                    .record
                    .partitions
                    .push(PartitionRecord::new(index, raid_group, position, start, end));
                if spec.zero {
                    request_in(txn, CheckpointKind::Zero, *member, index)?;
                }
            }
            Ok(raid_group)
        })?;
        info!(
            "{} bound: {} x{} [{}, {})",
            id, spec.raid_type, width, start, end
        );
        Ok(id)
    }

    /// Unbind a group; every LU on it must be unbound first
    pub fn destroy_raid_group(&self, raid_group: RaidGroupId) -> Result<()> {
        self.store.transact(|txn| {
            let group = txn.raid_group(raid_group)?;
            if !group.record.lus.is_empty() {
                return Err(Error::invalid_transition(format!(
                    "{raid_group} still has {} LUs bound",
                    group.record.lus.len()
                )));
            }
            for id in txn.fru_ids() {
                let indices: Vec<u8> = txn
                    .fru(id)?
                    .record
                    .partitions
                    .iter()
                    .filter(|p| p.raid_group == raid_group)
                    .map(|p| p.index)
                    .collect();
                if indices.is_empty() {
                    continue;
                }
                let drive = txn.fru_mut(id)?;
                drive
                    .record
                    .partitions
                    .retain(|p| !indices.contains(&p.index));
                for index in &indices {
                    drive.logging.remove(index);
                }
            }
            txn.remove_raid_group(raid_group)
        })?;
        self.arbiter.forget(Scope::RaidGroup(raid_group));
        info!("{} destroyed", raid_group);
        Ok(())
    }

    /// Bind an LU after the group's existing LUs.
    ///
    /// A hibernating group is woken; the LU stays Binding until the group's
    /// power chain is Active again.
    pub fn bind_lu(&self, spec: &LuSpec) -> Result<LuId> {
        let local = self.config.engine.local_sp;
        let raid_group = spec.raid_group;
        let id = self.store.transact(|txn| {
            let group = txn.raid_group(raid_group)?;
            if !group.is_valid() {
                return Err(Error::invalid_transition(format!(
                    "{raid_group} is not bound"
                )));
            }
            if group.is_reconfiguring() {
                return Err(Error::unstable(raid_group, "reconfiguration in progress"));
            }
            if spec.capacity == 0 {
                return Err(Error::invalid_argument("LU capacity must be non-zero"));
            }
            let offset = group
                .record
                .lus
                .iter()
                .filter_map(|lu| txn.lu(*lu).ok())
                .map(|lu| lu.record.offset + lu.record.capacity)
                .max()
                .unwrap_or(0);
            let available = group.record.user_capacity();
            if offset.saturating_add(spec.capacity) > available {
                return Err(Error::ResourceExhausted(format!(
                    "{raid_group}: {} blocks free, {} requested",
                    available.saturating_sub(offset),
                    spec.capacity
                )));
            }

            let record = LuRecord {
                raid_group,
                offset,
                capacity: spec.capacity,
                rebuild_priority: spec.rebuild_priority,
                verify_priority: spec.verify_priority,
                flags: LuPersistentFlags {
                    needs_background_verify: spec.needs_background_verify,
                    sniff_verify_enabled: spec.sniff_verify_enabled,
                },
                status: LuStatus {
                    bound_by_spa: local == SpId::A,
                    bound_by_spb: local == SpId::B,
                    unbind_queued: false,
                },
                power_policy: spec.power_policy,
            };
            let now = txn.now_secs();
            let id = txn.insert_lu(|id| LogicalUnit::new(id, record, now))?;
            txn.lu_mut(id)?.transition(LuState::Binding)?;
            txn.raid_group_mut(raid_group)?.record.lus.push(id);

            wake_raid_group_in(txn, raid_group)?;
            if txn.raid_group(raid_group)?.power.state == PowerSaveState::Active {
                let state = txn.lu_state_for(raid_group)?;
                txn.lu_mut(id)?.transition(state)?;
            }
            if spec.needs_background_verify {
                request_group_in(txn, raid_group, CheckpointKind::Verify)?;
            }
            Ok(id)
        })?;
        info!("{} bound on {} ({} blocks)", id, raid_group, spec.capacity);
        Ok(id)
    }

    pub fn unbind_lu(&self, lu: LuId) -> Result<()> {
        self.store.transact(|txn| {
            let raid_group = txn.lu(lu)?.record.raid_group;
            if txn.raid_group(raid_group).is_ok() {
                txn.lu_mut(lu)?.transition(LuState::Unbinding)?;
                txn.raid_group_mut(raid_group)?
                    .record
                    .lus
                    .retain(|id| *id != lu);
            }
            txn.remove_lu(lu)
        })?;
        self.arbiter.forget(Scope::Lu(lu));
        info!("{} unbound", lu);
        Ok(())
    }

    // ---- host I/O ----

    pub fn note_io(&self, lu: LuId) -> Result<()> {
        self.power.note_io(lu)
    }

    /// A host I/O finished. Successful writes are logged as dirty on every
    /// member that is out; returns the number of partitions marked.
    pub fn io_completed(
        &self,
        lu: LuId,
        lba: Lba,
        blocks: u64,
        is_write: bool,
        ok: bool,
    ) -> Result<usize> {
        let chunk = self.config.engine.dirty_chunk_blocks;
        self.store.transact(|txn| {
            note_io_in(txn, lu)?;
            if !(is_write && ok) {
                return Ok(0);
            }
            let unit = txn.lu(lu)?;
            lba.checked_add(blocks)
                .filter(|end| *end <= unit.record.capacity)
                .ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "{lu}: {blocks} blocks at {lba} exceed {} blocks",
                        unit.record.capacity
                    ))
                })?;
            let (raid_group, offset) = (unit.record.raid_group, unit.record.offset);
            record_write_in(txn, raid_group, offset + lba, blocks, chunk)
        })
    }

    // ---- policy ----

    fn persist_system(&self, record: SystemRecord) {
        let generation = self.system_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.queue.enqueue(CommitRecord::put(
            RecordKey::System,
            generation,
            self.config.engine.local_sp,
            RecordBody::System(record),
        ));
    }

    fn update_system(&self, f: impl FnOnce(&mut SystemRecord)) {
        let record = {
            let mut system = self.system.lock();
            f(&mut *system);
            *system
        };
        self.persist_system(record);
    }

    /// Adopt a system record without persisting it again
    fn apply_system(&self, record: SystemRecord) {
        self.power.set_system_enabled(record.power_save_enabled);
        self.power.set_wakeup_interval(record.wakeup_interval_secs);
        if let Err(e) = self.arbiter.set_scale(record.scale_percent) {
            warn!("Ignoring persisted scale: {}", e);
        }
        *self.system.lock() = record;
    }

    #[must_use]
    pub fn system(&self) -> SystemRecord {
        *self.system.lock()
    }

    pub fn set_system_power_save(&self, enabled: bool) {
        self.power.set_system_enabled(enabled);
        self.update_system(|s| s.power_save_enabled = enabled);
    }

    pub fn set_wakeup_interval(&self, secs: u64) {
        self.power.set_wakeup_interval(secs);
        self.update_system(|s| s.wakeup_interval_secs = secs);
    }

    pub fn set_raid_group_power_policy(
        &self,
        raid_group: RaidGroupId,
        policy: RaidGroupPowerPolicy,
    ) -> Result<()> {
        self.store.transact(|txn| {
            txn.raid_group_mut(raid_group)?.record.power_policy = policy;
            Ok(())
        })
    }

    pub fn set_lu_power_policy(&self, lu: LuId, policy: LuPowerPolicy) -> Result<()> {
        self.store.transact(|txn| {
            txn.lu_mut(lu)?.record.power_policy = policy;
            Ok(())
        })
    }

    // ---- service gates ----

    /// The scope exists and gates `service` there
    fn check_scope(&self, scope: Scope, service: BackgroundService) -> Result<()> {
        if matches!(scope, Scope::Lu(_))
            && !CheckpointKind::ALL
                .into_iter()
                .any(|kind| lu_service_for(kind) == Some(service))
        {
            return Err(Error::invalid_argument(format!(
                "{} is not gated per LU",
                service.name()
            )));
        }
        self.store.read(|t| match scope {
            Scope::System => Ok(()),
            Scope::RaidGroup(id) => t.raid_group(id).map(|_| ()),
            Scope::Lu(id) => t.lu(id).map(|_| ()),
            Scope::Fru(id) => t.fru(id).map(|_| ()),
        })
    }

    pub fn enable_service(
        &self,
        scope: Scope,
        service: BackgroundService,
        requestor: Requestor,
    ) -> Result<()> {
        self.check_scope(scope, service)?;
        self.arbiter.enable(scope, service, requestor);
        Ok(())
    }

    pub fn disable_service(
        &self,
        scope: Scope,
        service: BackgroundService,
        requestor: Requestor,
    ) -> Result<()> {
        self.check_scope(scope, service)?;
        self.arbiter.disable(scope, service, requestor);
        Ok(())
    }

    pub fn set_scale(&self, percent: u8) -> Result<()> {
        self.arbiter.set_scale(percent)?;
        self.update_system(|s| s.scale_percent = percent);
        Ok(())
    }

    pub fn disable_all_services(&self) {
        self.arbiter.disable_all_services();
    }

    pub fn enable_all_services(&self) {
        self.arbiter.enable_all_services();
    }

    /// Start a background verify of the LU's group
    pub fn request_verify(&self, lu: LuId) -> Result<()> {
        self.store.transact(|txn| {
            let raid_group = txn.lu(lu)?.record.raid_group;
            txn.lu_mut(lu)?.record.flags.needs_background_verify = true;
            request_group_in(txn, raid_group, CheckpointKind::Verify)
        })
    }

    // ---- reconfiguration ----

    /// Grow every member extent to `new_ending_address`
    pub fn start_expansion(&self, raid_group: RaidGroupId, new_ending_address: Lba) -> Result<()> {
        self.store.transact(|txn| {
            let group = txn.raid_group(raid_group)?;
            if !group.is_valid() {
                return Err(Error::invalid_transition(format!(
                    "{raid_group} is not bound"
                )));
            }
            if group.is_reconfiguring() {
                return Err(Error::unstable(raid_group, "reconfiguration in progress"));
            }
            if txn.raid_group_state(raid_group)? != RaidGroupState::Ready {
                return Err(Error::unstable(raid_group, "not all members are Ready"));
            }
            let old_end = group.record.ending_address;
            if new_ending_address <= old_end {
                return Err(Error::invalid_argument(format!(
                    "{raid_group} already ends at {old_end}"
                )));
            }
            let offset = group.record.address_offset;
            let data_disks = group.record.raid_type.data_disks(group.record.width()) as u64;
            let members = group.record.members.clone();

            for member in &members {
                let drive = txn.fru(*member)?;
                if drive.record.capacity < new_ending_address {
                    return Err(Error::invalid_argument(format!(
                        "{member} holds only {} blocks",
                        drive.record.capacity
                    )));
                }
                if let Some(p) = drive.record.partitions.iter().find(|p| {
                    p.raid_group != raid_group && p.start < new_ending_address && p.end > old_end
                }) {
                    return Err(Error::invalid_argument(format!(
                        "{member} extent would overlap {}",
                        p.raid_group
                    )));
                }
            }
            for member in &members {
                let drive = txn.fru_mut(*member)?;
                let index = drive
                    .record
                    .partition_for(raid_group)
                    .map(|p| p.index)
                    .ok_or_else(|| Error::not_found(format!("{member} partition for {raid_group}")))?;
                let p = drive.partition_mut(index)?;
                p.end = new_ending_address;
                *p.checkpoint_mut(CheckpointKind::Expansion) = CheckpointEntry::starting_at(old_end);
            }

            let group = txn.raid_group_mut(raid_group)?;
            group.record.flags.expanding = true;
            group.record.expansion = ExpansionCheckpoints {
                logical: (old_end - offset) * data_disks,
                physical: old_end,
            };
            Ok(())
        })?;
        info!("{} expanding to {}", raid_group, new_ending_address);
        Ok(())
    }

    pub fn start_defragment(&self, raid_group: RaidGroupId) -> Result<()> {
        self.store.transact(|txn| {
            let group = txn.raid_group_mut(raid_group)?;
            if group.is_reconfiguring() {
                return Err(Error::unstable(raid_group, "reconfiguration in progress"));
            }
            group.record.flags.defragmenting = true;
            Ok(())
        })
    }

    pub fn finish_defragment(&self, raid_group: RaidGroupId) -> Result<()> {
        self.store.transact(|txn| {
            let group = txn.raid_group_mut(raid_group)?;
            if !group.record.flags.defragmenting {
                return Err(Error::invalid_transition(format!(
                    "{raid_group} is not defragmenting"
                )));
            }
            group.record.flags.defragmenting = false;
            Ok(())
        })
    }

    /// Hold every background service of a group and mark it busy
    pub fn quiesce(&self, raid_group: RaidGroupId) -> Result<()> {
        self.store.transact(|txn| {
            txn.raid_group_mut(raid_group)?.runtime.busy = true;
            Ok(())
        })?;
        for service in BackgroundService::ALL {
            self.arbiter
                .disable(Scope::RaidGroup(raid_group), service, Requestor::Quiesce);
        }
        debug!("{} quiesced", raid_group);
        Ok(())
    }

    pub fn unquiesce(&self, raid_group: RaidGroupId) -> Result<()> {
        self.store.transact(|txn| {
            txn.raid_group_mut(raid_group)?.runtime.busy = false;
            Ok(())
        })?;
        for service in BackgroundService::ALL {
            self.arbiter
                .enable(Scope::RaidGroup(raid_group), service, Requestor::Quiesce);
        }
        debug!("{} resumed", raid_group);
        Ok(())
    }

    // ---- sparing ----

    pub fn classify(&self, fru: FruId) -> Result<SpareClass> {
        self.sparing.classify(fru)
    }

    pub fn select_spare(&self, for_fru: FruId) -> Result<FruId> {
        self.sparing.select_spare(for_fru)
    }

    pub fn swap_in(&self, spare: FruId, target: FruId, kind: SpareKind) -> Result<()> {
        self.sparing.swap_in(spare, target, kind)
    }

    /// Select a spare for `target` and swap it in
    pub fn spare_for(&self, target: FruId, kind: SpareKind) -> Result<FruId> {
        self.sparing.spare_for(target, kind)
    }

    pub fn swap_out(&self, raid_group: RaidGroupId, position: usize) -> Result<FruId> {
        self.sparing.swap_out(raid_group, position)
    }

    // ---- queries ----

    pub fn fru(&self, id: FruId) -> Result<Fru> {
        self.store.fru(id)
    }

    pub fn raid_group(&self, id: RaidGroupId) -> Result<RaidGroup> {
        self.store.raid_group(id)
    }

    pub fn lu(&self, id: LuId) -> Result<LogicalUnit> {
        self.store.lu(id)
    }

    pub fn raid_group_state(&self, id: RaidGroupId) -> Result<RaidGroupState> {
        self.store.raid_group_state(id)
    }

    #[must_use]
    pub fn list(&self, filter: &ObjectFilter) -> Vec<ObjectRef> {
        self.store.list(filter)
    }

    pub fn checkpoint(&self, kind: CheckpointKind, fru: FruId, index: u8) -> Result<CheckpointEntry> {
        self.tracker.checkpoint(kind, fru, index)
    }

    #[must_use]
    pub fn pending_work(&self) -> Vec<PendingOp> {
        self.runner.pending()
    }

    // ---- time and persistence ----

    /// One scheduling round: power-save pass, automatic sparing, one round
    /// of background progress, then a flush when configured
    pub fn tick(&self) -> Result<TickReport> {
        self.power.run_pass()?;
        let swaps = self.sparing.auto_pass();
        let steps = self.runner.run_once();
        let flushed = if self.config.persist.flush_on_tick {
            self.flush().unwrap_or_else(|e| {
                warn!("Flush deferred: {}", e);
                0
            })
        } else {
            0
        };
        Ok(TickReport {
            swaps,
            steps: steps.len(),
            completed: steps.iter().filter(|s| s.completed).count(),
            blocks: steps.iter().map(|s| s.to - s.from).sum(),
            flushed,
        })
    }

    /// Commit everything queued; failed batches stay queued
    pub fn flush(&self) -> Result<usize> {
        self.queue.flush(self.backend.as_ref())
    }

    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.queue.pending_len()
    }

    /// Apply commits pushed by the peer controller; returns how many
    /// changed local state
    pub fn apply_peer_commits(&self, records: &[CommitRecord]) -> Result<usize> {
        let mut applied = 0;
        for record in records {
            match (&record.key, &record.body) {
                (RecordKey::ServiceGate(scope), Some(RecordBody::ServiceGate(gate))) => {
                    let mut seen = self.peer_gates.entry(*scope).or_insert(0);
                    if *seen >= record.generation {
                        continue;
                    }
                    *seen = record.generation;
                    drop(seen);
                    self.arbiter.install(gate);
                    self.arbiter.observe_generation(record.generation);
                    applied += 1;
                }
                (RecordKey::ServiceGate(scope), None) => {
                    debug!("Peer dropped gates of {}", scope);
                }
                (RecordKey::System, Some(RecordBody::System(system))) => {
                    let newer = self
                        .system_generation
                        .fetch_max(record.generation, Ordering::AcqRel)
                        < record.generation;
                    if newer {
                        self.apply_system(*system);
                        applied += 1;
                    }
                }
                (RecordKey::System, _) => {}
                _ => {
                    if self.store.apply_peer_record(record)? {
                        applied += 1;
                    }
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::ObjectState;
    use crate::persist::BufferedPeerLink;
    use crate::testutil::fru_record;
    use arrayio_common::ObjectType;
    use arrayio_meta_store::{MemoryBackend, MetaStore};

    const END: Lba = 100_000;

    struct Harness {
        engine: ArrayEngine,
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
    }

    fn harness(config: Config) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let backend = Arc::new(MemoryBackend::new());
        let engine = ArrayEngine::new(config, backend.clone(), clock.clone());
        Harness {
            engine,
            clock,
            backend,
        }
    }

    fn add_drives(engine: &ArrayEngine, count: u16, capacity: u64) -> Vec<FruId> {
        let base = engine.list(&ObjectFilter {
            object_type: Some(ObjectType::Fru),
            raid_group: None,
        });
        (0..count)
            .map(|i| {
                let slot = base.len() as u16 + i;
                engine.add_fru(fru_record(0, slot, capacity)).unwrap()
            })
            .collect()
    }

    fn add_spare(engine: &ArrayEngine, capacity: u64) -> FruId {
        let spare = add_drives(engine, 1, capacity)[0];
        engine.set_hot_spare(spare, true).unwrap();
        spare
    }

    fn group_spec(raid_type: RaidType, members: Vec<FruId>, blocks: u64) -> RaidGroupSpec {
        RaidGroupSpec {
            raid_type,
            members,
            address_offset: 0,
            blocks_per_member: blocks,
            power_policy: RaidGroupPowerPolicy::default(),
            zero: false,
        }
    }

    fn bind_raid5(engine: &ArrayEngine, width: u16) -> (RaidGroupId, Vec<FruId>, LuId) {
        let members = add_drives(engine, width, END * 2);
        let rg = engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members.clone(), END))
            .unwrap();
        let lu = engine.bind_lu(&LuSpec::new(rg, 10_000)).unwrap();
        (rg, members, lu)
    }

    fn snapshot(engine: &ArrayEngine) -> Vec<(u64, String)> {
        engine.store().read(|t| {
            t.frus()
                .map(|f| (f.generation, format!("{:?}", f.record)))
                .chain(
                    t.raid_groups()
                        .map(|g| (g.generation, format!("{:?}", g.record))),
                )
                .collect()
        })
    }

    fn verify_progress(engine: &ArrayEngine, members: &[FruId]) -> u64 {
        members
            .iter()
            .map(|m| {
                let p = &engine.fru(*m).unwrap().record.partitions[0];
                p.normalized(CheckpointKind::Verify) - p.start
            })
            .sum()
    }

    #[test]
    fn test_scenario_differential_rebuild_after_reinsertion() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 4);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Ready);

        // Written while every member is present
        assert_eq!(h.engine.io_completed(lu, 0, 100, true, true).unwrap(), 0);

        h.engine.fru_removed(members[1]).unwrap();
        let out = h.engine.fru(members[1]).unwrap();
        assert!(out.is_logging(0));
        assert!(out.record.partitions[0].needs_rebuild);
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Degraded);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Degraded);

        assert_eq!(h.engine.io_completed(lu, 3000, 300, true, true).unwrap(), 1);
        assert_eq!(h.engine.io_completed(lu, 6000, 300, true, false).unwrap(), 0);

        h.engine.fru_inserted(members[1]).unwrap();
        h.engine.fru_ready(members[1]).unwrap();
        for _ in 0..10 {
            h.engine.tick().unwrap();
        }

        let p = h.engine.fru(members[1]).unwrap().record.partitions[0].clone();
        assert!(p.checkpoint(CheckpointKind::Rebuild).is_complete());
        assert_eq!(p.normalized(CheckpointKind::Rebuild), p.end);
        assert!(!p.needs_rebuild);
        assert_eq!(p.dirty.total_blocks(), 0);
        for member in &members {
            assert_eq!(
                h.engine
                    .tracker()
                    .next_work_range(CheckpointKind::Rebuild, *member, 0, 1 << 20)
                    .unwrap(),
                None
            );
        }
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Ready);
    }

    #[test]
    fn test_scenario_idle_chain_hibernates_and_wakes_on_write() {
        let mut config = Config::default();
        config.power_save.system_enabled = true;
        let h = harness(config);
        let members = add_drives(&h.engine, 3, END * 2);
        let mut spec = group_spec(RaidType::Raid5, members.clone(), END);
        spec.power_policy = RaidGroupPowerPolicy {
            enabled: true,
            idle_secs: 20,
        };
        let rg = h.engine.bind_raid_group(&spec).unwrap();
        let lu = h.engine.bind_lu(&LuSpec::new(rg, 1000)).unwrap();

        let power = |h: &Harness| -> Vec<PowerSaveState> {
            let mut states = vec![
                h.engine.lu(lu).unwrap().power.state,
                h.engine.raid_group(rg).unwrap().power.state,
            ];
            states.extend(members.iter().map(|m| h.engine.fru(*m).unwrap().power.state));
            states
        };

        h.clock.advance_secs(21);
        h.engine.tick().unwrap();
        assert!(power(&h).iter().all(|s| *s == PowerSaveState::Hibernating));

        h.engine.io_completed(lu, 0, 8, true, true).unwrap();
        h.engine.tick().unwrap();
        assert!(power(&h).iter().all(|s| *s == PowerSaveState::Active));
    }

    #[test]
    fn test_scenario_scale_and_master_gate() {
        let mut config = Config::default();
        config.background.blocks_per_sec = 1000;
        config.background.max_step_blocks = 1000;
        let h = harness(config);
        let members = add_drives(&h.engine, 10, 2_000_000);
        let rg = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members.clone(), 1_000_000))
            .unwrap();
        let lu = h.engine.bind_lu(&LuSpec::new(rg, 1000)).unwrap();
        h.engine.request_verify(lu).unwrap();

        let run = |secs: u64| -> u64 {
            let before = verify_progress(&h.engine, &members);
            for _ in 0..secs {
                h.clock.advance_secs(1);
                h.engine.tick().unwrap();
            }
            verify_progress(&h.engine, &members) - before
        };

        h.engine.set_scale(0).unwrap();
        let slow = run(5);
        h.engine.set_scale(100).unwrap();
        let fast = run(5);
        assert!(slow > 0);
        assert!(slow < fast);

        h.engine.disable_all_services();
        assert_eq!(run(3), 0);
        h.engine.enable_all_services();
        assert!(run(1) > 0);
    }

    #[test]
    fn test_scenario_swap_without_candidates_changes_nothing() {
        let h = harness(Config::default());
        let (_, members, _) = bind_raid5(&h.engine, 3);
        h.engine.flush().unwrap();
        let before = snapshot(&h.engine);

        let err = h.engine.spare_for(members[0], SpareKind::HotSpare).unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));
        let err = h
            .engine
            .swap_in(members[1], members[0], SpareKind::HotSpare)
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));

        assert_eq!(snapshot(&h.engine), before);
        assert_eq!(h.engine.pending_commits(), 0);
    }

    #[test]
    fn test_permanent_sparing_and_rebuild_on_tick() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);
        let spare = add_spare(&h.engine, END * 2);

        h.engine
            .fru_faulted(members[0], DeathReason::HardwareFault)
            .unwrap();
        h.clock.advance_secs(10);
        assert_eq!(h.engine.tick().unwrap().swaps, 0);

        h.clock.advance_secs(300);
        assert_eq!(h.engine.tick().unwrap().swaps, 1);
        assert_eq!(h.engine.raid_group(rg).unwrap().record.members[0], spare);
        assert_eq!(h.engine.classify(spare).unwrap(), SpareClass::SparedIn);

        for _ in 0..40 {
            h.clock.advance_secs(1);
            h.engine.tick().unwrap();
        }
        let p = h.engine.fru(spare).unwrap().record.partitions[0].clone();
        assert!(!p.needs_rebuild);
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Ready);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Ready);
    }

    #[test]
    fn test_second_loss_rebuilds_in_full_after_group_recovers() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);

        h.engine.fru_removed(members[0]).unwrap();
        assert!(h.engine.fru(members[0]).unwrap().is_logging(0));
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Degraded);

        // A broken group has no redundancy to log against
        h.engine.fru_removed(members[1]).unwrap();
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Broken);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Faulted);
        assert!(!h.engine.fru(members[1]).unwrap().is_logging(0));

        h.engine.fru_inserted(members[0]).unwrap();
        h.engine.fru_ready(members[0]).unwrap();
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Degraded);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Degraded);
        assert!(!h.engine.fru(members[0]).unwrap().is_logging(0));
        let out = h.engine.fru(members[1]).unwrap();
        assert!(out.is_logging(0));
        assert!(out.record.partitions[0].needs_rebuild);

        assert_eq!(h.engine.io_completed(lu, 3000, 300, true, true).unwrap(), 1);

        h.engine.fru_inserted(members[1]).unwrap();
        h.engine.fru_ready(members[1]).unwrap();
        assert_eq!(
            h.engine
                .checkpoint(CheckpointKind::Rebuild, members[1], 0)
                .unwrap(),
            CheckpointEntry::starting_at(0)
        );
        assert_eq!(
            h.engine
                .tracker()
                .next_work_range(CheckpointKind::Rebuild, members[1], 0, 1 << 20)
                .unwrap(),
            Some((0, END))
        );

        for _ in 0..40 {
            h.clock.advance_secs(1);
            h.engine.tick().unwrap();
        }
        let p = h.engine.fru(members[1]).unwrap().record.partitions[0].clone();
        assert!(p.checkpoint(CheckpointKind::Rebuild).is_complete());
        assert!(!p.needs_rebuild);
        assert_eq!(p.dirty.total_blocks(), 0);
        assert_eq!(h.engine.raid_group_state(rg).unwrap(), RaidGroupState::Ready);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Ready);
    }

    #[test]
    fn test_bind_rules() {
        let h = harness(Config::default());
        let members = add_drives(&h.engine, 4, END);
        let err = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid3, members.clone(), END))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members.clone(), END * 2))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        h.engine.set_hot_spare(members[3], true).unwrap();
        let err = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members.clone(), END))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let rg = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members[..3].to_vec(), END))
            .unwrap();
        let capacity = h.engine.raid_group(rg).unwrap().record.user_capacity();
        let err = h.engine.bind_lu(&LuSpec::new(rg, capacity + 1)).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        let a = h.engine.bind_lu(&LuSpec::new(rg, 1000)).unwrap();
        let b = h.engine.bind_lu(&LuSpec::new(rg, 1000)).unwrap();
        assert_eq!(h.engine.lu(b).unwrap().record.offset, 1000);
        assert!(h.engine.lu(a).unwrap().record.status.bound_by_spa);
    }

    #[test]
    fn test_destroy_requires_unbound_lus() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);
        let err = h.engine.destroy_raid_group(rg).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        h.engine.unbind_lu(lu).unwrap();
        assert!(h.engine.lu(lu).unwrap_err().is_not_found());
        h.engine.destroy_raid_group(rg).unwrap();
        assert!(h.engine.raid_group(rg).unwrap_err().is_not_found());
        for member in &members {
            assert!(h.engine.fru(*member).unwrap().record.partitions.is_empty());
        }
    }

    #[test]
    fn test_zeroing_clears_flag() {
        let h = harness(Config::default());
        let members = add_drives(&h.engine, 3, END * 2);
        let mut spec = group_spec(RaidType::Raid5, members, 20_000);
        spec.zero = true;
        let rg = h.engine.bind_raid_group(&spec).unwrap();
        assert!(h.engine.raid_group(rg).unwrap().record.flags.zeroing);
        for _ in 0..10 {
            h.clock.advance_secs(1);
            h.engine.tick().unwrap();
        }
        assert!(!h.engine.raid_group(rg).unwrap().record.flags.zeroing);
    }

    #[test]
    fn test_expansion_runs_to_completion() {
        let h = harness(Config::default());
        let (rg, _, lu) = bind_raid5(&h.engine, 3);
        h.engine.start_expansion(rg, END + 50_000).unwrap();
        let group = h.engine.raid_group(rg).unwrap();
        assert!(group.record.flags.expanding);
        assert_eq!(group.record.expansion.physical, END);
        assert!(h.engine.start_defragment(rg).is_err());
        assert!(h.engine.bind_lu(&LuSpec::new(rg, 10)).is_err());

        for _ in 0..30 {
            h.clock.advance_secs(1);
            h.engine.tick().unwrap();
        }
        let group = h.engine.raid_group(rg).unwrap();
        assert!(!group.record.flags.expanding);
        assert_eq!(group.record.ending_address, END + 50_000);
        assert_eq!(group.record.user_capacity(), (END + 50_000) * 2);
        assert_eq!(h.engine.lu(lu).unwrap().state, LuState::Ready);
    }

    #[test]
    fn test_quiesce_holds_services() {
        let h = harness(Config::default());
        let (rg, members, _) = bind_raid5(&h.engine, 3);
        let spare = add_spare(&h.engine, END * 2);
        h.engine.quiesce(rg).unwrap();
        assert!(!h.engine.arbiter().is_effective(
            BackgroundService::Rebuild,
            Some(rg),
            None
        ));
        let err = h
            .engine
            .swap_in(spare, members[0], SpareKind::Proactive)
            .unwrap_err();
        assert!(err.is_retryable());

        h.engine.unquiesce(rg).unwrap();
        assert!(h.engine.arbiter().is_effective(
            BackgroundService::Rebuild,
            Some(rg),
            None
        ));
        h.engine
            .swap_in(spare, members[0], SpareKind::Proactive)
            .unwrap();
    }

    #[test]
    fn test_service_gate_rejects_unknown_scope() {
        let h = harness(Config::default());
        let err = h
            .engine
            .disable_service(
                Scope::RaidGroup(RaidGroupId::new(7)),
                BackgroundService::Rebuild,
                Requestor::User,
            )
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(h.engine.set_scale(101).is_err());
    }

    #[test]
    fn test_lu_scope_limited_to_per_unit_services() {
        let h = harness(Config::default());
        let (_, _, lu) = bind_raid5(&h.engine, 3);
        let err = h
            .engine
            .disable_service(Scope::Lu(lu), BackgroundService::Rebuild, Requestor::User)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        h.engine
            .disable_service(
                Scope::Lu(lu),
                BackgroundService::BackgroundVerify,
                Requestor::User,
            )
            .unwrap();
        h.engine
            .disable_service(Scope::Lu(lu), BackgroundService::LunZero, Requestor::User)
            .unwrap();
        let err = h
            .engine
            .enable_service(
                Scope::Lu(LuId::new(9)),
                BackgroundService::BackgroundVerify,
                Requestor::User,
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_address_overflow_rejected() {
        let h = harness(Config::default());
        let members = add_drives(&h.engine, 3, END * 2);
        let mut spec = group_spec(RaidType::Raid5, members.clone(), END);
        spec.address_offset = u64::MAX - 10;
        let err = h.engine.bind_raid_group(&spec).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(h.engine.raid_group(RaidGroupId::new(0)).is_err());

        let rg = h
            .engine
            .bind_raid_group(&group_spec(RaidType::Raid5, members, END))
            .unwrap();
        let lu = h.engine.bind_lu(&LuSpec::new(rg, 10_000)).unwrap();
        let err = h.engine.io_completed(lu, u64::MAX - 5, 10, true, true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = h.engine.io_completed(lu, 9_995, 10, true, true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_recovery_rederives_runtime_state() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);
        h.engine
            .disable_service(Scope::RaidGroup(rg), BackgroundService::Rebuild, Requestor::User)
            .unwrap();
        h.engine
            .disable_service(
                Scope::RaidGroup(rg),
                BackgroundService::Rebuild,
                Requestor::ErrorHandling,
            )
            .unwrap();
        h.engine.set_scale(40).unwrap();
        h.engine.flush().unwrap();

        let present = vec![members[0], members[1]];
        let recovered = ArrayEngine::recover(
            Config::default(),
            h.backend.clone(),
            h.clock.clone(),
            &Discovery::Listed(present),
        )
        .unwrap();

        let out = recovered.fru(members[2]).unwrap();
        assert_eq!(out.state, FruState::Removed);
        assert!(out.is_logging(0));
        assert!(out.record.partitions[0].needs_rebuild);
        assert_eq!(recovered.fru(members[0]).unwrap().state, FruState::Ready);
        assert_eq!(recovered.raid_group_state(rg).unwrap(), RaidGroupState::Degraded);
        assert_eq!(recovered.lu(lu).unwrap().state, LuState::Degraded);

        let arbiter = recovered.arbiter();
        assert_eq!(
            arbiter.disabled_by(Scope::RaidGroup(rg), BackgroundService::Rebuild),
            vec![Requestor::User]
        );
        assert_eq!(arbiter.scale(), 40);
        assert_eq!(recovered.system().scale_percent, 40);
        recovered.tick().unwrap();
    }

    #[test]
    fn test_recovery_flags_orphaned_partitions() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);
        h.engine.flush().unwrap();
        h.backend
            .commit(&[CommitRecord::delete(RecordKey::RaidGroup(rg), 99, SpId::A)])
            .unwrap();

        let recovered = ArrayEngine::recover(
            Config::default(),
            h.backend.clone(),
            h.clock.clone(),
            &Discovery::FromLastKnown,
        )
        .unwrap();
        for member in &members {
            let drive = recovered.fru(*member).unwrap();
            assert!(drive.record.flags.needs_db_rebuild);
            assert_eq!(drive.state, FruState::Ready);
        }
        assert_eq!(recovered.lu(lu).unwrap().state, LuState::Faulted);
        recovered.tick().unwrap();
    }

    #[test]
    fn test_recovery_replaces_unreadable_drive() {
        let h = harness(Config::default());
        let (rg, members, _) = bind_raid5(&h.engine, 3);
        h.engine.flush().unwrap();
        assert!(h.backend.corrupt(RecordKey::Fru(members[1])));

        let recovered = ArrayEngine::recover(
            Config::default(),
            h.backend.clone(),
            h.clock.clone(),
            &Discovery::FromLastKnown,
        )
        .unwrap();
        let placeholder = recovered.fru(members[1]).unwrap();
        assert!(placeholder.record.flags.needs_db_rebuild);
        assert_eq!(placeholder.state, FruState::Removed);
        assert_eq!(recovered.raid_group_state(rg).unwrap(), RaidGroupState::Degraded);
        recovered.tick().unwrap();
    }

    #[test]
    fn test_flush_failure_keeps_commits_queued() {
        let h = harness(Config::default());
        bind_raid5(&h.engine, 3);
        let pending = h.engine.pending_commits();
        assert!(pending > 0);

        h.backend.fail_next_commits(1);
        assert!(h.engine.flush().is_err());
        assert_eq!(h.engine.pending_commits(), pending);
        assert_eq!(h.engine.flush().unwrap(), pending);
        assert_eq!(h.backend.len(), pending);
    }

    #[test]
    fn test_peer_sees_pushed_commits() {
        let a = harness(Config::default());
        let mut peer_config = Config::default();
        peer_config.engine.local_sp = SpId::B;
        let b = harness(peer_config);
        let link = Arc::new(BufferedPeerLink::new());
        a.engine.set_peer(link.clone());

        let (rg, members, lu) = bind_raid5(&a.engine, 3);
        a.engine
            .disable_service(Scope::System, BackgroundService::SniffVerify, Requestor::User)
            .unwrap();
        a.engine.flush().unwrap();

        let pushed = link.drain();
        assert!(b.engine.apply_peer_commits(&pushed).unwrap() > 0);
        assert_eq!(b.engine.apply_peer_commits(&pushed).unwrap(), 0);

        assert_eq!(b.engine.raid_group(rg).unwrap().record.members, members);
        assert_eq!(b.engine.fru(members[0]).unwrap().state, FruState::Defined);
        assert_eq!(b.engine.lu(lu).unwrap().state, LuState::Binding);
        assert!(!b
            .engine
            .arbiter()
            .is_enabled(Scope::System, BackgroundService::SniffVerify));
    }

    #[test]
    fn test_recovery_from_redb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let clock = Arc::new(ManualClock::new());
        let (rg, lu) = {
            let backend = Arc::new(MetaStore::open(&path).unwrap());
            let engine = ArrayEngine::new(Config::default(), backend, clock.clone());
            let (rg, _, lu) = bind_raid5(&engine, 3);
            engine.set_system_power_save(true);
            engine.flush().unwrap();
            (rg, lu)
        };

        let backend = Arc::new(MetaStore::open(&path).unwrap());
        let recovered =
            ArrayEngine::recover(Config::default(), backend, clock, &Discovery::FromLastKnown)
                .unwrap();
        assert_eq!(recovered.raid_group_state(rg).unwrap(), RaidGroupState::Ready);
        assert_eq!(recovered.lu(lu).unwrap().state, LuState::Ready);
        assert!(recovered.system().power_save_enabled);
        assert!(recovered.power().settings().system_enabled);
    }

    #[tokio::test]
    async fn test_subscriber_sees_member_loss() {
        let h = harness(Config::default());
        let (rg, members, lu) = bind_raid5(&h.engine, 3);
        let mut rx = h.engine.subscribe(
            ObjectTypeMask::of(&[ObjectType::RaidGroup, ObjectType::Lu]),
            StateMask::of(&[
                ObjectState::RaidGroup(RaidGroupState::Degraded),
                ObjectState::Lu(LuState::Degraded),
            ]),
        );
        h.engine.fru_removed(members[0]).unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|e| e.object);
        assert_eq!(seen[0].object, ObjectRef::RaidGroup(rg));
        assert_eq!(seen[0].new, Some(ObjectState::RaidGroup(RaidGroupState::Degraded)));
        assert_eq!(seen[1].object, ObjectRef::Lu(lu));
        assert_eq!(seen[1].old, Some(ObjectState::Lu(LuState::Ready)));
    }
}

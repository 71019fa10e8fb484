//! Object store: arena tables of drives, RAID groups and logical units.
//!
//! All authoritative state lives here behind a single `RwLock`. Mutations go
//! through [`ObjectStore::transact`], which stages copies of the touched
//! records, validates structural invariants, and only then swaps the staged
//! copies in. A rejected transaction leaves every record untouched.
//!
//! On commit the store compares each record's persisted projection before
//! and after; only records whose projection changed bump their generation and
//! get a commit queued. Lifecycle events are published while the write lock
//! is still held so subscribers observe commit order.

use crate::clock::Clock;
use crate::events::{EventBus, LifecycleEvent, ObjectState};
use crate::persist::PersistQueue;
use crate::records::{Fru, LogicalUnit, ObjectRecord, RaidGroup};
use arrayio_common::config::EngineConfig;
use arrayio_common::{
    Error, FruFlag, FruId, FruState, LuId, LuState, ObjectRef, ObjectType, RaidGroupId,
    RaidGroupState, Result, SpId,
};
use arrayio_meta_store::{CommitRecord, RecordBody, RecordKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Table capacities
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_frus: usize,
    pub max_raid_groups: usize,
    pub max_lus: usize,
    pub max_partitions: usize,
}

impl From<&EngineConfig> for Limits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_frus: config.max_frus,
            max_raid_groups: config.max_raid_groups,
            max_lus: config.max_lus,
            max_partitions: config.max_partitions,
        }
    }
}

/// Read access shared by committed tables and open transactions
pub trait ObjectView {
    fn fru(&self, id: FruId) -> Result<&Fru>;

    fn raid_group(&self, id: RaidGroupId) -> Result<&RaidGroup>;

    fn lu(&self, id: LuId) -> Result<&LogicalUnit>;

    fn fru_ids(&self) -> Vec<FruId>;

    fn raid_group_ids(&self) -> Vec<RaidGroupId>;

    fn lu_ids(&self) -> Vec<LuId>;

    /// Member positions whose drive is missing or not Ready
    fn failed_positions(&self, id: RaidGroupId) -> Result<BTreeSet<usize>> {
        let group = self.raid_group(id)?;
        Ok(group
            .record
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| self.fru(**member).map_or(true, |f| !f.is_ready()))
            .map(|(position, _)| position)
            .collect())
    }

    /// Health derived from member drive states
    fn raid_group_state(&self, id: RaidGroupId) -> Result<RaidGroupState> {
        let group = self.raid_group(id)?;
        let failed = self.failed_positions(id)?;
        Ok(if failed.is_empty() {
            RaidGroupState::Ready
        } else if group
            .record
            .raid_type
            .is_broken(group.record.width(), &failed)
        {
            RaidGroupState::Broken
        } else {
            RaidGroupState::Degraded
        })
    }

    /// LU state implied by its group's health
    fn lu_state_for(&self, id: RaidGroupId) -> Result<LuState> {
        Ok(match self.raid_group_state(id)? {
            RaidGroupState::Ready => LuState::Ready,
            RaidGroupState::Degraded => LuState::Degraded,
            RaidGroupState::Broken => LuState::Faulted,
        })
    }

    /// Bound and still able to serve data
    fn is_usable(&self, id: RaidGroupId) -> bool {
        self.raid_group(id).is_ok_and(RaidGroup::is_valid)
            && self
                .raid_group_state(id)
                .is_ok_and(|s| s != RaidGroupState::Broken)
    }
}

/// Committed arena tables
#[derive(Clone, Debug, Default)]
pub struct Tables {
    frus: Vec<Option<Fru>>,
    raid_groups: Vec<Option<RaidGroup>>,
    lus: Vec<Option<LogicalUnit>>,
}

fn slot<T>(table: &[Option<T>], index: usize) -> Option<&T> {
    table.get(index).and_then(Option::as_ref)
}

fn slot_mut<T>(table: &mut Vec<Option<T>>, index: usize) -> &mut Option<T> {
    if table.len() <= index {
        table.resize_with(index + 1, || None);
    }
    &mut table[index]
}

fn occupied<T>(table: &[Option<T>]) -> impl Iterator<Item = (usize, &T)> {
    table
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| entry.as_ref().map(|v| (i, v)))
}

fn to_raw(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

impl Tables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frus(&self) -> impl Iterator<Item = &Fru> {
        occupied(&self.frus).map(|(_, f)| f)
    }

    pub fn raid_groups(&self) -> impl Iterator<Item = &RaidGroup> {
        occupied(&self.raid_groups).map(|(_, g)| g)
    }

    pub fn lus(&self) -> impl Iterator<Item = &LogicalUnit> {
        occupied(&self.lus).map(|(_, l)| l)
    }

    /// Install a record directly, bypassing transactions (recovery only)
    pub(crate) fn put_fru(&mut self, fru: Fru) {
        let index = fru.id.index();
        *slot_mut(&mut self.frus, index) = Some(fru);
    }

    pub(crate) fn put_raid_group(&mut self, group: RaidGroup) {
        let index = group.id.index();
        *slot_mut(&mut self.raid_groups, index) = Some(group);
    }

    pub(crate) fn put_lu(&mut self, lu: LogicalUnit) {
        let index = lu.id.index();
        *slot_mut(&mut self.lus, index) = Some(lu);
    }

    pub(crate) fn fru_mut(&mut self, id: FruId) -> Option<&mut Fru> {
        self.frus.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn lu_mut(&mut self, id: LuId) -> Option<&mut LogicalUnit> {
        self.lus.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn apply(&mut self, staged: Staged, origin: SpId) -> (Vec<CommitRecord>, Vec<LifecycleEvent>) {
        let mut commits = Vec::new();
        let mut events = Vec::new();

        // RAID group health depends on member drives, so capture it for
        // every group a touched drive belongs to (before and after)
        let mut affected: BTreeSet<RaidGroupId> = staged.raid_groups.keys().copied().collect();
        for (id, entry) in &staged.frus {
            if let Ok(old) = self.fru(*id) {
                affected.extend(old.raid_groups());
            }
            if let Some(new) = entry {
                affected.extend(new.raid_groups());
            }
            affected.extend(
                self.raid_groups()
                    .filter(|g| g.record.members.contains(id))
                    .map(|g| g.id),
            );
        }
        let health_before: Vec<(RaidGroupId, Option<RaidGroupState>)> = affected
            .iter()
            .map(|id| (*id, self.raid_group_state(*id).ok()))
            .collect();

        for (id, entry) in staged.frus {
            let object = ObjectRef::Fru(id);
            let key = RecordKey::Fru(id);
            let slot = slot_mut(&mut self.frus, id.index());
            let old = slot.take();
            if let Some(mut new) = entry {
                if old.as_ref().is_none_or(|o| o.record != new.record) {
                    new.generation += 1;
                    commits.push(CommitRecord::put(
                        key,
                        new.generation,
                        origin,
                        RecordBody::Fru(new.record.clone()),
                    ));
                }
                push_change(
                    &mut events,
                    object,
                    old.as_ref().map(|o| ObjectState::Fru(o.state)),
                    Some(ObjectState::Fru(new.state)),
                );
                if let Some(old) = &old {
                    push_change(
                        &mut events,
                        object,
                        Some(ObjectState::Power(old.power.state)),
                        Some(ObjectState::Power(new.power.state)),
                    );
                }
                *slot = Some(new);
            } else if let Some(old) = old {
                commits.push(CommitRecord::delete(key, old.generation + 1, origin));
                push_change(&mut events, object, Some(ObjectState::Fru(old.state)), None);
            }
        }

        for (id, entry) in staged.raid_groups {
            let object = ObjectRef::RaidGroup(id);
            let key = RecordKey::RaidGroup(id);
            let slot = slot_mut(&mut self.raid_groups, id.index());
            let old = slot.take();
            if let Some(mut new) = entry {
                if old.as_ref().is_none_or(|o| o.record != new.record) {
                    new.generation += 1;
                    commits.push(CommitRecord::put(
                        key,
                        new.generation,
                        origin,
                        RecordBody::RaidGroup(new.record.clone()),
                    ));
                }
                if let Some(old) = &old {
                    push_change(
                        &mut events,
                        object,
                        Some(ObjectState::Power(old.power.state)),
                        Some(ObjectState::Power(new.power.state)),
                    );
                }
                *slot = Some(new);
            } else if let Some(old) = old {
                commits.push(CommitRecord::delete(key, old.generation + 1, origin));
            }
        }

        for (id, entry) in staged.lus {
            let object = ObjectRef::Lu(id);
            let key = RecordKey::Lu(id);
            let slot = slot_mut(&mut self.lus, id.index());
            let old = slot.take();
            if let Some(mut new) = entry {
                if old.as_ref().is_none_or(|o| o.record != new.record) {
                    new.generation += 1;
                    commits.push(CommitRecord::put(
                        key,
                        new.generation,
                        origin,
                        RecordBody::Lu(new.record.clone()),
                    ));
                }
                push_change(
                    &mut events,
                    object,
                    old.as_ref().map(|o| ObjectState::Lu(o.state)),
                    Some(ObjectState::Lu(new.state)),
                );
                if let Some(old) = &old {
                    push_change(
                        &mut events,
                        object,
                        Some(ObjectState::Power(old.power.state)),
                        Some(ObjectState::Power(new.power.state)),
                    );
                }
                *slot = Some(new);
            } else if let Some(old) = old {
                commits.push(CommitRecord::delete(key, old.generation + 1, origin));
                push_change(&mut events, object, Some(ObjectState::Lu(old.state)), None);
            }
        }

        for (id, before) in health_before {
            let after = self.raid_group_state(id).ok();
            push_change(
                &mut events,
                ObjectRef::RaidGroup(id),
                before.map(ObjectState::RaidGroup),
                after.map(ObjectState::RaidGroup),
            );
        }

        (commits, events)
    }
}

fn push_change(
    events: &mut Vec<LifecycleEvent>,
    object: ObjectRef,
    old: Option<ObjectState>,
    new: Option<ObjectState>,
) {
    if old != new {
        events.push(LifecycleEvent { object, old, new });
    }
}

impl ObjectView for Tables {
    fn fru(&self, id: FruId) -> Result<&Fru> {
        slot(&self.frus, id.index()).ok_or_else(|| Error::not_found(id))
    }

    fn raid_group(&self, id: RaidGroupId) -> Result<&RaidGroup> {
        slot(&self.raid_groups, id.index()).ok_or_else(|| Error::not_found(id))
    }

    fn lu(&self, id: LuId) -> Result<&LogicalUnit> {
        slot(&self.lus, id.index()).ok_or_else(|| Error::not_found(id))
    }

    fn fru_ids(&self) -> Vec<FruId> {
        occupied(&self.frus)
            .map(|(i, _)| FruId::new(to_raw(i)))
            .collect()
    }

    fn raid_group_ids(&self) -> Vec<RaidGroupId> {
        occupied(&self.raid_groups)
            .map(|(i, _)| RaidGroupId::new(to_raw(i)))
            .collect()
    }

    fn lu_ids(&self) -> Vec<LuId> {
        occupied(&self.lus)
            .map(|(i, _)| LuId::new(to_raw(i)))
            .collect()
    }
}

/// Staged copies of touched records; `None` deletes
#[derive(Default)]
struct Staged {
    frus: BTreeMap<FruId, Option<Fru>>,
    raid_groups: BTreeMap<RaidGroupId, Option<RaidGroup>>,
    lus: BTreeMap<LuId, Option<LogicalUnit>>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.frus.is_empty() && self.raid_groups.is_empty() && self.lus.is_empty()
    }
}

/// Open multi-record transaction
pub struct Txn<'a> {
    base: &'a Tables,
    limits: Limits,
    now_secs: u64,
    staged: Staged,
}

fn staged_get<'s, K: Ord, T>(
    staged: &'s BTreeMap<K, Option<T>>,
    key: &K,
) -> Option<std::result::Result<&'s T, ()>> {
    staged.get(key).map(|entry| entry.as_ref().ok_or(()))
}

fn merged_ids<K: Ord + Copy, T>(base: Vec<K>, staged: &BTreeMap<K, Option<T>>) -> Vec<K> {
    let mut ids: BTreeSet<K> = base.into_iter().collect();
    for (id, entry) in staged {
        if entry.is_some() {
            ids.insert(*id);
        } else {
            ids.remove(id);
        }
    }
    ids.into_iter().collect()
}

fn free_slot<K: Ord, T>(
    base: &[Option<T>],
    staged: &BTreeMap<K, Option<T>>,
    key: impl Fn(u32) -> K,
    limit: usize,
) -> Option<u32> {
    (0..limit)
        .filter_map(|i| u32::try_from(i).ok())
        .find(|raw| slot(base, *raw as usize).is_none() && !staged.contains_key(&key(*raw)))
}

impl<'a> Txn<'a> {
    fn new(base: &'a Tables, limits: Limits, now_secs: u64) -> Self {
        Self {
            base,
            limits,
            now_secs,
            staged: Staged::default(),
        }
    }

    /// Engine time the transaction started at
    #[must_use]
    pub const fn now_secs(&self) -> u64 {
        self.now_secs
    }

    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn fru_mut(&mut self, id: FruId) -> Result<&mut Fru> {
        if !self.staged.frus.contains_key(&id) {
            let copy = self.base.fru(id)?.clone();
            self.staged.frus.insert(id, Some(copy));
        }
        match self.staged.frus.get_mut(&id) {
            Some(Some(fru)) => Ok(fru),
            _ => Err(Error::not_found(id)),
        }
    }

    pub fn raid_group_mut(&mut self, id: RaidGroupId) -> Result<&mut RaidGroup> {
        if !self.staged.raid_groups.contains_key(&id) {
            let copy = self.base.raid_group(id)?.clone();
            self.staged.raid_groups.insert(id, Some(copy));
        }
        match self.staged.raid_groups.get_mut(&id) {
            Some(Some(group)) => Ok(group),
            _ => Err(Error::not_found(id)),
        }
    }

    pub fn lu_mut(&mut self, id: LuId) -> Result<&mut LogicalUnit> {
        if !self.staged.lus.contains_key(&id) {
            let copy = self.base.lu(id)?.clone();
            self.staged.lus.insert(id, Some(copy));
        }
        match self.staged.lus.get_mut(&id) {
            Some(Some(lu)) => Ok(lu),
            _ => Err(Error::not_found(id)),
        }
    }

    /// Create a drive record in the lowest free slot
    pub fn insert_fru(&mut self, build: impl FnOnce(FruId) -> Fru) -> Result<FruId> {
        let raw = free_slot(
            &self.base.frus,
            &self.staged.frus,
            FruId::new,
            self.limits.max_frus,
        )
        .ok_or_else(|| Error::ResourceExhausted("drive table full".into()))?;
        let id = FruId::new(raw);
        self.staged.frus.insert(id, Some(build(id)));
        Ok(id)
    }

    pub fn insert_raid_group(
        &mut self,
        build: impl FnOnce(RaidGroupId) -> RaidGroup,
    ) -> Result<RaidGroupId> {
        let raw = free_slot(
            &self.base.raid_groups,
            &self.staged.raid_groups,
            RaidGroupId::new,
            self.limits.max_raid_groups,
        )
        .ok_or_else(|| Error::ResourceExhausted("raid group table full".into()))?;
        let id = RaidGroupId::new(raw);
        self.staged.raid_groups.insert(id, Some(build(id)));
        Ok(id)
    }

    pub fn insert_lu(&mut self, build: impl FnOnce(LuId) -> LogicalUnit) -> Result<LuId> {
        let raw = free_slot(
            &self.base.lus,
            &self.staged.lus,
            LuId::new,
            self.limits.max_lus,
        )
        .ok_or_else(|| Error::ResourceExhausted("lu table full".into()))?;
        let id = LuId::new(raw);
        self.staged.lus.insert(id, Some(build(id)));
        Ok(id)
    }

    pub fn remove_raid_group(&mut self, id: RaidGroupId) -> Result<()> {
        self.raid_group(id)?;
        self.staged.raid_groups.insert(id, None);
        Ok(())
    }

    pub fn remove_lu(&mut self, id: LuId) -> Result<()> {
        self.lu(id)?;
        self.staged.lus.insert(id, None);
        Ok(())
    }

    /// Check structural invariants of everything staged
    fn validate(&self) -> Result<()> {
        for (id, entry) in &self.staged.raid_groups {
            match entry {
                Some(group) => {
                    let flags = &group.record.flags;
                    if flags.valid && group.record.members.is_empty() {
                        return Err(Error::invalid_transition(format!(
                            "{id}: valid with an empty member table"
                        )));
                    }
                    if flags.expanding && flags.defragmenting {
                        return Err(Error::invalid_transition(format!(
                            "{id}: expanding and defragmenting at once"
                        )));
                    }
                    if let Some(missing) =
                        group.record.members.iter().find(|m| self.fru(**m).is_err())
                    {
                        return Err(Error::invalid_transition(format!(
                            "{id}: member {missing} does not exist"
                        )));
                    }
                }
                None => {
                    if let Some(lu) = self
                        .lu_ids()
                        .into_iter()
                        .find(|lu| self.lu(*lu).is_ok_and(|l| l.record.raid_group == *id))
                    {
                        return Err(Error::invalid_transition(format!(
                            "{id}: {lu} is still bound"
                        )));
                    }
                }
            }
        }

        for (id, entry) in &self.staged.lus {
            let Some(lu) = entry else { continue };
            let needs_bound_group = matches!(
                lu.state,
                LuState::Binding | LuState::Ready | LuState::Degraded | LuState::Unbinding
            );
            if needs_bound_group
                && !self
                    .raid_group(lu.record.raid_group)
                    .is_ok_and(RaidGroup::is_valid)
            {
                return Err(Error::invalid_transition(format!(
                    "{id}: {} is not a bound raid group",
                    lu.record.raid_group
                )));
            }
        }

        for (id, entry) in &self.staged.frus {
            let Some(fru) = entry else { continue };
            if fru.record.partitions.len() > self.limits.max_partitions {
                return Err(Error::ResourceExhausted(format!("{id}: partition table full")));
            }
            if !fru.record.flags.needs_db_rebuild
                && let Some(p) = fru
                    .record
                    .partitions
                    .iter()
                    .find(|p| self.raid_group(p.raid_group).is_err())
            {
                return Err(Error::invalid_transition(format!(
                    "{id}: partition {} references missing {}",
                    p.index, p.raid_group
                )));
            }
        }
        Ok(())
    }
}

impl ObjectView for Txn<'_> {
    fn fru(&self, id: FruId) -> Result<&Fru> {
        match staged_get(&self.staged.frus, &id) {
            Some(Ok(fru)) => Ok(fru),
            Some(Err(())) => Err(Error::not_found(id)),
            None => self.base.fru(id),
        }
    }

    fn raid_group(&self, id: RaidGroupId) -> Result<&RaidGroup> {
        match staged_get(&self.staged.raid_groups, &id) {
            Some(Ok(group)) => Ok(group),
            Some(Err(())) => Err(Error::not_found(id)),
            None => self.base.raid_group(id),
        }
    }

    fn lu(&self, id: LuId) -> Result<&LogicalUnit> {
        match staged_get(&self.staged.lus, &id) {
            Some(Ok(lu)) => Ok(lu),
            Some(Err(())) => Err(Error::not_found(id)),
            None => self.base.lu(id),
        }
    }

    fn fru_ids(&self) -> Vec<FruId> {
        merged_ids(self.base.fru_ids(), &self.staged.frus)
    }

    fn raid_group_ids(&self) -> Vec<RaidGroupId> {
        merged_ids(self.base.raid_group_ids(), &self.staged.raid_groups)
    }

    fn lu_ids(&self) -> Vec<LuId> {
        merged_ids(self.base.lu_ids(), &self.staged.lus)
    }
}

/// Move every bound LU of a group to the state the group's health implies
pub fn refresh_lus_in(txn: &mut Txn<'_>, raid_group: RaidGroupId) -> Result<()> {
    let Ok(group) = txn.raid_group(raid_group) else {
        return Ok(());
    };
    if !group.is_valid() {
        return Ok(());
    }
    let lus = group.record.lus.clone();
    let next = txn.lu_state_for(raid_group)?;
    for id in lus {
        let lu = txn.lu_mut(id)?;
        if lu.state.is_bound() && lu.state != next {
            info!("{}: {} -> {}", id, lu.state, next);
            lu.transition(next)?;
        }
    }
    Ok(())
}

/// Query over object type and RAID group scope
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjectFilter {
    pub object_type: Option<ObjectType>,
    pub raid_group: Option<RaidGroupId>,
}

/// The repository owning every drive, RAID group and LU record
pub struct ObjectStore {
    tables: RwLock<Tables>,
    limits: Limits,
    origin: SpId,
    queue: Arc<PersistQueue>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl ObjectStore {
    pub fn new(
        config: &EngineConfig,
        queue: Arc<PersistQueue>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tables: RwLock::new(Tables::new()),
            limits: Limits::from(config),
            origin: config.local_sp,
            queue,
            events,
            clock,
        }
    }

    /// Replace all tables (recovery)
    pub(crate) fn install(&self, tables: Tables) {
        *self.tables.write() = tables;
    }

    #[must_use]
    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Run a pure read under the shared lock
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Run an all-or-nothing multi-record transaction.
    ///
    /// If `f` fails, or the staged result violates a structural invariant,
    /// nothing is written and the error is returned.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<R>) -> Result<R> {
        let now_secs = self.clock.now_secs();
        let mut tables = self.tables.write();
        let (out, staged) = {
            let mut txn = Txn::new(&tables, self.limits, now_secs);
            let out = f(&mut txn)?;
            txn.validate()?;
            (out, txn.staged)
        };
        if staged.is_empty() {
            return Ok(out);
        }
        let (commits, events) = tables.apply(staged, self.origin);
        self.queue.enqueue_all(commits);
        self.events.publish(&events);
        Ok(out)
    }

    pub fn fru(&self, id: FruId) -> Result<Fru> {
        self.read(|t| t.fru(id).cloned())
    }

    pub fn raid_group(&self, id: RaidGroupId) -> Result<RaidGroup> {
        self.read(|t| t.raid_group(id).cloned())
    }

    pub fn lu(&self, id: LuId) -> Result<LogicalUnit> {
        self.read(|t| t.lu(id).cloned())
    }

    pub fn raid_group_state(&self, id: RaidGroupId) -> Result<RaidGroupState> {
        self.read(|t| t.raid_group_state(id))
    }

    pub fn is_flag_set(&self, id: FruId, flag: FruFlag) -> Result<bool> {
        self.read(|t| t.fru(id).map(|f| f.is_flag_set(flag)))
    }

    /// Evaluate a predicate against any record
    pub fn is_type(
        &self,
        object: ObjectRef,
        predicate: impl FnOnce(ObjectRecord<'_>) -> bool,
    ) -> Result<bool> {
        self.read(|t| {
            let record = match object {
                ObjectRef::Fru(id) => ObjectRecord::Fru(t.fru(id)?),
                ObjectRef::RaidGroup(id) => ObjectRecord::RaidGroup(t.raid_group(id)?),
                ObjectRef::Lu(id) => ObjectRecord::Lu(t.lu(id)?),
            };
            Ok(predicate(record))
        })
    }

    /// Objects matching a filter, ordered by type then id
    #[must_use]
    pub fn list(&self, filter: &ObjectFilter) -> Vec<ObjectRef> {
        let wants = |t: ObjectType| filter.object_type.is_none_or(|want| want == t);
        self.read(|t| {
            let mut out = Vec::new();
            if wants(ObjectType::Fru) {
                out.extend(
                    t.frus()
                        .filter(|f| {
                            filter
                                .raid_group
                                .is_none_or(|rg| f.record.partition_for(rg).is_some())
                        })
                        .map(|f| ObjectRef::Fru(f.id)),
                );
            }
            if wants(ObjectType::RaidGroup) {
                out.extend(
                    t.raid_groups()
                        .filter(|g| filter.raid_group.is_none_or(|rg| rg == g.id))
                        .map(|g| ObjectRef::RaidGroup(g.id)),
                );
            }
            if wants(ObjectType::Lu) {
                out.extend(
                    t.lus()
                        .filter(|l| filter.raid_group.is_none_or(|rg| rg == l.record.raid_group))
                        .map(|l| ObjectRef::Lu(l.id)),
                );
            }
            out
        })
    }

    /// Move a drive from `expected` to `next` if it is still in `expected`.
    ///
    /// Returns `Ok(false)` when the drive changed state since the caller
    /// looked at it.
    pub fn compare_and_transition_fru(
        &self,
        id: FruId,
        expected: FruState,
        next: FruState,
    ) -> Result<bool> {
        self.transact(|txn| {
            let now = txn.now_secs();
            let fru = txn.fru_mut(id)?;
            if fru.state != expected {
                debug!(
                    "{}: expected {} but found {}, not transitioning",
                    id, expected, fru.state
                );
                return Ok(false);
            }
            fru.transition(next, now)?;
            Ok(true)
        })
    }

    /// Install a record committed by the peer controller.
    ///
    /// The record is applied only when its generation is newer than the
    /// local copy; runtime state of an existing local record is kept.
    /// Returns whether anything changed.
    pub fn apply_peer_record(&self, commit: &CommitRecord) -> Result<bool> {
        let now_secs = self.clock.now_secs();
        let mut tables = self.tables.write();
        let local_generation = match commit.key {
            RecordKey::Fru(id) => tables.fru(id).ok().map(|f| f.generation),
            RecordKey::RaidGroup(id) => tables.raid_group(id).ok().map(|g| g.generation),
            RecordKey::Lu(id) => tables.lu(id).ok().map(|l| l.generation),
            RecordKey::ServiceGate(_) | RecordKey::System => {
                return Err(Error::invalid_argument(format!(
                    "{:?} is not an object record",
                    commit.key
                )));
            }
        };
        if local_generation.is_some_and(|g| g >= commit.generation) {
            debug!(
                "Ignoring stale peer commit for {:?} (generation {})",
                commit.key, commit.generation
            );
            return Ok(false);
        }

        let mut staged = Staged::default();
        match (&commit.key, &commit.body) {
            (RecordKey::Fru(id), Some(RecordBody::Fru(record))) => {
                let mut fru = tables.fru(*id).cloned().unwrap_or_else(|_| {
                    Fru::new(*id, record.clone(), FruState::Defined, now_secs)
                });
                fru.record = record.clone();
                staged.frus.insert(*id, Some(fru));
            }
            (RecordKey::RaidGroup(id), Some(RecordBody::RaidGroup(record))) => {
                let mut group = tables
                    .raid_group(*id)
                    .cloned()
                    .unwrap_or_else(|_| RaidGroup::new(*id, record.clone(), now_secs));
                group.record = record.clone();
                staged.raid_groups.insert(*id, Some(group));
            }
            (RecordKey::Lu(id), Some(RecordBody::Lu(record))) => {
                let mut lu = tables.lu(*id).cloned().unwrap_or_else(|_| {
                    let mut lu = LogicalUnit::new(*id, record.clone(), now_secs);
                    lu.state = LuState::Binding;
                    lu
                });
                lu.record = record.clone();
                staged.lus.insert(*id, Some(lu));
            }
            (RecordKey::Fru(id), None) => {
                staged.frus.insert(*id, None);
            }
            (RecordKey::RaidGroup(id), None) => {
                staged.raid_groups.insert(*id, None);
            }
            (RecordKey::Lu(id), None) => {
                staged.lus.insert(*id, None);
            }
            (key, Some(_)) => {
                warn!("Peer commit for {:?} carries a mismatched body", key);
                return Err(Error::invalid_argument(format!(
                    "mismatched body for {key:?}"
                )));
            }
            (_, None) => return Ok(false),
        }

        // The peer already persisted this version; only events go out
        let (_, events) = tables.apply(staged, self.origin);
        match commit.key {
            RecordKey::Fru(id) => {
                if let Some(fru) = tables.fru_mut(id) {
                    fru.generation = commit.generation;
                }
            }
            RecordKey::RaidGroup(id) => {
                if let Some(group) = tables
                    .raid_groups
                    .get_mut(id.index())
                    .and_then(Option::as_mut)
                {
                    group.generation = commit.generation;
                }
            }
            RecordKey::Lu(id) => {
                if let Some(lu) = tables.lu_mut(id) {
                    lu.generation = commit.generation;
                }
            }
            RecordKey::ServiceGate(_) | RecordKey::System => {}
        }
        self.events.publish(&events);
        Ok(true)
    }
}

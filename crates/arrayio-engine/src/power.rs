//! Power-state propagation along the LU → RAID group → drive chain.
//!
//! Every object runs `Active → Entering → Hibernating → WakingUp → Active`.
//! An object whose idle timer expired may hibernate only once every
//! upstream object has marked the connecting edge as slumbering and is
//! itself hibernating; a single awake upstream keeps the whole subtree up.
//!
//! A pass runs inside one store transaction. The first sweep goes top-down
//! (LUs, groups, drives) so each object sees its upstream decisions from the
//! same pass; the second sweep goes bottom-up and finishes wake-ups once
//! nothing downstream is still asleep.

use crate::store::{ObjectStore, ObjectView, Txn};
use arrayio_common::config::PowerSaveConfig;
use arrayio_common::{
    LuId, LuState, ObjectRef, PowerSaveInfo, PowerSaveState, RaidGroupId, Result,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

fn power_of(view: &impl ObjectView, object: ObjectRef) -> Result<&PowerSaveInfo> {
    Ok(match object {
        ObjectRef::Fru(id) => &view.fru(id)?.power,
        ObjectRef::RaidGroup(id) => &view.raid_group(id)?.power,
        ObjectRef::Lu(id) => &view.lu(id)?.power,
    })
}

fn power_mut<'t>(txn: &'t mut Txn<'_>, object: ObjectRef) -> Result<&'t mut PowerSaveInfo> {
    Ok(match object {
        ObjectRef::Fru(id) => &mut txn.fru_mut(id)?.power,
        ObjectRef::RaidGroup(id) => &mut txn.raid_group_mut(id)?.power,
        ObjectRef::Lu(id) => &mut txn.lu_mut(id)?.power,
    })
}

/// Objects whose agreement `object` needs before hibernating
fn upstreams(view: &impl ObjectView, object: ObjectRef) -> Vec<ObjectRef> {
    match object {
        ObjectRef::Lu(_) => Vec::new(),
        ObjectRef::RaidGroup(id) => view
            .raid_group(id)
            .map(|g| g.record.lus.iter().map(|lu| ObjectRef::Lu(*lu)).collect())
            .unwrap_or_default(),
        ObjectRef::Fru(id) => view
            .fru(id)
            .map(|f| f.raid_groups().map(ObjectRef::RaidGroup).collect())
            .unwrap_or_default(),
    }
}

/// Objects that depend on `object`'s agreement
fn downstreams(view: &impl ObjectView, object: ObjectRef) -> Vec<ObjectRef> {
    match object {
        ObjectRef::Lu(id) => view
            .lu(id)
            .ok()
            .filter(|lu| view.raid_group(lu.record.raid_group).is_ok())
            .map(|lu| vec![ObjectRef::RaidGroup(lu.record.raid_group)])
            .unwrap_or_default(),
        ObjectRef::RaidGroup(id) => view
            .raid_group(id)
            .map(|g| {
                g.record
                    .members
                    .iter()
                    .filter(|m| view.fru(**m).is_ok())
                    .map(|m| ObjectRef::Fru(*m))
                    .collect()
            })
            .unwrap_or_default(),
        ObjectRef::Fru(_) => Vec::new(),
    }
}

/// Effective enablement and idle threshold
fn evaluate(view: &impl ObjectView, object: ObjectRef, settings: &PowerSaveConfig) -> (bool, u64) {
    let system = settings.system_enabled;
    match object {
        ObjectRef::Lu(id) => {
            let Ok(lu) = view.lu(id) else {
                return (false, settings.default_idle_secs);
            };
            let group = view.raid_group(lu.record.raid_group).ok();
            let eligible = system
                && group.is_some_and(|g| g.record.power_policy.enabled)
                && lu.record.power_policy.enabled
                && lu.state.is_bound();
            let threshold = lu
                .record
                .power_policy
                .hibernate_delay_secs
                .or_else(|| group.map(|g| g.record.power_policy.idle_secs))
                .unwrap_or(settings.default_idle_secs);
            (eligible, threshold)
        }
        ObjectRef::RaidGroup(id) => view.raid_group(id).map_or(
            (false, settings.default_idle_secs),
            |g| {
                (
                    system && g.record.power_policy.enabled,
                    g.record.power_policy.idle_secs,
                )
            },
        ),
        ObjectRef::Fru(id) => {
            let Ok(fru) = view.fru(id) else {
                return (false, settings.default_idle_secs);
            };
            let policies: Vec<_> = fru
                .raid_groups()
                .filter_map(|rg| view.raid_group(rg).ok())
                .map(|g| g.record.power_policy)
                .collect();
            let eligible = system && fru.is_ready() && policies.iter().all(|p| p.enabled);
            let threshold = policies
                .iter()
                .map(|p| p.idle_secs)
                .max()
                .unwrap_or(settings.default_idle_secs);
            (eligible, threshold)
        }
    }
}

fn set_state(info: &mut PowerSaveInfo, state: PowerSaveState, now: u64) {
    if info.state == state {
        return;
    }
    info.hibernating_since = (state == PowerSaveState::Hibernating).then_some(now);
    info.state = state;
}

/// One top-down step for a single object
fn step(
    info: &mut PowerSaveInfo,
    eligible: bool,
    threshold: u64,
    agree: bool,
    now: u64,
    settings: &PowerSaveConfig,
) {
    info.power_saving_enabled = eligible;
    info.idle_threshold_secs = threshold;
    info.seconds_since_last_io = now.saturating_sub(info.last_io_secs);
    if !eligible {
        set_state(info, PowerSaveState::Active, now);
        return;
    }
    let idle = info.seconds_since_last_io > threshold;
    match info.state {
        PowerSaveState::Active => {
            if idle && now >= info.hold_awake_until {
                set_state(info, PowerSaveState::Entering, now);
                if agree {
                    set_state(info, PowerSaveState::Hibernating, now);
                }
            }
        }
        PowerSaveState::Entering => {
            if !idle {
                set_state(info, PowerSaveState::Active, now);
            } else if agree {
                set_state(info, PowerSaveState::Hibernating, now);
            }
        }
        PowerSaveState::Hibernating => {
            let interval = settings.wakeup_interval_secs;
            let forced = interval > 0
                && info
                    .hibernating_since
                    .is_some_and(|since| now.saturating_sub(since) >= interval);
            if forced {
                info.hold_awake_until = now + settings.wake_hold_secs;
                set_state(info, PowerSaveState::WakingUp, now);
            } else if !agree {
                set_state(info, PowerSaveState::WakingUp, now);
            }
        }
        PowerSaveState::WakingUp => {}
    }
}

/// Mark or clear `object`'s slumber edge on everything downstream of it
fn sync_marks(txn: &mut Txn<'_>, object: ObjectRef) -> Result<()> {
    let hibernating = power_of(txn, object)?.is_hibernating();
    for down in downstreams(txn, object) {
        let marks = &mut power_mut(txn, down)?.slumber_edges;
        if hibernating {
            marks.insert(object);
        } else {
            marks.remove(&object);
        }
    }
    Ok(())
}

fn all_objects(view: &impl ObjectView) -> Vec<ObjectRef> {
    let mut objects: Vec<ObjectRef> = view.lu_ids().into_iter().map(ObjectRef::Lu).collect();
    objects.extend(view.raid_group_ids().into_iter().map(ObjectRef::RaidGroup));
    objects.extend(view.fru_ids().into_iter().map(ObjectRef::Fru));
    objects
}

/// Run one propagation pass
pub fn run_pass_in(txn: &mut Txn<'_>, settings: &PowerSaveConfig) -> Result<()> {
    let now = txn.now_secs();
    let objects = all_objects(txn);

    for object in &objects {
        let (eligible, threshold) = evaluate(txn, *object, settings);
        let ups = upstreams(txn, *object);
        let marks = &power_of(txn, *object)?.slumber_edges;
        let agree = ups.iter().all(|up| {
            marks.contains(up) && power_of(txn, *up).is_ok_and(PowerSaveInfo::is_hibernating)
        });
        let info = power_mut(txn, *object)?;
        info.slumber_edges.retain(|edge| ups.contains(edge));
        step(info, eligible, threshold, agree, now, settings);
        sync_marks(txn, *object)?;
    }

    for object in objects.iter().rev() {
        if power_of(txn, *object)?.state != PowerSaveState::WakingUp {
            continue;
        }
        let downstream_awake = downstreams(txn, *object)
            .into_iter()
            .all(|down| power_of(txn, down).is_ok_and(|p| !p.is_hibernating()));
        if downstream_awake {
            set_state(power_mut(txn, *object)?, PowerSaveState::Active, now);
        }
    }

    promote_binding_lus_in(txn)
}

/// Finish binding LUs whose group is valid and fully awake
fn promote_binding_lus_in(txn: &mut Txn<'_>) -> Result<()> {
    for id in txn.lu_ids() {
        let lu = txn.lu(id)?;
        if lu.state != LuState::Binding {
            continue;
        }
        let rg = lu.record.raid_group;
        let ready = txn
            .raid_group(rg)
            .is_ok_and(|g| g.is_valid() && g.power.state == PowerSaveState::Active);
        if ready {
            let next = txn.lu_state_for(rg)?;
            txn.lu_mut(id)?.transition(next)?;
            info!("{}: bound on {} ({})", id, rg, next);
        }
    }
    Ok(())
}

fn wake(txn: &mut Txn<'_>, object: ObjectRef, now: u64) -> Result<()> {
    let info = power_mut(txn, object)?;
    info.last_io_secs = now;
    info.seconds_since_last_io = 0;
    match info.state {
        PowerSaveState::Hibernating => set_state(info, PowerSaveState::WakingUp, now),
        PowerSaveState::Entering => set_state(info, PowerSaveState::Active, now),
        PowerSaveState::Active | PowerSaveState::WakingUp => {}
    }
    sync_marks(txn, object)
}

/// Wake a group and its member drives, resetting their idle timers
pub fn wake_raid_group_in(txn: &mut Txn<'_>, raid_group: RaidGroupId) -> Result<()> {
    let now = txn.now_secs();
    let object = ObjectRef::RaidGroup(raid_group);
    let members = downstreams(txn, object);
    wake(txn, object, now)?;
    for member in members {
        wake(txn, member, now)?;
    }
    Ok(())
}

/// Host I/O arrived on an LU
pub fn note_io_in(txn: &mut Txn<'_>, lu: LuId) -> Result<()> {
    let now = txn.now_secs();
    let raid_group = txn.lu(lu)?.record.raid_group;
    wake(txn, ObjectRef::Lu(lu), now)?;
    if txn.raid_group(raid_group).is_ok() {
        wake_raid_group_in(txn, raid_group)?;
    }
    Ok(())
}

/// Power-save propagator with its runtime settings
pub struct PowerPropagator {
    store: Arc<ObjectStore>,
    settings: RwLock<PowerSaveConfig>,
}

impl PowerPropagator {
    pub fn new(store: Arc<ObjectStore>, settings: PowerSaveConfig) -> Self {
        Self {
            store,
            settings: RwLock::new(settings),
        }
    }

    #[must_use]
    pub fn settings(&self) -> PowerSaveConfig {
        self.settings.read().clone()
    }

    pub fn set_system_enabled(&self, enabled: bool) {
        self.settings.write().system_enabled = enabled;
        info!(
            "System power saving {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Forced wake-up period while hibernating; 0 disables
    pub fn set_wakeup_interval(&self, secs: u64) {
        self.settings.write().wakeup_interval_secs = secs;
        debug!("Power-save wakeup interval set to {}s", secs);
    }

    pub fn run_pass(&self) -> Result<()> {
        let settings = self.settings();
        self.store.transact(|txn| run_pass_in(txn, &settings))
    }

    pub fn note_io(&self, lu: LuId) -> Result<()> {
        self.store.transact(|txn| note_io_in(txn, lu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ObjectTypeMask, StateMask, ObjectState};
    use crate::testutil::{add_group, add_lu, test_store, TestStore};
    use arrayio_common::{FruId, RaidType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn enabled() -> PowerSaveConfig {
        PowerSaveConfig {
            system_enabled: true,
            default_idle_secs: 600,
            wakeup_interval_secs: 0,
            wake_hold_secs: 60,
        }
    }

    fn state(ts: &TestStore, object: ObjectRef) -> PowerSaveState {
        ts.store.read(|t| power_of(t, object).map(|p| p.state)).unwrap()
    }

    struct Chain {
        ts: TestStore,
        power: PowerPropagator,
        rg: RaidGroupId,
        frus: Vec<FruId>,
        lus: Vec<LuId>,
    }

    fn chain(lus: usize, settings: PowerSaveConfig) -> Chain {
        let ts = test_store();
        let (rg, frus) = add_group(&ts.store, RaidType::Raid5, 3, 10_000, true);
        let lus = (0..lus)
            .map(|_| add_lu(&ts.store, rg, LuState::Ready))
            .collect();
        let power = PowerPropagator::new(ts.store.clone(), settings);
        Chain {
            ts,
            power,
            rg,
            frus,
            lus,
        }
    }

    /// Every hibernating object has only hibernating upstreams
    fn assert_safe(ts: &TestStore) {
        ts.store.read(|t| {
            for object in all_objects(t) {
                if power_of(t, object).unwrap().is_hibernating() {
                    for up in upstreams(t, object) {
                        assert!(
                            power_of(t, up).unwrap().is_hibernating(),
                            "{object} hibernates under awake {up}"
                        );
                    }
                }
            }
        });
    }

    #[test]
    fn test_idle_chain_hibernates() {
        let c = chain(2, enabled());
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::RaidGroup(c.rg)), PowerSaveState::Active);

        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        for lu in &c.lus {
            assert_eq!(state(&c.ts, ObjectRef::Lu(*lu)), PowerSaveState::Hibernating);
        }
        assert_eq!(
            state(&c.ts, ObjectRef::RaidGroup(c.rg)),
            PowerSaveState::Hibernating
        );
        for fru in &c.frus {
            assert_eq!(state(&c.ts, ObjectRef::Fru(*fru)), PowerSaveState::Hibernating);
        }
        assert_safe(&c.ts);
    }

    #[test]
    fn test_one_busy_lu_blocks_subtree() {
        let c = chain(2, enabled());
        c.ts.clock.advance_secs(500);
        c.power.note_io(c.lus[1]).unwrap();
        c.ts.clock.advance_secs(200);
        c.power.run_pass().unwrap();

        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Hibernating);
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[1])), PowerSaveState::Active);
        assert_ne!(
            state(&c.ts, ObjectRef::RaidGroup(c.rg)),
            PowerSaveState::Hibernating
        );
        for fru in &c.frus {
            assert_ne!(state(&c.ts, ObjectRef::Fru(*fru)), PowerSaveState::Hibernating);
        }
        assert_safe(&c.ts);
    }

    #[test]
    fn test_io_wakes_chain() {
        let c = chain(1, enabled());
        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        let mut rx = c
            .ts
            .events
            .subscribe(ObjectTypeMask::ALL, StateMask::power());

        c.power.note_io(c.lus[0]).unwrap();
        assert_eq!(
            state(&c.ts, ObjectRef::RaidGroup(c.rg)),
            PowerSaveState::WakingUp
        );
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Active);
        assert_eq!(state(&c.ts, ObjectRef::RaidGroup(c.rg)), PowerSaveState::Active);
        for fru in &c.frus {
            assert_eq!(state(&c.ts, ObjectRef::Fru(*fru)), PowerSaveState::Active);
        }

        let mut woke = 0;
        while let Ok(event) = rx.try_recv() {
            if event.new == Some(ObjectState::Power(PowerSaveState::WakingUp)) {
                woke += 1;
            }
        }
        assert_eq!(woke, 1 + 1 + c.frus.len());
    }

    #[test]
    fn test_disabling_forces_active() {
        let c = chain(1, enabled());
        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        c.ts.store
            .transact(|txn| {
                txn.raid_group_mut(c.rg)?.record.power_policy.enabled = false;
                Ok(())
            })
            .unwrap();
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::RaidGroup(c.rg)), PowerSaveState::Active);
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Active);
        for fru in &c.frus {
            assert_eq!(state(&c.ts, ObjectRef::Fru(*fru)), PowerSaveState::Active);
        }

        c.ts.store
            .transact(|txn| {
                txn.raid_group_mut(c.rg)?.record.power_policy.enabled = true;
                Ok(())
            })
            .unwrap();
        c.power.set_system_enabled(false);
        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Active);
    }

    #[test]
    fn test_periodic_wakeup_holds_awake() {
        let mut settings = enabled();
        settings.wakeup_interval_secs = 3600;
        let c = chain(1, settings);
        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Hibernating);

        c.ts.clock.advance_secs(3600);
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Active);
        assert_eq!(state(&c.ts, ObjectRef::RaidGroup(c.rg)), PowerSaveState::Active);

        // Still idle, but held awake
        c.ts.clock.advance_secs(30);
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Active);
        c.ts.clock.advance_secs(31);
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::Lu(c.lus[0])), PowerSaveState::Hibernating);
        assert_safe(&c.ts);
    }

    #[test]
    fn test_binding_lu_waits_for_active_group() {
        let c = chain(1, enabled());
        c.ts.clock.advance_secs(601);
        c.power.run_pass().unwrap();
        let lu = add_lu(&c.ts.store, c.rg, LuState::Binding);

        // The new upstream edge is awake, so the group wakes first
        c.power.run_pass().unwrap();
        assert_eq!(state(&c.ts, ObjectRef::RaidGroup(c.rg)), PowerSaveState::Active);
        c.power.run_pass().unwrap();
        assert_eq!(c.ts.store.lu(lu).unwrap().state, LuState::Ready);
    }

    #[test]
    fn test_threshold_override_and_drive_maximum() {
        let c = chain(1, enabled());
        c.ts.store
            .transact(|txn| {
                txn.lu_mut(c.lus[0])?.record.power_policy.hibernate_delay_secs = Some(60);
                Ok(())
            })
            .unwrap();
        c.power.run_pass().unwrap();
        c.ts.store.read(|t| {
            assert_eq!(power_of(t, ObjectRef::Lu(c.lus[0])).unwrap().idle_threshold_secs, 60);
            assert_eq!(
                power_of(t, ObjectRef::Fru(c.frus[0])).unwrap().idle_threshold_secs,
                600
            );
        });
    }

    #[test]
    fn test_order_independent_safety() {
        for seed in 0..8 {
            let c = chain(3, enabled());
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..200 {
                match rng.gen_range(0..3) {
                    0 => {
                        let lu = c.lus[rng.gen_range(0..c.lus.len())];
                        c.power.note_io(lu).unwrap();
                    }
                    1 => c.ts.clock.advance_secs(rng.gen_range(0..400)),
                    _ => {
                        c.power.run_pass().unwrap();
                        assert_safe(&c.ts);
                    }
                }
            }
            c.power.run_pass().unwrap();
            assert_safe(&c.ts);
        }
    }
}

//! Background-service arbiter.
//!
//! Every (scope, service) pair has one requestor word: bit `r` set means
//! requestor `r` lets the service run. A service is enabled at a scope only
//! while every requestor bit is set, and effective only when it is enabled
//! at the system scope, at the RAID group scope, at the drive or LU scope,
//! and the master gate is open. All checks are lock-free atomics.
//!
//! Bits of persistent requestors are committed through the persistence
//! queue and restored on recovery; runtime requestors always restart
//! enabled.

use crate::persist::PersistQueue;
use arrayio_common::{
    ALL_REQUESTORS, BackgroundService, Error, PERSISTENT_REQUESTORS, RaidGroupId, Requestor,
    RequestorFlags, Result, Scope, ServiceGateRecord, SpId,
};
use arrayio_meta_store::{CommitRecord, RecordBody, RecordKey};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

type Words = [AtomicU32; BackgroundService::COUNT];

/// Master gate value with every service open
pub const ALL_SERVICES: u32 = (1 << BackgroundService::COUNT) - 1;

fn fresh_words() -> Words {
    std::array::from_fn(|_| AtomicU32::new(ALL_REQUESTORS))
}

pub struct Arbiter {
    system: Words,
    scopes: DashMap<Scope, Words>,
    master: AtomicU32,
    scale: AtomicU8,
    queue: Arc<PersistQueue>,
    origin: SpId,
    /// Generation counter for gate records
    generation: AtomicU64,
}

impl Arbiter {
    #[must_use]
    pub fn new(queue: Arc<PersistQueue>, origin: SpId, scale_percent: u8) -> Self {
        Self {
            system: fresh_words(),
            scopes: DashMap::new(),
            master: AtomicU32::new(ALL_SERVICES),
            scale: AtomicU8::new(scale_percent.min(100)),
            queue,
            origin,
            generation: AtomicU64::new(0),
        }
    }

    /// Current requestor word
    #[must_use]
    pub fn word(&self, scope: Scope, service: BackgroundService) -> u32 {
        let i = service.index();
        match scope {
            Scope::System => self.system[i].load(Ordering::Acquire),
            _ => self
                .scopes
                .get(&scope)
                .map_or(ALL_REQUESTORS, |words| words[i].load(Ordering::Acquire)),
        }
    }

    fn update(
        &self,
        scope: Scope,
        service: BackgroundService,
        apply: impl Fn(&AtomicU32) -> u32,
    ) -> u32 {
        let i = service.index();
        match scope {
            Scope::System => apply(&self.system[i]),
            _ => {
                let words = self.scopes.entry(scope).or_insert_with(fresh_words);
                apply(&words[i])
            }
        }
    }

    /// Let `requestor` allow `service` at `scope` again
    pub fn enable(&self, scope: Scope, service: BackgroundService, requestor: Requestor) {
        let bit = requestor.bit();
        let word = self.update(scope, service, |w| w.fetch_or(bit, Ordering::AcqRel) | bit);
        debug!("{} {} enabled by {} (word {:#06x})", scope, service, requestor, word);
        self.persist_if_needed(scope, requestor);
    }

    /// Hold `service` at `scope` off on behalf of `requestor`
    pub fn disable(&self, scope: Scope, service: BackgroundService, requestor: Requestor) {
        let bit = requestor.bit();
        let word = self.update(scope, service, |w| w.fetch_and(!bit, Ordering::AcqRel) & !bit);
        debug!("{} {} disabled by {} (word {:#06x})", scope, service, requestor, word);
        self.persist_if_needed(scope, requestor);
    }

    /// No requestor holds the service off at this scope
    #[must_use]
    pub fn is_enabled(&self, scope: Scope, service: BackgroundService) -> bool {
        self.word(scope, service) == ALL_REQUESTORS
    }

    /// Requestors currently holding the service off
    #[must_use]
    pub fn disabled_by(&self, scope: Scope, service: BackgroundService) -> Vec<Requestor> {
        RequestorFlags::disabled_by(self.word(scope, service))
    }

    /// Whether the service may run for an object.
    ///
    /// `raid_group` is the owning group, `leaf` the drive or LU scope.
    #[must_use]
    pub fn is_effective(
        &self,
        service: BackgroundService,
        raid_group: Option<RaidGroupId>,
        leaf: Option<Scope>,
    ) -> bool {
        self.master.load(Ordering::Acquire) & service.bit() != 0
            && self.is_enabled(Scope::System, service)
            && raid_group.is_none_or(|rg| self.is_enabled(Scope::RaidGroup(rg), service))
            && leaf.is_none_or(|scope| self.is_enabled(scope, service))
    }

    /// Close the master gate for every service in one store
    pub fn disable_all_services(&self) {
        self.master.store(0, Ordering::Release);
        info!("All background services disabled");
    }

    pub fn enable_all_services(&self) {
        self.master.store(ALL_SERVICES, Ordering::Release);
        info!("All background services enabled");
    }

    #[must_use]
    pub fn master_gate(&self) -> u32 {
        self.master.load(Ordering::Acquire)
    }

    /// Set the global throughput scale (0-100)
    pub fn set_scale(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(Error::invalid_argument(format!(
                "scale {percent} is above 100"
            )));
        }
        self.scale.store(percent, Ordering::Release);
        info!("Background scale set to {}%", percent);
        Ok(())
    }

    #[must_use]
    pub fn scale(&self) -> u8 {
        self.scale.load(Ordering::Acquire)
    }

    /// Drop the words of a destroyed object
    pub fn forget(&self, scope: Scope) {
        if scope == Scope::System {
            return;
        }
        if self.scopes.remove(&scope).is_some() {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.queue.enqueue(CommitRecord::delete(
                RecordKey::ServiceGate(scope),
                generation,
                self.origin,
            ));
        }
    }

    /// Install persisted bits, keeping the current runtime bits
    pub fn install(&self, record: &ServiceGateRecord) {
        for service in BackgroundService::ALL {
            let stored = record.words[service.index()] & PERSISTENT_REQUESTORS;
            self.update(record.scope, service, |w| {
                let runtime = w.load(Ordering::Acquire) & !PERSISTENT_REQUESTORS;
                w.store(stored | runtime, Ordering::Release);
                stored | runtime
            });
        }
    }

    /// Start gate generations above anything already persisted
    pub fn observe_generation(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::AcqRel);
    }

    /// Persistent bits of one scope
    #[must_use]
    pub fn gate_record(&self, scope: Scope) -> ServiceGateRecord {
        ServiceGateRecord {
            scope,
            words: std::array::from_fn(|i| {
                self.word(scope, BackgroundService::ALL[i]) & PERSISTENT_REQUESTORS
            }),
        }
    }

    fn persist_if_needed(&self, scope: Scope, requestor: Requestor) {
        if requestor.bit() & PERSISTENT_REQUESTORS == 0 {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.queue.enqueue(CommitRecord::put(
            RecordKey::ServiceGate(scope),
            generation,
            self.origin,
            RecordBody::ServiceGate(self.gate_record(scope)),
        ));
    }
}

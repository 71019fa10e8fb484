//! Lifecycle notification bus.
//!
//! The store publishes one event per observed state change while it still
//! holds the write lock, so every subscriber sees changes in commit order.
//! Subscribers filter by object type and by state; receivers that have been
//! dropped are pruned on the next publish.

use arrayio_common::{FruState, LuState, ObjectRef, ObjectType, PowerSaveState, RaidGroupState};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Observable state of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ObjectState {
    Fru(FruState),
    RaidGroup(RaidGroupState),
    Lu(LuState),
    Power(PowerSaveState),
}

impl ObjectState {
    /// Bit in a [`StateMask`]
    #[must_use]
    pub const fn bit(self) -> u32 {
        let index = match self {
            Self::Fru(s) => s as u32,
            Self::RaidGroup(s) => 5 + s as u32,
            Self::Lu(s) => 8 + s as u32,
            Self::Power(s) => 14 + s as u32,
        };
        1 << index
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fru(s) => write!(f, "{s}"),
            Self::RaidGroup(s) => write!(f, "{s}"),
            Self::Lu(s) => write!(f, "{s}"),
            Self::Power(s) => write!(f, "power:{s}"),
        }
    }
}

/// State change of one object; `None` means the object did not exist
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub object: ObjectRef,
    pub old: Option<ObjectState>,
    pub new: Option<ObjectState>,
}

/// Object types a subscriber wants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectTypeMask(u8);

impl ObjectTypeMask {
    pub const ALL: Self = Self(0b111);

    #[must_use]
    pub fn of(types: &[ObjectType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | Self::bit(*t)))
    }

    const fn bit(t: ObjectType) -> u8 {
        match t {
            ObjectType::Fru => 0b001,
            ObjectType::RaidGroup => 0b010,
            ObjectType::Lu => 0b100,
        }
    }

    #[must_use]
    pub const fn contains(self, t: ObjectType) -> bool {
        self.0 & Self::bit(t) != 0
    }
}

/// States a subscriber wants; matched against the new state, or the old
/// state when an object is destroyed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMask(u32);

impl StateMask {
    pub const ALL: Self = Self(u32::MAX);

    #[must_use]
    pub fn of(states: &[ObjectState]) -> Self {
        Self(states.iter().fold(0, |acc, s| acc | s.bit()))
    }

    /// Every power-save state
    #[must_use]
    pub fn power() -> Self {
        Self::of(&[
            ObjectState::Power(PowerSaveState::Active),
            ObjectState::Power(PowerSaveState::Entering),
            ObjectState::Power(PowerSaveState::Hibernating),
            ObjectState::Power(PowerSaveState::WakingUp),
        ])
    }

    #[must_use]
    pub const fn contains(self, state: ObjectState) -> bool {
        self.0 & state.bit() != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

struct Subscriber {
    types: ObjectTypeMask,
    states: StateMask,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl Subscriber {
    fn wants(&self, event: &LifecycleEvent) -> bool {
        if !self.types.contains(event.object.object_type()) {
            return false;
        }
        event
            .new
            .or(event.old)
            .is_some_and(|state| self.states.contains(state))
    }
}

/// Fan-out of lifecycle events to registered subscribers
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest; events arrive on the returned receiver
    pub fn subscribe(
        &self,
        types: ObjectTypeMask,
        states: StateMask,
    ) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { types, states, tx });
        rx
    }

    pub fn publish(&self, events: &[LifecycleEvent]) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            for event in events {
                if sub.wants(event) && sub.tx.send(*event).is_err() {
                    return false;
                }
            }
            !sub.tx.is_closed()
        });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayio_common::{FruId, LuId};

    fn fru_event(id: u32, old: FruState, new: FruState) -> LifecycleEvent {
        LifecycleEvent {
            object: ObjectRef::Fru(FruId::new(id)),
            old: Some(ObjectState::Fru(old)),
            new: Some(ObjectState::Fru(new)),
        }
    }

    #[test]
    fn test_state_bits_distinct() {
        let states = [
            ObjectState::Fru(FruState::Ready),
            ObjectState::Fru(FruState::Removed),
            ObjectState::RaidGroup(RaidGroupState::Broken),
            ObjectState::Lu(LuState::Unbinding),
            ObjectState::Power(PowerSaveState::WakingUp),
            ObjectState::Power(PowerSaveState::Active),
        ];
        let mut seen = 0u32;
        for s in states {
            assert_eq!(seen & s.bit(), 0);
            seen |= s.bit();
        }
    }

    #[test]
    fn test_filtering() {
        let bus = EventBus::new();
        let mut removed_only = bus.subscribe(
            ObjectTypeMask::of(&[ObjectType::Fru]),
            StateMask::of(&[ObjectState::Fru(FruState::Removed)]),
        );
        let mut everything = bus.subscribe(ObjectTypeMask::ALL, StateMask::ALL);

        bus.publish(&[
            fru_event(1, FruState::Ready, FruState::Removed),
            fru_event(1, FruState::Removed, FruState::PoweringUp),
            LifecycleEvent {
                object: ObjectRef::Lu(LuId::new(0)),
                old: Some(ObjectState::Lu(LuState::Ready)),
                new: Some(ObjectState::Lu(LuState::Degraded)),
            },
        ]);

        let first = removed_only.try_recv().unwrap();
        assert_eq!(first.new, Some(ObjectState::Fru(FruState::Removed)));
        assert!(removed_only.try_recv().is_err());

        let mut count = 0;
        while everything.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_dropped_receivers_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(ObjectTypeMask::ALL, StateMask::ALL);
        let _keep = bus.subscribe(ObjectTypeMask::ALL, StateMask::ALL);
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx);
        bus.publish(&[fru_event(0, FruState::Ready, FruState::Faulted)]);
        assert_eq!(bus.subscriber_count(), 1);
    }
}

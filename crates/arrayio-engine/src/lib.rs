//! ArrayIO Engine
//!
//! Control-plane state engine for a dual-controller block-storage array.
//! It owns the authoritative records of drives (FRUs), RAID groups and
//! logical units, and keeps them consistent as drives fail, return and get
//! replaced, as background operations make progress, and as idle objects
//! enter and leave power save.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ArrayEngine                  │
//! │  admin requests · drive events · host I/O    │
//! └───┬──────────┬──────────┬──────────┬─────────┘
//!     │          │          │          │
//! ┌───▼────┐ ┌───▼────┐ ┌───▼────┐ ┌───▼──────┐
//! │Sparing │ │ Power  │ │Runner  │ │ Arbiter  │
//! └───┬────┘ └───┬────┘ └───┬────┘ └───┬──────┘
//!     │          │          │          │
//! ┌───▼──────────▼──────────▼──┐   ┌───▼──────┐
//! │ ObjectStore + checkpoints  ├──►│ Persist  │──► redb / peer SP
//! └────────────────────────────┘   └──────────┘
//! ```

pub mod arbiter;
pub mod checkpoint;
pub mod clock;
pub mod engine;
pub mod events;
pub mod persist;
pub mod power;
pub mod records;
pub mod runner;
pub mod sparing;
pub mod store;
pub mod throttle;

#[cfg(test)]
mod testutil;

pub use arbiter::Arbiter;
pub use checkpoint::CheckpointTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ArrayEngine, Discovery, LuSpec, RaidGroupSpec, TickReport};
pub use events::{EventBus, LifecycleEvent, ObjectState, ObjectTypeMask, StateMask};
pub use persist::{BufferedPeerLink, PeerLink, PersistQueue};
pub use power::PowerPropagator;
pub use records::{Fru, LogicalUnit, RaidGroup};
pub use runner::{BackgroundRunner, PendingOp, ProgressStep};
pub use sparing::{SpareClass, SparingEngine};
pub use store::{ObjectFilter, ObjectStore, ObjectView};
pub use throttle::{ServiceThrottle, TokenBucket};

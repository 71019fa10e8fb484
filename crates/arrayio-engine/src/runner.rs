//! Background progress runner.
//!
//! Each pass collects every running checkpoint on a Ready, awake drive,
//! asks the arbiter whether its service may run, draws a grant from the
//! service's token bucket, and moves the checkpoint forward by at most
//! that many blocks. The runner never records I/O, so background work
//! does not keep objects out of power save.

use crate::arbiter::Arbiter;
use crate::checkpoint::{advance_in, lu_service_for, next_work_range, service_for};
use crate::clock::Clock;
use crate::store::{ObjectStore, ObjectView, Tables};
use crate::throttle::ServiceThrottle;
use arrayio_common::config::BackgroundConfig;
use arrayio_common::{
    BackgroundService, CheckpointKind, FruId, Lba, OpState, PowerSaveState, RaidGroupId, Scope,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

/// Checkpoint with work left to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PendingOp {
    pub fru: FruId,
    pub partition: u8,
    pub raid_group: RaidGroupId,
    pub kind: CheckpointKind,
}

/// One unit of progress made by the runner
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressStep {
    pub op: PendingOp,
    pub service: BackgroundService,
    pub from: Lba,
    pub to: Lba,
    pub completed: bool,
}

const KINDS: [CheckpointKind; 4] = [
    CheckpointKind::Rebuild,
    CheckpointKind::Expansion,
    CheckpointKind::Zero,
    CheckpointKind::Verify,
];

fn pending_ops(tables: &Tables) -> Vec<PendingOp> {
    let mut ops = Vec::new();
    for fru in tables.frus() {
        if !fru.is_ready() || fru.power.state != PowerSaveState::Active {
            continue;
        }
        for p in &fru.record.partitions {
            if fru.is_logging(p.index) {
                continue;
            }
            let awake = tables
                .raid_group(p.raid_group)
                .is_ok_and(|g| g.power.state == PowerSaveState::Active);
            if !awake {
                continue;
            }
            for kind in KINDS {
                if p.checkpoint(kind).state == OpState::InProgress {
                    ops.push(PendingOp {
                        fru: fru.id,
                        partition: p.index,
                        raid_group: p.raid_group,
                        kind,
                    });
                }
            }
        }
    }
    ops
}

pub struct BackgroundRunner {
    store: Arc<ObjectStore>,
    arbiter: Arc<Arbiter>,
    clock: Arc<dyn Clock>,
    throttle: ServiceThrottle,
    max_step_blocks: u64,
    cursor: AtomicUsize,
}

impl BackgroundRunner {
    pub fn new(
        store: Arc<ObjectStore>,
        arbiter: Arc<Arbiter>,
        clock: Arc<dyn Clock>,
        config: &BackgroundConfig,
    ) -> Self {
        let throttle = ServiceThrottle::new(config.blocks_per_sec, arbiter.scale(), clock.now_ms());
        Self {
            store,
            arbiter,
            clock,
            throttle,
            max_step_blocks: config.max_step_blocks.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Checkpoints that would be considered by the next pass
    pub fn pending(&self) -> Vec<PendingOp> {
        self.store.read(pending_ops)
    }

    /// Make one round of progress; every pending op gets at most one step
    pub fn run_once(&self) -> Vec<ProgressStep> {
        self.throttle.apply_scale(self.arbiter.scale());
        let mut ops = self.pending();
        if ops.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % ops.len();
        ops.rotate_left(start);

        let mut steps = Vec::new();
        for op in ops {
            match self.step(op) {
                Ok(Some(step)) => {
                    trace!(
                        "{} {} partition {}: {}..{}",
                        step.service, op.fru, op.partition, step.from, step.to
                    );
                    if step.completed {
                        debug!("{} {} partition {} complete", step.service, op.fru, op.partition);
                    }
                    steps.push(step);
                }
                Ok(None) => {}
                Err(e) => warn!("{} {} partition {}: {}", op.kind, op.fru, op.partition, e),
            }
        }
        steps
    }

    fn step(&self, op: PendingOp) -> arrayio_common::Result<Option<ProgressStep>> {
        let service = self
            .store
            .read(|t| service_for(t, op.kind, op.fru, op.partition))?;
        if !self
            .arbiter
            .is_effective(service, Some(op.raid_group), Some(Scope::Fru(op.fru)))
        {
            return Ok(None);
        }
        if let Some(lu_service) = lu_service_for(op.kind) {
            let lus = self
                .store
                .read(|t| t.raid_group(op.raid_group).map(|g| g.record.lus.clone()))?;
            if let Some(lu) = lus
                .into_iter()
                .find(|lu| !self.arbiter.is_enabled(Scope::Lu(*lu), lu_service))
            {
                trace!("{} held off by {}", lu_service, lu);
                return Ok(None);
            }
        }
        let now_ms = self.clock.now_ms();
        self.store.transact(|txn| {
            let Some((from, to)) =
                next_work_range(txn, op.kind, op.fru, op.partition, self.max_step_blocks)?
            else {
                return Ok(None);
            };
            let wanted = to - from;
            let granted = if wanted == 0 {
                0
            } else {
                self.throttle.acquire(service, wanted, now_ms)
            };
            if wanted > 0 && granted == 0 {
                return Ok(None);
            }
            let to = from + granted;
            match advance_in(txn, op.kind, op.fru, op.partition, to) {
                Ok(completed) => Ok(Some(ProgressStep {
                    op,
                    service,
                    from,
                    to,
                    completed,
                })),
                Err(e) => {
                    self.throttle.release(service, granted);
                    Err(e)
                }
            }
        })
    }
}

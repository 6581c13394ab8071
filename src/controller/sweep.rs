//! Consistency Sweep
//!
//! The storage tools never refuse to create something that later loses its
//! owner: a pool whose volume creation crashed, a clone whose copy never
//! finished, a partition the cluster forgot about. The sweep compares what
//! exists on this node with the cluster's desired list and deletes the rest.
//!
//! Every deletion goes through the engines, so it takes the same named lock
//! a CRUD call would. A held lock means work is in flight and the resource
//! is left for the next sweep.

use crate::controller::retry::with_retry;
use crate::domain::ports::{DesiredState, DesiredStateSource, DesiredStateSourceRef};
use crate::domain::types::{LogicalVolume, LvKind};
use crate::error::{Error, Result};
use crate::events::TopologyRef;
use crate::storage::lvm::{
    is_thin_snapshot, volume_key, CLONE_PENDING_TAG, MANAGED_VG_TAG, SNAPSHOT_PREFIX,
    THIN_POOL_PREFIX, VOLUME_PREFIX,
};
use crate::storage::{LockManager, LvmEngine, PartitionEngine};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Static Desired State
// =============================================================================

/// Desired state held in memory, for embedders that own the volume list
#[derive(Debug, Default)]
pub struct StaticDesiredState {
    state: RwLock<DesiredState>,
}

impl StaticDesiredState {
    pub fn new(state: DesiredState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
        })
    }

    /// Replace the desired set
    pub fn set(&self, state: DesiredState) {
        *self.state.write() = state;
    }
}

#[async_trait]
impl DesiredStateSource for StaticDesiredState {
    async fn desired_state(&self) -> Result<DesiredState> {
        Ok(self.state.read().clone())
    }
}

// =============================================================================
// Sweep Report
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub volumes: Vec<String>,
    pub snapshots: Vec<String>,
    pub pools: Vec<String>,
    pub clones: Vec<String>,
    /// `disk:name` of removed partitions
    pub partitions: Vec<String>,
    /// Deletions skipped because the lock was held
    pub skipped: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.volumes.len()
            + self.snapshots.len()
            + self.pools.len()
            + self.clones.len()
            + self.partitions.len()
    }

    /// Fold a deletion result into the report; true if it happened
    fn record(&mut self, what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(Error::Aborted { key }) => {
                debug!(what, key = %key, "Lock held, leaving for next sweep");
                self.skipped += 1;
                false
            }
            Err(e) => {
                warn!(what, error = %e, "Sweep deletion failed");
                self.failures += 1;
                false
            }
        }
    }
}

fn user_name<'a>(lv: &'a LogicalVolume, prefix: &str) -> Option<&'a str> {
    lv.name.strip_prefix(prefix).filter(|n| !n.is_empty())
}

// =============================================================================
// Consistency Sweeper
// =============================================================================

pub struct ConsistencySweeper {
    lvm: Arc<LvmEngine>,
    partitions: Arc<PartitionEngine>,
    locks: Arc<LockManager>,
    desired: DesiredStateSourceRef,
    topology: TopologyRef,
}

impl ConsistencySweeper {
    pub fn new(
        lvm: Arc<LvmEngine>,
        partitions: Arc<PartitionEngine>,
        desired: DesiredStateSourceRef,
        topology: TopologyRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            locks: lvm.locks().clone(),
            lvm,
            partitions,
            desired,
            topology,
        })
    }

    /// Sweep every `interval` until shutdown; the first sweep waits one interval
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Consistency sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(report) if report.removed() > 0 || report.failures > 0 => info!(
                        removed = report.removed(),
                        skipped = report.skipped,
                        failures = report.failures,
                        "Consistency sweep finished"
                    ),
                    Ok(_) => debug!("Consistency sweep found nothing to remove"),
                    Err(e) => warn!(error = %e, "Consistency sweep failed"),
                },
            }
        }

        info!("Consistency sweep stopped");
    }

    /// Remove every local resource the desired state no longer references
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let desired = with_retry(|| self.desired.desired_state()).await?;
        let topology = self.topology.read().clone();
        let mut report = SweepReport::default();

        let vgs = with_retry(|| self.lvm.get_current_vg_struct()).await?;
        for vg in vgs
            .iter()
            .filter(|vg| vg.has_tag(MANAGED_VG_TAG) || topology.volume_groups.contains(&vg.name))
        {
            self.sweep_group(&vg.name, &desired, &mut report).await?;
        }

        for disk in topology.raw_disks.keys() {
            let partitions = match with_retry(|| self.partitions.list_partitions(disk)).await {
                Ok(partitions) => partitions,
                Err(e) => {
                    warn!(disk = %disk, error = %e, "Cannot read partition table, skipping disk");
                    report.failures += 1;
                    continue;
                }
            };
            for partition in partitions {
                if partition.name.is_empty() || desired.wants_volume(&partition.name) {
                    continue;
                }
                info!(disk = %disk, name = %partition.name, "Removing unreferenced partition");
                let result = self.partitions.delete_partition(disk, &partition.name).await;
                if report.record("partition", result) {
                    report.partitions.push(format!("{}:{}", disk, partition.name));
                }
            }
        }

        Ok(report)
    }

    async fn sweep_group(&self, group: &str, desired: &DesiredState, report: &mut SweepReport) -> Result<()> {
        let lvs = with_retry(|| self.lvm.list_lvs(group)).await?;

        // Interrupted clones first: desired or not, their content is incomplete.
        for lv in lvs
            .iter()
            .filter(|lv| lv.kind() == LvKind::ThinVolume && lv.has_tag(CLONE_PENDING_TAG))
        {
            let Some(name) = user_name(lv, VOLUME_PREFIX) else {
                continue;
            };
            if self.locks.is_held(&volume_key(name)) {
                debug!(volume = name, group, "Clone still in flight");
                report.skipped += 1;
                continue;
            }
            warn!(volume = name, group, "Removing interrupted clone");
            if report.record("clone", self.lvm.delete_volume(name, group).await) {
                report.clones.push(name.to_string());
            }
        }

        // Snapshots whose origin was deleted still count; they pin the pool.
        for lv in lvs.iter().filter(|lv| is_thin_snapshot(lv)) {
            let Some(name) = user_name(lv, SNAPSHOT_PREFIX) else {
                continue;
            };
            if desired.wants_snapshot(name) {
                continue;
            }
            info!(snapshot = name, group, "Removing unreferenced snapshot");
            if report.record("snapshot", self.lvm.delete_snapshot(name, group).await) {
                report.snapshots.push(name.to_string());
            }
        }

        for lv in lvs
            .iter()
            .filter(|lv| lv.kind() == LvKind::ThinVolume && !lv.has_tag(CLONE_PENDING_TAG))
        {
            let Some(name) = user_name(lv, VOLUME_PREFIX) else {
                continue;
            };
            if desired.wants_volume(name) {
                continue;
            }
            info!(volume = name, group, "Removing unreferenced volume");
            if report.record("volume", self.lvm.delete_volume(name, group).await) {
                report.volumes.push(name.to_string());
            }
        }

        // Pools left behind by a crashed create, re-read after the deletions above.
        let lvs = with_retry(|| self.lvm.list_lvs(group)).await?;
        for pool in lvs.iter().filter(|lv| lv.kind() == LvKind::ThinPool) {
            let Some(name) = user_name(pool, THIN_POOL_PREFIX) else {
                continue;
            };
            let referenced = lvs
                .iter()
                .any(|lv| lv.pool_lv.as_deref() == Some(pool.name.as_str()));
            if referenced || desired.wants_volume(name) {
                continue;
            }
            info!(pool = %pool.name, group, "Removing empty thin pool");
            if report.record("pool", self.lvm.delete_volume(name, group).await) {
                report.pools.push(pool.name.clone());
            }
        }

        Ok(())
    }
}

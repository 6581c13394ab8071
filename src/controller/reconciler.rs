//! Reconciliation Loop
//!
//! Drives VG membership toward the disk selector policy. Each pass:
//!
//! ```text
//! read VGs ──► classify disks ──► add missing members
//!                                        │
//!     publish if changed ◄── re-read ◄── remove mismatched / unknown PVs
//! ```
//!
//! The underlying tools keep no change log, so drift is detected by
//! comparing the VG snapshot taken before the pass with the one after it.

use crate::config::NodeConfig;
use crate::domain::types::{Disk, ManagementPolicy, VolumeGroup};
use crate::error::{Error, Result};
use crate::events::{EventBus, ManagedTopology, StorageMetrics, TopologyRef, Trigger};
use crate::hardware::{ClassifierConfig, CompiledPolicy, DiskClassifier, DiskScanner};
use crate::storage::lvm::MANAGED_VG_TAG;
use crate::storage::{LockManager, LvmEngine, PartitionEngine, DISK_MUTEX};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Pass Report
// =============================================================================

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// (disk, group) pairs added
    pub added: Vec<(String, String)>,
    /// (disk, group) pairs removed
    pub removed: Vec<(String, String)>,
    /// Groups whose missing PVs were force-removed
    pub force_cleaned: Vec<String>,
    /// Operations that failed and will be retried next pass
    pub failures: usize,
    /// The disk mutex was held elsewhere; nothing was done
    pub skipped: bool,
    /// VG or managed-pool state differs from before the pass
    pub changed: bool,
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    scanner: DiskScanner,
    lvm: Arc<LvmEngine>,
    partitions: Arc<PartitionEngine>,
    locks: Arc<LockManager>,
    events: Arc<EventBus>,
    topology: TopologyRef,
    metrics: Option<Arc<StorageMetrics>>,
    config: watch::Receiver<NodeConfig>,
}

impl Reconciler {
    pub fn new(
        scanner: DiskScanner,
        lvm: Arc<LvmEngine>,
        partitions: Arc<PartitionEngine>,
        events: Arc<EventBus>,
        topology: TopologyRef,
        config: watch::Receiver<NodeConfig>,
    ) -> Self {
        Self {
            scanner,
            locks: lvm.locks().clone(),
            lvm,
            partitions,
            events,
            topology,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StorageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run passes on the configured interval until shutdown
    ///
    /// A config change rebuilds the timer when the interval moved and
    /// always triggers an immediate pass.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut period = self.config.borrow().scan_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut config_open = true;

        info!(interval_secs = period.as_secs(), "Reconciliation loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        warn!("Config channel closed, keeping last config");
                        config_open = false;
                        continue;
                    }

                    let next = self.config.borrow_and_update().scan_interval();
                    if next != period {
                        info!(
                            from_secs = period.as_secs(),
                            to_secs = next.as_secs(),
                            "Scan interval changed"
                        );
                        period = next;
                        ticker = interval_at(tokio::time::Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }

                    let node = self.config.borrow().node_name.clone();
                    self.events.publish(Trigger::ConfigChanged, node);
                    self.run_pass().await;
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    async fn run_pass(&self) {
        let started = Instant::now();
        let result = self.reconcile_once().await;
        let elapsed = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.observe_reconcile(elapsed, result.is_ok());
        }

        match result {
            Ok(report) if report.skipped => {}
            Ok(report) => info!(
                added = report.added.len(),
                removed = report.removed.len(),
                force_cleaned = report.force_cleaned.len(),
                failures = report.failures,
                changed = report.changed,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reconciliation pass finished"
            ),
            Err(e) => error!(error = %e, "Reconciliation pass failed"),
        }
    }

    /// One full add/remove pass under the disk mutex
    ///
    /// Individual add/remove failures are logged and counted; only a failed
    /// read of host state fails the pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let config = self.config.borrow().clone();
        let mut report = ReconcileReport::default();

        let _guard = match self.locks.lock(DISK_MUTEX) {
            Ok(guard) => guard,
            Err(Error::Aborted { .. }) => {
                debug!("Disk mutex held, skipping reconciliation pass");
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let classifier = DiskClassifier::with_config(ClassifierConfig {
            reserved_name_markers: config.reserved_name_markers.clone(),
        });
        let compiled = CompiledPolicy::compile_all(&config.disk_selectors)?;

        // Step 1: actual and desired membership
        let before = self.lvm.get_current_vg_struct().await?;
        let disks = self.scanner.scan().await?;
        let pvs = self.lvm.get_current_pv_struct().await?;
        let desired = classifier.classify(&config.disk_selectors, &disks, &pvs, &before)?;

        // Step 2: add what is missing
        for (group, devices) in &desired {
            if config.selector(group).map(|s| s.policy) != Some(ManagementPolicy::Lvm) {
                debug!(group = %group, disks = devices.len(), "Not an LVM group, leaving disks alone");
                continue;
            }
            let current = before.iter().find(|vg| &vg.name == group);
            for device in devices {
                if current.is_some_and(|vg| vg.has_pv(device)) {
                    continue;
                }
                match self.lvm.add_disk_locked(device, group).await {
                    Ok(()) => report.added.push((device.clone(), group.clone())),
                    Err(e) => {
                        warn!(disk = %device, group = %group, error = %e, "Failed to add disk");
                        report.failures += 1;
                    }
                }
            }
        }

        // Step 3: drop members that no longer belong
        let lvm_groups: BTreeSet<String> = config.lvm_groups().into_iter().map(String::from).collect();
        let current = self.lvm.get_current_vg_struct().await?;
        for vg in current.iter().filter(|vg| is_managed(vg, &lvm_groups)) {
            let policy = compiled
                .iter()
                .find(|p| p.name() == vg.name && p.kind() == ManagementPolicy::Lvm);

            if vg.pvs.iter().any(|pv| pv.is_unknown()) {
                match self.lvm.force_clean_unknown_locked(&vg.name).await {
                    Ok(()) => report.force_cleaned.push(vg.name.clone()),
                    Err(e) => {
                        warn!(group = %vg.name, error = %e, "Failed to drop missing PVs");
                        report.failures += 1;
                    }
                }
            }

            for pv in vg.pvs.iter().filter(|pv| !pv.is_unknown()) {
                if policy.is_some_and(|p| p.matches(pv.kernel_name())) {
                    continue;
                }
                info!(disk = %pv.name, group = %vg.name, "Disk no longer selected by policy");
                match self.lvm.remove_disk_locked(&pv.name, &vg.name).await {
                    Ok(()) => report.removed.push((pv.name.clone(), vg.name.clone())),
                    Err(e) => {
                        warn!(disk = %pv.name, group = %vg.name, error = %e, "Failed to remove disk");
                        report.failures += 1;
                    }
                }
            }
        }

        // Raw disks: keep the partition name cache in step with the tables
        let raw = classifier.raw_devices(&config.disk_selectors, &disks)?;
        let raw_disks = raw_disk_sizes(raw.values().flatten(), &disks);
        for disk in raw_disks.keys() {
            if let Err(e) = self.partitions.refresh_cache(disk).await {
                warn!(disk = %disk, error = %e, "Failed to refresh partition cache");
            }
        }

        // Step 4: compare and publish
        let after = self.lvm.get_current_vg_struct().await?;
        let topology = ManagedTopology {
            volume_groups: lvm_groups,
            raw_disks,
        };
        let topology_changed = {
            let mut shared = self.topology.write();
            let changed = *shared != topology;
            *shared = topology;
            changed
        };

        report.changed = before != after || topology_changed;
        if report.changed {
            self.events.publish(Trigger::Reconciled, config.node_name.as_str());
        }
        Ok(report)
    }
}

/// VGs this manager may shrink: created by it or named by an LVM policy
fn is_managed(vg: &VolumeGroup, lvm_groups: &BTreeSet<String>) -> bool {
    vg.has_tag(MANAGED_VG_TAG) || lvm_groups.contains(&vg.name)
}

fn raw_disk_sizes<'a>(
    paths: impl Iterator<Item = &'a String>,
    disks: &[Disk],
) -> BTreeMap<String, u64> {
    paths
        .filter_map(|path| {
            disks
                .iter()
                .find(|d| &d.path == path)
                .map(|d| (path.clone(), d.size_bytes))
        })
        .collect()
}

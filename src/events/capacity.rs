//! Capacity Publisher
//!
//! Drains its own event subscription, recomputes the node's capacity from
//! live LVM and partition-table reads, pushes the result into every
//! configured [`CapacitySink`] and then completes the event so a waiting
//! producer can return.
//!
//! Which VGs and raw disks count as managed is decided by the reconciler
//! each pass and shared through [`ManagedTopology`].

use crate::controller::retry::with_retry;
use crate::domain::ports::{CapacitySink, CapacitySinkRef};
use crate::domain::types::{GroupCapacity, NodeCapacity, RawDiskCapacity, ScannedDisk};
use crate::error::{Error, Result};
use crate::events::bus::{EventBus, VolumeEvent};
use crate::storage::lvm::MANAGED_VG_TAG;
use crate::storage::partition::table;
use crate::storage::{LvmEngine, PartitionEngine};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SECTOR_SIZE: u64 = 512;
const GPT_RESERVED_SECTORS: u64 = 34;

// =============================================================================
// Managed Topology
// =============================================================================

/// Volume groups and raw disks currently under management
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedTopology {
    /// LVM policy groups; tagged VGs are reported regardless
    pub volume_groups: BTreeSet<String>,
    /// Raw disk device path -> size in bytes
    pub raw_disks: BTreeMap<String, u64>,
}

pub type TopologyRef = Arc<RwLock<ManagedTopology>>;

/// Capacity of a disk that has no partition table yet
///
/// Computed against the table `sgdisk --clear` would write, so the figure
/// matches what the first allocation can actually get.
pub fn blank_disk_capacity(device: &str, size_bytes: u64) -> RawDiskCapacity {
    let sectors = size_bytes / SECTOR_SIZE;
    if sectors <= 2 * GPT_RESERVED_SECTORS {
        return RawDiskCapacity::default();
    }
    let blank = ScannedDisk {
        device: device.to_string(),
        sector_size: SECTOR_SIZE,
        first_lba: GPT_RESERVED_SECTORS,
        last_lba: sectors - GPT_RESERVED_SECTORS,
        partitions: Vec::new(),
    };
    table::raw_capacity(&blank)
}

// =============================================================================
// Watch Sink
// =============================================================================

/// In-process sink; the HTTP API and tests read the latest value
pub struct WatchCapacitySink {
    tx: watch::Sender<NodeCapacity>,
}

impl WatchCapacitySink {
    pub fn new() -> (Arc<Self>, watch::Receiver<NodeCapacity>) {
        let (tx, rx) = watch::channel(NodeCapacity::default());
        (Arc::new(Self { tx }), rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeCapacity> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl CapacitySink for WatchCapacitySink {
    async fn publish(&self, capacity: &NodeCapacity) -> Result<()> {
        self.tx.send_replace(capacity.clone());
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "watch"
    }
}

// =============================================================================
// Capacity Publisher
// =============================================================================

pub struct CapacityPublisher {
    node_name: String,
    lvm: Arc<LvmEngine>,
    partitions: Arc<PartitionEngine>,
    topology: TopologyRef,
    sinks: Vec<CapacitySinkRef>,
}

impl CapacityPublisher {
    pub fn new(
        node_name: impl Into<String>,
        lvm: Arc<LvmEngine>,
        partitions: Arc<PartitionEngine>,
        topology: TopologyRef,
        sinks: Vec<CapacitySinkRef>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.into(),
            lvm,
            partitions,
            topology,
            sinks,
        })
    }

    /// Current capacity of every managed VG and raw disk
    pub async fn compute(&self) -> Result<NodeCapacity> {
        let topology = self.topology.read().clone();
        let mut capacity = NodeCapacity {
            node_name: self.node_name.clone(),
            ..Default::default()
        };

        let vgs = with_retry(|| self.lvm.get_current_vg_struct()).await?;
        for vg in vgs
            .iter()
            .filter(|vg| vg.has_tag(MANAGED_VG_TAG) || topology.volume_groups.contains(&vg.name))
        {
            capacity.groups.insert(
                vg.name.clone(),
                GroupCapacity {
                    total_bytes: vg.size_bytes,
                    free_bytes: vg.free_bytes,
                    pv_count: vg.pv_count,
                    lv_count: vg.lv_count,
                },
            );
        }

        for (disk, size_bytes) in &topology.raw_disks {
            let raw = match with_retry(|| self.partitions.scan_disk(disk)).await {
                Ok(scanned) => table::raw_capacity(&scanned),
                Err(Error::NotFound { .. }) => blank_disk_capacity(disk, *size_bytes),
                Err(e) => {
                    warn!(disk = %disk, error = %e, "Skipping raw disk in capacity report");
                    continue;
                }
            };
            capacity.raw_disks.insert(disk.clone(), raw);
        }

        Ok(capacity)
    }

    /// Recompute and push to every sink
    ///
    /// A failing sink is logged and does not stop the others.
    pub async fn publish_now(&self) -> Result<NodeCapacity> {
        let capacity = self.compute().await?;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&capacity).await {
                warn!(sink = sink.sink_name(), error = %e, "Capacity sink rejected update");
            }
        }
        debug!(
            groups = capacity.groups.len(),
            raw_disks = capacity.raw_disks.len(),
            "Published node capacity"
        );
        Ok(capacity)
    }

    /// Subscribe now and drain the bus on a background task
    pub fn spawn(self: Arc<Self>, events: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(async move { self.run(rx, shutdown).await })
    }

    async fn run(&self, mut rx: broadcast::Receiver<VolumeEvent>, shutdown: CancellationToken) {
        info!(node = %self.node_name, sinks = self.sinks.len(), "Capacity publisher started");
        self.republish(&[]).await;

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            };

            match first {
                Ok(event) => {
                    // Coalesce whatever queued up behind it into one recompute.
                    let mut batch = vec![event];
                    while let Ok(next) = rx.try_recv() {
                        batch.push(next);
                    }
                    self.republish(&batch).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Capacity publisher lagged, recomputing");
                    self.republish(&[]).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("Capacity publisher stopped");
    }

    async fn republish(&self, batch: &[VolumeEvent]) {
        if let Err(e) = self.publish_now().await {
            warn!(error = %e, events = batch.len(), "Capacity recompute failed");
        }
        for event in batch {
            event.complete();
        }
    }
}

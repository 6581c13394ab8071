//! Local Storage Manager
//!
//! Node-local storage for a Kubernetes worker: classifies the disks
//! attached to the node, pools them into LVM thin volume groups or hands
//! them out as GPT partitions, and keeps published capacity in step with
//! every mutation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Control Loops                                   │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌───────────────────┐  │
//! │  │    Reconciler      │  │  Consistency Sweep │  │   Config Watcher  │  │
//! │  │ (scan + classify)  │  │ (desired vs host)  │  │   (hot reload)    │  │
//! │  └─────────┬──────────┘  └─────────┬──────────┘  └─────────┬─────────┘  │
//! │            └───────────────────────┼───────────────────────┘            │
//! ├────────────────────────────────────┼────────────────────────────────────┤
//! │                          Storage Engines                                 │
//! │  ┌────────────────────┐  ┌─────────┴──────────┐  ┌───────────────────┐  │
//! │  │   LVM Thin Engine  │  │    Lock Manager    │  │  Partition Engine │  │
//! │  └─────────┬──────────┘  └────────────────────┘  └─────────┬─────────┘  │
//! │            └──────────────────────┬────────────────────────┘            │
//! ├───────────────────────────────────┼─────────────────────────────────────┤
//! │                             Event Bus                                    │
//! │  ┌────────────────────┐  ┌────────┴───────────┐  ┌───────────────────┐  │
//! │  │ Capacity Publisher │  │  Storage Metrics   │  │   REST / Health   │  │
//! │  │ (watch, NodeStorage)│ │   (Prometheus)     │  │      (axum)       │  │
//! │  └────────────────────┘  └────────────────────┘  └───────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`storage`]: Lock manager, command executor, LVM and partition engines
//! - [`hardware`]: Disk discovery and classification
//! - [`events`]: Event bus, capacity publication and metrics
//! - [`controller`]: Reconciliation loop, consistency sweep and retry
//! - [`crd`]: Custom Resource Definitions
//! - [`api`]: HTTP surface
//! - [`domain`]: Core domain types and ports
//! - [`config`]: Node configuration and hot reload
//! - [`error`]: Error types and handling

pub mod api;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod events;
pub mod hardware;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use api::RestRouter;

pub use config::{ConfigWatcher, NodeConfig};

pub use controller::{
    ConsistencySweeper, ReconcileReport, Reconciler, StaticDesiredState, SweepReport,
};

pub use crd::{KubeCapacitySink, KubeDesiredState, LocalVolume, NodeStorage};

pub use domain::ports::{
    CapacitySink, DesiredState, DesiredStateSource, Executor,
};

pub use domain::types::{
    Disk, DiskSelectorPolicy, LogicalVolume, ManagementPolicy, NodeCapacity, PhysicalVolume,
    VolumeGroup,
};

pub use error::{Error, ErrorAction, ErrorCode, Result};

pub use events::{
    CapacityPublisher, EventBus, ManagedTopology, StorageMetrics, Trigger, VolumeEvent,
    WatchCapacitySink,
};

pub use hardware::{DiskClassifier, DiskScanner, ScannerConfig};

pub use storage::{CommandExecutor, LockManager, LvmEngine, PartitionEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! Domain Ports - Core trait definitions for the storage manager
//!
//! These traits define the boundaries between the engines and the outside
//! world: the host's storage tools, the cluster's desired state, and the
//! place capacity numbers are published to. Adapters implement these
//! traits to provide concrete functionality.

use crate::domain::types::NodeCapacity;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// Executor Port
// =============================================================================

/// Runs an external tool and returns its stdout
///
/// Every LVM, partitioning and discovery call goes through this seam, so a
/// test can substitute a simulated host.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` with `args`; non-zero exit maps to `Error::CommandFailed`
    async fn run_command(&self, program: &str, args: &[String]) -> Result<String>;
}

// =============================================================================
// Desired State Port
// =============================================================================

/// Names the cluster still references on this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Volume names (without the `volume-` prefix)
    pub volumes: BTreeSet<String>,
    /// Snapshot names (without the `snap-` prefix)
    pub snapshots: BTreeSet<String>,
}

impl DesiredState {
    pub fn wants_volume(&self, name: &str) -> bool {
        self.volumes.contains(name)
    }

    pub fn wants_snapshot(&self, name: &str) -> bool {
        self.snapshots.contains(name)
    }
}

/// Port to the cluster's desired-state list
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Fetch everything the cluster expects to exist on this node
    async fn desired_state(&self) -> Result<DesiredState>;
}

// =============================================================================
// Capacity Sink Port
// =============================================================================

/// Port for publishing capacity to downstream consumers
#[async_trait]
pub trait CapacitySink: Send + Sync {
    /// Publish a freshly computed capacity snapshot
    async fn publish(&self, capacity: &NodeCapacity) -> Result<()>;

    /// Sink name, for logging
    fn sink_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ExecutorRef = Arc<dyn Executor>;
pub type DesiredStateSourceRef = Arc<dyn DesiredStateSource>;
pub type CapacitySinkRef = Arc<dyn CapacitySink>;

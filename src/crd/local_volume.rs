//! LocalVolume CRD
//!
//! Desired state for one node-local volume or snapshot. The provisioning
//! adapter creates these objects; this crate only lists them to decide
//! which on-disk resources are still referenced.

use crate::domain::ports::{DesiredState, DesiredStateSource};
use crate::error::Result;
use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

// =============================================================================
// LocalVolume CRD
// =============================================================================

/// A volume, snapshot or raw partition bound to one node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LocalVolume",
    plural = "localvolumes",
    shortname = "lv",
    status = "LocalVolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Group", "type": "string", "jsonPath": ".spec.group"}"#,
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.sizeBytes"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    /// Node that owns the backing storage
    pub node_name: String,

    /// Volume group, or raw disk device path
    pub group: String,

    /// What kind of local resource this is
    #[serde(default)]
    pub kind: LocalVolumeKind,

    /// Requested size in bytes
    #[serde(default)]
    pub size_bytes: u64,

    /// Origin volume for snapshots, source volume for clones
    #[serde(default)]
    pub source: Option<String>,
}

/// Kind of node-local resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LocalVolumeKind {
    /// Thin LVM volume
    #[default]
    Lvm,
    /// Thin snapshot of an LVM volume
    Snapshot,
    /// GPT partition on a raw disk
    Raw,
}

impl std::fmt::Display for LocalVolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalVolumeKind::Lvm => write!(f, "Lvm"),
            LocalVolumeKind::Snapshot => write!(f, "Snapshot"),
            LocalVolumeKind::Raw => write!(f, "Raw"),
        }
    }
}

/// Status written by the provisioning adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    #[serde(default)]
    pub phase: Option<String>,

    /// Block device backing the volume
    #[serde(default)]
    pub device_path: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Desired State
// =============================================================================

/// Fold listed objects into the desired set for `node_name`
pub fn desired_state_from(volumes: &[LocalVolume], node_name: &str) -> DesiredState {
    let mut desired = DesiredState::default();
    for volume in volumes.iter().filter(|v| v.spec.node_name == node_name) {
        match volume.spec.kind {
            LocalVolumeKind::Snapshot => {
                desired.snapshots.insert(volume.name_any());
            }
            LocalVolumeKind::Lvm | LocalVolumeKind::Raw => {
                desired.volumes.insert(volume.name_any());
            }
        }
    }
    desired
}

/// Desired state read from LocalVolume objects in the cluster
pub struct KubeDesiredState {
    client: Client,
    node_name: String,
}

impl KubeDesiredState {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl DesiredStateSource for KubeDesiredState {
    async fn desired_state(&self) -> Result<DesiredState> {
        let api: Api<LocalVolume> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        let desired = desired_state_from(&list.items, &self.node_name);
        debug!(
            volumes = desired.volumes.len(),
            snapshots = desired.snapshots.len(),
            "Listed desired local volumes"
        );
        Ok(desired)
    }
}

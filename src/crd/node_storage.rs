//! NodeStorage CRD
//!
//! Published capacity of one node: every managed volume group and raw
//! disk with its total and free bytes. Schedulers read the status; only
//! the node's own manager writes it.

use crate::domain::ports::CapacitySink;
use crate::domain::types::NodeCapacity;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "local-storage-manager";

// =============================================================================
// NodeStorage CRD
// =============================================================================

/// Capacity report for one node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "NodeStorage",
    plural = "nodestorages",
    shortname = "ns",
    status = "NodeStorageStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Total", "type": "integer", "jsonPath": ".status.totalBytes"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.freeBytes"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct NodeStorageSpec {
    /// Name of the Kubernetes node
    pub node_name: String,
}

// =============================================================================
// Status
// =============================================================================

/// Capacity of one pool (volume group or raw disk)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacityStatus {
    pub total_bytes: u64,
    pub free_bytes: u64,

    /// Largest allocatable extent (raw disks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largest_free_extent_bytes: Option<u64>,
}

/// Status of the NodeStorage
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStorageStatus {
    /// Volume groups by name
    #[serde(default)]
    pub volume_groups: BTreeMap<String, PoolCapacityStatus>,

    /// Raw disks by device path
    #[serde(default)]
    pub raw_disks: BTreeMap<String, PoolCapacityStatus>,

    /// Sum over all pools
    #[serde(default)]
    pub total_bytes: u64,

    /// Sum over all pools
    #[serde(default)]
    pub free_bytes: u64,

    /// When the status was last written
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl NodeStorageStatus {
    pub fn from_capacity(capacity: &NodeCapacity, now: DateTime<Utc>) -> Self {
        let volume_groups: BTreeMap<String, PoolCapacityStatus> = capacity
            .groups
            .iter()
            .map(|(name, g)| {
                (
                    name.clone(),
                    PoolCapacityStatus {
                        total_bytes: g.total_bytes,
                        free_bytes: g.free_bytes,
                        largest_free_extent_bytes: None,
                    },
                )
            })
            .collect();
        let raw_disks: BTreeMap<String, PoolCapacityStatus> = capacity
            .raw_disks
            .iter()
            .map(|(path, d)| {
                (
                    path.clone(),
                    PoolCapacityStatus {
                        total_bytes: d.total_bytes,
                        free_bytes: d.free_bytes,
                        largest_free_extent_bytes: Some(d.largest_free_extent_bytes),
                    },
                )
            })
            .collect();

        let pools = volume_groups.values().chain(raw_disks.values());
        let (total_bytes, free_bytes) = pools.fold((0u64, 0u64), |(t, f), p| {
            (t + p.total_bytes, f + p.free_bytes)
        });

        Self {
            volume_groups,
            raw_disks,
            total_bytes,
            free_bytes,
            last_updated: Some(now),
        }
    }
}

// =============================================================================
// Capacity Sink
// =============================================================================

/// Writes capacity into the node's NodeStorage status
pub struct KubeCapacitySink {
    client: Client,
}

impl KubeCapacitySink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn ensure_object(&self, api: &Api<NodeStorage>, node_name: &str) -> Result<()> {
        if api.get_opt(node_name).await?.is_none() {
            let object = NodeStorage::new(
                node_name,
                NodeStorageSpec {
                    node_name: node_name.to_string(),
                },
            );
            api.create(&PostParams::default(), &object).await?;
            info!(node = node_name, "Created NodeStorage object");
        }
        Ok(())
    }
}

#[async_trait]
impl CapacitySink for KubeCapacitySink {
    async fn publish(&self, capacity: &NodeCapacity) -> Result<()> {
        let api: Api<NodeStorage> = Api::all(self.client.clone());
        self.ensure_object(&api, &capacity.node_name).await?;

        let status = NodeStorageStatus::from_capacity(capacity, Utc::now());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &capacity.node_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        debug!(
            node = %capacity.node_name,
            total_bytes = status.total_bytes,
            free_bytes = status.free_bytes,
            "Patched NodeStorage status"
        );
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "kubernetes"
    }
}

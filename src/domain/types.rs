//! Domain Types
//!
//! Value types recomputed from the external storage tools on every query.
//! None of these are long-lived mutable objects: a `VolumeGroup` is a
//! snapshot of what `vgs` reported at one instant.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Block Devices
// =============================================================================

/// Block device type as reported by lsblk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Disk,
    Part,
    Lvm,
    Crypt,
    Mpath,
    Rom,
    Loop,
    Other(String),
}

impl DeviceType {
    /// Parse the lsblk TYPE column
    pub fn from_lsblk(value: &str) -> Self {
        match value {
            "disk" => DeviceType::Disk,
            "part" => DeviceType::Part,
            "lvm" => DeviceType::Lvm,
            "crypt" => DeviceType::Crypt,
            "mpath" => DeviceType::Mpath,
            "rom" => DeviceType::Rom,
            "loop" => DeviceType::Loop,
            other => DeviceType::Other(other.to_string()),
        }
    }

    /// Whether a device of this type can back a volume group
    pub fn is_supported(&self) -> bool {
        matches!(self, DeviceType::Disk)
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Disk => write!(f, "disk"),
            DeviceType::Part => write!(f, "part"),
            DeviceType::Lvm => write!(f, "lvm"),
            DeviceType::Crypt => write!(f, "crypt"),
            DeviceType::Mpath => write!(f, "mpath"),
            DeviceType::Rom => write!(f, "rom"),
            DeviceType::Loop => write!(f, "loop"),
            DeviceType::Other(other) => write!(f, "{}", other),
        }
    }
}

/// A discovered block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Kernel name (e.g., sdb)
    pub name: String,
    /// Device path (e.g., /dev/sdb)
    pub path: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Rotational media
    pub rotational: bool,
    /// Read-only device
    pub read_only: bool,
    /// Filesystem or other signature, if any
    pub fstype: Option<String>,
    /// Mount point, if mounted
    pub mountpoint: Option<String>,
    /// Parent kernel name (set for partitions and mapped devices)
    pub parent: Option<String>,
    /// Other devices name this one as their parent
    pub has_children: bool,
    /// lsblk device type
    pub device_type: DeviceType,
    /// Bytes in use by a mounted filesystem
    pub used_bytes: u64,
    /// udev properties
    #[serde(default)]
    pub udev: BTreeMap<String, String>,
}

impl Disk {
    /// Carries an LVM physical-volume label
    pub fn is_lvm_member(&self) -> bool {
        self.fstype.as_deref() == Some("LVM2_member")
    }
}

// =============================================================================
// LVM Entities
// =============================================================================

/// Name `pvs` uses for a physical volume whose device has gone missing
pub const UNKNOWN_PV_NAME: &str = "[unknown]";

/// A physical volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    /// Device path, or `[unknown]` when the device is missing
    pub name: String,
    /// Owning volume group, `None` when unassigned
    pub vg_name: Option<String>,
    pub size_bytes: u64,
    pub free_bytes: u64,
    /// Bytes of allocated extents
    pub used_bytes: u64,
    pub attr: String,
}

impl PhysicalVolume {
    /// The PV is reported missing or its name is unknown
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_PV_NAME || self.attr.chars().nth(2) == Some('m')
    }

    /// Kernel name of the backing device (strips `/dev/`)
    pub fn kernel_name(&self) -> &str {
        self.name.strip_prefix("/dev/").unwrap_or(&self.name)
    }
}

/// A volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    pub pv_count: u32,
    pub lv_count: u32,
    pub snap_count: u32,
    pub attr: String,
    pub tags: Vec<String>,
    pub size_bytes: u64,
    pub free_bytes: u64,
    /// Member physical volumes
    pub pvs: Vec<PhysicalVolume>,
}

impl VolumeGroup {
    /// Whether a device path is a member of this VG
    pub fn has_pv(&self, device_path: &str) -> bool {
        self.pvs.iter().any(|pv| pv.name == device_path)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Kind of logical volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LvKind {
    ThinPool,
    ThinVolume,
    Snapshot,
    Other,
}

/// A logical volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    pub kernel_major: Option<u32>,
    pub kernel_minor: Option<u32>,
    /// Origin LV for snapshots
    pub origin: Option<String>,
    /// Thin pool this LV is carved from
    pub pool_lv: Option<String>,
    pub tags: Vec<String>,
    pub attr: String,
    pub active: bool,
    /// Percentage of the LV's data space that is mapped
    pub data_percent: f64,
}

impl LogicalVolume {
    pub fn kind(&self) -> LvKind {
        match self.attr.chars().next() {
            Some('t') => LvKind::ThinPool,
            Some('V') if self.origin.is_some() => LvKind::Snapshot,
            Some('V') => LvKind::ThinVolume,
            _ => LvKind::Other,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Bytes currently mapped in this LV
    pub fn used_bytes(&self) -> u64 {
        (self.size_bytes as f64 * self.data_percent / 100.0).ceil() as u64
    }
}

// =============================================================================
// Partitions
// =============================================================================

/// A partition on a raw-mode disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition number (1..=127)
    pub number: u32,
    pub name: String,
    /// Byte offset of the first byte
    pub start_byte: u64,
    /// Byte offset of the last byte (inclusive)
    pub last_byte: u64,
    pub type_guid: String,
    pub uuid: Option<String>,
}

impl Partition {
    pub fn size_bytes(&self) -> u64 {
        self.last_byte - self.start_byte + 1
    }
}

/// The live partition table of a whole disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDisk {
    pub device: String,
    pub sector_size: u64,
    /// First usable LBA
    pub first_lba: u64,
    /// Last usable LBA (inclusive)
    pub last_lba: u64,
    pub partitions: Vec<Partition>,
}

// =============================================================================
// Disk Selector Policy
// =============================================================================

/// How a group of disks is managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagementPolicy {
    #[serde(rename = "LVM", alias = "lvm")]
    Lvm,
    #[serde(rename = "RAW", alias = "raw")]
    Raw,
    #[serde(rename = "HOST-PATH", alias = "host-path")]
    HostPath,
}

impl std::fmt::Display for ManagementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementPolicy::Lvm => write!(f, "LVM"),
            ManagementPolicy::Raw => write!(f, "RAW"),
            ManagementPolicy::HostPath => write!(f, "HOST-PATH"),
        }
    }
}

/// One entry of the ordered disk selector list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSelectorPolicy {
    /// Group name (VG name for LVM groups)
    pub name: String,
    /// Regex patterns matched against the kernel name
    pub re: Vec<String>,
    pub policy: ManagementPolicy,
}

// =============================================================================
// Capacity
// =============================================================================

/// Capacity of one volume group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub pv_count: u32,
    pub lv_count: u32,
}

/// Capacity of one raw-mode disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDiskCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub largest_free_extent_bytes: u64,
    pub partition_count: u32,
}

/// Capacity numbers published for the scheduler and control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub node_name: String,
    pub groups: IndexMap<String, GroupCapacity>,
    pub raw_disks: IndexMap<String, RawDiskCapacity>,
}

//! Disk Classifier
//!
//! Assigns discovered disks to named groups using the ordered selector
//! policies. A disk belongs to the first policy whose pattern matches its
//! kernel name; later policies never see it. Disks that already carry
//! data, a filesystem, a mount, a parent or children are never eligible.

use crate::domain::types::{
    DeviceType, Disk, DiskSelectorPolicy, ManagementPolicy, PhysicalVolume, VolumeGroup,
};
use crate::error::Result;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Group name -> sorted device paths, in policy order
pub type Classification = IndexMap<String, Vec<String>>;

// =============================================================================
// Compiled Policies
// =============================================================================

/// A selector policy with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: DiskSelectorPolicy,
    patterns: Vec<Regex>,
}

impl CompiledPolicy {
    pub fn compile(policy: &DiskSelectorPolicy) -> Result<Self> {
        let patterns = policy
            .re
            .iter()
            .map(|re| Regex::new(re))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            policy: policy.clone(),
            patterns,
        })
    }

    pub fn compile_all(policies: &[DiskSelectorPolicy]) -> Result<Vec<Self>> {
        policies.iter().map(Self::compile).collect()
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub fn kind(&self) -> ManagementPolicy {
        self.policy.policy
    }

    /// Whether any pattern matches the kernel name
    pub fn matches(&self, kernel_name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(kernel_name))
    }
}

/// First policy, in configured order, matching `kernel_name`
pub fn first_match<'a>(compiled: &'a [CompiledPolicy], kernel_name: &str) -> Option<&'a CompiledPolicy> {
    compiled.iter().find(|p| p.matches(kernel_name))
}

// =============================================================================
// Classifier Configuration
// =============================================================================

/// Configuration for the disk classifier
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Name substrings marking devices owned by someone else (e.g., bcache)
    pub reserved_name_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            reserved_name_markers: vec!["bcache".to_string()],
        }
    }
}

// =============================================================================
// Disk Classifier
// =============================================================================

/// Maps discovered disks onto selector groups
pub struct DiskClassifier {
    config: ClassifierConfig,
}

impl Default for DiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskClassifier {
    /// Create a new classifier with default config
    pub fn new() -> Self {
        Self {
            config: ClassifierConfig::default(),
        }
    }

    /// Create a classifier with custom config
    pub fn with_config(config: ClassifierConfig) -> Self {
        Self { config }
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.config
            .reserved_name_markers
            .iter()
            .any(|marker| name.contains(marker.as_str()))
    }

    /// Why a disk cannot join a volume group, if it cannot
    ///
    /// `free_pvs` lists device paths carrying a PV label with no VG; that
    /// label is not treated as foreign data.
    pub fn ineligible_reason(&self, disk: &Disk, free_pvs: &HashSet<&str>) -> Option<&'static str> {
        if !disk.device_type.is_supported() {
            return Some("unsupported device type");
        }
        if disk.parent.is_some() {
            return Some("has a parent device");
        }
        if disk.has_children {
            return Some("has partitions or holders");
        }
        if disk.read_only {
            return Some("read-only");
        }
        if self.is_reserved(&disk.name) {
            return Some("reserved name");
        }
        let free_label = disk.is_lvm_member() && free_pvs.contains(disk.path.as_str());
        if disk.fstype.is_some() && !free_label {
            return Some("carries a signature");
        }
        if disk.mountpoint.is_some() {
            return Some("mounted");
        }
        if disk.used_bytes > 0 {
            return Some("holds data");
        }
        None
    }

    /// Whether a disk may be handed to a raw partition group
    ///
    /// Raw disks may already carry partitions; the partition engine owns them.
    pub fn raw_ineligible_reason(&self, disk: &Disk) -> Option<&'static str> {
        if disk.device_type != DeviceType::Disk {
            return Some("not a whole disk");
        }
        if disk.parent.is_some() {
            return Some("has a parent device");
        }
        if disk.read_only {
            return Some("read-only");
        }
        if self.is_reserved(&disk.name) {
            return Some("reserved name");
        }
        if disk.fstype.is_some() {
            return Some("carries a signature");
        }
        if disk.mountpoint.is_some() {
            return Some("mounted");
        }
        None
    }

    /// Assign eligible disks to LVM and host-path groups, then merge orphan PVs
    ///
    /// An orphan PV declares a VG name that is an LVM group of the current
    /// policy list while no such VG exists. It is placed under that name,
    /// replacing any pattern-based placement of the same device.
    pub fn classify(
        &self,
        policies: &[DiskSelectorPolicy],
        disks: &[Disk],
        pvs: &[PhysicalVolume],
        vgs: &[VolumeGroup],
    ) -> Result<Classification> {
        let compiled = CompiledPolicy::compile_all(policies)?;
        let free_pvs: HashSet<&str> = pvs
            .iter()
            .filter(|pv| pv.vg_name.is_none())
            .map(|pv| pv.name.as_str())
            .collect();

        let mut groups: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for disk in disks {
            let Some(policy) = first_match(&compiled, &disk.name) else {
                continue;
            };
            if policy.kind() == ManagementPolicy::Raw {
                continue;
            }
            if let Some(reason) = self.ineligible_reason(disk, &free_pvs) {
                trace!(disk = %disk.name, group = policy.name(), reason, "Skipping disk");
                continue;
            }
            groups.entry(policy.name()).or_default().insert(disk.path.clone());
        }

        let existing_vgs: HashSet<&str> = vgs.iter().map(|vg| vg.name.as_str()).collect();
        for pv in pvs.iter().filter(|pv| !pv.is_unknown()) {
            let Some(vg) = pv.vg_name.as_deref() else {
                continue;
            };
            if existing_vgs.contains(vg) {
                continue;
            }
            let Some(policy) = compiled
                .iter()
                .find(|p| p.name() == vg && p.kind() == ManagementPolicy::Lvm)
            else {
                continue;
            };
            for members in groups.values_mut() {
                members.remove(&pv.name);
            }
            debug!(pv = %pv.name, vg, "Merging orphan physical volume");
            groups.entry(policy.name()).or_default().insert(pv.name.clone());
        }

        Ok(ordered(&compiled, groups))
    }

    /// Assign disks to RAW groups
    pub fn raw_devices(&self, policies: &[DiskSelectorPolicy], disks: &[Disk]) -> Result<Classification> {
        let compiled = CompiledPolicy::compile_all(policies)?;

        let mut groups: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for disk in disks {
            let Some(policy) = first_match(&compiled, &disk.name) else {
                continue;
            };
            if policy.kind() != ManagementPolicy::Raw {
                continue;
            }
            if let Some(reason) = self.raw_ineligible_reason(disk) {
                trace!(disk = %disk.name, group = policy.name(), reason, "Skipping raw disk");
                continue;
            }
            groups.entry(policy.name()).or_default().insert(disk.path.clone());
        }

        Ok(ordered(&compiled, groups))
    }
}

fn ordered(compiled: &[CompiledPolicy], mut groups: HashMap<&str, BTreeSet<String>>) -> Classification {
    compiled
        .iter()
        .filter_map(|p| {
            groups
                .remove(p.name())
                .filter(|members| !members.is_empty())
                .map(|members| (p.name().to_string(), members.into_iter().collect()))
        })
        .collect()
}

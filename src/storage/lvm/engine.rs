//! LVM Volume Engine
//!
//! Thin-provisioned volumes on top of the LVM2 command-line tools. Each user
//! volume `<name>` is backed by its own thin pool `t-<name>` holding one thin
//! LV `volume-<name>`; snapshots `snap-<snap>` live in the same pool.
//!
//! Per-volume state machine:
//!
//! ```text
//! absent -> pool-created -> volume-created -> (snapshot-created)* -> deleting -> absent
//! ```
//!
//! The engine keeps no cached LVM facts: every call re-reads `pvs`/`vgs`/`lvs`.
//! Calls are not retried here; callers apply bounded retry.

use super::report::{self, LV_FIELDS, PV_FIELDS, VG_FIELDS};
use crate::domain::ports::ExecutorRef;
use crate::domain::types::{LogicalVolume, LvKind, PhysicalVolume, VolumeGroup};
use crate::error::{Error, Result};
use crate::events::{EventBus, Trigger};
use crate::storage::lock::{LockManager, DISK_MUTEX};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Naming
// =============================================================================

pub const THIN_POOL_PREFIX: &str = "t-";
pub const VOLUME_PREFIX: &str = "volume-";
pub const SNAPSHOT_PREFIX: &str = "snap-";

/// Tag placed on every VG this engine creates
pub const MANAGED_VG_TAG: &str = "local-storage";

/// Tag carried by a clone target until its content copy finished
pub const CLONE_PENDING_TAG: &str = "clone-pending";

/// LVM allocates in 4 MiB extents by default
pub const EXTENT_SIZE: u64 = 4 * 1024 * 1024;

pub fn pool_name(volume: &str) -> String {
    format!("{}{}", THIN_POOL_PREFIX, volume)
}

pub fn volume_lv_name(volume: &str) -> String {
    format!("{}{}", VOLUME_PREFIX, volume)
}

pub fn snapshot_lv_name(snapshot: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, snapshot)
}

/// Lock key for a user volume
pub fn volume_key(volume: &str) -> String {
    volume_lv_name(volume)
}

/// Lock key for a snapshot
pub fn snapshot_key(snapshot: &str) -> String {
    snapshot_lv_name(snapshot)
}

/// Volume that owns a thin pool, from the pool's LV name
pub fn pool_owner(pool: &str) -> Option<&str> {
    pool.strip_prefix(THIN_POOL_PREFIX).filter(|n| !n.is_empty())
}

/// A thin snapshot, including one whose origin has been removed
///
/// LVM clears `origin` on thin snapshots when the origin goes away, so the
/// name prefix and the pool reference identify them from then on.
pub fn is_thin_snapshot(lv: &LogicalVolume) -> bool {
    match lv.kind() {
        LvKind::Snapshot => true,
        LvKind::ThinVolume => lv.name.starts_with(SNAPSHOT_PREFIX) && lv.pool_lv.is_some(),
        _ => false,
    }
}

/// Thin pool size for a volume of `size_bytes`
pub fn thin_pool_size(size_bytes: u64, ratio: f64) -> u64 {
    (size_bytes as f64 * ratio).ceil() as u64
}

fn lv_path(group: &str, lv: &str) -> String {
    format!("{}/{}", group, lv)
}

fn device_path(group: &str, lv: &str) -> String {
    format!("/dev/{}/{}", group, lv)
}

/// Existing LV size satisfies a request, allowing for extent rounding
fn size_matches(existing: u64, requested: u64) -> bool {
    existing >= requested && existing - requested < EXTENT_SIZE
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
        return Err(Error::InvalidArgument(format!("invalid {} name: {:?}", kind, name)));
    }
    Ok(())
}

// =============================================================================
// LVM Engine
// =============================================================================

/// Thin volume, snapshot and clone lifecycle plus VG membership
pub struct LvmEngine {
    exec: ExecutorRef,
    locks: Arc<LockManager>,
    events: Arc<EventBus>,
}

impl LvmEngine {
    pub fn new(exec: ExecutorRef, locks: Arc<LockManager>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            exec,
            locks,
            events,
        })
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String> {
        self.exec.run_command(program, &args).await
    }

    // =========================================================================
    // Read-only Views
    // =========================================================================

    /// All physical volumes, assigned or not
    pub async fn get_current_pv_struct(&self) -> Result<Vec<PhysicalVolume>> {
        let out = self.run("pvs", report::report_args(PV_FIELDS)).await?;
        let mut pvs = report::parse_pvs(&out)?;
        pvs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pvs)
    }

    /// All volume groups with their member PVs attached
    pub async fn get_current_vg_struct(&self) -> Result<Vec<VolumeGroup>> {
        let out = self.run("vgs", report::report_args(VG_FIELDS)).await?;
        let mut vgs = report::parse_vgs(&out)?;
        let pvs = self.get_current_pv_struct().await?;

        for vg in &mut vgs {
            vg.pvs = pvs
                .iter()
                .filter(|pv| pv.vg_name.as_deref() == Some(vg.name.as_str()))
                .cloned()
                .collect();
        }
        vgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vgs)
    }

    /// A single volume group
    pub async fn volume_group(&self, group: &str) -> Result<VolumeGroup> {
        self.get_current_vg_struct()
            .await?
            .into_iter()
            .find(|vg| vg.name == group)
            .ok_or_else(|| Error::not_found("VolumeGroup", group))
    }

    /// Every LV in `group`; empty if the group does not exist
    pub async fn list_lvs(&self, group: &str) -> Result<Vec<LogicalVolume>> {
        let mut args = report::report_args(LV_FIELDS);
        args.push("--select".into());
        args.push(format!("vg_name={}", group));
        let out = self.run("lvs", args).await?;
        report::parse_lvs(&out)
    }

    /// LVs belonging to volume `name` (pool, volume, snapshots), or all LVs
    /// in the group when `name` is empty
    pub async fn volume_list(&self, name: &str, group: &str) -> Result<Vec<LogicalVolume>> {
        let lvs = self.list_lvs(group).await?;
        if name.is_empty() {
            return Ok(lvs);
        }

        let pool = pool_name(name);
        let volume = volume_lv_name(name);
        Ok(lvs
            .into_iter()
            .filter(|lv| {
                lv.name == pool
                    || lv.name == volume
                    || lv.pool_lv.as_deref() == Some(pool.as_str())
                    || lv.origin.as_deref() == Some(volume.as_str())
            })
            .collect())
    }

    // =========================================================================
    // Volume Lifecycle
    // =========================================================================

    /// Create volume `name` of `size_bytes` backed by a pool of `size x ratio`
    pub async fn create_volume(
        &self,
        name: &str,
        group: &str,
        size_bytes: u64,
        ratio: f64,
    ) -> Result<LogicalVolume> {
        validate_name("volume", name)?;
        if size_bytes == 0 {
            return Err(Error::InvalidArgument("volume size must be positive".into()));
        }
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "over-provision ratio must be >= 1.0, got {}",
                ratio
            )));
        }

        let _guard = self.locks.lock(volume_key(name))?;
        let pool = pool_name(name);
        let volume = volume_lv_name(name);
        let pool_size = thin_pool_size(size_bytes, ratio);

        let lvs = self.list_lvs(group).await?;
        if let Some(existing) = lvs.iter().find(|lv| lv.name == volume) {
            if size_matches(existing.size_bytes, size_bytes) {
                debug!(volume = %name, group, "Volume already exists with requested size");
                return Ok(existing.clone());
            }
            return Err(Error::already_exists(
                "Volume",
                name,
                format!(
                    "existing size {} differs from requested {}",
                    existing.size_bytes, size_bytes
                ),
            ));
        }

        let vg = self.volume_group(group).await?;
        let existing_pool = lvs.iter().find(|lv| lv.name == pool);

        let created_pool = match existing_pool {
            None => {
                if vg.free_bytes < pool_size {
                    return Err(Error::ResourceExhausted {
                        requested: pool_size,
                        available: vg.free_bytes,
                    });
                }
                self.create_thin_pool(group, &pool, pool_size).await?;
                true
            }
            Some(existing) => {
                // Pool left behind by an interrupted create
                if existing.size_bytes < pool_size {
                    let grow = pool_size - existing.size_bytes;
                    if vg.free_bytes < grow {
                        return Err(Error::ResourceExhausted {
                            requested: grow,
                            available: vg.free_bytes,
                        });
                    }
                    self.extend_lv(group, &pool, pool_size).await?;
                }
                false
            }
        };

        if let Err(e) = self
            .create_thin_volume(group, &pool, &volume, size_bytes, &[])
            .await
        {
            if created_pool {
                self.remove_lv_best_effort(group, &pool).await;
            }
            return Err(e);
        }

        info!(volume = %name, group, size_bytes, pool_size, "Created thin volume");
        let created = self.find_lv(group, &volume).await?;
        self.events.publish_and_wait(Trigger::VolumeCreated, name).await;
        Ok(created)
    }

    /// Remove volume `name` and, once nothing references it, its pool
    ///
    /// Deleting an absent volume succeeds.
    pub async fn delete_volume(&self, name: &str, group: &str) -> Result<()> {
        validate_name("volume", name)?;
        let _guard = self.locks.lock(volume_key(name))?;

        let pool = pool_name(name);
        let volume = volume_lv_name(name);
        let lvs = self.list_lvs(group).await?;

        let mut changed = false;
        if lvs.iter().any(|lv| lv.name == volume) {
            self.remove_lv(group, &volume).await?;
            changed = true;
        }

        let pool_referenced = lvs
            .iter()
            .any(|lv| lv.name != volume && lv.pool_lv.as_deref() == Some(pool.as_str()));
        if pool_referenced {
            info!(volume = %name, group, "Keeping thin pool, snapshots still reference it");
        } else if lvs.iter().any(|lv| lv.name == pool) {
            self.remove_lv(group, &pool).await?;
            changed = true;
        }

        if changed {
            info!(volume = %name, group, "Deleted volume");
            self.events.publish(Trigger::VolumeDeleted, name);
        } else {
            debug!(volume = %name, group, "Volume already absent");
        }
        Ok(())
    }

    /// Grow the pool, then the volume; shrinking is refused
    pub async fn resize_volume(
        &self,
        name: &str,
        group: &str,
        new_size_bytes: u64,
        ratio: f64,
    ) -> Result<LogicalVolume> {
        validate_name("volume", name)?;
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "over-provision ratio must be >= 1.0, got {}",
                ratio
            )));
        }
        let _guard = self.locks.lock(volume_key(name))?;

        let pool = pool_name(name);
        let volume = volume_lv_name(name);
        let lvs = self.list_lvs(group).await?;

        let current = lvs
            .iter()
            .find(|lv| lv.name == volume)
            .ok_or_else(|| Error::not_found("Volume", name))?;

        // The LV is rounded up to whole extents at creation
        if size_matches(current.size_bytes, new_size_bytes) {
            return Ok(current.clone());
        }
        if new_size_bytes < current.size_bytes {
            return Err(Error::OutOfRange {
                current: current.size_bytes,
                requested: new_size_bytes,
            });
        }

        let pool_target = thin_pool_size(new_size_bytes, ratio);
        let pool_lv = lvs
            .iter()
            .find(|lv| lv.name == pool)
            .ok_or_else(|| Error::not_found("ThinPool", &pool))?;

        if pool_lv.size_bytes < pool_target {
            let vg = self.volume_group(group).await?;
            let grow = pool_target - pool_lv.size_bytes;
            if vg.free_bytes < grow {
                return Err(Error::ResourceExhausted {
                    requested: grow,
                    available: vg.free_bytes,
                });
            }
            self.extend_lv(group, &pool, pool_target).await?;
        }

        self.extend_lv(group, &volume, new_size_bytes).await?;
        info!(volume = %name, group, new_size_bytes, "Resized volume");

        let resized = self.find_lv(group, &volume).await?;
        self.events.publish(Trigger::VolumeResized, name);
        Ok(resized)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Thin snapshot of volume `name`; consumes pool, not VG, capacity
    ///
    /// The pool must have room for the origin's currently mapped data, so a
    /// full rewrite of the origin after the snapshot cannot overflow it.
    pub async fn create_snapshot(
        &self,
        snapshot: &str,
        name: &str,
        group: &str,
    ) -> Result<LogicalVolume> {
        validate_name("snapshot", snapshot)?;
        validate_name("volume", name)?;
        let _guard = self.locks.lock(volume_key(name))?;

        let volume = volume_lv_name(name);
        let snap = snapshot_lv_name(snapshot);
        let lvs = self.list_lvs(group).await?;

        if let Some(existing) = lvs.iter().find(|lv| lv.name == snap) {
            if existing.origin.as_deref() == Some(volume.as_str()) {
                return Ok(existing.clone());
            }
            return Err(Error::already_exists(
                "Snapshot",
                snapshot,
                format!("belongs to origin {:?}", existing.origin),
            ));
        }

        let origin = lvs
            .iter()
            .find(|lv| lv.name == volume)
            .ok_or_else(|| Error::not_found("Volume", name))?;
        let pool_lv = origin
            .pool_lv
            .as_deref()
            .and_then(|p| lvs.iter().find(|lv| lv.name == p))
            .ok_or_else(|| Error::not_found("ThinPool", pool_name(name)))?;

        let pool_free = pool_lv.size_bytes.saturating_sub(pool_lv.used_bytes());
        let projected = origin.used_bytes();
        if pool_free < projected {
            return Err(Error::ResourceExhausted {
                requested: projected,
                available: pool_free,
            });
        }

        let args: Vec<String> = vec![
            "-y".into(),
            "-s".into(),
            "-kn".into(),
            "-n".into(),
            snap.clone(),
            lv_path(group, &volume),
        ];
        self.run("lvcreate", args).await?;
        info!(snapshot, volume = %name, group, "Created snapshot");

        let created = self.find_lv(group, &snap).await?;
        self.events.publish(Trigger::SnapshotCreated, snapshot);
        Ok(created)
    }

    /// Remove a snapshot; removes the pool too once its volume is gone
    ///
    /// Runs under the owning volume's key as well, so it never races a
    /// delete of the origin over who releases the shared pool.
    pub async fn delete_snapshot(&self, snapshot: &str, group: &str) -> Result<()> {
        validate_name("snapshot", snapshot)?;
        let _guard = self.locks.lock(snapshot_key(snapshot))?;

        let snap = snapshot_lv_name(snapshot);
        let owner = self
            .list_lvs(group)
            .await?
            .into_iter()
            .find(|lv| lv.name == snap)
            .and_then(|lv| lv.pool_lv)
            .and_then(|pool| pool_owner(&pool).map(str::to_string));
        let _owner_guard = owner
            .as_deref()
            .map(|volume| self.locks.lock(volume_key(volume)))
            .transpose()?;

        let lvs = self.list_lvs(group).await?;
        let Some(existing) = lvs.iter().find(|lv| lv.name == snap) else {
            debug!(snapshot, group, "Snapshot already absent");
            return Ok(());
        };
        if !is_thin_snapshot(existing) {
            return Err(Error::InvalidArgument(format!("{} is not a snapshot", snap)));
        }

        self.remove_lv(group, &snap).await?;

        if let Some(pool) = existing.pool_lv.as_deref() {
            let remaining = lvs
                .iter()
                .filter(|lv| lv.name != snap && lv.pool_lv.as_deref() == Some(pool))
                .count();
            if remaining == 0 && lvs.iter().any(|lv| lv.name == pool) {
                info!(pool, group, "Removing orphaned thin pool after last snapshot");
                self.remove_lv(group, pool).await?;
            }
        }

        info!(snapshot, group, "Deleted snapshot");
        self.events.publish(Trigger::SnapshotDeleted, snapshot);
        Ok(())
    }

    /// Merge the snapshot back into its origin, consuming the snapshot
    ///
    /// Precondition, not enforced: the caller has closed every open handle
    /// on the origin's block device. LVM defers the merge otherwise.
    pub async fn restore_snapshot(&self, snapshot: &str, name: &str, group: &str) -> Result<()> {
        validate_name("snapshot", snapshot)?;
        validate_name("volume", name)?;
        let _guard = self.locks.lock(volume_key(name))?;

        let snap = snapshot_lv_name(snapshot);
        let volume = volume_lv_name(name);
        let lvs = self.list_lvs(group).await?;

        let existing = lvs
            .iter()
            .find(|lv| lv.name == snap)
            .ok_or_else(|| Error::not_found("Snapshot", snapshot))?;
        if existing.origin.as_deref() != Some(volume.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} does not belong to volume {}",
                snapshot, name
            )));
        }

        let args: Vec<String> = vec!["-y".into(), "--merge".into(), lv_path(group, &snap)];
        self.run("lvconvert", args).await?;
        info!(snapshot, volume = %name, group, "Restored snapshot");

        self.events.publish(Trigger::SnapshotRestored, name);
        Ok(())
    }

    // =========================================================================
    // Clone
    // =========================================================================

    /// Independent copy of `name` as `new_name`
    ///
    /// Two phases: provision the target pool and volume tagged
    /// `clone-pending`, then copy content and drop the tag. A crash between
    /// the phases leaves a tagged target that the consistency sweep removes.
    pub async fn clone_volume(
        &self,
        name: &str,
        group: &str,
        new_name: &str,
    ) -> Result<LogicalVolume> {
        validate_name("volume", name)?;
        validate_name("volume", new_name)?;
        if name == new_name {
            return Err(Error::InvalidArgument("clone target equals source".into()));
        }
        let _source_guard = self.locks.lock(volume_key(name))?;
        let _target_guard = self.locks.lock(volume_key(new_name))?;

        let source = volume_lv_name(name);
        let source_pool = pool_name(name);
        let target = volume_lv_name(new_name);
        let target_pool = pool_name(new_name);
        let lvs = self.list_lvs(group).await?;

        let source_lv = lvs
            .iter()
            .find(|lv| lv.name == source)
            .ok_or_else(|| Error::not_found("Volume", name))?;
        let pool_size = lvs
            .iter()
            .find(|lv| lv.name == source_pool)
            .map(|lv| lv.size_bytes)
            .unwrap_or(source_lv.size_bytes);

        if let Some(existing) = lvs.iter().find(|lv| lv.name == target) {
            if !existing.has_tag(CLONE_PENDING_TAG) && size_matches(existing.size_bytes, source_lv.size_bytes) {
                return Ok(existing.clone());
            }
            if !existing.has_tag(CLONE_PENDING_TAG) {
                return Err(Error::already_exists(
                    "Volume",
                    new_name,
                    "clone target exists with a different size",
                ));
            }
            warn!(volume = %new_name, group, "Discarding interrupted clone target");
            self.remove_lv(group, &target).await?;
        }

        let vg = self.volume_group(group).await?;
        let have_pool = lvs.iter().any(|lv| lv.name == target_pool);
        if !have_pool {
            if vg.free_bytes < pool_size {
                return Err(Error::ResourceExhausted {
                    requested: pool_size,
                    available: vg.free_bytes,
                });
            }
            self.create_thin_pool(group, &target_pool, pool_size).await?;
        }

        if let Err(e) = self
            .create_thin_volume(
                group,
                &target_pool,
                &target,
                source_lv.size_bytes,
                &[CLONE_PENDING_TAG],
            )
            .await
        {
            self.remove_lv_best_effort(group, &target_pool).await;
            return Err(e);
        }

        let copy_args: Vec<String> = vec![
            format!("if={}", device_path(group, &source)),
            format!("of={}", device_path(group, &target)),
            "bs=4M".into(),
            "conv=sparse,fsync".into(),
            "status=none".into(),
        ];
        if let Err(e) = self.run("dd", copy_args).await {
            warn!(volume = %new_name, group, error = %e, "Clone copy failed, removing target");
            self.remove_lv_best_effort(group, &target).await;
            self.remove_lv_best_effort(group, &target_pool).await;
            return Err(e);
        }

        let untag: Vec<String> = vec![
            "--deltag".into(),
            CLONE_PENDING_TAG.into(),
            lv_path(group, &target),
        ];
        self.run("lvchange", untag).await?;
        info!(source = %name, target = %new_name, group, "Cloned volume");

        let cloned = self.find_lv(group, &target).await?;
        self.events.publish_and_wait(Trigger::VolumeCloned, new_name).await;
        Ok(cloned)
    }

    // =========================================================================
    // VG Membership
    // =========================================================================

    /// Label `disk` and add it to `group`, creating the VG if needed
    pub async fn add_new_disk_to_vg(&self, disk: &str, group: &str) -> Result<()> {
        let _guard = self.locks.lock(DISK_MUTEX)?;
        self.add_disk_locked(disk, group).await
    }

    /// Evacuate `disk` and remove it from `group`
    pub async fn remove_disk_in_vg(&self, disk: &str, group: &str) -> Result<()> {
        let _guard = self.locks.lock(DISK_MUTEX)?;
        self.remove_disk_locked(disk, group).await
    }

    /// Add a disk; caller holds `DISK_MUTEX`
    pub(crate) async fn add_disk_locked(&self, disk: &str, group: &str) -> Result<()> {
        let vgs = self.get_current_vg_struct().await?;
        let vg_exists = |name: &str| vgs.iter().any(|vg| vg.name == name);
        let group_exists = vg_exists(group);

        let pvs = self.get_current_pv_struct().await?;
        match pvs.iter().find(|pv| pv.name == disk) {
            Some(pv) if group_exists && pv.vg_name.as_deref() == Some(group) => {
                debug!(disk, group, "Disk already a member");
                return Ok(());
            }
            Some(pv) if pv.vg_name.as_deref().is_some_and(|vg| vg_exists(vg)) => {
                return Err(Error::already_exists(
                    "PhysicalVolume",
                    disk,
                    format!("member of volume group {:?}", pv.vg_name),
                ));
            }
            Some(_) => debug!(disk, "Reusing existing PV label"),
            None => {
                let args: Vec<String> = vec!["-y".into(), disk.to_string()];
                self.run("pvcreate", args).await?;
            }
        }

        if group_exists {
            let args: Vec<String> = vec!["-y".into(), group.to_string(), disk.to_string()];
            self.run("vgextend", args).await?;
        } else {
            let args: Vec<String> = vec![
                "-y".into(),
                "--addtag".into(),
                MANAGED_VG_TAG.into(),
                group.to_string(),
                disk.to_string(),
            ];
            self.run("vgcreate", args).await?;
        }

        info!(disk, group, "Added disk to volume group");
        self.events.publish(Trigger::DiskAdded, disk);
        Ok(())
    }

    /// Remove a disk; caller holds `DISK_MUTEX`
    ///
    /// A PV that still carries allocated extents after the move attempt is
    /// reported as an error and left in place.
    pub(crate) async fn remove_disk_locked(&self, disk: &str, group: &str) -> Result<()> {
        let pvs = self.get_current_pv_struct().await?;
        let Some(pv) = pvs
            .iter()
            .find(|pv| pv.name == disk && pv.vg_name.as_deref() == Some(group))
        else {
            debug!(disk, group, "Disk not a member, nothing to remove");
            return Ok(());
        };

        if pv.used_bytes > 0 {
            info!(disk, group, used_bytes = pv.used_bytes, "Moving extents off disk");
            let args: Vec<String> = vec!["-y".into(), disk.to_string()];
            if let Err(e) = self.run("pvmove", args).await {
                warn!(disk, group, error = %e, "pvmove failed");
            }

            let still_used = self
                .get_current_pv_struct()
                .await?
                .into_iter()
                .find(|p| p.name == disk)
                .map(|p| p.used_bytes)
                .unwrap_or(0);
            if still_used > 0 {
                return Err(Error::Internal(format!(
                    "{} still has {} bytes of allocated extents in {}",
                    disk, still_used, group
                )));
            }
        }

        let vg = self.volume_group(group).await?;
        if vg.pv_count <= 1 && vg.lv_count == 0 {
            let args: Vec<String> = vec!["-y".into(), group.to_string()];
            self.run("vgremove", args).await?;
        } else {
            let args: Vec<String> = vec!["-y".into(), group.to_string(), disk.to_string()];
            self.run("vgreduce", args).await?;
        }

        let args: Vec<String> = vec!["-y".into(), disk.to_string()];
        self.run("pvremove", args).await?;

        info!(disk, group, "Removed disk from volume group");
        self.events.publish(Trigger::DiskRemoved, disk);
        Ok(())
    }

    /// Drop missing PVs from `group` without the allocated-extent check
    pub(crate) async fn force_clean_unknown_locked(&self, group: &str) -> Result<()> {
        let args: Vec<String> = vec![
            "-y".into(),
            "--removemissing".into(),
            "--force".into(),
            group.to_string(),
        ];
        self.run("vgreduce", args).await?;
        warn!(group, "Force-removed missing physical volumes");
        self.events.publish(Trigger::DiskRemoved, group);
        Ok(())
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    async fn find_lv(&self, group: &str, lv: &str) -> Result<LogicalVolume> {
        self.list_lvs(group)
            .await?
            .into_iter()
            .find(|l| l.name == lv)
            .ok_or_else(|| Error::not_found("LogicalVolume", lv_path(group, lv)))
    }

    async fn create_thin_pool(&self, group: &str, pool: &str, size_bytes: u64) -> Result<()> {
        let args: Vec<String> = vec![
            "-y".into(),
            "--type".into(),
            "thin-pool".into(),
            "-L".into(),
            format!("{}b", size_bytes),
            "-n".into(),
            pool.to_string(),
            group.to_string(),
        ];
        self.run("lvcreate", args).await?;
        debug!(pool, group, size_bytes, "Created thin pool");
        Ok(())
    }

    async fn create_thin_volume(
        &self,
        group: &str,
        pool: &str,
        lv: &str,
        size_bytes: u64,
        tags: &[&str],
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "--type".into(),
            "thin".into(),
            "-V".into(),
            format!("{}b", size_bytes),
            "--thinpool".into(),
            pool.to_string(),
            "-n".into(),
            lv.to_string(),
        ];
        for tag in tags {
            args.push("--addtag".into());
            args.push(tag.to_string());
        }
        args.push(group.to_string());
        self.run("lvcreate", args).await?;
        Ok(())
    }

    async fn extend_lv(&self, group: &str, lv: &str, size_bytes: u64) -> Result<()> {
        let args: Vec<String> = vec![
            "-y".into(),
            "-L".into(),
            format!("{}b", size_bytes),
            lv_path(group, lv),
        ];
        self.run("lvextend", args).await?;
        Ok(())
    }

    async fn remove_lv(&self, group: &str, lv: &str) -> Result<()> {
        let args: Vec<String> = vec!["-y".into(), "-f".into(), lv_path(group, lv)];
        self.run("lvremove", args).await?;
        debug!(lv, group, "Removed logical volume");
        Ok(())
    }

    async fn remove_lv_best_effort(&self, group: &str, lv: &str) {
        if let Err(e) = self.remove_lv(group, lv).await {
            warn!(lv, group, error = %e, "Rollback removal failed");
        }
    }
}

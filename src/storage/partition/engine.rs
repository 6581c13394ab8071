//! Partition Engine
//!
//! Raw-mode volumes are GPT partitions on whole disks. The engine keeps a
//! per-disk `name -> number` cache so a create whose follow-up scan has not
//! yet observed the new partition cannot hand out the same number twice.
//! All mutations of one disk serialize on that disk's lock key.

use super::table::{self, LINUX_FILESYSTEM_GUID};
use crate::domain::ports::ExecutorRef;
use crate::domain::types::{Partition, ScannedDisk};
use crate::error::{Error, Result};
use crate::events::{EventBus, Trigger};
use crate::storage::lock::{disk_key, LockManager};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NO_TABLE_MARKER: &str = "does not contain a recognized partition table";

/// Partition name -> number, per disk
type NameCache = HashMap<String, HashMap<String, u32>>;

// =============================================================================
// Partition Engine
// =============================================================================

pub struct PartitionEngine {
    exec: ExecutorRef,
    locks: Arc<LockManager>,
    events: Arc<EventBus>,
    cache: Mutex<NameCache>,
}

impl PartitionEngine {
    pub fn new(exec: ExecutorRef, locks: Arc<LockManager>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            exec,
            locks,
            events,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String> {
        self.exec.run_command(program, &args).await
    }

    // =========================================================================
    // Read-only Views
    // =========================================================================

    /// Read the live partition table
    ///
    /// A disk without any label yields `NotFound`.
    pub async fn scan_disk(&self, disk: &str) -> Result<ScannedDisk> {
        let args: Vec<String> = vec!["--json".into(), disk.to_string()];
        match self.run("sfdisk", args).await {
            Ok(out) => table::parse_sfdisk(disk, &out),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains(NO_TABLE_MARKER) => {
                Err(Error::not_found("PartitionTable", disk))
            }
            Err(e) => Err(e),
        }
    }

    /// Partitions of `disk`; empty for an unlabelled disk
    pub async fn list_partitions(&self, disk: &str) -> Result<Vec<Partition>> {
        match self.scan_disk(disk).await {
            Ok(scanned) => Ok(scanned.partitions),
            Err(Error::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Cached `name -> number` map for `disk`
    pub fn cached(&self, disk: &str) -> HashMap<String, u32> {
        self.cache.lock().get(disk).cloned().unwrap_or_default()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Allocate a named partition of at least `size_bytes`
    pub async fn create_partition(&self, disk: &str, name: &str, size_bytes: u64) -> Result<Partition> {
        if name.is_empty() || name.contains(':') {
            return Err(Error::InvalidArgument(format!("invalid partition name: {:?}", name)));
        }
        if size_bytes == 0 {
            return Err(Error::InvalidArgument("partition size must be positive".into()));
        }
        let _guard = self.locks.lock(disk_key(disk))?;

        let scanned = self.ensure_table(disk).await?;
        let wanted_sectors = table::sectors_for(size_bytes, scanned.sector_size);

        if let Some(existing) = self.find_named(disk, &scanned, name) {
            if existing.size_bytes() == wanted_sectors * scanned.sector_size {
                debug!(disk, name, "Partition already exists with requested size");
                return Ok(existing);
            }
            return Err(Error::already_exists(
                "Partition",
                name,
                format!(
                    "existing size {} differs from requested {}",
                    existing.size_bytes(),
                    size_bytes
                ),
            ));
        }

        let mut used: BTreeSet<u32> = scanned.partitions.iter().map(|p| p.number).collect();
        used.extend(self.cached(disk).values().copied());
        let number = table::lowest_free_number(&used).ok_or(Error::ResourceExhausted {
            requested: size_bytes,
            available: 0,
        })?;

        let (start, end) = table::first_fit(&scanned, size_bytes).ok_or_else(|| {
            Error::ResourceExhausted {
                requested: size_bytes,
                available: table::raw_capacity(&scanned).largest_free_extent_bytes,
            }
        })?;

        let args: Vec<String> = vec![
            format!("--new={}:{}:{}", number, start, end),
            format!("--change-name={}:{}", number, name),
            format!("--typecode={}:{}", number, LINUX_FILESYSTEM_GUID),
            disk.to_string(),
        ];
        self.run("sgdisk", args).await?;
        self.cache
            .lock()
            .entry(disk.to_string())
            .or_default()
            .insert(name.to_string(), number);
        self.reread_best_effort(disk).await;

        info!(disk, name, number, size_bytes, "Created partition");
        let created = self.partition_by_number(disk, number).await?;
        self.events.publish_and_wait(Trigger::PartitionChanged, disk).await;
        Ok(created)
    }

    /// Grow a partition in place, keeping its number, name and GUID
    pub async fn update_partition(&self, disk: &str, name: &str, new_size_bytes: u64) -> Result<Partition> {
        let _guard = self.locks.lock(disk_key(disk))?;

        let scanned = self.scan_disk(disk).await?;
        let current = self
            .find_named(disk, &scanned, name)
            .ok_or_else(|| Error::not_found("Partition", name))?;

        let wanted_sectors = table::sectors_for(new_size_bytes, scanned.sector_size);
        let current_sectors = current.size_bytes() / scanned.sector_size;
        if wanted_sectors < current_sectors {
            return Err(Error::OutOfRange {
                current: current.size_bytes(),
                requested: new_size_bytes,
            });
        }
        if wanted_sectors == current_sectors {
            return Ok(current);
        }

        let start = current.start_byte / scanned.sector_size;
        let new_end = start + wanted_sectors - 1;
        let limit = table::growth_limit(&scanned, &current);
        if new_end > limit {
            return Err(Error::ResourceExhausted {
                requested: new_size_bytes,
                available: (limit - start + 1) * scanned.sector_size,
            });
        }

        let n = current.number;
        let mut args: Vec<String> = vec![
            format!("--delete={}", n),
            format!("--new={}:{}:{}", n, start, new_end),
            format!("--change-name={}:{}", n, current.name),
            format!("--typecode={}:{}", n, current.type_guid),
        ];
        if let Some(uuid) = &current.uuid {
            args.push(format!("--partition-guid={}:{}", n, uuid));
        }
        args.push(disk.to_string());
        self.run("sgdisk", args).await?;
        self.reread_best_effort(disk).await;

        info!(disk, name, number = n, new_size_bytes, "Grew partition");
        let grown = self.partition_by_number(disk, n).await?;
        self.events.publish(Trigger::PartitionChanged, disk);
        Ok(grown)
    }

    /// Delete a partition by name; an absent name succeeds
    pub async fn delete_partition(&self, disk: &str, name: &str) -> Result<()> {
        let _guard = self.locks.lock(disk_key(disk))?;

        let scanned = match self.scan_disk(disk).await {
            Ok(scanned) => scanned,
            Err(Error::NotFound { .. }) => {
                self.forget(disk, name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(existing) = self.find_named(disk, &scanned, name) else {
            debug!(disk, name, "Partition already absent");
            self.forget(disk, name);
            return Ok(());
        };

        self.remove_number(disk, existing.number).await?;
        self.forget(disk, name);
        info!(disk, name, number = existing.number, "Deleted partition");
        self.events.publish(Trigger::PartitionChanged, disk);
        Ok(())
    }

    /// Delete a partition by number; an absent number succeeds
    pub async fn delete_partition_by_number(&self, disk: &str, number: u32) -> Result<()> {
        let _guard = self.locks.lock(disk_key(disk))?;

        let partitions = self.list_partitions(disk).await?;
        if partitions.iter().any(|p| p.number == number) {
            self.remove_number(disk, number).await?;
            info!(disk, number, "Deleted partition");
            self.events.publish(Trigger::PartitionChanged, disk);
        }

        if let Some(names) = self.cache.lock().get_mut(disk) {
            names.retain(|_, n| *n != number);
        }
        Ok(())
    }

    /// Destroy every partition structure on `disk`
    pub async fn wipe(&self, disk: &str) -> Result<()> {
        let _guard = self.locks.lock(disk_key(disk))?;

        let args: Vec<String> = vec!["--zap-all".into(), disk.to_string()];
        self.run("sgdisk", args).await?;
        self.cache.lock().remove(disk);
        self.reread_best_effort(disk).await;

        warn!(disk, "Wiped partition table");
        self.events.publish(Trigger::PartitionChanged, disk);
        Ok(())
    }

    /// Rebuild the name cache of `disk` from its live table
    pub async fn refresh_cache(&self, disk: &str) -> Result<()> {
        let _guard = self.locks.lock(disk_key(disk))?;

        let names: HashMap<String, u32> = self
            .list_partitions(disk)
            .await?
            .into_iter()
            .filter(|p| !p.name.is_empty())
            .map(|p| (p.name, p.number))
            .collect();
        debug!(disk, entries = names.len(), "Refreshed partition cache");
        self.cache.lock().insert(disk.to_string(), names);
        Ok(())
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    async fn ensure_table(&self, disk: &str) -> Result<ScannedDisk> {
        match self.scan_disk(disk).await {
            Err(Error::NotFound { .. }) => {
                info!(disk, "Initialising empty GPT label");
                let args: Vec<String> = vec!["--clear".into(), disk.to_string()];
                self.run("sgdisk", args).await?;
                self.scan_disk(disk).await
            }
            other => other,
        }
    }

    /// Look the name up through the cache first, then the table itself
    fn find_named(&self, disk: &str, scanned: &ScannedDisk, name: &str) -> Option<Partition> {
        let cached = self.cache.lock().get(disk).and_then(|names| names.get(name).copied());
        cached
            .and_then(|n| scanned.partitions.iter().find(|p| p.number == n && p.name == name))
            .or_else(|| scanned.partitions.iter().find(|p| p.name == name))
            .cloned()
    }

    async fn partition_by_number(&self, disk: &str, number: u32) -> Result<Partition> {
        self.list_partitions(disk)
            .await?
            .into_iter()
            .find(|p| p.number == number)
            .ok_or_else(|| Error::not_found("Partition", format!("{}#{}", disk, number)))
    }

    async fn remove_number(&self, disk: &str, number: u32) -> Result<()> {
        let args: Vec<String> = vec![format!("--delete={}", number), disk.to_string()];
        self.run("sgdisk", args).await?;
        self.reread_best_effort(disk).await;
        Ok(())
    }

    fn forget(&self, disk: &str, name: &str) {
        if let Some(names) = self.cache.lock().get_mut(disk) {
            names.remove(name);
        }
    }

    async fn reread_best_effort(&self, disk: &str) {
        let args: Vec<String> = vec![disk.to_string()];
        if let Err(e) = self.run("partprobe", args).await {
            warn!(disk, error = %e, "partprobe failed, kernel view may lag");
        }
    }
}

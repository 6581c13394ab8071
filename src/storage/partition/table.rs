//! GPT Table Model
//!
//! Parses `sfdisk --json` and answers placement questions (free extents,
//! first fit, lowest free number) against the parsed table. Nothing here
//! touches the disk.

use crate::domain::types::{Partition, RawDiskCapacity, ScannedDisk};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Partitions start on 1 MiB boundaries
pub const ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// GPT type GUID for "Linux filesystem data"
pub const LINUX_FILESYSTEM_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Highest GPT partition number handed out
pub const MAX_PARTITION_NUMBER: u32 = 127;

const DEFAULT_SECTOR_SIZE: u64 = 512;

// =============================================================================
// sfdisk JSON
// =============================================================================

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    firstlba: Option<u64>,
    #[serde(default)]
    lastlba: Option<u64>,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type", default)]
    type_guid: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Partition number from a device node (`/dev/sdb3`, `/dev/nvme0n1p3`)
pub fn partition_number(node: &str) -> Result<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits
        .parse()
        .map_err(|_| Error::Parse(format!("no partition number in node {}", node)))
}

/// Parse `sfdisk --json <device>` output
pub fn parse_sfdisk(device: &str, json: &str) -> Result<ScannedDisk> {
    let dump: SfdiskDump = serde_json::from_str(json)?;
    let table = dump.partitiontable;

    if let Some(label) = table.label.as_deref() {
        if label != "gpt" {
            return Err(Error::InvalidArgument(format!(
                "{} carries a {} label, only gpt is managed",
                device, label
            )));
        }
    }

    let sector_size = table.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE);
    let first_lba = table
        .firstlba
        .ok_or_else(|| Error::Parse(format!("{}: missing firstlba", device)))?;
    let last_lba = table
        .lastlba
        .ok_or_else(|| Error::Parse(format!("{}: missing lastlba", device)))?;

    let mut partitions = table
        .partitions
        .into_iter()
        .map(|p| {
            Ok(Partition {
                number: partition_number(&p.node)?,
                name: p.name.unwrap_or_default(),
                start_byte: p.start * sector_size,
                last_byte: (p.start + p.size) * sector_size - 1,
                type_guid: p.type_guid,
                uuid: p.uuid,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    partitions.sort_by_key(|p| p.start_byte);

    Ok(ScannedDisk {
        device: device.to_string(),
        sector_size,
        first_lba,
        last_lba,
        partitions,
    })
}

// =============================================================================
// Placement
// =============================================================================

/// Sectors needed to hold `bytes`
pub fn sectors_for(bytes: u64, sector_size: u64) -> u64 {
    bytes.div_ceil(sector_size)
}

/// A contiguous unallocated run of sectors, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub start_lba: u64,
    pub end_lba: u64,
}

impl FreeExtent {
    pub fn sectors(&self) -> u64 {
        self.end_lba - self.start_lba + 1
    }
}

fn align_up(lba: u64, align: u64) -> u64 {
    lba.div_ceil(align) * align
}

/// Unallocated extents with aligned starts, in disk order
pub fn free_extents(disk: &ScannedDisk) -> Vec<FreeExtent> {
    let align = (ALIGNMENT_BYTES / disk.sector_size).max(1);
    let mut used: Vec<(u64, u64)> = disk
        .partitions
        .iter()
        .map(|p| (p.start_byte / disk.sector_size, p.last_byte / disk.sector_size))
        .collect();
    used.sort_unstable();

    let mut extents = Vec::new();
    let mut cursor = disk.first_lba;
    for (start, end) in used.into_iter().chain(std::iter::once((disk.last_lba + 1, disk.last_lba + 1))) {
        let aligned = align_up(cursor, align);
        if start > aligned {
            let end_lba = (start - 1).min(disk.last_lba);
            if end_lba >= aligned {
                extents.push(FreeExtent {
                    start_lba: aligned,
                    end_lba,
                });
            }
        }
        cursor = cursor.max(end + 1);
    }
    extents
}

/// First aligned extent able to hold `size_bytes`, as (start, end) LBAs
pub fn first_fit(disk: &ScannedDisk, size_bytes: u64) -> Option<(u64, u64)> {
    let sectors = sectors_for(size_bytes, disk.sector_size);
    if sectors == 0 {
        return None;
    }
    free_extents(disk)
        .into_iter()
        .find(|e| e.sectors() >= sectors)
        .map(|e| (e.start_lba, e.start_lba + sectors - 1))
}

/// Lowest partition number in 1..=127 not in `used`
pub fn lowest_free_number(used: &BTreeSet<u32>) -> Option<u32> {
    (1..=MAX_PARTITION_NUMBER).find(|n| !used.contains(n))
}

/// Last LBA a partition starting at `start_byte` may grow to
pub fn growth_limit(disk: &ScannedDisk, partition: &Partition) -> u64 {
    disk.partitions
        .iter()
        .filter(|p| p.start_byte > partition.start_byte)
        .map(|p| p.start_byte / disk.sector_size - 1)
        .min()
        .unwrap_or(disk.last_lba)
}

/// Capacity figures for one raw disk
pub fn raw_capacity(disk: &ScannedDisk) -> RawDiskCapacity {
    let extents = free_extents(disk);
    let total = (disk.last_lba - disk.first_lba + 1) * disk.sector_size;
    let free: u64 = extents.iter().map(|e| e.sectors() * disk.sector_size).sum();
    let largest = extents
        .iter()
        .map(|e| e.sectors() * disk.sector_size)
        .max()
        .unwrap_or(0);

    RawDiskCapacity {
        total_bytes: total,
        free_bytes: free,
        largest_free_extent_bytes: largest,
        partition_count: disk.partitions.len() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SFDISK: &str = r#"{
   "partitiontable": {
      "label": "gpt",
      "id": "A1B2C3D4-0000-4000-8000-000000000000",
      "device": "/dev/nvme1n1",
      "unit": "sectors",
      "firstlba": 34,
      "lastlba": 20971486,
      "sectorsize": 512,
      "partitions": [
         {"node": "/dev/nvme1n1p2", "start": 1050624, "size": 2097152,
          "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
          "uuid": "6E2E1E1C-5E61-4F0B-9E4B-1A8D2F4B3C21", "name": "pvc-b"},
         {"node": "/dev/nvme1n1p1", "start": 2048, "size": 1048576,
          "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
          "uuid": "0B7C6A3E-1F6D-4D49-8F36-2E1C0B7D9A10", "name": "pvc-a"}
      ]
   }
}"#;

    fn empty_disk(last_lba: u64) -> ScannedDisk {
        ScannedDisk {
            device: "/dev/sdb".into(),
            sector_size: 512,
            first_lba: 34,
            last_lba,
            partitions: Vec::new(),
        }
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number("/dev/sdb3").unwrap(), 3);
        assert_eq!(partition_number("/dev/nvme0n1p12").unwrap(), 12);
        assert!(partition_number("/dev/sdb").is_err());
    }

    #[test]
    fn test_parse_sfdisk() {
        let disk = parse_sfdisk("/dev/nvme1n1", SFDISK).unwrap();
        assert_eq!(disk.sector_size, 512);
        assert_eq!(disk.partitions.len(), 2);
        // Sorted by position
        assert_eq!(disk.partitions[0].number, 1);
        assert_eq!(disk.partitions[0].name, "pvc-a");
        assert_eq!(disk.partitions[0].start_byte, 2048 * 512);
        assert_eq!(disk.partitions[0].size_bytes(), 512 * 1024 * 1024);
        assert_eq!(disk.partitions[1].number, 2);
    }

    #[test]
    fn test_parse_sfdisk_rejects_dos_label() {
        let json = r#"{"partitiontable": {"label": "dos", "firstlba": 2048, "lastlba": 100, "partitions": []}}"#;
        assert!(parse_sfdisk("/dev/sdb", json).is_err());
    }

    #[test]
    fn test_free_extents_aligned() {
        let disk = parse_sfdisk("/dev/nvme1n1", SFDISK).unwrap();
        let extents = free_extents(&disk);
        // Gap after p2 only; the gap before p1 is swallowed by alignment
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].start_lba, 1050624 + 2097152);
        assert_eq!(extents[0].start_lba % 2048, 0);
        assert_eq!(extents[0].end_lba, 20971486);
    }

    #[test]
    fn test_first_fit_empty_disk() {
        let disk = empty_disk(20971486);
        let (start, end) = first_fit(&disk, 1024 * 1024 * 1024).unwrap();
        assert_eq!(start, 2048);
        assert_eq!(end, 2048 + 2097152 - 1);
        assert!(first_fit(&disk, 20 * 1024 * 1024 * 1024).is_none());
    }

    #[test]
    fn test_lowest_free_number() {
        let used: BTreeSet<u32> = [1, 2, 4].into_iter().collect();
        assert_eq!(lowest_free_number(&used), Some(3));
        let full: BTreeSet<u32> = (1..=MAX_PARTITION_NUMBER).collect();
        assert_eq!(lowest_free_number(&full), None);
    }

    #[test]
    fn test_raw_capacity() {
        let disk = parse_sfdisk("/dev/nvme1n1", SFDISK).unwrap();
        let cap = raw_capacity(&disk);
        assert_eq!(cap.partition_count, 2);
        assert_eq!(cap.free_bytes, cap.largest_free_extent_bytes);
        assert!(cap.free_bytes < cap.total_bytes);
    }

    #[test]
    fn test_growth_limit() {
        let disk = parse_sfdisk("/dev/nvme1n1", SFDISK).unwrap();
        assert_eq!(growth_limit(&disk, &disk.partitions[0]), 1050624 - 1);
        assert_eq!(growth_limit(&disk, &disk.partitions[1]), 20971486);
    }

    proptest! {
        #[test]
        fn prop_lowest_free_number_is_minimal(used in proptest::collection::btree_set(1u32..=127, 0..127)) {
            match lowest_free_number(&used) {
                Some(n) => {
                    prop_assert!(!used.contains(&n));
                    prop_assert!((1..n).all(|m| used.contains(&m)));
                }
                None => prop_assert_eq!(used.len(), 127),
            }
        }

        #[test]
        fn prop_first_fit_never_overlaps(sizes in proptest::collection::vec(1u64..64, 1..12)) {
            let mut disk = empty_disk(512 * 2048 - 1);
            for (i, mib) in sizes.into_iter().enumerate() {
                let Some((start, end)) = first_fit(&disk, mib * ALIGNMENT_BYTES) else {
                    break;
                };
                prop_assert_eq!(start % 2048, 0);
                prop_assert!(end <= disk.last_lba);
                for p in &disk.partitions {
                    let (ps, pe) = (p.start_byte / 512, p.last_byte / 512);
                    prop_assert!(end < ps || start > pe);
                }
                disk.partitions.push(Partition {
                    number: i as u32 + 1,
                    name: format!("p{}", i),
                    start_byte: start * 512,
                    last_byte: (end + 1) * 512 - 1,
                    type_guid: String::new(),
                    uuid: None,
                });
            }
        }
    }
}

//! Block Device Scanner
//!
//! Enumerates block devices via `lsblk --pairs` and turns each row into a
//! [`Disk`] for classification. Optionally enriches disks with their udev
//! properties.

use crate::domain::ports::ExecutorRef;
use crate::domain::types::{DeviceType, Disk};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

const LSBLK_COLUMNS: &str = "NAME,KNAME,PKNAME,TYPE,SIZE,ROTA,RO,FSTYPE,MOUNTPOINT,FSUSED";

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the disk scanner
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    /// Include loopback devices
    pub include_loopback: bool,
    /// Include RAM disks
    pub include_ram: bool,
    /// Include device mapper devices
    pub include_dm: bool,
    /// Query udev properties for every whole disk
    pub probe_udev: bool,
}

// =============================================================================
// Disk Scanner
// =============================================================================

/// Lists the block devices of the local node
pub struct DiskScanner {
    exec: ExecutorRef,
    config: ScannerConfig,
}

impl DiskScanner {
    /// Create a new disk scanner
    pub fn new(exec: ExecutorRef, config: ScannerConfig) -> Self {
        Self { exec, config }
    }

    /// Create a scanner with default configuration
    pub fn default_scanner(exec: ExecutorRef) -> Self {
        Self::new(exec, ScannerConfig::default())
    }

    /// Discover all block devices on the local node
    pub async fn scan(&self) -> Result<Vec<Disk>> {
        let args: Vec<String> = vec![
            "--pairs".into(),
            "--bytes".into(),
            "--all".into(),
            "--output".into(),
            LSBLK_COLUMNS.into(),
        ];
        let output = self.exec.run_command("lsblk", &args).await?;
        let mut disks = parse_lsblk(&output)?;
        disks.retain(|d| self.should_include_device(&d.name));

        if self.config.probe_udev {
            for disk in disks.iter_mut().filter(|d| d.device_type == DeviceType::Disk) {
                match self.udev_properties(&disk.path).await {
                    Ok(props) => disk.udev = props,
                    Err(e) => warn!("udev probe of {} failed: {}", disk.path, e),
                }
            }
        }

        debug!("Scanned {} block devices", disks.len());
        Ok(disks)
    }

    /// Read udev properties of one device
    pub async fn udev_properties(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let args: Vec<String> = vec![
            "info".into(),
            "--query=property".into(),
            "--name".into(),
            path.to_string(),
        ];
        let output = self.exec.run_command("udevadm", &args).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    /// Check if a device should be included
    fn should_include_device(&self, name: &str) -> bool {
        // Skip loopback devices
        if !self.config.include_loopback && name.starts_with("loop") {
            return false;
        }

        // Skip RAM disks
        if !self.config.include_ram && name.starts_with("ram") {
            return false;
        }

        // Skip device mapper
        if !self.config.include_dm && name.starts_with("dm-") {
            return false;
        }

        // Skip zram
        if name.starts_with("zram") {
            return false;
        }

        true
    }
}

// =============================================================================
// lsblk Pairs Parsing
// =============================================================================

/// Parse one `KEY="value" ...` line; lsblk escapes unsafe bytes as `\xHH`
pub fn parse_pairs(line: &str) -> Result<HashMap<String, String>> {
    let mut row = HashMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let (key, after) = rest
            .split_once("=\"")
            .ok_or_else(|| Error::Parse(format!("malformed lsblk pair in: {}", line)))?;
        let end = after
            .find('"')
            .ok_or_else(|| Error::Parse(format!("unterminated lsblk value in: {}", line)))?;
        row.insert(key.trim().to_string(), unescape(&after[..end]));
        rest = after[end + 1..].trim_start();
    }

    Ok(row)
}

fn unescape(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') && i + 3 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn non_empty(row: &HashMap<String, String>, key: &str) -> Option<String> {
    row.get(key).filter(|v| !v.is_empty()).cloned()
}

fn number(row: &HashMap<String, String>, key: &str) -> Result<u64> {
    match row.get(key).map(String::as_str) {
        None | Some("") => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Parse(format!("invalid {} value: {}", key, v))),
    }
}

/// Parse full `lsblk --pairs` output into disks
pub fn parse_lsblk(output: &str) -> Result<Vec<Disk>> {
    let rows = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_pairs)
        .collect::<Result<Vec<_>>>()?;

    let parents: HashSet<String> = rows.iter().filter_map(|r| non_empty(r, "PKNAME")).collect();

    let mut disks = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = non_empty(row, "KNAME")
            .or_else(|| non_empty(row, "NAME"))
            .ok_or_else(|| Error::Parse("lsblk row without a name".into()))?;

        disks.push(Disk {
            path: format!("/dev/{}", name),
            size_bytes: number(row, "SIZE")?,
            rotational: row.get("ROTA").map(String::as_str) == Some("1"),
            read_only: row.get("RO").map(String::as_str) == Some("1"),
            fstype: non_empty(row, "FSTYPE"),
            mountpoint: non_empty(row, "MOUNTPOINT"),
            parent: non_empty(row, "PKNAME"),
            has_children: parents.contains(&name),
            device_type: DeviceType::from_lsblk(row.get("TYPE").map(String::as_str).unwrap_or("")),
            used_bytes: number(row, "FSUSED")?,
            udev: BTreeMap::new(),
            name,
        });
    }

    Ok(disks)
}

/// Node name fallback when none is configured
pub fn node_hostname() -> String {
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.is_empty() {
            return name;
        }
    }

    // Try /etc/hostname first
    if let Ok(hostname) = fs::read_to_string("/etc/hostname") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    info!("No hostname found, using \"unknown\"");
    "unknown".to_string()
}

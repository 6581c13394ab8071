//! In-memory host for tests
//!
//! `FakeHost` implements [`Executor`] by interpreting the exact command
//! lines the engines issue (lsblk, the LVM2 tools, sfdisk, sgdisk) against
//! a simulated set of disks, PVs, VGs, LVs and GPT tables. Tests therefore
//! exercise real command sequences instead of mocked method calls.

use crate::domain::ports::Executor;
use crate::error::{Error, Result};
use crate::storage::executor::render_command;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

const SECTOR: u64 = 512;
const GPT_RESERVED_SECTORS: u64 = 34;

// =============================================================================
// Simulated State
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    pub size_bytes: u64,
    pub rotational: bool,
    pub read_only: bool,
    pub device_type: String,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub parent: Option<String>,
    pub fs_used: u64,
}

#[derive(Debug, Clone)]
struct FakePartition {
    start: u64,
    end: u64,
    name: String,
    type_guid: String,
    uuid: String,
}

#[derive(Debug, Clone)]
struct FakePv {
    vg: Option<String>,
    size: u64,
    used: u64,
    missing: bool,
}

#[derive(Debug, Clone, Default)]
struct FakeVg {
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeLv {
    size: u64,
    kind: char,
    pool: Option<String>,
    origin: Option<String>,
    tags: Vec<String>,
    data_percent: f64,
    minor: u32,
    /// Extents held on each PV (thin pools only)
    allocations: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<String, FakeDevice>,
    tables: BTreeMap<String, BTreeMap<u32, FakePartition>>,
    pvs: BTreeMap<String, FakePv>,
    vgs: BTreeMap<String, FakeVg>,
    /// Keyed by (vg, lv)
    lvs: BTreeMap<(String, String), FakeLv>,
    history: Vec<String>,
    failures: Vec<(String, String)>,
    counter: u32,
}

fn fail(command: &str, stderr: impl Into<String>) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        stderr: stderr.into(),
    }
}

fn kernel_name(path: &str) -> &str {
    path.strip_prefix("/dev/").unwrap_or(path)
}

fn partition_node(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn values_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}

fn parse_bytes(value: &str) -> Option<u64> {
    value.trim_end_matches(['b', 'B']).parse().ok()
}

/// lvcreate rounds virtual sizes up to whole 4 MiB extents
fn round_to_extent(bytes: u64) -> u64 {
    const EXTENT: u64 = 4 * 1024 * 1024;
    bytes.div_ceil(EXTENT) * EXTENT
}

fn split_lv_path(path: &str) -> Option<(String, String)> {
    path.split_once('/')
        .map(|(vg, lv)| (vg.to_string(), lv.to_string()))
}

// =============================================================================
// Fake Host
// =============================================================================

/// Simulated node storage stack
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a blank whole disk
    pub fn add_disk(&self, name: &str, size_bytes: u64) {
        self.add_device(
            name,
            FakeDevice {
                size_bytes,
                device_type: "disk".into(),
                ..Default::default()
            },
        );
    }

    pub fn add_device(&self, name: &str, device: FakeDevice) {
        self.state.lock().devices.insert(name.to_string(), device);
    }

    /// Unplug a device without telling LVM
    pub fn unplug(&self, name: &str) {
        let mut state = self.state.lock();
        state.devices.remove(name);
        if let Some(pv) = state.pvs.get_mut(&format!("/dev/{}", name)) {
            pv.missing = true;
        }
    }

    /// A PV label naming `vg` whose VG metadata is absent
    pub fn add_orphan_pv(&self, name: &str, size_bytes: u64, vg: &str) {
        self.add_disk(name, size_bytes);
        self.state.lock().pvs.insert(
            format!("/dev/{}", name),
            FakePv {
                vg: Some(vg.to_string()),
                size: size_bytes,
                used: 0,
                missing: false,
            },
        );
    }

    pub fn set_data_percent(&self, vg: &str, lv: &str, percent: f64) {
        if let Some(lv) = self
            .state
            .lock()
            .lvs
            .get_mut(&(vg.to_string(), lv.to_string()))
        {
            lv.data_percent = percent;
        }
    }

    /// Tag an existing LV, as an interrupted clone would have left it
    pub fn add_lv_tag(&self, vg: &str, lv: &str, tag: &str) {
        if let Some(lv) = self
            .state
            .lock()
            .lvs
            .get_mut(&(vg.to_string(), lv.to_string()))
        {
            lv.tags.push(tag.to_string());
        }
    }

    /// Make the next `program` call whose argument line contains `needle` fail
    pub fn fail_next(&self, program: &str, needle: &str) {
        self.state
            .lock()
            .failures
            .push((program.to_string(), needle.to_string()));
    }

    /// Whether any executed command line contains `needle`
    pub fn ran(&self, needle: &str) -> bool {
        self.state.lock().history.iter().any(|c| c.contains(needle))
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub fn vg_names(&self) -> Vec<String> {
        self.state.lock().vgs.keys().cloned().collect()
    }

    pub fn lv_names(&self, vg: &str) -> Vec<String> {
        self.state
            .lock()
            .lvs
            .keys()
            .filter(|(v, _)| v == vg)
            .map(|(_, lv)| lv.clone())
            .collect()
    }

    pub fn partition_names(&self, disk: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(kernel_name(disk))
            .map(|t| t.values().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    fn dispatch(&self, program: &str, args: &[String]) -> Result<String> {
        let rendered = render_command(program, args);
        let mut state = self.state.lock();

        let arg_line = args.join(" ");
        if let Some(i) = state
            .failures
            .iter()
            .position(|(p, needle)| p == program && arg_line.contains(needle.as_str()))
        {
            state.failures.remove(i);
            return Err(fail(&rendered, "injected failure"));
        }
        state.history.push(rendered.clone());

        match program {
            "lsblk" => Ok(state.lsblk()),
            "udevadm" => Ok(state.udevadm(args)),
            "pvs" => Ok(state.pvs_report()),
            "vgs" => Ok(state.vgs_report()),
            "lvs" => Ok(state.lvs_report(args)),
            "pvcreate" => state.pvcreate(&rendered, args),
            "pvremove" => state.pvremove(&rendered, args),
            "pvmove" => state.pvmove(&rendered, args),
            "vgcreate" => state.vgcreate(&rendered, args),
            "vgextend" => state.vgextend(&rendered, args),
            "vgreduce" => state.vgreduce(&rendered, args),
            "vgremove" => state.vgremove(&rendered, args),
            "lvcreate" => state.lvcreate(&rendered, args),
            "lvextend" => state.lvextend(&rendered, args),
            "lvremove" => state.lvremove(&rendered, args),
            "lvconvert" => state.lvconvert(&rendered, args),
            "lvchange" => state.lvchange(&rendered, args),
            "sfdisk" => state.sfdisk(&rendered, args),
            "sgdisk" => state.sgdisk(&rendered, args),
            "dd" | "partprobe" => Ok(String::new()),
            other => Err(fail(&rendered, format!("{}: command not found", other))),
        }
    }
}

#[async_trait]
impl Executor for FakeHost {
    async fn run_command(&self, program: &str, args: &[String]) -> Result<String> {
        self.dispatch(program, args)
    }
}

// =============================================================================
// Block Devices
// =============================================================================

impl State {
    fn lsblk(&self) -> String {
        let mut out = String::new();
        for (name, dev) in &self.devices {
            let path = format!("/dev/{}", name);
            let fstype = if self.pvs.contains_key(&path) {
                Some("LVM2_member".to_string())
            } else {
                dev.fstype.clone()
            };
            let _ = writeln!(
                out,
                "NAME=\"{n}\" KNAME=\"{n}\" PKNAME=\"{p}\" TYPE=\"{t}\" SIZE=\"{s}\" ROTA=\"{r}\" RO=\"{ro}\" FSTYPE=\"{f}\" MOUNTPOINT=\"{m}\" FSUSED=\"{u}\"",
                n = name,
                p = dev.parent.clone().unwrap_or_default(),
                t = dev.device_type,
                s = dev.size_bytes,
                r = dev.rotational as u8,
                ro = dev.read_only as u8,
                f = fstype.unwrap_or_default(),
                m = dev.mountpoint.clone().unwrap_or_default(),
                u = if dev.fs_used > 0 { dev.fs_used.to_string() } else { String::new() },
            );
            if let Some(table) = self.tables.get(name) {
                for (number, part) in table {
                    let _ = writeln!(
                        out,
                        "NAME=\"{n}\" KNAME=\"{n}\" PKNAME=\"{p}\" TYPE=\"part\" SIZE=\"{s}\" ROTA=\"0\" RO=\"0\" FSTYPE=\"\" MOUNTPOINT=\"\" FSUSED=\"\"",
                        n = partition_node(name, *number),
                        p = name,
                        s = (part.end - part.start + 1) * SECTOR,
                    );
                }
            }
        }
        out
    }

    fn udevadm(&self, args: &[String]) -> String {
        let name = value_of(args, "--name").map(kernel_name).unwrap_or_default();
        format!("DEVNAME=/dev/{0}\nDEVTYPE=disk\nID_SERIAL=FAKE-{0}\n", name)
    }

    // =========================================================================
    // LVM Reports
    // =========================================================================

    fn pv_free(pv: &FakePv) -> u64 {
        pv.size - pv.used
    }

    fn pvs_report(&self) -> String {
        let mut out = String::new();
        for (name, pv) in &self.pvs {
            let (name, attr) = if pv.missing {
                ("[unknown]", "a-m")
            } else {
                (name.as_str(), "a--")
            };
            let _ = writeln!(
                out,
                "  LVM2_PV_NAME='{}' LVM2_VG_NAME='{}' LVM2_PV_ATTR='{}' LVM2_PV_SIZE='{}' LVM2_PV_FREE='{}' LVM2_PV_USED='{}'",
                name,
                pv.vg.clone().unwrap_or_default(),
                attr,
                pv.size,
                Self::pv_free(pv),
                pv.used,
            );
        }
        out
    }

    fn vgs_report(&self) -> String {
        let mut out = String::new();
        for (name, vg) in &self.vgs {
            let members: Vec<&FakePv> = self
                .pvs
                .values()
                .filter(|pv| pv.vg.as_deref() == Some(name.as_str()))
                .collect();
            let lvs: Vec<&FakeLv> = self
                .lvs
                .iter()
                .filter(|((v, _), _)| v == name)
                .map(|(_, lv)| lv)
                .collect();
            let _ = writeln!(
                out,
                "  LVM2_VG_NAME='{}' LVM2_PV_COUNT='{}' LVM2_LV_COUNT='{}' LVM2_SNAP_COUNT='{}' LVM2_VG_ATTR='wz--n-' LVM2_VG_TAGS='{}' LVM2_VG_SIZE='{}' LVM2_VG_FREE='{}'",
                name,
                members.len(),
                lvs.len(),
                lvs.iter().filter(|lv| lv.origin.is_some()).count(),
                vg.tags.join(","),
                members.iter().map(|pv| pv.size).sum::<u64>(),
                members.iter().map(|pv| Self::pv_free(pv)).sum::<u64>(),
            );
        }
        out
    }

    fn lvs_report(&self, args: &[String]) -> String {
        let selected = value_of(args, "--select").and_then(|s| s.strip_prefix("vg_name="));
        let mut out = String::new();
        for ((vg, name), lv) in &self.lvs {
            if selected.is_some_and(|s| s != vg) {
                continue;
            }
            let attr = if lv.kind == 't' { "twi-a-tz--" } else { "Vwi-a-tz--" };
            let _ = writeln!(
                out,
                "  LVM2_LV_NAME='{}' LVM2_VG_NAME='{}' LVM2_LV_SIZE='{}' LVM2_LV_KERNEL_MAJOR='253' LVM2_LV_KERNEL_MINOR='{}' LVM2_ORIGIN='{}' LVM2_POOL_LV='{}' LVM2_LV_TAGS='{}' LVM2_LV_ATTR='{}' LVM2_DATA_PERCENT='{:.2}'",
                name,
                vg,
                lv.size,
                lv.minor,
                lv.origin.clone().unwrap_or_default(),
                lv.pool.clone().unwrap_or_default(),
                lv.tags.join(","),
                attr,
                lv.data_percent,
            );
        }
        out
    }

    // =========================================================================
    // PV / VG Commands
    // =========================================================================

    fn device_exists(&self, path: &str) -> bool {
        self.devices.contains_key(kernel_name(path))
    }

    fn pvcreate(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?;
        if !self.device_exists(disk) {
            return Err(fail(cmd, format!("Cannot use {}: device not found", disk)));
        }
        if self.pvs.contains_key(disk) {
            return Err(fail(cmd, format!("{} is already a physical volume", disk)));
        }
        let size = self.devices[kernel_name(disk)].size_bytes;
        self.pvs.insert(
            disk.clone(),
            FakePv {
                vg: None,
                size,
                used: 0,
                missing: false,
            },
        );
        Ok(String::new())
    }

    fn pvremove(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?;
        match self.pvs.get(disk) {
            None => Err(fail(cmd, format!("No PV found on device {}", disk))),
            Some(pv) if pv.vg.as_ref().is_some_and(|vg| self.vgs.contains_key(vg)) => {
                Err(fail(cmd, format!("{} belongs to a volume group", disk)))
            }
            Some(_) => {
                self.pvs.remove(disk);
                Ok(String::new())
            }
        }
    }

    fn pvmove(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?.clone();
        let pv = self
            .pvs
            .get(&disk)
            .cloned()
            .ok_or_else(|| fail(cmd, "no such PV"))?;
        let vg = pv.vg.clone().ok_or_else(|| fail(cmd, "PV not in a VG"))?;

        let others: Vec<String> = self
            .pvs
            .iter()
            .filter(|(n, p)| **n != disk && p.vg.as_deref() == Some(vg.as_str()) && !p.missing)
            .map(|(n, _)| n.clone())
            .collect();
        let room: u64 = others.iter().map(|n| Self::pv_free(&self.pvs[n])).sum();
        if room < pv.used {
            return Err(fail(cmd, "Insufficient free space for extents to move"));
        }

        for lv in self.lvs.values_mut() {
            let Some(mut moving) = lv.allocations.remove(&disk) else {
                continue;
            };
            for other in &others {
                let Some(target) = self.pvs.get_mut(other) else {
                    continue;
                };
                let take = moving.min(target.size - target.used);
                target.used += take;
                *lv.allocations.entry(other.clone()).or_default() += take;
                moving -= take;
                if moving == 0 {
                    break;
                }
            }
        }
        if let Some(pv) = self.pvs.get_mut(&disk) {
            pv.used = 0;
        }
        Ok(String::new())
    }

    fn vgcreate(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?.clone();
        let vg = args
            .get(args.len().wrapping_sub(2))
            .ok_or_else(|| fail(cmd, "missing vg name"))?
            .clone();
        if self.vgs.contains_key(&vg) {
            return Err(fail(cmd, format!("A volume group called {} already exists", vg)));
        }
        let pv = self
            .pvs
            .get_mut(&disk)
            .ok_or_else(|| fail(cmd, format!("{} is not a PV", disk)))?;
        pv.vg = Some(vg.clone());
        let tags = values_of(args, "--addtag").into_iter().map(String::from).collect();
        self.vgs.insert(vg, FakeVg { tags });
        Ok(String::new())
    }

    fn vgextend(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?.clone();
        let vg = args[args.len() - 2].clone();
        if !self.vgs.contains_key(&vg) {
            return Err(fail(cmd, format!("Volume group \"{}\" not found", vg)));
        }
        let pv = self
            .pvs
            .get_mut(&disk)
            .ok_or_else(|| fail(cmd, format!("{} is not a PV", disk)))?;
        pv.vg = Some(vg);
        Ok(String::new())
    }

    fn vgreduce(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        if args.iter().any(|a| a == "--removemissing") {
            let vg = args.last().ok_or_else(|| fail(cmd, "missing vg"))?.clone();
            self.pvs
                .retain(|_, pv| !(pv.missing && pv.vg.as_deref() == Some(vg.as_str())));
            return Ok(String::new());
        }
        let disk = args.last().ok_or_else(|| fail(cmd, "missing device"))?.clone();
        let pv = self
            .pvs
            .get_mut(&disk)
            .ok_or_else(|| fail(cmd, "no such PV"))?;
        if pv.used > 0 {
            return Err(fail(cmd, format!("Physical volume {} still in use", disk)));
        }
        pv.vg = None;
        Ok(String::new())
    }

    fn vgremove(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let vg = args.last().ok_or_else(|| fail(cmd, "missing vg"))?.clone();
        if self.lvs.keys().any(|(v, _)| *v == vg) {
            return Err(fail(cmd, "volume group still contains logical volumes"));
        }
        if self.vgs.remove(&vg).is_none() {
            return Err(fail(cmd, format!("Volume group \"{}\" not found", vg)));
        }
        for pv in self.pvs.values_mut() {
            if pv.vg.as_deref() == Some(vg.as_str()) {
                pv.vg = None;
            }
        }
        Ok(String::new())
    }

    // =========================================================================
    // LV Commands
    // =========================================================================

    fn allocate(&mut self, vg: &str, bytes: u64) -> Option<BTreeMap<String, u64>> {
        let free: u64 = self
            .pvs
            .values()
            .filter(|pv| pv.vg.as_deref() == Some(vg) && !pv.missing)
            .map(Self::pv_free)
            .sum();
        if free < bytes {
            return None;
        }
        let mut remaining = bytes;
        let mut allocations = BTreeMap::new();
        for (name, pv) in self.pvs.iter_mut() {
            if remaining == 0 {
                break;
            }
            if pv.vg.as_deref() != Some(vg) || pv.missing {
                continue;
            }
            let take = remaining.min(pv.size - pv.used);
            if take > 0 {
                pv.used += take;
                allocations.insert(name.clone(), take);
                remaining -= take;
            }
        }
        Some(allocations)
    }

    fn release(&mut self, allocations: &BTreeMap<String, u64>) {
        for (name, bytes) in allocations {
            if let Some(pv) = self.pvs.get_mut(name) {
                pv.used -= (*bytes).min(pv.used);
            }
        }
    }

    fn next_minor(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    fn lvcreate(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let name = value_of(args, "-n")
            .ok_or_else(|| fail(cmd, "missing -n"))?
            .to_string();
        let tags: Vec<String> = values_of(args, "--addtag").into_iter().map(String::from).collect();

        if args.iter().any(|a| a == "-s") {
            let (vg, origin) = args
                .last()
                .and_then(|p| split_lv_path(p))
                .ok_or_else(|| fail(cmd, "missing origin"))?;
            let origin_lv = self
                .lvs
                .get(&(vg.clone(), origin.clone()))
                .cloned()
                .ok_or_else(|| fail(cmd, format!("origin {} not found", origin)))?;
            if self.lvs.contains_key(&(vg.clone(), name.clone())) {
                return Err(fail(cmd, format!("Logical volume {} already exists", name)));
            }
            let minor = self.next_minor();
            self.lvs.insert(
                (vg, name),
                FakeLv {
                    size: origin_lv.size,
                    kind: 'V',
                    pool: origin_lv.pool.clone(),
                    origin: Some(origin),
                    tags,
                    data_percent: origin_lv.data_percent,
                    minor,
                    allocations: BTreeMap::new(),
                },
            );
            return Ok(String::new());
        }

        let vg = args.last().ok_or_else(|| fail(cmd, "missing vg"))?.clone();
        if !self.vgs.contains_key(&vg) {
            return Err(fail(cmd, format!("Volume group \"{}\" not found", vg)));
        }
        if self.lvs.contains_key(&(vg.clone(), name.clone())) {
            return Err(fail(cmd, format!("Logical volume {} already exists", name)));
        }
        let minor = self.next_minor();

        match value_of(args, "--type") {
            Some("thin-pool") => {
                let size = value_of(args, "-L")
                    .and_then(parse_bytes)
                    .ok_or_else(|| fail(cmd, "missing -L"))?;
                let allocations = self
                    .allocate(&vg, size)
                    .ok_or_else(|| fail(cmd, "Insufficient free space"))?;
                self.lvs.insert(
                    (vg, name),
                    FakeLv {
                        size,
                        kind: 't',
                        pool: None,
                        origin: None,
                        tags,
                        data_percent: 0.0,
                        minor,
                        allocations,
                    },
                );
            }
            Some("thin") => {
                let size = value_of(args, "-V")
                    .and_then(parse_bytes)
                    .map(round_to_extent)
                    .ok_or_else(|| fail(cmd, "missing -V"))?;
                let pool = value_of(args, "--thinpool")
                    .ok_or_else(|| fail(cmd, "missing --thinpool"))?
                    .to_string();
                if !self.lvs.contains_key(&(vg.clone(), pool.clone())) {
                    return Err(fail(cmd, format!("thin pool {} not found", pool)));
                }
                self.lvs.insert(
                    (vg, name),
                    FakeLv {
                        size,
                        kind: 'V',
                        pool: Some(pool),
                        origin: None,
                        tags,
                        data_percent: 0.0,
                        minor,
                        allocations: BTreeMap::new(),
                    },
                );
            }
            other => return Err(fail(cmd, format!("unsupported type {:?}", other))),
        }
        Ok(String::new())
    }

    fn lvextend(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let key = args
            .last()
            .and_then(|p| split_lv_path(p))
            .ok_or_else(|| fail(cmd, "missing lv"))?;
        let size = value_of(args, "-L")
            .and_then(parse_bytes)
            .ok_or_else(|| fail(cmd, "missing -L"))?;
        let lv = self
            .lvs
            .get(&key)
            .cloned()
            .ok_or_else(|| fail(cmd, "lv not found"))?;
        if size < lv.size {
            return Err(fail(cmd, "New size is smaller than current size"));
        }
        if lv.kind == 't' {
            let extra = self
                .allocate(&key.0, size - lv.size)
                .ok_or_else(|| fail(cmd, "Insufficient free space"))?;
            if let Some(pool) = self.lvs.get_mut(&key) {
                for (pv, bytes) in extra {
                    *pool.allocations.entry(pv).or_default() += bytes;
                }
            }
        }
        if let Some(lv) = self.lvs.get_mut(&key) {
            lv.size = size;
        }
        Ok(String::new())
    }

    fn lvremove(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let (vg, name) = args
            .last()
            .and_then(|p| split_lv_path(p))
            .ok_or_else(|| fail(cmd, "missing lv"))?;
        let dependants = self
            .lvs
            .iter()
            .any(|((v, _), lv)| *v == vg && lv.pool.as_deref() == Some(name.as_str()));
        if dependants {
            return Err(fail(cmd, format!("thin pool {} still has thin volumes", name)));
        }
        let lv = self
            .lvs
            .remove(&(vg.clone(), name.clone()))
            .ok_or_else(|| fail(cmd, format!("Failed to find logical volume {}", name)))?;
        self.release(&lv.allocations);

        // Thin snapshots outlive their origin and lose the reference
        for ((v, _), other) in self.lvs.iter_mut() {
            if *v == vg && other.origin.as_deref() == Some(name.as_str()) {
                other.origin = None;
            }
        }
        Ok(String::new())
    }

    fn lvconvert(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let key = args
            .last()
            .and_then(|p| split_lv_path(p))
            .ok_or_else(|| fail(cmd, "missing snapshot"))?;
        let snap = self
            .lvs
            .remove(&key)
            .ok_or_else(|| fail(cmd, "snapshot not found"))?;
        let origin = snap.origin.ok_or_else(|| fail(cmd, "not a snapshot"))?;
        if let Some(origin) = self.lvs.get_mut(&(key.0, origin)) {
            origin.data_percent = snap.data_percent;
        }
        Ok(String::new())
    }

    fn lvchange(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let key = args
            .last()
            .and_then(|p| split_lv_path(p))
            .ok_or_else(|| fail(cmd, "missing lv"))?;
        let lv = self.lvs.get_mut(&key).ok_or_else(|| fail(cmd, "lv not found"))?;
        for tag in values_of(args, "--deltag") {
            lv.tags.retain(|t| t != tag);
        }
        for tag in values_of(args, "--addtag") {
            lv.tags.push(tag.to_string());
        }
        Ok(String::new())
    }

    // =========================================================================
    // Partition Tables
    // =========================================================================

    fn last_lba(&self, disk: &str) -> u64 {
        self.devices
            .get(disk)
            .map(|d| d.size_bytes / SECTOR - GPT_RESERVED_SECTORS)
            .unwrap_or(0)
    }

    fn sfdisk(&self, cmd: &str, args: &[String]) -> Result<String> {
        let path = args.last().ok_or_else(|| fail(cmd, "missing device"))?;
        let disk = kernel_name(path);
        if !self.devices.contains_key(disk) {
            return Err(fail(cmd, format!("cannot open {}", path)));
        }
        let table = self.tables.get(disk).ok_or_else(|| {
            fail(cmd, format!("{}: does not contain a recognized partition table", path))
        })?;

        let partitions: Vec<serde_json::Value> = table
            .iter()
            .map(|(n, p)| {
                serde_json::json!({
                    "node": format!("/dev/{}", partition_node(disk, *n)),
                    "start": p.start,
                    "size": p.end - p.start + 1,
                    "type": p.type_guid,
                    "uuid": p.uuid,
                    "name": p.name,
                })
            })
            .collect();
        let dump = serde_json::json!({
            "partitiontable": {
                "label": "gpt",
                "device": path,
                "unit": "sectors",
                "firstlba": GPT_RESERVED_SECTORS,
                "lastlba": self.last_lba(disk),
                "sectorsize": SECTOR,
                "partitions": partitions,
            }
        });
        Ok(dump.to_string())
    }

    fn sgdisk(&mut self, cmd: &str, args: &[String]) -> Result<String> {
        let path = args.last().ok_or_else(|| fail(cmd, "missing device"))?;
        let disk = kernel_name(path).to_string();
        if !self.devices.contains_key(&disk) {
            return Err(fail(cmd, format!("cannot open {}", path)));
        }
        let last_lba = self.last_lba(&disk);

        let mut table = self.tables.get(&disk).cloned();
        for arg in &args[..args.len() - 1] {
            let (flag, value) = arg.split_once('=').unwrap_or((arg.as_str(), ""));
            match flag {
                "--clear" => table = Some(BTreeMap::new()),
                "--zap-all" => table = None,
                "--delete" => {
                    let n: u32 = value.parse().map_err(|_| fail(cmd, "bad number"))?;
                    let t = table.as_mut().ok_or_else(|| fail(cmd, "no table"))?;
                    t.remove(&n).ok_or_else(|| fail(cmd, format!("partition {} absent", n)))?;
                }
                "--new" => {
                    let parts: Vec<&str> = value.split(':').collect();
                    let [n, start, end] = parts[..] else {
                        return Err(fail(cmd, "bad --new"));
                    };
                    let n: u32 = n.parse().map_err(|_| fail(cmd, "bad number"))?;
                    let start: u64 = start.parse().map_err(|_| fail(cmd, "bad start"))?;
                    let end: u64 = end.parse().map_err(|_| fail(cmd, "bad end"))?;
                    let t = table.as_mut().ok_or_else(|| fail(cmd, "no table"))?;
                    if t.contains_key(&n) {
                        return Err(fail(cmd, format!("partition {} in use", n)));
                    }
                    if start < GPT_RESERVED_SECTORS || end > last_lba || end < start {
                        return Err(fail(cmd, "partition out of bounds"));
                    }
                    if t.values().any(|p| !(end < p.start || start > p.end)) {
                        return Err(fail(cmd, "partition overlaps"));
                    }
                    self.counter += 1;
                    t.insert(
                        n,
                        FakePartition {
                            start,
                            end,
                            name: String::new(),
                            type_guid: String::new(),
                            uuid: format!("00000000-0000-4000-8000-{:012X}", self.counter),
                        },
                    );
                }
                "--change-name" | "--typecode" | "--partition-guid" => {
                    let (n, v) = value.split_once(':').ok_or_else(|| fail(cmd, "bad value"))?;
                    let n: u32 = n.parse().map_err(|_| fail(cmd, "bad number"))?;
                    let part = table
                        .as_mut()
                        .and_then(|t| t.get_mut(&n))
                        .ok_or_else(|| fail(cmd, format!("partition {} absent", n)))?;
                    match flag {
                        "--change-name" => part.name = v.to_string(),
                        "--typecode" => part.type_guid = v.to_string(),
                        _ => part.uuid = v.to_string(),
                    }
                }
                other => return Err(fail(cmd, format!("unsupported option {}", other))),
            }
        }

        match table {
            Some(t) => {
                self.tables.insert(disk, t);
            }
            None => {
                self.tables.remove(&disk);
            }
        }
        Ok(String::new())
    }
}
